pub mod atomic;
pub mod crypto;
pub mod session;

pub use atomic::write_atomic;
pub use crypto::{SessionCipher, SessionSecret};
pub use session::SessionStore;
