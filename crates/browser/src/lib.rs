pub mod cdp;
pub mod driver;
pub mod launcher;
pub mod scripts;
pub mod session;

pub use driver::{AutomationDriver, AutomationSession};
pub use launcher::{find_browser_binary, BrowserEngine};
pub use session::{BrowserState, CdpDriver};
