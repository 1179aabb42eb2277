pub mod gateway;
pub mod logout;
pub mod onboard;
pub mod status;
