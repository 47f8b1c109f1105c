pub mod account;
pub mod device_flow;
pub mod oauth;
pub mod refresh;
