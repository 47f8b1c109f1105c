mod account;
mod config;

pub use account::{account_health, AccountHealth, StoredCredentials};
pub use config::AppConfig;
