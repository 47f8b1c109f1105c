mod auth;
mod panic;

pub use auth::{api_key_middleware, required_permission, ApiKeyIdentity};
pub use panic::catch_panic_middleware;
