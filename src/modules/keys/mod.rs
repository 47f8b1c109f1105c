mod rate_limit;
mod store;
mod usage;

pub use rate_limit::{RateDecision, SlidingWindowLimiter};
pub use store::{
    ApiKeyMetadata, ApiKeyStore, KeyStatus, Permission, RateLimitSpec, UpdateKeyRequest,
};
pub use usage::KeyUsageStats;
