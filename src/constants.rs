use once_cell::sync::Lazy;

// Vendor OAuth endpoints (RFC 8628 device flow on the chat host).
pub const DEVICE_CODE_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/device/code";
pub const TOKEN_URL: &str = "https://chat.qwen.ai/api/v1/oauth2/token";
pub const OAUTH_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";
pub const OAUTH_SCOPE: &str = "openid profile email model.completion";
pub const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

// Fallback API base when a credential bundle carries no resource_url.
pub const DEFAULT_API_BASE: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

pub const DEFAULT_MODEL: &str = "qwen3-coder-plus";

pub const API_KEY_PREFIX: &str = "sk-proj-";
// prefix + 48 hex chars
pub const API_KEY_MIN_LEN: usize = 56;

pub const CHAT_DEADLINE_SECS: u64 = 60;
pub const SEARCH_DEADLINE_SECS: u64 = 30;
pub const MODELS_CACHE_TTL_SECS: u64 = 300;

// A token expiring within this window is refreshed before it is presented upstream.
pub const EXPIRY_SKEW_MS: i64 = 60_000;

pub const AUTH_ERROR_THRESHOLD: u32 = 3;
pub const MAX_DISPATCH_ATTEMPTS: usize = 3;

pub const REFRESH_TICK_SECS: u64 = 300;
pub const REFRESH_BATCH_SIZE: usize = 20;
pub const REFRESH_THRESHOLD_MIN_MINUTES: i64 = 10;
pub const REFRESH_THRESHOLD_MAX_MINUTES: i64 = 30;

pub const DEVICE_FLOW_MAX_LIFETIME_SECS: i64 = 900;
pub const DEVICE_FLOW_JANITOR_SECS: u64 = 60;

pub const COUNTER_FLUSH_INTERVAL_MS: u64 = 1_000;
pub const STATS_SNAPSHOT_INTERVAL_SECS: u64 = 30;

pub const SHUTDOWN_GRACE_SECS: u64 = 5;

pub const WEB_SEARCH_MAX_ROWS: u32 = 100;

pub static USER_AGENT: Lazy<String> =
    Lazy::new(|| format!("qwen-relay/{}", env!("CARGO_PKG_VERSION")));
