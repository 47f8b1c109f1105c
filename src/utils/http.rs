use once_cell::sync::Lazy;
use reqwest::Client;
use std::time::Duration;

fn build_client(timeout_secs: u64) -> Client {
    Client::builder()
        .connect_timeout(Duration::from_secs(20))
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(60))
        .timeout(Duration::from_secs(timeout_secs))
        .user_agent(crate::constants::USER_AGENT.as_str())
        .build()
        .expect("Failed to create HTTP client")
}

static CLIENT: Lazy<Client> = Lazy::new(|| build_client(30));
static LONG_CLIENT: Lazy<Client> = Lazy::new(|| build_client(600));

/// Shared client for short control-plane calls (OAuth, device flow).
pub fn get_client() -> Client {
    CLIENT.clone()
}

/// Shared client for long-lived calls; per-request deadlines are applied by
/// the caller on top of this client's outer timeout.
pub fn get_long_client() -> Client {
    LONG_CLIENT.clone()
}
