use axum::{extract::State, response::IntoResponse, response::Response, Json};
use serde_json::json;

use crate::models::{account_health, AccountHealth};
use crate::proxy::server::AppState;

/// Linux-only RSS read; other platforms report null.
fn process_memory_kb() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|kb| kb.parse().ok())
}

/// GET /health — aggregate and per-account status plus today's counters.
pub async fn handle_health(State(state): State<AppState>) -> Response {
    let now = chrono::Utc::now().timestamp_millis();
    let accounts = state.dispatcher.pool().snapshot();

    let mut healthy = 0usize;
    let per_account: Vec<serde_json::Value> = accounts
        .iter()
        .map(|account| {
            let status = account_health(&account.creds, account.is_auth_dead());
            if matches!(status, AccountHealth::Healthy | AccountHealth::ExpiringSoon) {
                healthy += 1;
            }
            json!({
                "account_id": account.account_id,
                "status": status,
                "expiry_timestamp": account.creds.expiry_timestamp,
                "minutes_left": account.creds.minutes_left(),
                "quota_exhausted": account.quota_exhausted_until > now,
                "consecutive_auth_errors": account.consecutive_auth_errors,
                "last_used": account.last_used,
            })
        })
        .collect();

    let overall = if accounts.is_empty() {
        "no_accounts"
    } else if healthy > 0 {
        "ok"
    } else {
        "degraded"
    };

    let today = state.counters.totals_today();

    Json(json!({
        "status": overall,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "platform": std::env::consts::OS,
        "memory_rss_kb": process_memory_kb(),
        "endpoint": format!("http://{}:{}", state.config.host, state.config.port),
        "accounts": {
            "total": accounts.len(),
            "healthy": healthy,
            "detail": per_account,
        },
        "today": today,
    }))
    .into_response()
}
