use std::sync::Arc;

use serde_json::json;

use crate::constants::STATS_SNAPSHOT_INTERVAL_SECS;
use crate::modules::keys::KeyUsageStats;
use crate::modules::stats::Counters;
use crate::proxy::pool::AccountPool;
use crate::utils::fsio;

/// Periodic snapshot of today's totals into `stats/daily-YYYY-MM-DD.json`,
/// plus the deferred key-usage flush.
pub fn spawn_stats_collector(
    counters: Counters,
    key_usage: Arc<KeyUsageStats>,
    pool: Arc<AccountPool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            STATS_SNAPSHOT_INTERVAL_SECS,
        ));
        interval.tick().await;
        loop {
            interval.tick().await;
            write_daily_snapshot(&counters, &pool);
            key_usage.flush_if_dirty();
        }
    })
}

fn write_daily_snapshot(counters: &Counters, pool: &Arc<AccountPool>) {
    let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let per_account: serde_json::Map<String, serde_json::Value> = pool
        .snapshot()
        .iter()
        .map(|account| {
            let day = counters.get_today(&account.account_id);
            (
                account.account_id.clone(),
                serde_json::to_value(day).unwrap_or_default(),
            )
        })
        .collect();

    let snapshot = json!({
        "date": date,
        "written_at": chrono::Utc::now().to_rfc3339(),
        "totals": counters.totals_today(),
        "accounts": per_account,
    });

    let Ok(data_dir) = crate::modules::auth::account::get_data_dir() else {
        return;
    };
    let stats_dir = data_dir.join("stats");
    if !stats_dir.exists() {
        if let Err(e) = std::fs::create_dir_all(&stats_dir) {
            tracing::warn!("[Stats] Cannot create stats dir: {}", e);
            return;
        }
    }
    let path = stats_dir.join(format!("daily-{}.json", date));
    if let Err(e) = fsio::write_json_atomic(&path, &snapshot) {
        tracing::warn!("[Stats] Snapshot write failed: {}", e);
    }
}

/// One JSONL line per forwarded request, only when the operator turned the
/// request log on.
pub fn write_request_log_line(
    account_id: &str,
    endpoint: &str,
    status: u16,
    duration_ms: u64,
) {
    let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
    let line = json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "account": account_id,
        "endpoint": endpoint,
        "status": status,
        "duration_ms": duration_ms,
    })
    .to_string();

    let Ok(data_dir) = crate::modules::auth::account::get_data_dir() else {
        return;
    };
    let path = data_dir.join("stats").join(format!("requests-{}.jsonl", date));
    if let Err(e) = fsio::append_line(&path, &line) {
        tracing::warn!("[Stats] Request log append failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{lock_env, ScopedEnvVar};

    #[tokio::test]
    async fn snapshot_file_lands_under_stats_dir() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

        let (counters, _handle) = Counters::start().expect("start");
        counters.incr_request("acct1", crate::modules::stats::RequestKind::Chat, 1);
        counters.flush().await;

        let pool = Arc::new(AccountPool::new());
        write_daily_snapshot(&counters, &pool);

        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let path = dir.path().join("stats").join(format!("daily-{}.json", date));
        assert!(path.exists());

        let snapshot: serde_json::Value = crate::utils::fsio::read_json(&path).expect("read");
        assert_eq!(snapshot["totals"]["chat_requests"], 1);
    }

    #[test]
    fn request_log_appends_jsonl() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

        write_request_log_line("acct1", "/v1/chat/completions", 200, 150);
        write_request_log_line("acct1", "/v1/web/search", 502, 30);

        let date = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let path = dir
            .path()
            .join("stats")
            .join(format!("requests-{}.jsonl", date));
        let content = std::fs::read_to_string(&path).expect("read");
        assert_eq!(content.lines().count(), 2);
    }
}
