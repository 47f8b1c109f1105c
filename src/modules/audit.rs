use serde_json::json;

use crate::modules::auth::account::get_data_dir;
use crate::utils::fsio;

const AUDIT_FILE: &str = "audit.log";

/// Append one audit record. Auditing must never break the request path, so
/// failures are logged and swallowed.
pub fn record(action: &str, actor: &str, ip: Option<&str>, subject: &str) {
    let line = json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "action": action,
        "actor": actor,
        "ip": ip,
        "subject": subject,
    })
    .to_string();

    match get_data_dir() {
        Ok(dir) => {
            if let Err(e) = fsio::append_line(&dir.join(AUDIT_FILE), &line) {
                tracing::warn!("[Audit] Failed to append record: {}", e);
            }
        }
        Err(e) => tracing::warn!("[Audit] Data dir unavailable: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{lock_env, ScopedEnvVar};

    #[test]
    fn records_are_appended_as_json_lines() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

        record("key_created", "admin", Some("127.0.0.1"), "key-1");
        record("account_deleted", "admin", None, "acct1");

        let content = std::fs::read_to_string(dir.path().join("audit.log")).expect("read");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("json line");
        assert_eq!(first["action"], "key_created");
        assert_eq!(first["ip"], "127.0.0.1");
        assert_eq!(first["subject"], "key-1");
    }
}
