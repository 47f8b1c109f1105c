use serde::{Deserialize, Serialize};

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// One vendor credential bundle as persisted in `oauth_creds_<account_id>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Absolute expiry, millisecond resolution.
    pub expiry_timestamp: i64,
    /// Vendor-chosen API base, normalized to `https://…/v1` before storage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
    /// Kept across a device-flow pair; cleared once the flow completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
}

impl StoredCredentials {
    pub fn expires_within(&self, skew_ms: i64) -> bool {
        self.expiry_timestamp <= chrono::Utc::now().timestamp_millis() + skew_ms
    }

    pub fn is_expired(&self) -> bool {
        self.expires_within(0)
    }

    /// Minutes until expiry; negative once past.
    pub fn minutes_left(&self) -> i64 {
        (self.expiry_timestamp - chrono::Utc::now().timestamp_millis()) / 60_000
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountHealth {
    Healthy,
    ExpiringSoon,
    Expired,
    Failed,
}

pub fn account_health(creds: &StoredCredentials, auth_dead: bool) -> AccountHealth {
    if auth_dead {
        return AccountHealth::Failed;
    }
    let minutes = creds.minutes_left();
    if minutes <= 0 {
        AccountHealth::Expired
    } else if minutes < 30 {
        AccountHealth::ExpiringSoon
    } else {
        AccountHealth::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds_expiring_in_ms(delta_ms: i64) -> StoredCredentials {
        StoredCredentials {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            token_type: "Bearer".to_string(),
            expiry_timestamp: chrono::Utc::now().timestamp_millis() + delta_ms,
            resource_url: None,
            code_verifier: None,
        }
    }

    #[test]
    fn expiry_skew_triggers_within_window() {
        let creds = creds_expiring_in_ms(30_000);
        assert!(creds.expires_within(60_000));
        assert!(!creds.is_expired());
    }

    #[test]
    fn health_maps_expiry_distance() {
        assert_eq!(
            account_health(&creds_expiring_in_ms(2 * 3_600_000), false),
            AccountHealth::Healthy
        );
        assert_eq!(
            account_health(&creds_expiring_in_ms(10 * 60_000), false),
            AccountHealth::ExpiringSoon
        );
        assert_eq!(
            account_health(&creds_expiring_in_ms(-1_000), false),
            AccountHealth::Expired
        );
        assert_eq!(
            account_health(&creds_expiring_in_ms(3_600_000), true),
            AccountHealth::Failed
        );
    }

    #[test]
    fn token_type_defaults_on_deserialize() {
        let creds: StoredCredentials = serde_json::from_str(
            r#"{"access_token":"a","refresh_token":"r","expiry_timestamp":1}"#,
        )
        .expect("parse");
        assert_eq!(creds.token_type, "Bearer");
    }
}
