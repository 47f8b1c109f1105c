use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Serialize;

use crate::constants::{DEVICE_FLOW_JANITOR_SECS, DEVICE_FLOW_MAX_LIFETIME_SECS};

/// Ephemeral state for one pending device authorization, keyed by its
/// `device_code`. Destroyed on completion, denial or expiry.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceFlow {
    pub device_code: String,
    pub target_account_id: String,
    pub user_code: String,
    pub verification_uri: String,
    pub verification_uri_complete: Option<String>,
    #[serde(skip_serializing)]
    pub code_verifier: String,
    /// ms epoch
    pub expires_at: i64,
    pub poll_interval: u64,
}

impl DeviceFlow {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

#[derive(Default)]
pub struct DeviceFlowRegistry {
    flows: Mutex<HashMap<String, DeviceFlow>>,
}

impl DeviceFlowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new flow, capping its lifetime and sweeping stale entries
    /// while the lock is held anyway.
    pub fn insert(&self, mut flow: DeviceFlow) {
        let now = chrono::Utc::now().timestamp_millis();
        let cap = now + DEVICE_FLOW_MAX_LIFETIME_SECS * 1_000;
        if flow.expires_at > cap {
            flow.expires_at = cap;
        }

        let mut flows = self.flows.lock().unwrap_or_else(|p| p.into_inner());
        flows.retain(|_, f| !f.is_expired(now));
        flows.insert(flow.device_code.clone(), flow);
    }

    pub fn get(&self, device_code: &str) -> Option<DeviceFlow> {
        let now = chrono::Utc::now().timestamp_millis();
        let flows = self.flows.lock().unwrap_or_else(|p| p.into_inner());
        flows
            .get(device_code)
            .filter(|f| !f.is_expired(now))
            .cloned()
    }

    pub fn remove(&self, device_code: &str) -> Option<DeviceFlow> {
        let mut flows = self.flows.lock().unwrap_or_else(|p| p.into_inner());
        flows.remove(device_code)
    }

    pub fn sweep_expired(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let mut flows = self.flows.lock().unwrap_or_else(|p| p.into_inner());
        let before = flows.len();
        flows.retain(|_, f| !f.is_expired(now));
        before - flows.len()
    }

    pub fn len(&self) -> usize {
        self.flows.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn spawn_janitor(registry: Arc<DeviceFlowRegistry>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(DEVICE_FLOW_JANITOR_SECS));
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = registry.sweep_expired();
            if removed > 0 {
                tracing::debug!("[DeviceFlow] Janitor removed {} expired flow(s)", removed);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flow(device_code: &str, expires_in_ms: i64) -> DeviceFlow {
        DeviceFlow {
            device_code: device_code.to_string(),
            target_account_id: "acct1".to_string(),
            user_code: "ABCD".to_string(),
            verification_uri: "https://chat.qwen.ai/authorize".to_string(),
            verification_uri_complete: None,
            code_verifier: "V1".to_string(),
            expires_at: chrono::Utc::now().timestamp_millis() + expires_in_ms,
            poll_interval: 5,
        }
    }

    #[test]
    fn expired_flows_are_invisible_and_swept() {
        let registry = DeviceFlowRegistry::new();
        registry.insert(flow("DC1", -1_000));
        registry.insert(flow("DC2", 60_000));

        assert!(registry.get("DC1").is_none());
        assert!(registry.get("DC2").is_some());

        // DC1 was already dropped by the insert-time sweep.
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.sweep_expired(), 0);
    }

    #[test]
    fn lifetime_is_capped_at_fifteen_minutes() {
        let registry = DeviceFlowRegistry::new();
        registry.insert(flow("DC1", 3_600_000));

        let stored = registry.get("DC1").expect("flow present");
        let max = chrono::Utc::now().timestamp_millis() + DEVICE_FLOW_MAX_LIFETIME_SECS * 1_000;
        assert!(stored.expires_at <= max);
    }

    #[test]
    fn remove_destroys_the_flow() {
        let registry = DeviceFlowRegistry::new();
        registry.insert(flow("DC1", 60_000));
        assert!(registry.remove("DC1").is_some());
        assert!(registry.get("DC1").is_none());
        assert!(registry.is_empty());
    }
}
