use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::utils::fsio;

const USAGE_FILE: &str = "key_usage_stats.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyStat {
    pub total_requests: u64,
    pub total_errors: u64,
    pub total_response_ms: u64,
    pub last_used_at: Option<i64>,
}

impl KeyStat {
    pub fn avg_response_ms(&self) -> u64 {
        if self.total_requests == 0 {
            0
        } else {
            self.total_response_ms / self.total_requests
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct KeyUsageFile {
    /// date -> key_id -> request count
    #[serde(default)]
    daily: HashMap<String, HashMap<String, u64>>,
    #[serde(default, rename = "keyStats")]
    key_stats: HashMap<String, KeyStat>,
}

/// Per-key request tallies, flushed by the stats collector tick and on
/// shutdown rather than on every request.
pub struct KeyUsageStats {
    inner: Mutex<KeyUsageFile>,
    path: PathBuf,
    dirty: AtomicBool,
}

impl KeyUsageStats {
    pub fn load() -> Result<Self, String> {
        let path = crate::modules::auth::account::get_data_dir()?.join(USAGE_FILE);
        let file = if path.exists() {
            fsio::read_json(&path)?
        } else {
            KeyUsageFile::default()
        };
        Ok(Self {
            inner: Mutex::new(file),
            path,
            dirty: AtomicBool::new(false),
        })
    }

    pub fn record(&self, key_id: &str, response_ms: u64, is_error: bool) {
        let today = chrono::Utc::now().format("%Y-%m-%d").to_string();
        let now = chrono::Utc::now().timestamp_millis();

        let mut file = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        *file
            .daily
            .entry(today)
            .or_default()
            .entry(key_id.to_string())
            .or_default() += 1;

        let stat = file.key_stats.entry(key_id.to_string()).or_default();
        stat.total_requests += 1;
        stat.total_response_ms += response_ms;
        if is_error {
            stat.total_errors += 1;
        }
        stat.last_used_at = Some(now);
        drop(file);
        self.dirty.store(true, Ordering::Relaxed);
    }

    /// Key deletion also drops its usage trail.
    pub fn remove_key(&self, key_id: &str) {
        let mut file = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        file.key_stats.remove(key_id);
        for counts in file.daily.values_mut() {
            counts.remove(key_id);
        }
        drop(file);
        self.dirty.store(true, Ordering::Relaxed);
    }

    pub fn stat_for(&self, key_id: &str) -> Option<KeyStat> {
        let file = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        file.key_stats.get(key_id).cloned()
    }

    pub fn flush_if_dirty(&self) {
        if !self.dirty.swap(false, Ordering::Relaxed) {
            return;
        }
        let snapshot = {
            let file = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            file.clone()
        };
        if let Err(e) = fsio::write_json_atomic(&self.path, &snapshot) {
            tracing::warn!("[Keys] Failed to flush usage stats: {}", e);
            self.dirty.store(true, Ordering::Relaxed);
        }
    }
}
