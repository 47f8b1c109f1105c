use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::constants::{
    AUTH_ERROR_THRESHOLD, REFRESH_THRESHOLD_MAX_MINUTES, REFRESH_THRESHOLD_MIN_MINUTES,
};
use crate::models::StoredCredentials;
use crate::modules::auth::account as account_store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PickPurpose {
    Chat,
    Search,
}

impl PickPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            PickPurpose::Chat => "chat",
            PickPurpose::Search => "search",
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no eligible account available")]
    NoEligibleAccount,
    #[error("unknown account: {0}")]
    UnknownAccount(String),
    #[error("persistence error: {0}")]
    Persistence(String),
}

struct AccountEntry {
    creds: StoredCredentials,
    consecutive_auth_errors: u32,
    /// ms epoch; 0 = not exhausted. Reset boundary is the next UTC midnight.
    quota_exhausted_until: i64,
    last_used: i64,
    refreshing: bool,
    /// Scheduler threshold in minutes, randomized per account to
    /// de-synchronize mass refreshes.
    refresh_threshold_minutes: i64,
}

impl AccountEntry {
    fn new(creds: StoredCredentials) -> Self {
        Self {
            creds,
            consecutive_auth_errors: 0,
            quota_exhausted_until: 0,
            last_used: 0,
            refreshing: false,
            refresh_threshold_minutes: rand::thread_rng()
                .gen_range(REFRESH_THRESHOLD_MIN_MINUTES..=REFRESH_THRESHOLD_MAX_MINUTES),
        }
    }

    fn is_eligible(&self, now_ms: i64) -> bool {
        self.quota_exhausted_until <= now_ms
            && self.consecutive_auth_errors < AUTH_ERROR_THRESHOLD
            && !self.refreshing
    }
}

#[derive(Debug, Clone)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub creds: StoredCredentials,
    pub consecutive_auth_errors: u32,
    pub quota_exhausted_until: i64,
    pub last_used: i64,
}

impl AccountSnapshot {
    pub fn is_auth_dead(&self) -> bool {
        self.consecutive_auth_errors >= AUTH_ERROR_THRESHOLD
    }
}

pub fn next_utc_midnight_ms(now_ms: i64) -> i64 {
    const DAY_MS: i64 = 24 * 60 * 60 * 1_000;
    (now_ms / DAY_MS + 1) * DAY_MS
}

/// Owns every loaded account's credentials and runtime flags. All mutation
/// goes through this type; callers only ever see credential snapshots.
#[derive(Default)]
pub struct AccountPool {
    inner: RwLock<HashMap<String, AccountEntry>>,
}

impl AccountPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hydrate every persisted account. A corrupt file skips that account and
    /// leaves the pool usable.
    pub fn load_all(&self) -> Result<usize, PoolError> {
        let ids = account_store::list_account_ids().map_err(PoolError::Persistence)?;
        let mut loaded = 0;
        let mut accounts = self.inner.write().unwrap_or_else(|p| p.into_inner());

        for id in ids {
            match account_store::load_credentials(&id) {
                Ok(creds) => {
                    accounts
                        .entry(id)
                        .or_insert_with(|| AccountEntry::new(creds));
                    loaded += 1;
                }
                Err(e) => {
                    warn!("[Pool] Skipping account {}: {}", id, e);
                }
            }
        }

        info!("[Pool] Loaded {} account(s)", loaded);
        Ok(loaded)
    }

    /// Persist first, then insert, so a storage failure leaves memory intact.
    pub fn add(&self, account_id: &str, creds: StoredCredentials) -> Result<(), PoolError> {
        account_store::save_credentials(account_id, &creds).map_err(PoolError::Persistence)?;
        let mut accounts = self.inner.write().unwrap_or_else(|p| p.into_inner());
        accounts.insert(account_id.to_string(), AccountEntry::new(creds));
        info!("[Pool] Added account {}", account_id);
        Ok(())
    }

    pub fn remove(&self, account_id: &str) -> Result<(), PoolError> {
        account_store::delete_credentials(account_id).map_err(PoolError::Persistence)?;
        let mut accounts = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if accounts.remove(account_id).is_none() {
            return Err(PoolError::UnknownAccount(account_id.to_string()));
        }
        info!("[Pool] Removed account {}", account_id);
        crate::modules::audit::record("account_deleted", "operator", None, account_id);
        Ok(())
    }

    /// Least-recently-used eligible account. Quota-exhausted, auth-dead and
    /// mid-refresh accounts never come back from here.
    pub fn pick(&self, purpose: PickPurpose) -> Result<String, PoolError> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut accounts = self.inner.write().unwrap_or_else(|p| p.into_inner());

        let chosen = accounts
            .iter()
            .filter(|(_, entry)| entry.is_eligible(now))
            .min_by_key(|(id, entry)| (entry.last_used, (*id).clone()))
            .map(|(id, _)| id.clone())
            .ok_or(PoolError::NoEligibleAccount)?;

        if let Some(entry) = accounts.get_mut(&chosen) {
            entry.last_used = now;
        }
        tracing::debug!("[Pool] Picked {} for {}", chosen, purpose.as_str());
        Ok(chosen)
    }

    pub fn credentials_for(&self, account_id: &str) -> Result<StoredCredentials, PoolError> {
        let accounts = self.inner.read().unwrap_or_else(|p| p.into_inner());
        accounts
            .get(account_id)
            .map(|entry| entry.creds.clone())
            .ok_or_else(|| PoolError::UnknownAccount(account_id.to_string()))
    }

    pub fn mark_quota_exhausted(&self, account_id: &str) {
        let now = chrono::Utc::now().timestamp_millis();
        let until = next_utc_midnight_ms(now);
        let mut accounts = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = accounts.get_mut(account_id) {
            entry.quota_exhausted_until = until;
            warn!(
                "[Pool] Account {} quota exhausted until UTC midnight ({})",
                account_id, until
            );
        }
    }

    pub fn mark_auth_error(&self, account_id: &str) -> u32 {
        let mut accounts = self.inner.write().unwrap_or_else(|p| p.into_inner());
        match accounts.get_mut(account_id) {
            Some(entry) => {
                entry.consecutive_auth_errors += 1;
                if entry.consecutive_auth_errors >= AUTH_ERROR_THRESHOLD {
                    warn!(
                        "[Pool] Account {} hit auth error threshold ({})",
                        account_id, entry.consecutive_auth_errors
                    );
                }
                entry.consecutive_auth_errors
            }
            None => 0,
        }
    }

    /// Terminal: the refresh_token no longer works. The account stays loaded
    /// but is never picked until re-authorized.
    pub fn mark_auth_dead(&self, account_id: &str) {
        let mut accounts = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = accounts.get_mut(account_id) {
            entry.consecutive_auth_errors = AUTH_ERROR_THRESHOLD;
        }
        warn!("[Pool] Account {} marked auth-dead (invalid_grant)", account_id);
    }

    /// Returns a guard exactly once while no refresh is in flight for the
    /// account; concurrent callers get None and must skip or wait.
    pub fn try_lock_for_refresh(self: &Arc<Self>, account_id: &str) -> Option<RefreshGuard> {
        let mut accounts = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let entry = accounts.get_mut(account_id)?;
        if entry.refreshing {
            return None;
        }
        entry.refreshing = true;
        Some(RefreshGuard {
            pool: Arc::clone(self),
            account_id: account_id.to_string(),
        })
    }

    fn release_refresh(&self, account_id: &str) {
        let mut accounts = self.inner.write().unwrap_or_else(|p| p.into_inner());
        if let Some(entry) = accounts.get_mut(account_id) {
            entry.refreshing = false;
        }
    }

    /// Install refreshed credentials: persisted first, then swapped in under
    /// the pool lock so readers see either the old or the new bundle. A
    /// successful refresh also clears the auth-error count.
    pub fn swap_credentials(
        &self,
        account_id: &str,
        creds: StoredCredentials,
    ) -> Result<(), PoolError> {
        account_store::save_credentials(account_id, &creds).map_err(PoolError::Persistence)?;
        let mut accounts = self.inner.write().unwrap_or_else(|p| p.into_inner());
        let entry = accounts
            .get_mut(account_id)
            .ok_or_else(|| PoolError::UnknownAccount(account_id.to_string()))?;
        if creds.expiry_timestamp <= entry.creds.expiry_timestamp {
            warn!(
                "[Pool] Refresh for {} did not advance expiry ({} -> {})",
                account_id, entry.creds.expiry_timestamp, creds.expiry_timestamp
            );
        }
        entry.creds = creds;
        entry.consecutive_auth_errors = 0;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn eligible_count(&self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        let accounts = self.inner.read().unwrap_or_else(|p| p.into_inner());
        accounts.values().filter(|e| e.is_eligible(now)).count()
    }

    pub fn all_quota_exhausted(&self) -> bool {
        let now = chrono::Utc::now().timestamp_millis();
        let accounts = self.inner.read().unwrap_or_else(|p| p.into_inner());
        !accounts.is_empty() && accounts.values().all(|e| e.quota_exhausted_until > now)
    }

    pub fn snapshot(&self) -> Vec<AccountSnapshot> {
        let accounts = self.inner.read().unwrap_or_else(|p| p.into_inner());
        let mut out: Vec<AccountSnapshot> = accounts
            .iter()
            .map(|(id, entry)| AccountSnapshot {
                account_id: id.clone(),
                creds: entry.creds.clone(),
                consecutive_auth_errors: entry.consecutive_auth_errors,
                quota_exhausted_until: entry.quota_exhausted_until,
                last_used: entry.last_used,
            })
            .collect();
        out.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        out
    }

    /// Accounts whose remaining lifetime fell under their randomized
    /// threshold (always at least the hard 10-minute floor).
    pub fn refresh_candidates(&self) -> Vec<String> {
        let accounts = self.inner.read().unwrap_or_else(|p| p.into_inner());
        accounts
            .iter()
            .filter(|(_, entry)| {
                entry.creds.minutes_left() <= entry.refresh_threshold_minutes
                    && entry.consecutive_auth_errors < AUTH_ERROR_THRESHOLD
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Scoped per-account refresh lock. Dropping it releases the slot.
pub struct RefreshGuard {
    pool: Arc<AccountPool>,
    account_id: String,
}

impl RefreshGuard {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.pool.release_refresh(&self.account_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{lock_env, ScopedEnvVar};

    fn creds(expiry_delta_ms: i64) -> StoredCredentials {
        StoredCredentials {
            access_token: "T1".to_string(),
            refresh_token: "R1".to_string(),
            token_type: "Bearer".to_string(),
            expiry_timestamp: chrono::Utc::now().timestamp_millis() + expiry_delta_ms,
            resource_url: None,
            code_verifier: None,
        }
    }

    fn pool_with(ids: &[&str]) -> Arc<AccountPool> {
        let pool = Arc::new(AccountPool::new());
        let mut accounts = pool.inner.write().unwrap();
        for id in ids {
            accounts.insert(id.to_string(), AccountEntry::new(creds(3_600_000)));
        }
        drop(accounts);
        pool
    }

    #[test]
    fn pick_is_identity_for_a_single_account() {
        let pool = pool_with(&["acct1"]);
        for _ in 0..5 {
            assert_eq!(pool.pick(PickPurpose::Chat).expect("pick"), "acct1");
        }
    }

    #[test]
    fn pick_round_robins_by_last_used() {
        let pool = pool_with(&["acct1", "acct2"]);
        let first = pool.pick(PickPurpose::Chat).expect("pick");
        let second = pool.pick(PickPurpose::Chat).expect("pick");
        let third = pool.pick(PickPurpose::Chat).expect("pick");
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[test]
    fn pick_skips_quota_exhausted_accounts() {
        let pool = pool_with(&["acct1", "acct2"]);
        pool.mark_quota_exhausted("acct1");
        for _ in 0..3 {
            assert_eq!(pool.pick(PickPurpose::Chat).expect("pick"), "acct2");
        }
    }

    #[test]
    fn pick_skips_auth_dead_accounts() {
        let pool = pool_with(&["acct1", "acct2"]);
        for _ in 0..AUTH_ERROR_THRESHOLD {
            pool.mark_auth_error("acct1");
        }
        assert_eq!(pool.pick(PickPurpose::Search).expect("pick"), "acct2");

        for _ in 0..AUTH_ERROR_THRESHOLD {
            pool.mark_auth_error("acct2");
        }
        assert!(matches!(
            pool.pick(PickPurpose::Search),
            Err(PoolError::NoEligibleAccount)
        ));
    }

    #[test]
    fn pick_skips_accounts_mid_refresh() {
        let pool = pool_with(&["acct1", "acct2"]);
        let guard = pool.try_lock_for_refresh("acct1").expect("lock");
        assert_eq!(pool.pick(PickPurpose::Chat).expect("pick"), "acct2");
        drop(guard);
        pool.mark_quota_exhausted("acct2");
        assert_eq!(pool.pick(PickPurpose::Chat).expect("pick"), "acct1");
    }

    #[test]
    fn refresh_lock_is_exclusive_until_dropped() {
        let pool = pool_with(&["acct1"]);
        let guard = pool.try_lock_for_refresh("acct1").expect("first lock");
        assert!(pool.try_lock_for_refresh("acct1").is_none());
        drop(guard);
        assert!(pool.try_lock_for_refresh("acct1").is_some());
    }

    #[test]
    fn quota_mark_lasts_until_next_utc_midnight() {
        let now = chrono::Utc::now().timestamp_millis();
        let midnight = next_utc_midnight_ms(now);
        assert!(midnight > now);
        assert!(midnight - now <= 24 * 60 * 60 * 1_000);
        assert_eq!(midnight % (24 * 60 * 60 * 1_000), 0);
    }

    #[test]
    fn swap_clears_auth_errors_and_advances_expiry() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

        let pool = pool_with(&["acct1"]);
        pool.mark_auth_error("acct1");
        pool.mark_auth_error("acct1");

        let before = pool.credentials_for("acct1").expect("creds");
        let refreshed = creds(7_200_000);
        pool.swap_credentials("acct1", refreshed.clone()).expect("swap");

        let after = pool.credentials_for("acct1").expect("creds");
        assert!(after.expiry_timestamp > before.expiry_timestamp);
        // Eligible again right away.
        assert_eq!(pool.pick(PickPurpose::Chat).expect("pick"), "acct1");
    }

    #[test]
    fn add_and_remove_persist_credentials() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

        let pool = Arc::new(AccountPool::new());
        pool.add("acct1", creds(3_600_000)).expect("add");
        assert!(dir.path().join("oauth_creds_acct1.json").exists());
        assert_eq!(pool.len(), 1);

        pool.remove("acct1").expect("remove");
        assert!(!dir.path().join("oauth_creds_acct1.json").exists());
        assert!(pool.is_empty());
    }

    #[test]
    fn add_rolls_back_when_persistence_fails() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        // Point DATA_DIR at a file so credential writes cannot land.
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").expect("blocker file");
        let _data_dir = ScopedEnvVar::set("DATA_DIR", blocker.to_str().unwrap());

        let pool = Arc::new(AccountPool::new());
        assert!(matches!(
            pool.add("acct1", creds(3_600_000)),
            Err(PoolError::Persistence(_))
        ));
        assert!(pool.is_empty());
    }

    #[test]
    fn expired_candidates_are_flagged_for_refresh() {
        let pool = Arc::new(AccountPool::new());
        {
            let mut accounts = pool.inner.write().unwrap();
            accounts.insert("fresh".to_string(), AccountEntry::new(creds(3_600_000)));
            accounts.insert("stale".to_string(), AccountEntry::new(creds(5 * 60_000)));
        }
        let candidates = pool.refresh_candidates();
        assert!(candidates.contains(&"stale".to_string()));
        assert!(!candidates.contains(&"fresh".to_string()));
    }

    #[test]
    fn all_quota_exhausted_detects_full_outage() {
        let pool = pool_with(&["acct1", "acct2"]);
        assert!(!pool.all_quota_exhausted());
        pool.mark_quota_exhausted("acct1");
        assert!(!pool.all_quota_exhausted());
        pool.mark_quota_exhausted("acct2");
        assert!(pool.all_quota_exhausted());
    }
}
