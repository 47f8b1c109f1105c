use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::time::{self, Duration};
use tracing::{info, warn};

use crate::constants::{REFRESH_BATCH_SIZE, REFRESH_TICK_SECS};
use crate::modules::auth::refresh::{refresh_account, RefreshOutcome};
use crate::proxy::pool::AccountPool;

// One flag for the whole scheduler: an overlapping tick is dropped, not queued.
static REFRESH_IN_PROGRESS: Lazy<AtomicBool> = Lazy::new(|| AtomicBool::new(false));

/// Background token renewal. Runs once at startup, then every tick. Candidate
/// selection lives in the pool: every account under its randomized
/// [10, 30]-minute threshold (so anything inside the hard 10-minute floor,
/// expired ones included) gets refreshed.
pub fn start_scheduler(pool: Arc<AccountPool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("[Scheduler] Token refresh scheduler started");
        let mut interval = time::interval(Duration::from_secs(REFRESH_TICK_SECS));

        loop {
            interval.tick().await;

            if REFRESH_IN_PROGRESS.swap(true, Ordering::SeqCst) {
                warn!("[Scheduler] Previous refresh pass still running, skipping tick");
                continue;
            }

            let candidates = pool.refresh_candidates();
            if !candidates.is_empty() {
                info!("[Scheduler] {} account(s) due for refresh", candidates.len());
                run_refresh_pass(&pool, candidates).await;
            }

            REFRESH_IN_PROGRESS.store(false, Ordering::SeqCst);
        }
    })
}

/// Refresh every account unconditionally, still one in-flight refresh per
/// account.
pub async fn force_refresh_all(pool: &Arc<AccountPool>) -> (usize, usize) {
    let ids: Vec<String> = pool
        .snapshot()
        .into_iter()
        .map(|a| a.account_id)
        .collect();
    let total = ids.len();
    let refreshed = run_refresh_pass(pool, ids).await;
    (refreshed, total)
}

async fn run_refresh_pass(pool: &Arc<AccountPool>, candidates: Vec<String>) -> usize {
    if candidates.is_empty() {
        return 0;
    }
    let mut refreshed = 0;
    for batch in candidates.chunks(REFRESH_BATCH_SIZE) {
        let tasks = batch.iter().map(|account_id| {
            let pool = Arc::clone(pool);
            let account_id = account_id.clone();
            async move { (account_id.clone(), refresh_account(&pool, &account_id).await) }
        });

        for (account_id, outcome) in futures::future::join_all(tasks).await {
            match outcome {
                RefreshOutcome::Refreshed => refreshed += 1,
                RefreshOutcome::AlreadyInFlight => {
                    info!("[Scheduler] {} already refreshing elsewhere, skipped", account_id)
                }
                RefreshOutcome::InvalidGrant => {
                    warn!("[Scheduler] {} needs re-authorization (invalid_grant)", account_id)
                }
                RefreshOutcome::Failed(e) => {
                    warn!("[Scheduler] {} refresh failed, will retry next tick: {}", account_id, e)
                }
            }
        }
    }
    refreshed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn force_refresh_on_empty_pool_is_a_noop() {
        let pool = Arc::new(AccountPool::new());
        assert_eq!(force_refresh_all(&pool).await, (0, 0));
    }
}
