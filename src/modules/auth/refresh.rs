use std::sync::Arc;

use tracing::{info, warn};

use crate::modules::audit;
use crate::modules::auth::oauth;
use crate::proxy::pool::AccountPool;

#[derive(Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    /// Another task already holds the account's refresh lock.
    AlreadyInFlight,
    /// Terminal: refresh_token rejected, account marked dead.
    InvalidGrant,
    Failed(String),
}

/// Refresh one account's credentials under its pool lock. Used by both the
/// background scheduler and the router's inline pre-send refresh.
pub async fn refresh_account(pool: &Arc<AccountPool>, account_id: &str) -> RefreshOutcome {
    let Some(_guard) = pool.try_lock_for_refresh(account_id) else {
        return RefreshOutcome::AlreadyInFlight;
    };

    let previous = match pool.credentials_for(account_id) {
        Ok(creds) => creds,
        Err(e) => return RefreshOutcome::Failed(e.to_string()),
    };

    match oauth::refresh_access_token(&previous.refresh_token).await {
        Ok(response) => {
            let creds = response.into_credentials(Some(&previous));
            if let Err(e) = pool.swap_credentials(account_id, creds) {
                warn!("[Refresh] Failed to persist refreshed token for {}: {}", account_id, e);
                audit::record("refresh_failed", "system", None, account_id);
                return RefreshOutcome::Failed(e.to_string());
            }
            info!("[Refresh] Account {} token renewed", account_id);
            audit::record("refresh_ok", "system", None, account_id);
            RefreshOutcome::Refreshed
        }
        Err(e) if oauth::is_invalid_grant(&e) => {
            pool.mark_auth_dead(account_id);
            audit::record("refresh_invalid_grant", "system", None, account_id);
            RefreshOutcome::InvalidGrant
        }
        Err(e) => {
            warn!("[Refresh] Account {} refresh failed: {}", account_id, e);
            audit::record("refresh_failed", "system", None, account_id);
            RefreshOutcome::Failed(e)
        }
    }
}
