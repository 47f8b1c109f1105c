use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::modules::audit;
use crate::modules::keys::{Permission, RateLimitSpec, UpdateKeyRequest};
use crate::modules::system::scheduler::force_refresh_all;
use crate::proxy::handlers::errors::{to_client_error, ErrorKind};
use crate::proxy::server::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateKeyRequest {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
}

/// GET /admin/keys — metadata only, never digests.
pub async fn handle_list_keys(State(state): State<AppState>) -> Response {
    Json(json!({ "keys": state.key_store.list().await })).into_response()
}

/// POST /admin/keys — the only moment the raw key is ever visible.
pub async fn handle_create_key(
    State(state): State<AppState>,
    Json(request): Json<CreateKeyRequest>,
) -> Response {
    if request.name.trim().is_empty() {
        return to_client_error(ErrorKind::ValidationError, "'name' must not be empty");
    }
    if request.permissions.is_empty() {
        return to_client_error(
            ErrorKind::ValidationError,
            "'permissions' must name at least one permission",
        );
    }

    match state
        .key_store
        .create(
            request.name,
            request.description,
            request.permissions,
            request.rate_limit,
        )
        .await
    {
        Ok((raw_key, metadata)) => (
            StatusCode::CREATED,
            Json(json!({ "key": raw_key, "metadata": metadata })),
        )
            .into_response(),
        Err(e) => to_client_error(ErrorKind::InternalError, e),
    }
}

/// PATCH /admin/keys/:keyId — partial update of mutable fields.
pub async fn handle_update_key(
    State(state): State<AppState>,
    Path(key_id): Path<String>,
    Json(patch): Json<UpdateKeyRequest>,
) -> Response {
    match state.key_store.update(&key_id, patch).await {
        Ok(metadata) => Json(metadata).into_response(),
        Err(e) => to_client_error(ErrorKind::NotFound, e),
    }
}

/// DELETE /admin/keys/:keyId — removes the record and its usage stats.
pub async fn handle_delete_key(
    State(state): State<AppState>,
    Path(key_id): Path<String>,
) -> Response {
    match state.key_store.delete(&key_id).await {
        Ok(true) => {
            state.key_usage.remove_key(&key_id);
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(false) => to_client_error(ErrorKind::NotFound, format!("unknown key: {}", key_id)),
        Err(e) => to_client_error(ErrorKind::InternalError, e),
    }
}

/// GET /admin/accounts — runtime view of the pool.
pub async fn handle_list_accounts(State(state): State<AppState>) -> Response {
    let now = chrono::Utc::now().timestamp_millis();
    let accounts: Vec<serde_json::Value> = state
        .dispatcher
        .pool()
        .snapshot()
        .iter()
        .map(|account| {
            json!({
                "account_id": account.account_id,
                "expiry_timestamp": account.creds.expiry_timestamp,
                "minutes_left": account.creds.minutes_left(),
                "resource_url": account.creds.resource_url,
                "quota_exhausted": account.quota_exhausted_until > now,
                "consecutive_auth_errors": account.consecutive_auth_errors,
                "last_used": account.last_used,
            })
        })
        .collect();
    Json(json!({ "accounts": accounts })).into_response()
}

/// DELETE /admin/accounts/:accountId — drop credentials and pool entry.
pub async fn handle_delete_account(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Response {
    match state.dispatcher.pool().remove(&account_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => to_client_error(ErrorKind::NotFound, e.to_string()),
    }
}

/// POST /admin/accounts/refresh — unconditional refresh of every account.
pub async fn handle_force_refresh(State(state): State<AppState>) -> Response {
    let (refreshed, total) = force_refresh_all(state.dispatcher.pool()).await;
    info!("[Admin] Forced refresh: {}/{} accounts renewed", refreshed, total);
    audit::record("force_refresh", "operator", None, "all");
    Json(json!({ "refreshed": refreshed, "total": total })).into_response()
}
