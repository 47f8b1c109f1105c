use axum::{
    extract::{Extension, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::modules::audit;
use crate::modules::auth::device_flow::DeviceFlow;
use crate::modules::auth::oauth::{self, PollOutcome};
use crate::proxy::handlers::errors::{to_client_error, ErrorKind};
use crate::proxy::middleware::ApiKeyIdentity;
use crate::proxy::server::AppState;

/// POST /auth/initiate — start a device authorization. The response carries
/// the PKCE verifier; the caller must feed it back into /auth/poll.
pub async fn handle_initiate(
    State(state): State<AppState>,
    identity: Option<Extension<ApiKeyIdentity>>,
) -> Response {
    let (authorization, code_verifier) = match oauth::initiate_device_flow().await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("[DeviceFlow] Initiate failed: {}", e);
            return to_client_error(ErrorKind::UpstreamUnavailable, e);
        }
    };

    let target_account_id = uuid::Uuid::new_v4().to_string();
    let flow = DeviceFlow {
        device_code: authorization.device_code.clone(),
        target_account_id: target_account_id.clone(),
        user_code: authorization.user_code.clone(),
        verification_uri: authorization.verification_uri.clone(),
        verification_uri_complete: authorization.verification_uri_complete.clone(),
        code_verifier: code_verifier.clone(),
        expires_at: chrono::Utc::now().timestamp_millis() + authorization.expires_in * 1_000,
        poll_interval: authorization.interval,
    };
    state.device_flows.insert(flow);

    let actor = identity
        .as_ref()
        .map(|Extension(id)| id.name.as_str())
        .unwrap_or("unknown");
    audit::record("device_flow_initiated", actor, None, &target_account_id);

    Json(json!({
        "device_code": authorization.device_code,
        "user_code": authorization.user_code,
        "verification_uri": authorization.verification_uri,
        "verification_uri_complete": authorization.verification_uri_complete,
        "expires_in": authorization.expires_in,
        "interval": authorization.interval,
        "code_verifier": code_verifier,
        "account_id": target_account_id,
    }))
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct PollRequest {
    pub device_code: String,
    pub code_verifier: String,
}

/// POST /auth/poll — one redemption attempt. Completion persists the
/// credentials before the flow object is destroyed.
pub async fn handle_poll(
    State(state): State<AppState>,
    identity: Option<Extension<ApiKeyIdentity>>,
    Json(request): Json<PollRequest>,
) -> Response {
    let Some(flow) = state.device_flows.get(&request.device_code) else {
        return to_client_error(ErrorKind::NotFound, "Unknown or expired device flow");
    };

    let outcome = match oauth::poll_device_token(&request.device_code, &request.code_verifier).await
    {
        Ok(outcome) => outcome,
        Err(e) => return to_client_error(ErrorKind::UpstreamUnavailable, e),
    };

    let actor = identity
        .as_ref()
        .map(|Extension(id)| id.name.as_str())
        .unwrap_or("unknown")
        .to_string();

    match outcome {
        PollOutcome::Pending => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "pending",
                "message": "Authorization pending, keep polling",
                "interval": flow.poll_interval,
            })),
        )
            .into_response(),
        PollOutcome::SlowDown => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "slow_down",
                "message": "Polling too fast, increase the interval",
                "interval": flow.poll_interval + 5,
            })),
        )
            .into_response(),
        PollOutcome::Completed(token) => {
            let creds = token.into_credentials(None);
            let access_token = creds.access_token.clone();
            let account_id = flow.target_account_id.clone();

            if let Err(e) = state.dispatcher.pool().add(&account_id, creds) {
                warn!("[DeviceFlow] Failed to persist account {}: {}", account_id, e);
                return to_client_error(ErrorKind::InternalError, "Failed to persist credentials");
            }
            state.device_flows.remove(&request.device_code);
            audit::record("account_created", &actor, None, &account_id);
            info!("[DeviceFlow] Account {} authorized", account_id);

            Json(json!({
                "access_token": access_token,
                "account_id": account_id,
                "message": "Account authorized",
            }))
            .into_response()
        }
        PollOutcome::Expired => {
            state.device_flows.remove(&request.device_code);
            audit::record("device_flow_expired", &actor, None, &flow.target_account_id);
            to_client_error(ErrorKind::AuthenticationError, "Device flow expired")
        }
        PollOutcome::Denied => {
            state.device_flows.remove(&request.device_code);
            audit::record("device_flow_denied", &actor, None, &flow.target_account_id);
            to_client_error(ErrorKind::AuthenticationError, "Authorization denied")
        }
    }
}
