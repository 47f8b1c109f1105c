use std::time::Instant;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};

use crate::constants::{API_KEY_MIN_LEN, API_KEY_PREFIX};
use crate::modules::keys::{Permission, RateDecision};
use crate::proxy::handlers::errors::{rate_limited_response, to_client_error, ErrorKind};
use crate::proxy::server::AppState;

/// Attached to the request once the key has been admitted, for handlers and
/// audit records.
#[derive(Clone, Debug)]
pub struct ApiKeyIdentity {
    pub key_id: String,
    pub name: String,
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Endpoint → required permission. `None` admits any active key;
/// `full_access` bypasses the whole map.
pub fn required_permission(path: &str) -> Option<Permission> {
    if path.starts_with("/v1/chat/completions") {
        Some(Permission::ChatCompletions)
    } else if path.starts_with("/v1/models") {
        Some(Permission::ModelsList)
    } else if path.starts_with("/v1/web/search") {
        Some(Permission::ChatCompletions)
    } else if path.starts_with("/auth/") || path.starts_with("/admin/") {
        Some(Permission::FullAccess)
    } else {
        None
    }
}

/// Gate on every forwarded endpoint: Bearer extraction, shape check, PBKDF2
/// validation, permission map, per-key rate limit, then post-completion
/// bookkeeping.
pub async fn api_key_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    let Some(raw_key) = extract_bearer(request.headers()) else {
        return to_client_error(
            ErrorKind::AuthenticationError,
            "Missing or malformed Authorization header",
        );
    };

    if !raw_key.starts_with(API_KEY_PREFIX) || raw_key.len() < API_KEY_MIN_LEN {
        return to_client_error(ErrorKind::AuthenticationError, "Malformed API key");
    }

    let Some(key) = state.key_store.validate(raw_key).await else {
        return to_client_error(ErrorKind::AuthenticationError, "Invalid API key");
    };

    if let Some(required) = required_permission(&path) {
        if !key.has_permission(required) {
            return to_client_error(
                ErrorKind::PermissionError,
                format!("API key '{}' lacks permission for {}", key.name, path),
            );
        }
    }

    if let Some(limit) = &key.rate_limit {
        if let RateDecision::Limited { retry_after_secs } =
            state
                .limiter
                .check(&key.key_id, limit.max_requests, limit.window_ms)
        {
            return rate_limited_response(retry_after_secs);
        }
    }

    let identity = ApiKeyIdentity {
        key_id: key.key_id.clone(),
        name: key.name.clone(),
    };
    request.extensions_mut().insert(identity);

    let started = Instant::now();
    let response = next.run(request).await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    let is_error = response.status().is_client_error() || response.status().is_server_error();

    state.key_store.record_usage(&key.key_id).await;
    state.key_usage.record(&key.key_id, elapsed_ms, is_error);

    response
}
