use std::time::Instant;

use axum::{
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::modules::stats::write_request_log_line;
use crate::proxy::handlers::errors::{to_client_error, ErrorKind};
use crate::proxy::handlers::streaming::{build_sse_response, guard_stream};
use crate::proxy::handlers::pinned_account;
use crate::proxy::router::DispatchError;
use crate::proxy::server::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct AccountQuery {
    pub account: Option<String>,
}

/// Turn a dispatch failure into the client's response. Non-rotating 4xx
/// bodies come back verbatim with the upstream status.
pub(crate) fn dispatch_error_response(error: DispatchError) -> Response {
    match error {
        DispatchError::Upstream { status, body } => {
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            match serde_json::from_str::<Value>(&body) {
                Ok(json) => (status, Json(json)).into_response(),
                Err(_) => (status, body).into_response(),
            }
        }
        DispatchError::Client { kind, message } => to_client_error(kind, message),
    }
}

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AccountQuery>,
    Json(mut body): Json<Value>,
) -> Response {
    // Validation short-circuits before any account is touched.
    let Some(object) = body.as_object_mut() else {
        return to_client_error(ErrorKind::ValidationError, "Request body must be a JSON object");
    };
    let messages_ok = object
        .get("messages")
        .and_then(Value::as_array)
        .map(|m| !m.is_empty())
        .unwrap_or(false);
    if !messages_ok {
        return to_client_error(
            ErrorKind::ValidationError,
            "'messages' must be a non-empty array",
        );
    }

    let pinned = pinned_account(&headers, query.account.as_deref(), Some(&body));
    // The pin is relay routing detail, not vendor payload.
    if let Some(object) = body.as_object_mut() {
        object.remove("account");
        if object
            .get("model")
            .and_then(Value::as_str)
            .map(str::is_empty)
            .unwrap_or(true)
        {
            object.insert(
                "model".to_string(),
                Value::String(state.config.default_model.clone()),
            );
        }
    }

    let wants_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let stream = wants_stream && state.config.stream_enabled;
    if wants_stream && !stream {
        info!("[Chat] Streaming disabled globally, serving buffered response");
        body["stream"] = Value::Bool(false);
    }

    let started = Instant::now();
    if stream {
        match state
            .dispatcher
            .chat_completion_stream(body, pinned.as_deref())
            .await
        {
            Ok((account_id, lines)) => {
                if state.config.request_log_enabled {
                    write_request_log_line(
                        &account_id,
                        "/v1/chat/completions",
                        200,
                        started.elapsed().as_millis() as u64,
                    );
                }
                build_sse_response(Body::from_stream(guard_stream(lines)), &account_id)
            }
            Err(error) => dispatch_error_response(error),
        }
    } else {
        match state.dispatcher.chat_completion(body, pinned.as_deref()).await {
            Ok((account_id, response)) => {
                if state.config.request_log_enabled {
                    write_request_log_line(
                        &account_id,
                        "/v1/chat/completions",
                        200,
                        started.elapsed().as_millis() as u64,
                    );
                }
                Json(response).into_response()
            }
            Err(error) => dispatch_error_response(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upstream_passthrough_keeps_status_and_body() {
        let response = dispatch_error_response(DispatchError::Upstream {
            status: 404,
            body: r#"{"error":{"message":"model not found"}}"#.to_string(),
        });
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn client_errors_render_the_taxonomy() {
        let response = dispatch_error_response(DispatchError::Client {
            kind: ErrorKind::UpstreamUnavailable,
            message: "all attempts failed".to_string(),
        });
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
