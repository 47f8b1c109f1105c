use axum::{extract::State, response::IntoResponse, response::Response, Json};

use crate::proxy::handlers::chat::dispatch_error_response;
use crate::proxy::server::AppState;

/// Forwarded model list, cached by the dispatcher for the vendor TTL.
pub async fn handle_list_models(State(state): State<AppState>) -> Response {
    match state.dispatcher.list_models().await {
        Ok(body) => Json(body).into_response(),
        Err(error) => dispatch_error_response(error),
    }
}
