use std::time::Instant;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use crate::constants::WEB_SEARCH_MAX_ROWS;
use crate::modules::stats::write_request_log_line;
use crate::proxy::handlers::chat::{dispatch_error_response, AccountQuery};
use crate::proxy::handlers::errors::{to_client_error, ErrorKind};
use crate::proxy::handlers::pinned_account;
use crate::proxy::server::AppState;

#[derive(Debug, Deserialize)]
pub struct WebSearchRequest {
    #[serde(default)]
    pub query: String,
    pub page: Option<u32>,
    pub rows: Option<u32>,
    pub account: Option<String>,
}

pub(crate) fn validate_search_request(request: &WebSearchRequest) -> Result<(), String> {
    if request.query.trim().is_empty() {
        return Err("'query' must not be empty".to_string());
    }
    if let Some(rows) = request.rows {
        if rows == 0 || rows > WEB_SEARCH_MAX_ROWS {
            return Err(format!(
                "'rows' must be between 1 and {}",
                WEB_SEARCH_MAX_ROWS
            ));
        }
    }
    Ok(())
}

pub async fn handle_web_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query_params): Query<AccountQuery>,
    Json(request): Json<WebSearchRequest>,
) -> Response {
    if let Err(message) = validate_search_request(&request) {
        return to_client_error(ErrorKind::ValidationError, message);
    }

    let body_pin = request
        .account
        .as_deref()
        .map(|a| serde_json::json!({ "account": a }));
    let pinned = pinned_account(&headers, query_params.account.as_deref(), body_pin.as_ref());

    let started = Instant::now();
    match state
        .dispatcher
        .web_search(request.query, request.page, request.rows, pinned.as_deref())
        .await
    {
        Ok((account_id, body)) => {
            if state.config.request_log_enabled {
                write_request_log_line(
                    &account_id,
                    "/v1/web/search",
                    200,
                    started.elapsed().as_millis() as u64,
                );
            }
            Json(body).into_response()
        }
        Err(error) => dispatch_error_response(error),
    }
}
