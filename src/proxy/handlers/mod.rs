pub mod admin;
pub mod chat;
pub mod device;
pub mod errors;
pub mod models;
pub mod search;
pub mod streaming;

use axum::http::HeaderMap;
use serde_json::Value;

/// Requests may pin a specific account via the `X-Qwen-Account` header, the
/// `?account=` query parameter, or an `account` field in the body.
pub(crate) fn pinned_account(
    headers: &HeaderMap,
    query_account: Option<&str>,
    body: Option<&Value>,
) -> Option<String> {
    if let Some(value) = headers.get("x-qwen-account").and_then(|h| h.to_str().ok()) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    if let Some(account) = query_account {
        let trimmed = account.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    body.and_then(|b| b.get("account"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
