use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::constants::{EXPIRY_SKEW_MS, MAX_DISPATCH_ATTEMPTS, MODELS_CACHE_TTL_SECS};
use crate::models::StoredCredentials;
use crate::modules::auth::refresh::{refresh_account, RefreshOutcome};
use crate::modules::stats::{Counters, RequestKind};
use crate::proxy::handlers::errors::ErrorKind;
use crate::proxy::pool::{AccountPool, PickPurpose, PoolError};
use crate::proxy::sse::normalize_sse;
use crate::proxy::upstream::UpstreamClient;

/// How one upstream failure feeds back into rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 401/403: token no longer accepted.
    AuthInvalid,
    /// 429 or a quota phrase in the body: account is done for the day.
    Quota,
    /// 5xx: try another account.
    Server,
    /// Any other 4xx belongs to the caller; no rotation.
    OtherClient,
}

pub fn classify_failure(status: u16, body: &str) -> FailureClass {
    if status == 401 || status == 403 {
        return FailureClass::AuthInvalid;
    }
    let lower = body.to_ascii_lowercase();
    if status == 429
        || lower.contains("free allocated quota exceeded")
        || lower.contains("quota")
    {
        return FailureClass::Quota;
    }
    if status >= 500 {
        return FailureClass::Server;
    }
    FailureClass::OtherClient
}

pub fn extract_usage(body: &Value) -> Option<(u64, u64)> {
    let usage = body.get("usage")?;
    let input = usage.get("prompt_tokens").and_then(Value::as_u64)?;
    let output = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
    Some((input, output))
}

/// Result count out of the vendor search envelope, for the per-account
/// results counter.
pub fn count_search_results(body: &Value) -> u64 {
    if let Some(results) = body.get("results").and_then(Value::as_array) {
        return results.len() as u64;
    }
    if let Some(results) = body
        .get("data")
        .and_then(|d| d.get("results"))
        .and_then(Value::as_array)
    {
        return results.len() as u64;
    }
    if let Some(items) = body.get("data").and_then(Value::as_array) {
        return items.len() as u64;
    }
    0
}

fn truncate_body(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(300)
        .map(|(i, _)| i)
        .unwrap_or(body.len());
    &body[..end]
}

#[derive(Debug)]
pub enum DispatchError {
    /// Non-rotating upstream 4xx, passed through to the caller verbatim.
    Upstream { status: u16, body: String },
    Client { kind: ErrorKind, message: String },
}

impl DispatchError {
    fn client(kind: ErrorKind, message: impl Into<String>) -> Self {
        DispatchError::Client {
            kind,
            message: message.into(),
        }
    }
}

type SendFuture = BoxFuture<'static, Result<reqwest::Response, String>>;

/// The dispatch core: picks an account, keeps its token fresh, forwards the
/// call and rotates through the pool on the recoverable failure classes.
pub struct Dispatcher {
    pool: Arc<AccountPool>,
    upstream: Arc<UpstreamClient>,
    counters: Counters,
    models_cache: tokio::sync::RwLock<Option<(Instant, Value)>>,
}

impl Dispatcher {
    pub fn new(pool: Arc<AccountPool>, upstream: Arc<UpstreamClient>, counters: Counters) -> Self {
        Self {
            pool,
            upstream,
            counters,
            models_cache: tokio::sync::RwLock::new(None),
        }
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    fn resolve_account(
        &self,
        pinned: Option<&str>,
        purpose: PickPurpose,
    ) -> Result<String, DispatchError> {
        if let Some(id) = pinned {
            self.pool.credentials_for(id).map_err(|_| {
                DispatchError::client(ErrorKind::NotFound, format!("Unknown account: {}", id))
            })?;
            return Ok(id.to_string());
        }

        match self.pool.pick(purpose) {
            Ok(id) => Ok(id),
            Err(PoolError::NoEligibleAccount) => {
                if self.pool.all_quota_exhausted() {
                    Err(DispatchError::client(
                        ErrorKind::QuotaExceeded,
                        "All accounts have exhausted their daily quota",
                    ))
                } else {
                    Err(DispatchError::client(
                        ErrorKind::UpstreamUnavailable,
                        "No eligible account available",
                    ))
                }
            }
            Err(e) => Err(DispatchError::client(ErrorKind::InternalError, e.to_string())),
        }
    }

    /// Credential snapshot for an account, refreshing first when the token is
    /// inside the expiry skew. An expired token is never sent upstream
    /// without a refresh attempt.
    async fn ensure_fresh(&self, account_id: &str) -> Result<StoredCredentials, String> {
        for _ in 0..3 {
            let creds = self
                .pool
                .credentials_for(account_id)
                .map_err(|e| e.to_string())?;
            if !creds.expires_within(EXPIRY_SKEW_MS) {
                return Ok(creds);
            }

            match refresh_account(&self.pool, account_id).await {
                RefreshOutcome::Refreshed => continue,
                RefreshOutcome::AlreadyInFlight => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
                RefreshOutcome::InvalidGrant => {
                    return Err(format!("account {} refresh_token rejected (invalid_grant)", account_id))
                }
                RefreshOutcome::Failed(e) => return Err(e),
            }
        }
        Err(format!("account {} still stale after refresh attempts", account_id))
    }

    /// The attempt loop. `send` is called with a fresh credential snapshot
    /// per attempt; attempts are capped by the eligible pool size.
    async fn execute_with_rotation(
        &self,
        purpose: PickPurpose,
        pinned: Option<&str>,
        send: impl Fn(StoredCredentials) -> SendFuture,
    ) -> Result<(String, reqwest::Response), DispatchError> {
        let attempts_max = if pinned.is_some() {
            1
        } else {
            MAX_DISPATCH_ATTEMPTS.min(self.pool.eligible_count()).max(1)
        };
        let mut last_error = String::new();

        for attempt in 0..attempts_max {
            let account_id = self.resolve_account(pinned, purpose)?;

            let creds = match self.ensure_fresh(&account_id).await {
                Ok(creds) => creds,
                Err(e) => {
                    warn!("[Router] Refresh before send failed for {}: {}", account_id, e);
                    last_error = e;
                    continue;
                }
            };

            let response = match send(creds).await {
                Ok(response) => response,
                Err(e) => {
                    debug!(
                        "[Router] Attempt {}/{} transport error on {}: {}",
                        attempt + 1,
                        attempts_max,
                        account_id,
                        e
                    );
                    last_error = e;
                    continue;
                }
            };

            let status = response.status();
            if status.is_success() {
                return Ok((account_id, response));
            }

            let status_u16 = status.as_u16();
            let body = response.text().await.unwrap_or_default();

            match classify_failure(status_u16, &body) {
                FailureClass::AuthInvalid => {
                    self.pool.mark_auth_error(&account_id);
                    // One inline refresh and a single retry on the same
                    // account before rotating away.
                    if matches!(
                        refresh_account(&self.pool, &account_id).await,
                        RefreshOutcome::Refreshed
                    ) {
                        if let Ok(fresh) = self.pool.credentials_for(&account_id) {
                            if let Ok(retry) = send(fresh).await {
                                if retry.status().is_success() {
                                    return Ok((account_id, retry));
                                }
                            }
                        }
                        self.pool.mark_auth_error(&account_id);
                    }
                    last_error =
                        format!("auth rejected ({}): {}", status_u16, truncate_body(&body));
                }
                FailureClass::Quota => {
                    self.pool.mark_quota_exhausted(&account_id);
                    last_error =
                        format!("quota exhausted ({}): {}", status_u16, truncate_body(&body));
                }
                FailureClass::Server => {
                    last_error =
                        format!("upstream error ({}): {}", status_u16, truncate_body(&body));
                }
                FailureClass::OtherClient => {
                    return Err(DispatchError::Upstream {
                        status: status_u16,
                        body,
                    });
                }
            }
            debug!(
                "[Router] Attempt {}/{} failed on {}: {}",
                attempt + 1,
                attempts_max,
                account_id,
                last_error
            );
        }

        Err(DispatchError::client(
            ErrorKind::UpstreamUnavailable,
            format!("All upstream attempts failed: {}", last_error),
        ))
    }

    fn chat_send(&self, body: Arc<Value>) -> impl Fn(StoredCredentials) -> SendFuture {
        let upstream = Arc::clone(&self.upstream);
        move |creds| {
            let upstream = Arc::clone(&upstream);
            let body = Arc::clone(&body);
            async move { upstream.chat_completion(&creds, &body).await }.boxed()
        }
    }

    /// Buffered chat completion: the vendor body is returned verbatim and
    /// usage is credited from its `usage` block.
    pub async fn chat_completion(
        &self,
        body: Value,
        pinned: Option<&str>,
    ) -> Result<(String, Value), DispatchError> {
        let (account_id, response) = self
            .execute_with_rotation(PickPurpose::Chat, pinned, self.chat_send(Arc::new(body)))
            .await?;

        let json: Value = response.json().await.map_err(|e| {
            DispatchError::client(
                ErrorKind::UpstreamUnavailable,
                format!("Invalid upstream response: {}", e),
            )
        })?;

        self.counters.incr_request(&account_id, RequestKind::Chat, 1);
        if let Some((input, output)) = extract_usage(&json) {
            self.counters.incr_tokens(&account_id, input, output);
        }
        Ok((account_id, json))
    }

    /// Streaming chat completion. The returned stream yields well-framed SSE
    /// lines; usage is credited only once the `usage` chunk or the terminal
    /// `[DONE]` has been observed, so a client that disconnects early
    /// credits nothing.
    pub async fn chat_completion_stream(
        &self,
        body: Value,
        pinned: Option<&str>,
    ) -> Result<(String, impl Stream<Item = Result<Bytes, String>> + Send), DispatchError> {
        let (account_id, response) = self
            .execute_with_rotation(PickPurpose::Chat, pinned, self.chat_send(Arc::new(body)))
            .await?;

        let normalized = normalize_sse(Box::pin(response.bytes_stream()));
        let tracked = track_stream_usage(normalized, self.counters.clone(), account_id.clone());
        Ok((account_id, tracked))
    }

    /// Web search with the vendor's `query ↔ uq` field rename at the boundary.
    pub async fn web_search(
        &self,
        query: String,
        page: Option<u32>,
        rows: Option<u32>,
        pinned: Option<&str>,
    ) -> Result<(String, Value), DispatchError> {
        let mut outbound = json!({ "uq": query });
        if let Some(page) = page {
            outbound["page"] = json!(page);
        }
        if let Some(rows) = rows {
            outbound["rows"] = json!(rows);
        }

        let upstream = Arc::clone(&self.upstream);
        let payload = Arc::new(outbound);
        let send = move |creds: StoredCredentials| -> SendFuture {
            let upstream = Arc::clone(&upstream);
            let payload = Arc::clone(&payload);
            async move { upstream.web_search(&creds, &payload).await }.boxed()
        };

        let (account_id, response) = self
            .execute_with_rotation(PickPurpose::Search, pinned, send)
            .await?;

        let json: Value = response.json().await.map_err(|e| {
            DispatchError::client(
                ErrorKind::UpstreamUnavailable,
                format!("Invalid upstream response: {}", e),
            )
        })?;

        self.counters
            .incr_request(&account_id, RequestKind::WebSearch, 1);
        self.counters
            .incr_search_results(&account_id, count_search_results(&json));
        Ok((account_id, json))
    }

    /// Model list, cached for the vendor-suggested TTL.
    pub async fn list_models(&self) -> Result<Value, DispatchError> {
        {
            let cache = self.models_cache.read().await;
            if let Some((fetched_at, cached)) = cache.as_ref() {
                if fetched_at.elapsed() < Duration::from_secs(MODELS_CACHE_TTL_SECS) {
                    return Ok(cached.clone());
                }
            }
        }

        let upstream = Arc::clone(&self.upstream);
        let send = move |creds: StoredCredentials| -> SendFuture {
            let upstream = Arc::clone(&upstream);
            async move { upstream.list_models(&creds).await }.boxed()
        };

        let (_, response) = self
            .execute_with_rotation(PickPurpose::Chat, None, send)
            .await?;
        let json: Value = response.json().await.map_err(|e| {
            DispatchError::client(
                ErrorKind::UpstreamUnavailable,
                format!("Invalid upstream response: {}", e),
            )
        })?;

        let mut cache = self.models_cache.write().await;
        *cache = Some((Instant::now(), json.clone()));
        Ok(json)
    }
}

/// Watch a normalized SSE stream for the usage chunk / terminal marker and
/// apply exactly one counter increment for the whole request.
fn track_stream_usage<S>(
    stream: S,
    counters: Counters,
    account_id: String,
) -> impl Stream<Item = Result<Bytes, String>> + Send
where
    S: Stream<Item = Result<Bytes, String>> + Send,
{
    let mut credited = false;
    stream.map(move |item| {
        if credited {
            return item;
        }
        if let Ok(line) = &item {
            if let Some(payload) = line.as_ref().strip_prefix(b"data:") {
                if let Ok(text) = std::str::from_utf8(payload) {
                    let text = text.trim();
                    if text == "[DONE]" {
                        credited = true;
                        counters.incr_request(&account_id, RequestKind::Chat, 1);
                    } else if let Ok(value) = serde_json::from_str::<Value>(text) {
                        if let Some((input, output)) = extract_usage(&value) {
                            credited = true;
                            counters.incr_request(&account_id, RequestKind::Chat, 1);
                            counters.incr_tokens(&account_id, input, output);
                        }
                    }
                }
            }
        }
        item
    })
}
