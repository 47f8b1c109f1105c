//! Router-level tests: the full axum stack with the validator middleware in
//! front, no live upstream. Everything that must short-circuit before
//! account selection is exercised here.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use crate::models::AppConfig;
use crate::modules::auth::device_flow::DeviceFlowRegistry;
use crate::modules::keys::{
    ApiKeyStore, KeyUsageStats, Permission, RateLimitSpec, SlidingWindowLimiter,
};
use crate::modules::stats::Counters;
use crate::proxy::pool::AccountPool;
use crate::proxy::router::Dispatcher;
use crate::proxy::server::{build_router, AppState};
use crate::proxy::upstream::UpstreamClient;
use crate::test_utils::{lock_env, ScopedEnvVar};

fn build_state() -> AppState {
    let (counters, _task) = Counters::start().expect("counters");
    let pool = Arc::new(AccountPool::new());
    let key_store = Arc::new(ApiKeyStore::load().expect("key store"));
    let key_usage = Arc::new(KeyUsageStats::load().expect("key usage"));

    AppState {
        config: Arc::new(AppConfig::default()),
        dispatcher: Arc::new(Dispatcher::new(
            Arc::clone(&pool),
            Arc::new(UpstreamClient::new()),
            counters.clone(),
        )),
        key_store,
        key_usage,
        limiter: Arc::new(SlidingWindowLimiter::new(64)),
        counters,
        device_flows: Arc::new(DeviceFlowRegistry::new()),
        started_at: Instant::now(),
    }
}

fn post_json(path: &str, key: Option<&str>, body: &str) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {}", key));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get_request(path: &str, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(path);
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {}", key));
    }
    builder.body(Body::empty()).unwrap()
}

async fn response_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

const CHAT_BODY: &str = r#"{"model":"qwen3-coder-plus","messages":[{"role":"user","content":"hi"}]}"#;

#[tokio::test]
async fn missing_authorization_header_is_rejected() {
    let _guard = lock_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

    let app = build_router(build_state());
    let response = app
        .oneshot(post_json("/v1/chat/completions", None, CHAT_BODY))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response_json(response).await;
    assert_eq!(body["error"]["type"], "authentication_error");
}

#[tokio::test]
async fn malformed_key_is_rejected_before_validation() {
    let _guard = lock_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

    let app = build_router(build_state());
    let response = app
        .oneshot(post_json("/v1/chat/completions", Some("sk-wrong-prefix"), CHAT_BODY))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn key_without_chat_permission_is_denied_and_nothing_is_counted() {
    let _guard = lock_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

    let state = build_state();
    let (raw_key, _) = state
        .key_store
        .create(
            "models-only".to_string(),
            None,
            vec![Permission::ModelsList],
            None,
        )
        .await
        .expect("create key");

    let app = build_router(state.clone());
    let response = app
        .oneshot(post_json("/v1/chat/completions", Some(&raw_key), CHAT_BODY))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let body = response_json(response).await;
    assert_eq!(body["error"]["type"], "permission_error");

    state.counters.flush().await;
    let totals = state.counters.totals_today();
    assert_eq!(totals.chat_requests, 0);
    assert_eq!(totals.input_tokens, 0);
}

#[tokio::test]
async fn search_rows_boundary_short_circuits_before_account_selection() {
    let _guard = lock_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

    let state = build_state();
    let (raw_key, _) = state
        .key_store
        .create(
            "searcher".to_string(),
            None,
            vec![Permission::ChatCompletions],
            None,
        )
        .await
        .expect("create key");

    // The pool is empty: a 400 here proves validation ran first, otherwise
    // the dispatcher would have answered for the missing accounts.
    let app = build_router(state);
    let response = app
        .oneshot(post_json(
            "/v1/web/search",
            Some(&raw_key),
            r#"{"query":"rust","rows":101}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = response_json(response).await;
    assert_eq!(body["error"]["type"], "validation_error");
}

#[tokio::test]
async fn chat_without_messages_is_a_validation_error() {
    let _guard = lock_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

    let state = build_state();
    let (raw_key, _) = state
        .key_store
        .create("chat".to_string(), None, vec![Permission::FullAccess], None)
        .await
        .expect("create key");

    let app = build_router(state);
    let response = app
        .oneshot(post_json(
            "/v1/chat/completions",
            Some(&raw_key),
            r#"{"model":"qwen3-coder-plus","messages":[]}"#,
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_pinned_account_is_not_found() {
    let _guard = lock_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

    let state = build_state();
    let (raw_key, _) = state
        .key_store
        .create("chat".to_string(), None, vec![Permission::FullAccess], None)
        .await
        .expect("create key");

    let app = build_router(state);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {}", raw_key))
        .header("x-qwen-account", "ghost")
        .body(Body::from(CHAT_BODY))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response_json(response).await;
    assert_eq!(body["error"]["type"], "not_found");
}

#[tokio::test]
async fn health_reports_empty_pool() {
    let _guard = lock_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

    let state = build_state();
    let (raw_key, _) = state
        .key_store
        .create("ops".to_string(), None, vec![Permission::FullAccess], None)
        .await
        .expect("create key");

    let app = build_router(state);
    let response = app
        .oneshot(get_request("/health", Some(&raw_key)))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["status"], "no_accounts");
    assert_eq!(body["accounts"]["total"], 0);
}

#[tokio::test]
async fn per_key_rate_limit_kicks_in_with_retry_hint() {
    let _guard = lock_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

    let state = build_state();
    let (raw_key, _) = state
        .key_store
        .create(
            "limited".to_string(),
            None,
            vec![Permission::FullAccess],
            Some(RateLimitSpec {
                max_requests: 1,
                window_ms: 60_000,
            }),
        )
        .await
        .expect("create key");

    let app = build_router(state);
    let first = app
        .clone()
        .oneshot(get_request("/health", Some(&raw_key)))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(get_request("/health", Some(&raw_key)))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));
    let body = response_json(second).await;
    assert_eq!(body["error"]["type"], "rate_limit_error");
}

#[tokio::test]
async fn admin_key_lifecycle_over_http() {
    let _guard = lock_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

    let state = build_state();
    let (admin_key, _) = state
        .key_store
        .create("admin".to_string(), None, vec![Permission::FullAccess], None)
        .await
        .expect("create admin key");

    // Mint a scoped key through the API.
    let app = build_router(state.clone());
    let response = app
        .clone()
        .oneshot(post_json(
            "/admin/keys",
            Some(&admin_key),
            r#"{"name":"ci","permissions":["models.list"]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = response_json(response).await;
    let minted = body["key"].as_str().expect("raw key").to_string();
    let minted_id = body["metadata"]["key_id"].as_str().unwrap().to_string();
    assert!(minted.starts_with("sk-proj-"));

    // The minted key authenticates but cannot reach admin routes.
    let denied = app
        .clone()
        .oneshot(get_request("/admin/keys", Some(&minted)))
        .await
        .unwrap();
    assert_eq!(denied.status(), StatusCode::FORBIDDEN);

    // Round trip: the raw key validates back to the same record.
    let validated = state.key_store.validate(&minted).await.expect("validate");
    assert_eq!(validated.key_id, minted_id);

    // Delete it and the key stops working.
    let deleted = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/admin/keys/{}", minted_id))
                .header("authorization", format!("Bearer {}", admin_key))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(deleted.status(), StatusCode::NO_CONTENT);

    let gone = app
        .oneshot(get_request("/health", Some(&minted)))
        .await
        .unwrap();
    assert_eq!(gone.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn admin_accounts_listing_is_empty_without_accounts() {
    let _guard = lock_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

    let state = build_state();
    let (admin_key, _) = state
        .key_store
        .create("admin".to_string(), None, vec![Permission::FullAccess], None)
        .await
        .expect("create admin key");

    let app = build_router(state);
    let response = app
        .oneshot(get_request("/admin/accounts", Some(&admin_key)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["accounts"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn key_usage_is_recorded_after_completion() {
    let _guard = lock_env();
    let dir = tempfile::tempdir().expect("tempdir");
    let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

    let state = build_state();
    let (raw_key, created) = state
        .key_store
        .create("ops".to_string(), None, vec![Permission::FullAccess], None)
        .await
        .expect("create key");

    let app = build_router(state.clone());
    let response = app
        .oneshot(get_request("/health", Some(&raw_key)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let metadata = state.key_store.get(&created.key_id).await.expect("metadata");
    assert_eq!(metadata.usage_count, 1);
    assert!(metadata.last_used_at.is_some());

    let stat = state.key_usage.stat_for(&created.key_id).expect("stat");
    assert_eq!(stat.total_requests, 1);
    assert_eq!(stat.total_errors, 0);
}
