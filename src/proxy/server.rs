use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::constants::SHUTDOWN_GRACE_SECS;
use crate::error::{AppError, AppResult};
use crate::models::AppConfig;
use crate::modules::auth::device_flow::{self, DeviceFlowRegistry};
use crate::modules::keys::{ApiKeyStore, KeyUsageStats, SlidingWindowLimiter};
use crate::modules::stats::{spawn_stats_collector, Counters};
use crate::modules::system::scheduler;
use crate::proxy::handlers::{admin, chat, device, models, search};
use crate::proxy::health::handle_health;
use crate::proxy::middleware::{api_key_middleware, catch_panic_middleware};
use crate::proxy::pool::AccountPool;
use crate::proxy::router::Dispatcher;
use crate::proxy::upstream::UpstreamClient;

const RATE_LIMITER_MAX_TRACKED: usize = 1024;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub dispatcher: Arc<Dispatcher>,
    pub key_store: Arc<ApiKeyStore>,
    pub key_usage: Arc<KeyUsageStats>,
    pub limiter: Arc<SlidingWindowLimiter>,
    pub counters: Counters,
    pub device_flows: Arc<DeviceFlowRegistry>,
    pub started_at: Instant,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat::handle_chat_completions))
        .route("/v1/models", get(models::handle_list_models))
        .route("/v1/web/search", post(search::handle_web_search))
        .route("/health", get(handle_health))
        .route("/auth/initiate", post(device::handle_initiate))
        .route("/auth/poll", post(device::handle_poll))
        .route(
            "/admin/keys",
            get(admin::handle_list_keys).post(admin::handle_create_key),
        )
        .route(
            "/admin/keys/:keyId",
            axum::routing::patch(admin::handle_update_key).delete(admin::handle_delete_key),
        )
        .route("/admin/accounts", get(admin::handle_list_accounts))
        .route(
            "/admin/accounts/:accountId",
            axum::routing::delete(admin::handle_delete_account),
        )
        .route("/admin/accounts/refresh", post(admin::handle_force_refresh))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            api_key_middleware,
        ))
        .layer(middleware::from_fn(catch_panic_middleware))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Wire everything up, bind, serve, drain. Returns only after shutdown;
/// binding or persistence failures surface as errors for a non-zero exit.
pub async fn start(config: AppConfig) -> AppResult<()> {
    let config = Arc::new(config);

    let (counters, _counters_task) = Counters::start().map_err(AppError::Config)?;

    let pool = Arc::new(AccountPool::new());
    let loaded = pool.load_all().map_err(|e| AppError::Config(e.to_string()))?;
    if loaded == 0 {
        warn!("[Server] No accounts loaded; authorize one via POST /auth/initiate");
    }

    let key_store = Arc::new(ApiKeyStore::load().map_err(AppError::Config)?);
    key_store
        .ensure_bootstrap_keys(&config.bootstrap_api_keys)
        .await;
    let key_usage = Arc::new(KeyUsageStats::load().map_err(AppError::Config)?);

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&pool),
        Arc::new(UpstreamClient::new()),
        counters.clone(),
    ));

    let device_flows = Arc::new(DeviceFlowRegistry::new());
    let janitor = device_flow::spawn_janitor(Arc::clone(&device_flows));

    let state = AppState {
        config: Arc::clone(&config),
        dispatcher,
        key_store,
        key_usage: Arc::clone(&key_usage),
        limiter: Arc::new(SlidingWindowLimiter::new(RATE_LIMITER_MAX_TRACKED)),
        counters: counters.clone(),
        device_flows,
        started_at: Instant::now(),
    };

    let refresh_task = scheduler::start_scheduler(Arc::clone(&pool));
    let stats_task = spawn_stats_collector(counters.clone(), Arc::clone(&key_usage), pool);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::Config(format!("Address {} binding failed: {}", addr, e)))?;
    info!("[Server] Listening on http://{}", addr);

    let app = build_router(state);
    let drain = Arc::new(Notify::new());
    let drain_signal = Arc::clone(&drain);

    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { drain_signal.notified().await })
            .await
    });

    shutdown_signal().await;
    info!("[Server] Shutdown signal received, draining in-flight requests");
    drain.notify_one();

    let mut server = server;
    tokio::select! {
        result = &mut server => {
            if let Ok(Err(e)) = result {
                error!("[Server] Serve error during drain: {}", e);
            }
        }
        _ = tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_SECS)) => {
            warn!("[Server] Grace period elapsed, forcing close");
            server.abort();
        }
    }

    refresh_task.abort();
    stats_task.abort();
    janitor.abort();

    counters.flush().await;
    counters.flush_sync();
    key_usage.flush_if_dirty();
    info!("[Server] Shutdown complete");
    Ok(())
}
