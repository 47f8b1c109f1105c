pub mod constants;
pub mod error;
pub mod models;
pub mod modules;
pub mod proxy;
#[cfg(test)]
mod test_utils;
pub mod utils;

use tracing::{error, info};

use modules::system::{config, logger};

/// Process entry point: config + env overrides, logging, then the server
/// until a shutdown signal. Exit code 1 for any startup failure.
pub fn run() {
    let mut app_config = match config::load_app_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    config::apply_env_overrides(&mut app_config);
    if let Err(e) = config::validate_app_config(&app_config) {
        eprintln!("Configuration validation failed: {}", e);
        std::process::exit(1);
    }

    logger::init_logger(app_config.debug_log, app_config.log_file_limit_mb);
    info!(
        "Starting qwen-relay v{} on {}:{}",
        env!("CARGO_PKG_VERSION"),
        app_config.host,
        app_config.port
    );

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to create Tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        if let Err(e) = proxy::server::start(app_config).await {
            error!("[Startup] {}", e);
            std::process::exit(1);
        }
    });
}
