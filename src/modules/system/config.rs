use tracing::{info, warn};

use crate::models::AppConfig;
use crate::modules::auth::account::get_data_dir;
use crate::utils::fsio;

const CONFIG_FILE: &str = "config.json";

pub fn load_app_config() -> Result<AppConfig, String> {
    let path = get_data_dir()?.join(CONFIG_FILE);
    if !path.exists() {
        return Ok(AppConfig::default());
    }
    fsio::read_json(&path)
}

pub fn save_app_config(config: &AppConfig) -> Result<(), String> {
    let path = get_data_dir()?.join(CONFIG_FILE);
    fsio::write_json_atomic(&path, config)
}

fn parse_env_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Environment wins over the persisted config for operator-facing knobs.
/// `DATA_DIR` is not handled here; the data-dir resolver reads it directly.
pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(port) = std::env::var("PORT") {
        let trimmed = port.trim();
        if !trimmed.is_empty() {
            match trimmed.parse::<u16>() {
                Ok(p) if p > 0 => {
                    config.port = p;
                    info!("Using port from environment: {}", p);
                }
                _ => warn!("Ignoring invalid PORT value: {}", port),
            }
        }
    }

    if let Ok(host) = std::env::var("HOST") {
        if !host.trim().is_empty() {
            config.host = host.trim().to_string();
            info!("Using host from environment: {}", config.host);
        }
    }

    if let Ok(model) = std::env::var("DEFAULT_MODEL") {
        if !model.trim().is_empty() {
            config.default_model = model.trim().to_string();
            info!("Using default model from environment: {}", config.default_model);
        }
    }

    if let Ok(stream) = std::env::var("STREAM") {
        match parse_env_bool(&stream) {
            Some(parsed) => {
                config.stream_enabled = parsed;
                info!("Streaming globally set from environment: {}", parsed);
            }
            None => warn!("Ignoring invalid STREAM value: {}", stream),
        }
    }

    if let Ok(debug) = std::env::var("DEBUG_LOG") {
        if let Some(parsed) = parse_env_bool(&debug) {
            config.debug_log = parsed;
        }
    }

    if let Ok(limit) = std::env::var("LOG_FILE_LIMIT") {
        match limit.trim().parse::<u64>() {
            Ok(mb) if mb > 0 => config.log_file_limit_mb = mb,
            _ => warn!("Ignoring invalid LOG_FILE_LIMIT value: {}", limit),
        }
    }

    // One key or a comma-separated list to seed the key store with.
    if let Ok(keys) = std::env::var("API_KEY") {
        let parsed: Vec<String> = keys
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
        if !parsed.is_empty() {
            info!("Using {} bootstrap API key(s) from environment", parsed.len());
            config.bootstrap_api_keys = parsed;
        }
    }
}

pub fn validate_app_config(config: &AppConfig) -> Result<(), String> {
    if config.host.trim().is_empty() {
        return Err("host must not be empty".to_string());
    }
    if config.port == 0 {
        return Err("port must be non-zero".to_string());
    }
    if config.default_model.trim().is_empty() {
        return Err("default_model must not be empty".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{lock_env, ScopedEnvVar};

    #[test]
    fn env_port_overrides_config_port() {
        let _guard = lock_env();
        let _port = ScopedEnvVar::set("PORT", "8045");
        let _host = ScopedEnvVar::unset("HOST");

        let mut config = AppConfig::default();
        config.port = 8145;
        apply_env_overrides(&mut config);
        assert_eq!(config.port, 8045);
    }

    #[test]
    fn invalid_port_is_ignored() {
        let _guard = lock_env();
        let _port = ScopedEnvVar::set("PORT", "not-a-port");

        let mut config = AppConfig::default();
        config.port = 8145;
        apply_env_overrides(&mut config);
        assert_eq!(config.port, 8145);
    }

    #[test]
    fn api_key_env_splits_on_commas() {
        let _guard = lock_env();
        let _keys = ScopedEnvVar::set("API_KEY", "sk-proj-a, sk-proj-b ,");
        let _port = ScopedEnvVar::unset("PORT");

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config);
        assert_eq!(
            config.bootstrap_api_keys,
            vec!["sk-proj-a".to_string(), "sk-proj-b".to_string()]
        );
    }

    #[test]
    fn stream_env_toggles_global_streaming() {
        let _guard = lock_env();
        let _stream = ScopedEnvVar::set("STREAM", "off");

        let mut config = AppConfig::default();
        apply_env_overrides(&mut config);
        assert!(!config.stream_enabled);
    }

    #[test]
    fn validation_rejects_empty_host() {
        let mut config = AppConfig::default();
        config.host = " ".to_string();
        assert!(validate_app_config(&config).is_err());
    }

    #[test]
    fn config_round_trips_through_disk() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());

        let mut config = AppConfig::default();
        config.port = 9001;
        save_app_config(&config).expect("save");

        let loaded = load_app_config().expect("load");
        assert_eq!(loaded.port, 9001);
    }
}
