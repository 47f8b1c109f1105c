use serde::{Deserialize, Serialize};

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_model() -> String {
    crate::constants::DEFAULT_MODEL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_log_file_limit_mb() -> u64 {
    512
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// Global streaming switch; when off, `stream: true` requests fall back
    /// to the buffered path.
    #[serde(default = "default_true")]
    pub stream_enabled: bool,
    #[serde(default)]
    pub debug_log: bool,
    #[serde(default = "default_log_file_limit_mb")]
    pub log_file_limit_mb: u64,
    /// When on, each forwarded request appends one line to
    /// `stats/requests-YYYY-MM-DD.jsonl`.
    #[serde(default)]
    pub request_log_enabled: bool,
    /// Raw keys seeded into the key store on startup when the store is empty.
    #[serde(default)]
    pub bootstrap_api_keys: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            default_model: default_model(),
            stream_enabled: true,
            debug_log: false,
            log_file_limit_mb: default_log_file_limit_mb(),
            request_log_enabled: false,
            bootstrap_api_keys: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_yields_defaults() {
        let config: AppConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert!(config.stream_enabled);
        assert_eq!(config.default_model, "qwen3-coder-plus");
    }
}
