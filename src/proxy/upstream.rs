use std::time::Duration;

use reqwest::{Client, Response};
use serde_json::Value;

use crate::constants::{CHAT_DEADLINE_SECS, DEFAULT_API_BASE, SEARCH_DEADLINE_SECS};
use crate::models::StoredCredentials;
use crate::modules::auth::oauth::normalize_resource_url;

/// Thin reqwest wrapper owning the outbound connection pool. Base URLs are
/// derived per call from the chosen account's credentials.
pub struct UpstreamClient {
    client: Client,
}

/// Effective API base for a credential bundle: the vendor default when no
/// resource_url is attached, otherwise the stored URL normalized to
/// `https://…/v1`.
pub fn effective_base(resource_url: Option<&str>) -> String {
    match resource_url {
        Some(raw) if !raw.trim().is_empty() => normalize_resource_url(raw),
        _ => DEFAULT_API_BASE.to_string(),
    }
}

pub fn chat_url(base: &str) -> String {
    format!("{}/chat/completions", base)
}

pub fn models_url(base: &str) -> String {
    format!("{}/models", base)
}

/// Web search lives outside the `/v1` prefix on the same host.
pub fn search_url(base: &str) -> String {
    let root = base.strip_suffix("/v1").unwrap_or(base);
    format!("{}/api/v1/indices/plugin/web_search", root)
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self {
            client: crate::utils::http::get_long_client(),
        }
    }

    fn base_for(creds: &StoredCredentials) -> String {
        effective_base(creds.resource_url.as_deref())
    }

    pub async fn chat_completion(
        &self,
        creds: &StoredCredentials,
        body: &Value,
    ) -> Result<Response, String> {
        let url = chat_url(&Self::base_for(creds));
        self.client
            .post(&url)
            .bearer_auth(&creds.access_token)
            .timeout(Duration::from_secs(CHAT_DEADLINE_SECS))
            .json(body)
            .send()
            .await
            .map_err(|e| format!("Chat request failed: {}", e))
    }

    pub async fn web_search(
        &self,
        creds: &StoredCredentials,
        body: &Value,
    ) -> Result<Response, String> {
        let url = search_url(&Self::base_for(creds));
        self.client
            .post(&url)
            .bearer_auth(&creds.access_token)
            .timeout(Duration::from_secs(SEARCH_DEADLINE_SECS))
            .json(body)
            .send()
            .await
            .map_err(|e| format!("Web search request failed: {}", e))
    }

    pub async fn list_models(&self, creds: &StoredCredentials) -> Result<Response, String> {
        let url = models_url(&Self::base_for(creds));
        self.client
            .get(&url)
            .bearer_auth(&creds.access_token)
            .timeout(Duration::from_secs(SEARCH_DEADLINE_SECS))
            .send()
            .await
            .map_err(|e| format!("Models request failed: {}", e))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_resource_url_falls_back_to_vendor_default() {
        assert_eq!(effective_base(None), DEFAULT_API_BASE);
        assert_eq!(effective_base(Some("")), DEFAULT_API_BASE);
        assert_eq!(effective_base(Some("  ")), DEFAULT_API_BASE);
    }

    #[test]
    fn bare_host_gains_scheme_and_v1() {
        assert_eq!(
            effective_base(Some("portal.qwen.ai")),
            "https://portal.qwen.ai/v1"
        );
    }

    #[test]
    fn existing_v1_suffix_is_not_doubled() {
        assert_eq!(
            effective_base(Some("https://portal.qwen.ai/v1")),
            "https://portal.qwen.ai/v1"
        );
    }

    #[test]
    fn chat_and_models_hang_off_the_v1_base() {
        let base = effective_base(Some("portal.qwen.ai"));
        assert_eq!(chat_url(&base), "https://portal.qwen.ai/v1/chat/completions");
        assert_eq!(models_url(&base), "https://portal.qwen.ai/v1/models");
    }

    #[test]
    fn search_url_drops_the_v1_prefix() {
        let base = effective_base(Some("portal.qwen.ai"));
        assert_eq!(
            search_url(&base),
            "https://portal.qwen.ai/api/v1/indices/plugin/web_search"
        );
    }
}
