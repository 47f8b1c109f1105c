use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::constants::{
    DEVICE_CODE_URL, DEVICE_GRANT_TYPE, OAUTH_CLIENT_ID, OAUTH_SCOPE, TOKEN_URL,
};
use crate::models::StoredCredentials;

pub fn generate_pkce_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

pub fn pkce_challenge_s256(verifier: &str) -> String {
    let digest = sha2::Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub resource_url: Option<String>,
}

impl TokenResponse {
    /// Build the credential bundle to persist, carrying forward the pieces the
    /// vendor omits: the previous refresh_token and resource_url survive when
    /// the response does not replace them.
    pub fn into_credentials(self, previous: Option<&StoredCredentials>) -> StoredCredentials {
        let now = chrono::Utc::now().timestamp_millis();
        let refresh_token = self
            .refresh_token
            .or_else(|| previous.map(|p| p.refresh_token.clone()))
            .unwrap_or_default();
        let resource_url = self
            .resource_url
            .map(|raw| normalize_resource_url(&raw))
            .or_else(|| previous.and_then(|p| p.resource_url.clone()));

        StoredCredentials {
            access_token: self.access_token,
            refresh_token,
            token_type: if self.token_type.is_empty() {
                "Bearer".to_string()
            } else {
                self.token_type
            },
            expiry_timestamp: now + self.expires_in * 1_000,
            resource_url,
            code_verifier: None,
        }
    }
}

/// Vendor-chosen API bases arrive in assorted shapes; store them as
/// `https://…/v1`.
pub fn normalize_resource_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return crate::constants::DEFAULT_API_BASE.to_string();
    }
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    };
    if with_scheme.ends_with("/v1") {
        with_scheme
    } else {
        format!("{}/v1", with_scheme)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default)]
    pub verification_uri_complete: Option<String>,
    pub expires_in: i64,
    #[serde(default = "default_poll_interval")]
    pub interval: u64,
}

fn default_poll_interval() -> u64 {
    5
}

#[derive(Debug)]
pub enum PollOutcome {
    Pending,
    SlowDown,
    Completed(TokenResponse),
    Expired,
    Denied,
}

/// Start a device authorization: PKCE pair first, then the vendor call. The
/// verifier must be held by the caller and fed back into `poll_device_token`.
pub async fn initiate_device_flow() -> Result<(DeviceAuthorization, String), String> {
    let verifier = generate_pkce_verifier();
    let challenge = pkce_challenge_s256(&verifier);

    let params: Vec<(&str, &str)> = vec![
        ("client_id", OAUTH_CLIENT_ID),
        ("scope", OAUTH_SCOPE),
        ("code_challenge", challenge.as_str()),
        ("code_challenge_method", "S256"),
    ];

    let response = crate::utils::http::get_client()
        .post(DEVICE_CODE_URL)
        .form(&params)
        .send()
        .await
        .map_err(|e| format!("Device code request failed: {}", e))?;

    if !response.status().is_success() {
        let error_text = response.text().await.unwrap_or_default();
        return Err(format!("Device code request rejected: {}", error_text));
    }

    let authorization = response
        .json::<DeviceAuthorization>()
        .await
        .map_err(|e| format!("Device code parsing failed: {}", e))?;

    tracing::info!(
        "[OAuth] Device flow started, user_code: {} ({}s to confirm)",
        authorization.user_code,
        authorization.expires_in
    );

    Ok((authorization, verifier))
}

pub(crate) fn classify_poll_error(error_code: &str) -> PollOutcome {
    match error_code {
        "authorization_pending" => PollOutcome::Pending,
        "slow_down" => PollOutcome::SlowDown,
        "expired_token" => PollOutcome::Expired,
        _ => PollOutcome::Denied,
    }
}

/// One redemption attempt against the token endpoint. The server's `interval`
/// pacing is the caller's responsibility.
pub async fn poll_device_token(
    device_code: &str,
    code_verifier: &str,
) -> Result<PollOutcome, String> {
    let params: Vec<(&str, &str)> = vec![
        ("grant_type", DEVICE_GRANT_TYPE),
        ("client_id", OAUTH_CLIENT_ID),
        ("device_code", device_code),
        ("code_verifier", code_verifier),
    ];

    let response = crate::utils::http::get_client()
        .post(TOKEN_URL)
        .form(&params)
        .send()
        .await
        .map_err(|e| format!("Device token request failed: {}", e))?;

    if response.status().is_success() {
        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| format!("Device token parsing failed: {}", e))?;
        return Ok(PollOutcome::Completed(token));
    }

    let body = response.text().await.unwrap_or_default();
    let error_code = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_default();

    Ok(classify_poll_error(&error_code))
}

/// Exchange a refresh_token for a new bundle. `invalid_grant` is surfaced in
/// the error string so the caller can mark the account dead.
pub async fn refresh_access_token(refresh_token: &str) -> Result<TokenResponse, String> {
    let params: Vec<(&str, &str)> = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", OAUTH_CLIENT_ID),
    ];

    let response = crate::utils::http::get_client()
        .post(TOKEN_URL)
        .form(&params)
        .send()
        .await
        .map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                format!("Refresh request failed: {}. Unable to reach the authorization server.", e)
            } else {
                format!("Refresh request failed: {}", e)
            }
        })?;

    if response.status().is_success() {
        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|e| format!("Refresh data parsing failed: {}", e))?;
        tracing::info!(
            "[OAuth] Token refreshed, expires in {} seconds",
            token.expires_in
        );
        Ok(token)
    } else {
        let error_text = response.text().await.unwrap_or_default();
        Err(format!("Refresh failed: {}", error_text))
    }
}

pub fn is_invalid_grant(error: &str) -> bool {
    error.contains("invalid_grant")
}
