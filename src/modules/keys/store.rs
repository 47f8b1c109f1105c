use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::utils::crypto;
use crate::utils::fsio;

const KEY_FILE: &str = "api_keys.json";
const KEY_FILE_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    #[serde(rename = "chat.completions")]
    ChatCompletions,
    #[serde(rename = "models.list")]
    ModelsList,
    #[serde(rename = "full_access")]
    FullAccess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Disabled,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub max_requests: u32,
    pub window_ms: u64,
}

/// Full record as persisted. The raw key exists only in the creation
/// response; from then on the PBKDF2 digest and display affixes are all
/// that remains.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ApiKeyRecord {
    key_id: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    key_hash: String,
    salt: String,
    iterations: u32,
    key_prefix: String,
    key_suffix: String,
    permissions: Vec<Permission>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rate_limit: Option<RateLimitSpec>,
    status: KeyStatus,
    created_at: i64,
    #[serde(default)]
    last_used_at: Option<i64>,
    #[serde(default)]
    usage_count: u64,
}

/// What `list()` and `validate()` hand out: everything except the digest.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyMetadata {
    pub key_id: String,
    pub name: String,
    pub description: Option<String>,
    pub key_prefix: String,
    pub key_suffix: String,
    pub permissions: Vec<Permission>,
    pub rate_limit: Option<RateLimitSpec>,
    pub status: KeyStatus,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
    pub usage_count: u64,
}

impl ApiKeyMetadata {
    pub fn has_permission(&self, permission: Permission) -> bool {
        self.permissions.contains(&Permission::FullAccess)
            || self.permissions.contains(&permission)
    }
}

impl From<&ApiKeyRecord> for ApiKeyMetadata {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            key_id: record.key_id.clone(),
            name: record.name.clone(),
            description: record.description.clone(),
            key_prefix: record.key_prefix.clone(),
            key_suffix: record.key_suffix.clone(),
            permissions: record.permissions.clone(),
            rate_limit: record.rate_limit.clone(),
            status: record.status,
            created_at: record.created_at,
            last_used_at: record.last_used_at,
            usage_count: record.usage_count,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateKeyRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub permissions: Option<Vec<Permission>>,
    /// `Some(None)` clears an existing limit.
    #[serde(default, with = "double_option")]
    pub rate_limit: Option<Option<RateLimitSpec>>,
    pub status: Option<KeyStatus>,
}

mod double_option {
    use super::RateLimitSpec;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(
        deserializer: D,
    ) -> Result<Option<Option<RateLimitSpec>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<RateLimitSpec>::deserialize(deserializer).map(Some)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    keys: HashMap<String, ApiKeyRecord>,
}

impl Default for KeyFile {
    fn default() -> Self {
        Self {
            version: KEY_FILE_VERSION,
            keys: HashMap::new(),
        }
    }
}

pub struct ApiKeyStore {
    inner: RwLock<KeyFile>,
    path: PathBuf,
}

impl ApiKeyStore {
    pub fn load() -> Result<Self, String> {
        let path = crate::modules::auth::account::get_data_dir()?.join(KEY_FILE);
        let file = if path.exists() {
            fsio::read_json(&path)?
        } else {
            KeyFile::default()
        };
        info!("[Keys] Loaded {} API key(s)", file.keys.len());
        Ok(Self {
            inner: RwLock::new(file),
            path,
        })
    }

    async fn persist(&self, file: &KeyFile) -> Result<(), String> {
        fsio::write_json_atomic(&self.path, file)
    }

    /// Mint a new key. The returned raw key is shown exactly once and is
    /// never re-derivable from what we store.
    pub async fn create(
        &self,
        name: String,
        description: Option<String>,
        permissions: Vec<Permission>,
        rate_limit: Option<RateLimitSpec>,
    ) -> Result<(String, ApiKeyMetadata), String> {
        let raw_key = crypto::generate_api_key();
        let raw_for_hash = raw_key.clone();
        let (salt, key_hash) =
            tokio::task::spawn_blocking(move || crypto::hash_api_key(&raw_for_hash))
                .await
                .map_err(|e| format!("hash task failed: {}", e))?;

        let record = ApiKeyRecord {
            key_id: uuid::Uuid::new_v4().to_string(),
            name,
            description,
            key_hash,
            salt,
            iterations: crypto::KDF_ITERATIONS,
            key_prefix: raw_key[..12.min(raw_key.len())].to_string(),
            key_suffix: raw_key[raw_key.len() - 4..].to_string(),
            permissions,
            rate_limit,
            status: KeyStatus::Active,
            created_at: chrono::Utc::now().timestamp_millis(),
            last_used_at: None,
            usage_count: 0,
        };
        let metadata = ApiKeyMetadata::from(&record);

        let mut file = self.inner.write().await;
        file.keys.insert(record.key_id.clone(), record);
        self.persist(&file).await?;
        info!("[Keys] Created key {} ({})", metadata.key_id, metadata.name);
        crate::modules::audit::record("key_created", "operator", None, &metadata.key_id);
        Ok((raw_key, metadata))
    }

    pub async fn list(&self) -> Vec<ApiKeyMetadata> {
        let file = self.inner.read().await;
        let mut keys: Vec<ApiKeyMetadata> = file.keys.values().map(ApiKeyMetadata::from).collect();
        keys.sort_by_key(|k| k.created_at);
        keys
    }

    pub async fn get(&self, key_id: &str) -> Option<ApiKeyMetadata> {
        let file = self.inner.read().await;
        file.keys.get(key_id).map(ApiKeyMetadata::from)
    }

    pub async fn update(
        &self,
        key_id: &str,
        patch: UpdateKeyRequest,
    ) -> Result<ApiKeyMetadata, String> {
        let mut file = self.inner.write().await;
        let record = file
            .keys
            .get_mut(key_id)
            .ok_or_else(|| format!("unknown key: {}", key_id))?;

        if let Some(name) = patch.name {
            record.name = name;
        }
        if let Some(description) = patch.description {
            record.description = Some(description);
        }
        if let Some(permissions) = patch.permissions {
            record.permissions = permissions;
        }
        if let Some(rate_limit) = patch.rate_limit {
            record.rate_limit = rate_limit;
        }
        if let Some(status) = patch.status {
            record.status = status;
        }
        let metadata = ApiKeyMetadata::from(&*record);
        self.persist(&file).await?;
        Ok(metadata)
    }

    pub async fn delete(&self, key_id: &str) -> Result<bool, String> {
        let mut file = self.inner.write().await;
        let removed = file.keys.remove(key_id).is_some();
        if removed {
            self.persist(&file).await?;
            info!("[Keys] Deleted key {}", key_id);
            crate::modules::audit::record("key_deleted", "operator", None, key_id);
        }
        Ok(removed)
    }

    /// Scan active keys and verify the PBKDF2 digest off the request
    /// scheduler. Returns the metadata snapshot on a match.
    pub async fn validate(&self, raw_key: &str) -> Option<ApiKeyMetadata> {
        let candidates: Vec<(String, String, String, u32)> = {
            let file = self.inner.read().await;
            file.keys
                .values()
                .filter(|r| r.status == KeyStatus::Active)
                .map(|r| {
                    (
                        r.key_id.clone(),
                        r.salt.clone(),
                        r.key_hash.clone(),
                        r.iterations,
                    )
                })
                .collect()
        };

        let raw = raw_key.to_string();
        let matched = tokio::task::spawn_blocking(move || {
            let mut matched = None;
            for (key_id, salt, hash, iterations) in candidates {
                if crypto::verify_api_key(&raw, &salt, &hash, iterations) {
                    matched = Some(key_id);
                }
            }
            matched
        })
        .await
        .ok()??;

        let file = self.inner.read().await;
        file.keys.get(&matched).map(ApiKeyMetadata::from)
    }

    /// Post-completion bookkeeping for the validator middleware.
    pub async fn record_usage(&self, key_id: &str) {
        let mut file = self.inner.write().await;
        if let Some(record) = file.keys.get_mut(key_id) {
            record.last_used_at = Some(chrono::Utc::now().timestamp_millis());
            record.usage_count += 1;
        }
        if let Err(e) = self.persist(&file).await {
            warn!("[Keys] Failed to persist usage update: {}", e);
        }
    }

    /// Seed operator-supplied raw keys (API_KEY env / config) into an empty
    /// slot each; a key that already validates is left alone.
    pub async fn ensure_bootstrap_keys(&self, raw_keys: &[String]) {
        for (index, raw) in raw_keys.iter().enumerate() {
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if !raw.starts_with(crate::constants::API_KEY_PREFIX) {
                warn!(
                    "[Keys] Bootstrap key #{} does not start with {}; it will fail validation",
                    index + 1,
                    crate::constants::API_KEY_PREFIX
                );
            }
            if self.validate(raw).await.is_some() {
                continue;
            }

            let raw_for_hash = raw.to_string();
            let Ok((salt, key_hash)) =
                tokio::task::spawn_blocking(move || crypto::hash_api_key(&raw_for_hash)).await
            else {
                continue;
            };
            let record = ApiKeyRecord {
                key_id: uuid::Uuid::new_v4().to_string(),
                name: format!("bootstrap-{}", index + 1),
                description: Some("seeded from environment".to_string()),
                key_hash,
                salt,
                iterations: crypto::KDF_ITERATIONS,
                key_prefix: raw[..12.min(raw.len())].to_string(),
                key_suffix: raw[raw.len().saturating_sub(4)..].to_string(),
                permissions: vec![Permission::FullAccess],
                rate_limit: None,
                status: KeyStatus::Active,
                created_at: chrono::Utc::now().timestamp_millis(),
                last_used_at: None,
                usage_count: 0,
            };
            let mut file = self.inner.write().await;
            file.keys.insert(record.key_id.clone(), record);
            if let Err(e) = self.persist(&file).await {
                warn!("[Keys] Failed to persist bootstrap key: {}", e);
            } else {
                info!("[Keys] Seeded bootstrap key #{}", index + 1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{lock_env, ScopedEnvVar};

    async fn store_in(dir: &tempfile::TempDir) -> ApiKeyStore {
        let _data_dir = ScopedEnvVar::set("DATA_DIR", dir.path().to_str().unwrap());
        ApiKeyStore::load().expect("load store")
    }

    #[tokio::test]
    async fn create_then_validate_returns_same_key_id_and_permissions() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir).await;

        let (raw, created) = store
            .create(
                "ci".to_string(),
                None,
                vec![Permission::ChatCompletions],
                None,
            )
            .await
            .expect("create");

        assert!(raw.starts_with("sk-proj-"));
        let validated = store.validate(&raw).await.expect("validate");
        assert_eq!(validated.key_id, created.key_id);
        assert_eq!(validated.permissions, vec![Permission::ChatCompletions]);
    }

    #[tokio::test]
    async fn validate_rejects_unknown_and_inactive_keys() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir).await;

        let (raw, created) = store
            .create("ops".to_string(), None, vec![Permission::FullAccess], None)
            .await
            .expect("create");

        assert!(store.validate("sk-proj-deadbeef").await.is_none());

        store
            .update(
                &created.key_id,
                UpdateKeyRequest {
                    status: Some(KeyStatus::Disabled),
                    ..Default::default()
                },
            )
            .await
            .expect("update");
        assert!(store.validate(&raw).await.is_none());
    }

    #[tokio::test]
    async fn list_never_exposes_hash_material() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir).await;

        store
            .create("viewer".to_string(), None, vec![Permission::ModelsList], None)
            .await
            .expect("create");

        let listed = store.list().await;
        assert_eq!(listed.len(), 1);
        let as_json = serde_json::to_value(&listed[0]).expect("json");
        assert!(as_json.get("key_hash").is_none());
        assert!(as_json.get("salt").is_none());
        assert_eq!(as_json["key_prefix"].as_str().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn persisted_file_contains_only_digest_and_affixes() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir).await;

        let (raw, _) = store
            .create("ci".to_string(), None, vec![Permission::FullAccess], None)
            .await
            .expect("create");

        let content = std::fs::read_to_string(dir.path().join("api_keys.json")).expect("read");
        assert!(!content.contains(&raw));
        // The 12-char display prefix is allowed to appear.
        assert!(content.contains(&raw[..12]));
    }

    #[tokio::test]
    async fn full_access_grants_everything() {
        let metadata = ApiKeyMetadata {
            key_id: "k".to_string(),
            name: "n".to_string(),
            description: None,
            key_prefix: "sk-proj-aaaa".to_string(),
            key_suffix: "ffff".to_string(),
            permissions: vec![Permission::FullAccess],
            rate_limit: None,
            status: KeyStatus::Active,
            created_at: 0,
            last_used_at: None,
            usage_count: 0,
        };
        assert!(metadata.has_permission(Permission::ChatCompletions));
        assert!(metadata.has_permission(Permission::ModelsList));
    }

    #[tokio::test]
    async fn delete_removes_the_record() {
        let _guard = lock_env();
        let dir = tempfile::tempdir().expect("tempdir");
        let store = store_in(&dir).await;

        let (raw, created) = store
            .create("temp".to_string(), None, vec![Permission::FullAccess], None)
            .await
            .expect("create");
        assert!(store.delete(&created.key_id).await.expect("delete"));
        assert!(store.validate(&raw).await.is_none());
        assert!(!store.delete(&created.key_id).await.expect("second delete"));
    }
}
