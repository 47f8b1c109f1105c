use std::fs;
use std::path::PathBuf;

use crate::models::StoredCredentials;
use crate::utils::fsio;

const DATA_DIR: &str = ".qwen";
const CREDS_PREFIX: &str = "oauth_creds_";
const DEFAULT_CREDS_FILE: &str = "oauth_creds.json";

/// Account id reserved for the single-account `oauth_creds.json` file.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

pub fn get_data_dir() -> Result<PathBuf, String> {
    fn ensure_dir(path: &PathBuf) -> Result<(), String> {
        if !path.exists() {
            fs::create_dir_all(path).map_err(|e| format!("failed_to_create_data_dir: {}", e))?;
        }
        Ok(())
    }

    if let Ok(env_path) = std::env::var("DATA_DIR") {
        if !env_path.trim().is_empty() {
            let data_dir = PathBuf::from(env_path);
            ensure_dir(&data_dir)?;
            return Ok(data_dir);
        }
    }

    if cfg!(test) {
        let data_dir = std::env::temp_dir().join(format!(".qwen-test-{}", std::process::id()));
        ensure_dir(&data_dir)?;
        return Ok(data_dir);
    }

    if let Some(home) = dirs::home_dir() {
        let data_dir = home.join(DATA_DIR);
        if ensure_dir(&data_dir).is_ok() {
            return Ok(data_dir);
        }
    }

    let fallback_dir = std::env::temp_dir().join(DATA_DIR);
    ensure_dir(&fallback_dir)?;
    Ok(fallback_dir)
}

pub fn credentials_path(account_id: &str) -> Result<PathBuf, String> {
    let data_dir = get_data_dir()?;
    if account_id == DEFAULT_ACCOUNT_ID {
        Ok(data_dir.join(DEFAULT_CREDS_FILE))
    } else {
        Ok(data_dir.join(format!("{}{}.json", CREDS_PREFIX, account_id)))
    }
}

pub fn save_credentials(account_id: &str, creds: &StoredCredentials) -> Result<(), String> {
    let path = credentials_path(account_id)?;
    fsio::write_json_atomic(&path, creds)
}

pub fn load_credentials(account_id: &str) -> Result<StoredCredentials, String> {
    let path = credentials_path(account_id)?;
    fsio::read_json(&path)
}

pub fn delete_credentials(account_id: &str) -> Result<(), String> {
    let path = credentials_path(account_id)?;
    if path.exists() {
        fs::remove_file(&path)
            .map_err(|e| format!("failed_to_delete_credentials {:?}: {}", path, e))?;
    }
    Ok(())
}

/// Scan the data directory for persisted accounts. The single-account
/// `oauth_creds.json` is reported under the `default` id when present.
pub fn list_account_ids() -> Result<Vec<String>, String> {
    let data_dir = get_data_dir()?;
    let mut ids = Vec::new();

    let entries =
        fs::read_dir(&data_dir).map_err(|e| format!("failed_to_read_data_dir: {}", e))?;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name == DEFAULT_CREDS_FILE {
            ids.push(DEFAULT_ACCOUNT_ID.to_string());
        } else if let Some(rest) = name.strip_prefix(CREDS_PREFIX) {
            if let Some(id) = rest.strip_suffix(".json") {
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
        }
    }

    ids.sort();
    Ok(ids)
}
