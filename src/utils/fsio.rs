use std::fs;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

/// Serialize `value` and replace `path` via write-temp + rename, so a crash
/// mid-write never leaves a truncated file behind.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| format!("failed_to_serialize_json: {}", e))?;

    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, json).map_err(|e| format!("failed_to_write_temp_file: {}", e))?;
    fs::rename(&temp_path, path).map_err(|e| format!("failed_to_replace_file: {}", e))
}

pub fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, String> {
    let content =
        fs::read_to_string(path).map_err(|e| format!("failed_to_read_file {:?}: {}", path, e))?;
    serde_json::from_str(&content).map_err(|e| format!("failed_to_parse_json {:?}: {}", path, e))
}

/// Append a single line to a log-style file, creating it if missing.
pub fn append_line(path: &Path, line: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| format!("failed_to_create_dir: {}", e))?;
        }
    }
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| format!("failed_to_open_append {:?}: {}", path, e))?;
    writeln!(file, "{}", line).map_err(|e| format!("failed_to_append_line: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn atomic_write_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");

        write_json_atomic(&path, &json!({"n": 42})).expect("write");
        let value: serde_json::Value = read_json(&path).expect("read");
        assert_eq!(value["n"], 42);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn append_line_creates_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("logs").join("audit.log");

        append_line(&path, "first").expect("append");
        append_line(&path, "second").expect("append");

        let content = std::fs::read_to_string(&path).expect("read back");
        assert_eq!(content, "first\nsecond\n");
    }
}
