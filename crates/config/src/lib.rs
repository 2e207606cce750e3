//! Configuration directory helpers for the work-item sync engine
//!
//! All on-disk configuration (engine settings, linked-account credentials)
//! lives in a single directory, `~/.config/workitems/` by default. Set
//! `WORKITEMS_CONFIG_DIR` to point somewhere else (tests, containers).
//!
//! Call [`init`] at process startup to bootstrap the directory.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Environment variable that overrides the config directory
pub const CONFIG_DIR_ENV: &str = "WORKITEMS_CONFIG_DIR";

/// Initialize the config directory.
///
/// Creates the directory if it doesn't exist and returns its path.
pub fn init() -> Result<PathBuf> {
    ensure_config_dir()
}

/// Get the config directory (`$WORKITEMS_CONFIG_DIR` or `~/.config/workitems/`)
pub fn config_dir() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(CONFIG_DIR_ENV) {
        return Some(PathBuf::from(dir));
    }
    dirs::config_dir().map(|p| p.join("workitems"))
}

/// Get the path to a file within the config directory
pub fn config_path(filename: &str) -> Option<PathBuf> {
    config_dir().map(|p| p.join(filename))
}

/// Load and parse a JSON file from the config directory
pub fn load_json<T: DeserializeOwned>(filename: &str) -> Result<T> {
    let path = config_path(filename).context("Could not determine config directory")?;
    load_json_file(&path)
}

/// Load and parse a JSON file from an arbitrary path
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Check if a file exists in the config directory
pub fn config_exists(filename: &str) -> bool {
    config_path(filename).is_some_and(|p| p.exists())
}

/// Ensure the config directory exists
pub fn ensure_config_dir() -> Result<PathBuf> {
    let dir = config_dir().context("Could not determine config directory")?;
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;
    Ok(dir)
}

/// Save a value as pretty JSON to a file in the config directory
pub fn save_json<T: serde::Serialize>(filename: &str, value: &T) -> Result<()> {
    let dir = ensure_config_dir()?;
    let path = dir.join(filename);
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(&path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_path_is_inside_config_dir() {
        let dir = config_dir().unwrap();
        let path = config_path("engine.json").unwrap();
        assert_eq!(path, dir.join("engine.json"));
    }

    #[test]
    fn test_load_json_file() {
        let dir = std::env::temp_dir().join(format!("workitems-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("sample.json");
        std::fs::write(&path, r#"{"name": "gmail", "count": 3}"#).unwrap();

        #[derive(serde::Deserialize)]
        struct Sample {
            name: String,
            count: u32,
        }

        let sample: Sample = load_json_file(&path).unwrap();
        assert_eq!(sample.name, "gmail");
        assert_eq!(sample.count, 3);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_json_file_missing() {
        let path = std::env::temp_dir().join("workitems-does-not-exist.json");
        assert!(load_json_file::<serde_json::Value>(&path).is_err());
    }
}
