//! Engine configuration
//!
//! Loaded in this order of priority:
//! 1. An explicit JSON file path
//! 2. `engine.json` in the shared config directory (~/.config/workitems/)
//! 3. Built-in defaults
//!
//! Environment variables (`WORKITEMS_DB_PATH`, `WORKITEMS_EXTERNAL_TIMEOUT_MS`)
//! are applied on top of whichever source was used.

use anyhow::{Context, Result};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::sync::{RetryPolicy, ThreadSyncOptions};

/// Config filename in the workitems config directory
pub const ENGINE_CONFIG_FILE: &str = "engine.json";

/// Database filename used when no path is configured
const DEFAULT_DB_FILE: &str = "workitems.sqlite";

const DB_PATH_ENV: &str = "WORKITEMS_DB_PATH";
const TIMEOUT_ENV: &str = "WORKITEMS_EXTERNAL_TIMEOUT_MS";

/// Settings for the reconciliation and sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite database path; `None` means `<config dir>/workitems.sqlite`
    pub db_path: Option<PathBuf>,
    /// Timeout applied to every external call
    pub external_timeout_ms: u64,
    /// Backoff for per-item external fetches
    pub retry: RetryPolicy,
    /// Threads listed by a full refresh
    pub full_sync_page_size: usize,
    /// Cursors older than this force a full refresh
    pub cursor_max_age_days: i64,
    /// How far ahead calendar events are fetched
    pub event_window_days: i64,
    pub gmail_base_url: String,
    pub calendar_base_url: String,
    pub jira_base_url: String,
    pub github_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            external_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            full_sync_page_size: 500,
            cursor_max_age_days: 7,
            event_window_days: 7,
            gmail_base_url: "https://gmail.googleapis.com/gmail/v1".to_string(),
            calendar_base_url: "https://www.googleapis.com/calendar/v3".to_string(),
            jira_base_url: "https://api.atlassian.com/ex/jira".to_string(),
            github_base_url: "https://api.github.com".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load config from the config directory if present, else defaults,
    /// then apply environment overrides
    pub fn load() -> Result<Self> {
        let mut cfg = if config::config_exists(ENGINE_CONFIG_FILE) {
            config::load_json(ENGINE_CONFIG_FILE)?
        } else {
            Self::default()
        };
        cfg.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(cfg)
    }

    /// Load config from a specific JSON file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut cfg: Self = config::load_json_file(path)?;
        cfg.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(cfg)
    }

    /// Parse config from a JSON string (no overrides)
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse engine config JSON")
    }

    /// Apply overrides from a variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(DB_PATH_ENV).filter(|p| !p.is_empty()) {
            self.db_path = Some(PathBuf::from(path));
        }
        if let Some(ms) = lookup(TIMEOUT_ENV) {
            self.external_timeout_ms = ms
                .trim()
                .parse()
                .with_context(|| format!("{} must be an integer, got {:?}", TIMEOUT_ENV, ms))?;
        }
        Ok(())
    }

    /// Resolved database path
    pub fn resolved_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => config::config_path(DEFAULT_DB_FILE)
                .context("Could not determine config directory for the database"),
        }
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_millis(self.external_timeout_ms)
    }

    pub fn cursor_max_age(&self) -> ChronoDuration {
        ChronoDuration::days(self.cursor_max_age_days)
    }

    pub fn event_window(&self) -> ChronoDuration {
        ChronoDuration::days(self.event_window_days)
    }

    pub fn thread_sync_options(&self) -> ThreadSyncOptions {
        ThreadSyncOptions {
            page_size: self.full_sync_page_size,
            cursor_max_age: self.cursor_max_age(),
            retry: self.retry.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.external_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.full_sync_page_size, 500);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.cursor_max_age(), ChronoDuration::days(7));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let json = r#"{
            "external_timeout_ms": 2500,
            "retry": { "max_attempts": 5 }
        }"#;

        let cfg = EngineConfig::from_json(json).unwrap();
        assert_eq!(cfg.external_timeout_ms, 2500);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_delay_ms, 100);
        assert_eq!(cfg.full_sync_page_size, 500);
    }

    #[test]
    fn test_overrides() {
        let mut cfg = EngineConfig::default();
        cfg.apply_overrides(|name| match name {
            "WORKITEMS_DB_PATH" => Some("/tmp/items.sqlite".to_string()),
            "WORKITEMS_EXTERNAL_TIMEOUT_MS" => Some("750".to_string()),
            _ => None,
        })
        .unwrap();

        assert_eq!(cfg.db_path, Some(PathBuf::from("/tmp/items.sqlite")));
        assert_eq!(cfg.external_timeout_ms, 750);
        assert_eq!(cfg.resolved_db_path().unwrap(), PathBuf::from("/tmp/items.sqlite"));
    }

    #[test]
    fn test_invalid_timeout_override() {
        let mut cfg = EngineConfig::default();
        let result = cfg.apply_overrides(|name| {
            (name == "WORKITEMS_EXTERNAL_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_json() {
        assert!(EngineConfig::from_json("{ not json").is_err());
    }
}
