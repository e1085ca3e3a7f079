//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the
//! backend base URL, the request timeout, the login route used when a session
//! is torn down, and which backend holds the persisted session slots.
//!
//! Configuration is stored at `~/.config/clinic-client/config.json`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "clinic-client";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Backend used when nothing is configured (the dev server's default mount point)
const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api/v1";

/// HTTP request timeout in seconds.
/// Matches the browser client; a slower backend is reported as a transport error.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Route the session terminator navigates to
const DEFAULT_LOGIN_ROUTE: &str = "/login";

/// Environment variable overriding `api_base_url`
pub const ENV_API_URL: &str = "CLINIC_API_URL";

/// Environment variable overriding `storage`
pub const ENV_STORAGE: &str = "CLINIC_STORAGE";

/// Where the persisted session slots live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON file in the user data directory
    #[default]
    File,
    /// OS keychain
    Keyring,
}

impl StorageBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Some(StorageBackend::File),
            "keyring" | "keychain" => Some(StorageBackend::Keyring),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub request_timeout_secs: u64,
    pub login_route: String,
    pub storage: StorageBackend,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            login_route: DEFAULT_LOGIN_ROUTE.to_string(),
            storage: StorageBackend::default(),
            last_email: None,
        }
    }
}

impl Config {
    /// Load the config file (defaults if absent), then apply environment overrides.
    /// The result reflects this process only; do not `save()` it back.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env();
        Ok(config)
    }

    fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Record the last login email in the config file. Works on the file's own
    /// contents, so environment overrides never get written to disk.
    pub fn remember_email(email: &str) -> Result<()> {
        Self::remember_email_at(&Self::config_path()?, email)
    }

    fn remember_email_at(path: &Path, email: &str) -> Result<()> {
        let mut on_disk = Self::load_from(path)?;
        if on_disk.last_email.as_deref() == Some(email) {
            return Ok(());
        }
        on_disk.last_email = Some(email.to_string());
        on_disk.save_to(path)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var(ENV_API_URL) {
            if !url.trim().is_empty() {
                self.api_base_url = url.trim().to_string();
            }
        }
        if let Ok(value) = std::env::var(ENV_STORAGE) {
            match StorageBackend::parse(&value) {
                Some(backend) => self.storage = backend,
                None => warn!(value = %value, "Ignoring unknown storage backend"),
            }
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the file-backed session slots
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Directory for log files. Independent of the config file so logging can
    /// start before it is read.
    pub fn cache_dir() -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.api_base_url, "http://localhost:8000/api/v1");
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.login_route, "/login");
        assert_eq!(config.storage, StorageBackend::File);
    }

    #[test]
    fn test_partial_config_file_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"api_base_url": "https://clinic.example/api/v1", "storage": "keyring"}"#)
                .expect("parse partial config");
        assert_eq!(config.api_base_url, "https://clinic.example/api/v1");
        assert_eq!(config.storage, StorageBackend::Keyring);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.login_route, "/login");
    }

    #[test]
    fn test_zero_timeout_is_clamped() {
        let config = Config {
            request_timeout_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.request_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_storage_backend_parse() {
        assert_eq!(StorageBackend::parse("file"), Some(StorageBackend::File));
        assert_eq!(StorageBackend::parse(" Keyring "), Some(StorageBackend::Keyring));
        assert_eq!(StorageBackend::parse("keychain"), Some(StorageBackend::Keyring));
        assert_eq!(StorageBackend::parse("redis"), None);
    }

    #[test]
    fn test_remember_email_keeps_file_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, r#"{"api_base_url": "https://clinic.example/api/v1", "storage": "file"}"#).unwrap();

        // What the process runs with after CLINIC_API_URL / CLINIC_STORAGE overrides
        let mut running = Config::load_from(&path).unwrap();
        running.api_base_url = "http://staging.local/api/v1".to_string();
        running.storage = StorageBackend::Keyring;

        Config::remember_email_at(&path, "doc@clinic.test").unwrap();

        let on_disk = Config::load_from(&path).unwrap();
        assert_eq!(on_disk.api_base_url, "https://clinic.example/api/v1");
        assert_eq!(on_disk.storage, StorageBackend::File);
        assert_eq!(on_disk.last_email.as_deref(), Some("doc@clinic.test"));
        assert_ne!(running.api_base_url, on_disk.api_base_url);
    }

    #[test]
    fn test_remember_email_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        Config::remember_email_at(&path, "admin@clinic.test").unwrap();

        let on_disk = Config::load_from(&path).unwrap();
        assert_eq!(on_disk.last_email.as_deref(), Some("admin@clinic.test"));
        assert_eq!(on_disk.api_base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn test_log_dir_needs_no_loaded_config() {
        // Logging is set up from this before Config::load runs
        if let Ok(dir) = Config::cache_dir() {
            assert!(dir.ends_with(APP_NAME));
        }
    }
}
