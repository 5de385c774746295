//! Application configuration management.
//!
//! Selects which store backend a process uses and where each one lives.
//! Configuration is stored at `~/.config/shepherdbase/config.json`;
//! environment variables override the file, and a `.env` file is honored
//! when present.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/data directory paths
const APP_NAME: &str = "shepherdbase";

/// Config file name
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Embedded store, offline/demo mode.
    #[default]
    Local,
    /// Hosted relational store, production.
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub backend: BackendKind,
    /// Directory for the embedded database; defaults next to the user's
    /// data dir when unset.
    pub data_dir: Option<PathBuf>,
    pub remote_url: Option<String>,
    pub remote_service_key: Option<String>,
}

impl Config {
    /// Load the config file (if any) and apply environment overrides.
    pub fn load() -> Result<Self> {
        // Load .env file if present (silently ignore if not found)
        let _ = dotenvy::dotenv();

        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(backend) = std::env::var("SHEPHERDBASE_BACKEND") {
            config.backend = match backend.to_ascii_lowercase().as_str() {
                "local" => BackendKind::Local,
                "remote" => BackendKind::Remote,
                other => anyhow::bail!("Unknown SHEPHERDBASE_BACKEND value: {}", other),
            };
        }
        if let Ok(url) = std::env::var("SHEPHERDBASE_REMOTE_URL") {
            config.remote_url = Some(url);
        }
        if let Ok(key) = std::env::var("SHEPHERDBASE_SERVICE_KEY") {
            config.remote_service_key = Some(key);
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory for the embedded database.
    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME).join("db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&BackendKind::Remote).unwrap(),
            "\"remote\""
        );
        let parsed: Config =
            serde_json::from_str(r#"{"backend": "local", "remote_url": null}"#).unwrap();
        assert_eq!(parsed.backend, BackendKind::Local);
    }

    #[test]
    fn test_default_backend_is_local() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.backend, BackendKind::Local);
    }
}
