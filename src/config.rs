//! Configuration management for lexd.
//!
//! Configuration is loaded from `~/.config/lexd/config.toml`. A missing file
//! means defaults; an unparseable file is an error rather than a silent
//! fallback, since the daemon and client must agree on the port.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Loopback port the daemon listens on.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Warn when a query repeats more than three times in a month.
    #[serde(default = "default_true")]
    pub freq_alert: bool,
    /// Remote dictionary source.
    #[serde(default)]
    pub source: SourceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            freq_alert: true,
            source: SourceConfig::default(),
        }
    }
}

/// Remote source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the dictionary API.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl SourceConfig {
    /// Per-request timeout for the remote source.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

fn default_port() -> u16 {
    19707
}

fn default_endpoint() -> String {
    "https://api.dictionaryapi.dev/api/v2/entries/en".to_string()
}

fn default_timeout_secs() -> u64 {
    15
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Get the config directory path.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join("lexd"))
            .context("Could not determine config directory")
    }

    /// Get the config file path.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Get the data directory holding the cache database and runtime files.
    pub fn data_dir() -> Result<PathBuf> {
        dirs::data_dir()
            .map(|p| p.join("lexd"))
            .context("Could not determine data directory")
    }

    /// Get the cache database path.
    pub fn cache_db_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("cache.db"))
    }

    /// Get the runtime info file the daemon writes its identity to.
    pub fn runtime_info_path() -> Result<PathBuf> {
        Ok(Self::data_dir()?.join("daemon.json"))
    }

    /// Load configuration from file, using defaults if not found.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Whether the config file was modified after the given Unix timestamp.
    ///
    /// Used by the client to decide that a running daemon predates the
    /// current configuration and should be restarted. A missing config file
    /// never triggers a restart.
    pub fn modified_after(&self, started_at: i64) -> bool {
        let Ok(path) = Self::config_path() else {
            return false;
        };
        let Ok(meta) = std::fs::metadata(&path) else {
            return false;
        };
        let Ok(modified) = meta.modified() else {
            return false;
        };
        let mtime = modified
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs() as i64;
        mtime > started_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 19707);
        assert!(config.freq_alert);
        assert!(config.source.endpoint.starts_with("https://"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
port = 4321
freq_alert = false

[source]
endpoint = "https://dict.example.com/v1"
timeout_secs = 5
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.port, 4321);
        assert!(!config.freq_alert);
        assert_eq!(config.source.endpoint, "https://dict.example.com/v1");
        assert_eq!(config.source.timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = toml::from_str("port = 9000").unwrap();
        assert_eq!(config.port, 9000);
        assert!(config.freq_alert);
        assert_eq!(config.source.timeout_secs, 15);
    }
}
