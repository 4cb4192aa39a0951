//! Configuration system for Tandem
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/tandem/config.toml
//! - Linux: ~/.config/tandem/config.toml
//! - Windows: %APPDATA%/tandem/config.toml

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Relay server settings
    pub relay: RelayConfig,
    /// Client call settings
    pub client: ClientConfig,
    /// Signaling channel reconnection budget
    pub channel_retry: RetryConfig,
    /// Peer session reconnection budget
    pub peer_retry: RetryConfig,
    /// Room join retry policy
    pub join: JoinConfig,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// WebSocket port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay URL
    pub signal_url: String,
    /// Time allowed for one channel connect attempt
    pub connect_timeout_ms: u64,
    /// Time allowed for the relay to ack a create/join request
    pub request_timeout_ms: u64,
    /// Upper bound on the whole join handshake, retries included
    pub join_timeout_ms: u64,
    /// Pause between teardown and restart on an explicit retry
    pub settle_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            signal_url: "ws://localhost:8080".into(),
            connect_timeout_ms: 10_000,
            request_timeout_ms: 5_000,
            join_timeout_ms: 15_000,
            settle_delay_ms: 1_000,
        }
    }
}

impl ClientConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Bounded exponential backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts before giving up for good
    pub max_attempts: u32,
    /// Delay before the first retry (and poll interval for the channel)
    pub base_delay_ms: u64,
    /// Ceiling for the exponential delay
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Room join retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// Attempts for a joiner that keeps seeing ROOM_NOT_FOUND
    pub max_attempts: u32,
    /// Linear step: attempt N waits N * base_delay
    pub base_delay_ms: u64,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            max_attempts: crate::JOIN_MAX_ATTEMPTS,
            base_delay_ms: 500,
        }
    }
}

impl JoinConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("com", "tandem", "tandem")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Serialization error: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.relay.port, 8080);
        assert_eq!(config.join.max_attempts, 5);
        assert_eq!(config.client.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.channel_retry.base_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_config() {
        let toml_str = r#"
            [relay]
            port = 5000

            [peer_retry]
            max_attempts = 3
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.relay.port, 5000);
        assert_eq!(config.peer_retry.max_attempts, 3);
        // Other values should be defaults
        assert_eq!(config.peer_retry.base_delay_ms, 1_000);
        assert_eq!(config.channel_retry.max_attempts, 5);
    }

    #[test]
    fn test_sample_config() {
        let sample = Config::sample();
        assert!(sample.contains("[relay]"));
        assert!(sample.contains("[client]"));
        assert!(sample.contains("[channel_retry]"));
    }

    #[test]
    fn test_config_load_missing() {
        let config = Config::load_from(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.relay.port, 8080);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.client.signal_url = "ws://relay.example:9000".into();
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.client.signal_url, "ws://relay.example:9000");
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[relay\nport = ").unwrap();

        assert!(matches!(Config::load_from(&path), Err(ConfigError::Parse(_))));
    }
}
