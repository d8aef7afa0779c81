//! Broadcaster configuration types and loading

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Top-level configuration for the `bc` binary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level used when `--log-level` is not given
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Broadcaster settings
    pub broadcast: BroadcastConfig,
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path, then `./.bcast.yml`, then `<config_dir>/bcast/bcast.yml`,
    /// then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".bcast.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("bcast").join("bcast.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level, before logging is set up
    ///
    /// Errors are swallowed; the full load reports them once logging works.
    pub fn load_log_level(config_path: Option<&PathBuf>) -> Option<String> {
        Self::load(config_path).ok().and_then(|c| c.log_level)
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Broadcaster configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastConfig {
    /// Capacity of the coordinator's request queue
    #[serde(default = "default_inbox_buffer", rename = "inbox-buffer")]
    pub inbox_buffer: usize,

    /// Channel capacity for listeners created with `listen()`
    #[serde(default = "default_listener_buffer", rename = "listener-buffer")]
    pub listener_buffer: usize,

    /// Give up on a single delivery after this many milliseconds
    ///
    /// Unset means a listener that neither drains nor cancels blocks the
    /// broadcast indefinitely. A timed-out delivery skips the item for that
    /// listener only; the listener stays registered.
    #[serde(default, rename = "delivery-timeout-ms")]
    pub delivery_timeout_ms: Option<u64>,
}

fn default_inbox_buffer() -> usize {
    debug!("default_inbox_buffer: called");
    64
}

fn default_listener_buffer() -> usize {
    debug!("default_listener_buffer: called");
    16
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            inbox_buffer: default_inbox_buffer(),
            listener_buffer: default_listener_buffer(),
            delivery_timeout_ms: None,
        }
    }
}

impl BroadcastConfig {
    /// Per-delivery timeout, if one is configured
    pub fn delivery_timeout(&self) -> Option<Duration> {
        self.delivery_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = BroadcastConfig::default();
        assert_eq!(config.inbox_buffer, 64);
        assert_eq!(config.listener_buffer, 16);
        assert_eq!(config.delivery_timeout(), None);
    }

    #[test]
    fn test_delivery_timeout_duration() {
        let config = BroadcastConfig {
            delivery_timeout_ms: Some(250),
            ..Default::default()
        };
        assert_eq!(config.delivery_timeout(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "broadcast:\n  listener-buffer: 4\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.broadcast.listener_buffer, 4);
        assert_eq!(config.broadcast.inbox_buffer, 64);
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_load_explicit_path() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("bcast.yml");
        fs::write(
            &path,
            "log-level: debug\nbroadcast:\n  inbox-buffer: 8\n  delivery-timeout-ms: 100\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.log_level.as_deref(), Some("debug"));
        assert_eq!(config.broadcast.inbox_buffer, 8);
        assert_eq!(config.broadcast.delivery_timeout(), Some(Duration::from_millis(100)));
        assert_eq!(Config::load_log_level(Some(&path)).as_deref(), Some("debug"));
    }

    #[test]
    fn test_load_missing_explicit_path_fails() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let path = temp_dir.path().join("missing.yml");
        assert!(Config::load(Some(&path)).is_err());
    }
}
