//! Configuration for sensord.
//!
//! Loads settings from /etc/sensord/config.toml or uses defaults.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Config file path
pub const CONFIG_PATH: &str = "/etc/sensord/config.toml";

/// HTTP API settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the HTTP API
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Upper bound for any single request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_listen() -> String {
    "127.0.0.1:7870".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_ms: u64,
}

fn default_poll_interval() -> u64 {
    1000
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval(),
        }
    }
}

/// Sample eviction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// How often old samples are evicted
    #[serde(default = "default_retention_interval")]
    pub interval_secs: u64,

    /// Samples older than this are evicted
    #[serde(default = "default_retention_window")]
    pub window_secs: u64,
}

fn default_retention_interval() -> u64 {
    60
}

fn default_retention_window() -> u64 {
    3600 // one hour of history
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_retention_interval(),
            window_secs: default_retention_window(),
        }
    }
}

/// Snapshot and topology caching
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_retention")]
    pub retention_ms: u64,

    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

fn default_cache_retention() -> u64 {
    1000
}

fn default_fetch_timeout() -> u64 {
    5
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention_ms: default_cache_retention(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from `path`. A missing file means defaults; an
    /// unreadable or invalid one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject zero durations before anything is constructed
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("server.request_timeout_secs", self.server.request_timeout_secs),
            ("polling.interval_ms", self.polling.interval_ms),
            ("retention.interval_secs", self.retention.interval_secs),
            ("retention.window_secs", self.retention.window_secs),
            ("cache.retention_ms", self.cache.retention_ms),
            ("cache.fetch_timeout_secs", self.cache.fetch_timeout_secs),
        ];
        for (name, value) in checks {
            if value == 0 {
                bail!("{} must be greater than 0", name);
            }
        }
        if self.server.listen.trim().is_empty() {
            bail!("server.listen must not be empty");
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.polling.interval_ms)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention.interval_secs)
    }

    pub fn retention_window(&self) -> Duration {
        Duration::from_secs(self.retention.window_secs)
    }

    pub fn cache_retention(&self) -> Duration {
        Duration::from_millis(self.cache.retention_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.cache.fetch_timeout_secs)
    }
}
