//! Configuration for sensor-collector.
//!
//! Loads settings from /etc/sensor-collector/config.toml or uses defaults.

use anyhow::{bail, Context, Result};
use sensor_common::{BackoffConfig, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Config file path
pub const CONFIG_PATH: &str = "/etc/sensor-collector/config.toml";

/// Collection loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectConfig {
    #[serde(default = "default_interval")]
    pub interval_ms: u64,

    /// Bounds all attempts for one host in one cycle
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_attempts")]
    pub attempts: u32,

    /// First backoff delay between attempts
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,

    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
}

fn default_interval() -> u64 {
    1000
}

fn default_timeout() -> u64 {
    10
}

fn default_attempts() -> u32 {
    2
}

fn default_base_ms() -> u64 {
    100
}

fn default_max_ms() -> u64 {
    2000
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval(),
            timeout_secs: default_timeout(),
            attempts: default_attempts(),
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// When set, each host's stats are cached this long
    #[serde(default)]
    pub cache_retention_ms: Option<u64>,
}

fn default_request_timeout() -> u64 {
    5
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            cache_retention_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Listen address for the /metrics endpoint
    #[serde(default = "default_metrics_listen")]
    pub listen: String,
}

fn default_metrics_listen() -> String {
    "127.0.0.1:9187".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: default_metrics_listen(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
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
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// sensord base URLs
    #[serde(default = "default_hosts")]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub collect: CollectConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_hosts() -> Vec<String> {
    vec!["http://127.0.0.1:7870".to_string()]
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hosts: default_hosts(),
            collect: CollectConfig::default(),
            provider: ProviderConfig::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `path`. A missing file means defaults.
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

    pub fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            bail!("hosts must list at least one sensord URL");
        }
        if let Some(host) = self.hosts.iter().find(|h| h.trim().is_empty()) {
            bail!("hosts contains an empty entry: {:?}", host);
        }

        let checks = [
            ("collect.interval_ms", self.collect.interval_ms),
            ("collect.timeout_secs", self.collect.timeout_secs),
            ("collect.attempts", u64::from(self.collect.attempts)),
            ("provider.request_timeout_secs", self.provider.request_timeout_secs),
        ];
        for (name, value) in checks {
            if value == 0 {
                bail!("{} must be greater than 0", name);
            }
        }
        if self.provider.cache_retention_ms == Some(0) {
            bail!("provider.cache_retention_ms must be greater than 0 when set");
        }
        if self.collect.base_ms > self.collect.max_ms {
            bail!("collect.base_ms must not exceed collect.max_ms");
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.collect.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.collect.timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.provider.request_timeout_secs)
    }

    pub fn cache_retention(&self) -> Option<Duration> {
        self.provider.cache_retention_ms.map(Duration::from_millis)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.collect.attempts,
            backoff: BackoffConfig {
                base_ms: self.collect.base_ms,
                max_ms: self.collect.max_ms,
                ..BackoffConfig::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.interval(), Duration::from_secs(1));
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert_eq!(config.retry_policy().max_attempts, 2);
        assert_eq!(config.cache_retention(), None);
    }

    #[test]
    fn test_hosts_and_cache() {
        let config = Config::parse(
            r#"
            hosts = ["http://10.0.0.5:7870", "http://10.0.0.6:7870"]

            [collect]
            attempts = 4
            base_ms = 50

            [provider]
            cache_retention_ms = 500
            "#,
        )
        .unwrap();

        assert_eq!(config.hosts.len(), 2);
        assert_eq!(config.retry_policy().max_attempts, 4);
        assert_eq!(config.retry_policy().backoff.base_ms, 50);
        assert_eq!(config.cache_retention(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(Config::parse("hosts = []").is_err());
        assert!(Config::parse("[collect]\nattempts = 0").is_err());
        assert!(Config::parse("[provider]\ncache_retention_ms = 0").is_err());
        assert!(Config::parse("[collect]\nbase_ms = 5000\nmax_ms = 100").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("none.toml")).unwrap();
        assert_eq!(config.hosts, default_hosts());
    }
}
