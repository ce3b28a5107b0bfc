//! Configuration for the tracker
//!
//! Supports TOML configuration files with environment variable
//! overrides (prefix `TALLY_`) and sensible defaults, so a plain
//! `TrackerConfig::default()` talks to a local Redis.

use crate::connection::{RedisConfig, RetryPolicy};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackerConfig {
    /// Redis connection settings
    #[serde(default)]
    pub redis: RedisSettings,

    /// Key namespace prefix; every key this crate writes starts with it
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Default alias edit window in seconds; 0 means aliases never expire
    #[serde(default)]
    pub default_edit_window_secs: u64,
}

/// Redis connection settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisSettings {
    /// Redis server URL
    #[serde(default = "default_url")]
    pub url: String,

    /// Maximum number of concurrent commands
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection establishment timeout in seconds
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Retry attempts for transient command failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

// Default value functions
fn default_namespace() -> String {
    "tally".to_string()
}
fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_pool_size() -> u32 {
    16
}
fn default_connection_timeout_secs() -> u64 {
    5
}
fn default_command_timeout_ms() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    3
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            redis: RedisSettings::default(),
            namespace: default_namespace(),
            default_edit_window_secs: 0,
        }
    }
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_url(),
            pool_size: default_pool_size(),
            connection_timeout_secs: default_connection_timeout_secs(),
            command_timeout_ms: default_command_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl TrackerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigurationError(format!("Failed to read config file {}: {}", path, e))
        })?;

        toml::from_str(&contents).map_err(|e| {
            Error::ConfigurationError(format!("Failed to parse config file {}: {}", path, e))
        })
    }

    /// Load configuration from a TOML file with environment overrides
    pub fn from_file_with_env(path: &str) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Build from defaults plus environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("TALLY_REDIS_URL") {
            self.redis.url = url;
        }
        if let Ok(size) = std::env::var("TALLY_POOL_SIZE") {
            if let Ok(s) = size.parse() {
                self.redis.pool_size = s;
            }
        }
        if let Ok(timeout) = std::env::var("TALLY_COMMAND_TIMEOUT_MS") {
            if let Ok(t) = timeout.parse() {
                self.redis.command_timeout_ms = t;
            }
        }
        if let Ok(namespace) = std::env::var("TALLY_NAMESPACE") {
            self.namespace = namespace;
        }
        if let Ok(window) = std::env::var("TALLY_DEFAULT_EDIT_WINDOW_SECS") {
            if let Ok(w) = window.parse() {
                self.default_edit_window_secs = w;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::ConfigurationError(
                "Namespace cannot be empty".to_string(),
            ));
        }
        // Colon is the key separator, so a namespace containing one would
        // shift every key one segment deeper
        if self.namespace.contains(':') {
            return Err(Error::ConfigurationError(
                "Namespace cannot contain ':'".to_string(),
            ));
        }
        if self.redis.command_timeout_ms == 0 {
            return Err(Error::ConfigurationError(
                "Command timeout must be greater than 0".to_string(),
            ));
        }

        self.redis_config()
            .validate()
            .map_err(Error::ConfigurationError)
    }

    /// Convert to the runtime connection-pool configuration
    pub fn redis_config(&self) -> RedisConfig {
        RedisConfig {
            url: self.redis.url.clone(),
            pool_size: self.redis.pool_size,
            connection_timeout: Duration::from_secs(self.redis.connection_timeout_secs),
            command_timeout: Duration::from_millis(self.redis.command_timeout_ms),
            retry_policy: RetryPolicy {
                max_retries: self.redis.max_retries,
                ..Default::default()
            },
        }
    }

    /// Default alias TTL applied when `track` gets an alias but no
    /// explicit edit window
    pub fn default_edit_window(&self) -> Option<Duration> {
        if self.default_edit_window_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.default_edit_window_secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TrackerConfig::default();
        assert_eq!(config.namespace, "tally");
        assert_eq!(config.redis.pool_size, 16);
        assert_eq!(config.default_edit_window(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_namespace_validation() {
        let mut config = TrackerConfig::default();
        config.namespace = "".to_string();
        assert!(config.validate().is_err());

        config.namespace = "stats:prod".to_string();
        assert!(config.validate().is_err());

        config.namespace = "stats".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            namespace = "hits"
            default_edit_window_secs = 600

            [redis]
            url = "redis://cache.internal:6380"
            pool_size = 8
        "#;

        let config: TrackerConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.namespace, "hits");
        assert_eq!(config.redis.url, "redis://cache.internal:6380");
        assert_eq!(config.redis.pool_size, 8);
        // Unspecified fields take defaults
        assert_eq!(config.redis.max_retries, 3);
        assert_eq!(
            config.default_edit_window(),
            Some(Duration::from_secs(600))
        );
    }

    #[test]
    fn test_env_override() {
        std::env::set_var("TALLY_NAMESPACE", "env_ns");
        let config = TrackerConfig::from_env();
        assert_eq!(config.namespace, "env_ns");
        std::env::remove_var("TALLY_NAMESPACE");
    }

    #[test]
    fn test_redis_config_conversion() {
        let mut config = TrackerConfig::default();
        config.redis.command_timeout_ms = 250;
        config.redis.max_retries = 5;

        let redis = config.redis_config();
        assert_eq!(redis.command_timeout, Duration::from_millis(250));
        assert_eq!(redis.retry_policy.max_retries, 5);
    }
}
