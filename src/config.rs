//! Configuration management for Ratekeeper.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RateLimitError, Result};

/// Prefix of environment variables read by [`RatekeeperConfig::load`].
pub const ENV_PREFIX: &str = "RATEKEEPER";

/// Main configuration for the Ratekeeper engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatekeeperConfig {
    /// Dispatcher and store access settings
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Background task settings
    #[serde(default)]
    pub maintenance: MaintenanceSettings,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingSettings,

    /// Path to a YAML file overriding the named rate limit types
    #[serde(default)]
    pub rules_path: Option<String>,
}

/// Settings for the rate limit dispatcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Namespace of every key the engine writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound for a single store call in milliseconds; also the
    /// minimum time spent retrying a contended key
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Minimum compare-and-swap attempts before a contended check is denied
    #[serde(default = "default_max_cas_attempts")]
    pub max_cas_attempts: u32,

    /// Base backoff between compare-and-swap attempts in milliseconds
    #[serde(default = "default_cas_backoff_ms")]
    pub cas_backoff_ms: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            store_timeout_ms: default_store_timeout_ms(),
            max_cas_attempts: default_max_cas_attempts(),
            cas_backoff_ms: default_cas_backoff_ms(),
        }
    }
}

impl LimiterSettings {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn cas_backoff(&self) -> Duration {
        Duration::from_millis(self.cas_backoff_ms)
    }
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_max_cas_attempts() -> u32 {
    16
}

fn default_cas_backoff_ms() -> u64 {
    2
}

/// Settings for the periodic sweep and stats emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceSettings {
    #[serde(default = "default_maintenance_enabled")]
    pub enabled: bool,

    /// Interval between sweeps of expired state keys
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Interval between stats log lines
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            enabled: default_maintenance_enabled(),
            sweep_interval_secs: default_sweep_interval(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl MaintenanceSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs)
    }
}

fn default_maintenance_enabled() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    3600
}

fn default_stats_interval() -> u64 {
    300
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RatekeeperConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| RateLimitError::Config(e.to_string()))
    }

    /// Layer an optional file and `RATEKEEPER__*` environment variables over the defaults.
    ///
    /// Nested fields use a double underscore, e.g. `RATEKEEPER__LIMITER__STORE_TIMEOUT_MS`.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| RateLimitError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RatekeeperConfig::default();
        assert_eq!(config.limiter.key_prefix, "ratelimit");
        assert_eq!(config.limiter.store_timeout(), Duration::from_millis(250));
        assert_eq!(config.maintenance.sweep_interval(), Duration::from_secs(3600));
        assert_eq!(config.maintenance.stats_interval(), Duration::from_secs(300));
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(config.rules_path.is_none());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = r#"
limiter:
  store_timeout_ms: 50
maintenance:
  enabled: false
logging:
  format: json
"#;
        let config = RatekeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.store_timeout_ms, 50);
        assert_eq!(config.limiter.max_cas_attempts, 16);
        assert!(!config.maintenance.enabled);
        assert_eq!(config.maintenance.sweep_interval_secs, 3600);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let err = RatekeeperConfig::from_yaml("limiter: [1, 2").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = RatekeeperConfig::from_file("/nonexistent/ratekeeper.yaml").unwrap_err();
        assert!(matches!(err, RateLimitError::Io(_)));
    }
}
