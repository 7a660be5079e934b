//! Configuration management for beaconwatch.
//!
//! Supports:
//! - Loading from YAML files
//! - Environment variable overrides (`BEACONWATCH__*`)
//! - Validation of all settings

use crate::discovery_config::DiscoveryConfig;
use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::Level;

/// Prefix for environment variable overrides, e.g. `BEACONWATCH__DISCOVERY__PORT=6`
pub const ENV_PREFIX: &str = "BEACONWATCH";

/// Main application configuration.
///
/// # Examples
///
/// ```
/// use beaconwatch_core::config::AppConfig;
///
/// let config = AppConfig::from_yaml("discovery:\n  liveness_timeout_secs: 60\n").unwrap();
/// assert_eq!(config.discovery.liveness_timeout_secs, 60);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Discovery engine settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Loads configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::file_not_found(path.display().to_string()).into());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Self::from_yaml(&contents)
    }

    /// Loads configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Loads configuration using the `config` crate: the optional file first,
    /// then `BEACONWATCH__SECTION__KEY` environment variables on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let source = path
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "environment".to_string());

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigError::LoadFailed {
                path: source,
                reason: e.to_string(),
            })?;

        config.try_deserialize().map_err(|e| {
            ConfigError::InvalidFormat {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<()> {
        self.discovery
            .validate()
            .map_err(|reason| ConfigError::invalid_value("discovery", reason))?;

        self.logging.parse_level()?;

        Ok(())
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: LogFormat,

    /// Whether to include the event target
    #[serde(default)]
    pub target: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

impl LoggingConfig {
    /// Parses the log level string to a tracing Level.
    pub fn parse_level(&self) -> Result<Level> {
        self.level.parse().map_err(|_| {
            ConfigError::invalid_value("logging.level", format!("Invalid log level: {}", self.level))
                .into()
        })
    }
}

/// Log format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format
    Text,
    /// JSON format for structured logging
    Json,
}
