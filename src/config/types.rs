//! Configuration types for rust-resolver
//!
//! The root [`Config`] carries logging settings and the DNS subsystem
//! settings ([`DnsConfig`]). Configuration is loaded from JSON files and
//! validated at startup.

use serde::{Deserialize, Serialize};

use crate::dns::DnsConfig;
use crate::error::ConfigError;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// DNS resolution configuration
    #[serde(default)]
    pub dns: DnsConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate()?;
        self.dns.validate()?;
        Ok(())
    }

    /// Create a minimal default configuration
    ///
    /// Uses public resolvers so the result passes validation.
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            log: LogConfig::default(),
            dns: DnsConfig {
                nameserver: vec!["223.5.5.5".into(), "tls://1.1.1.1".into()],
                default_nameserver: vec!["223.5.5.5".into()],
                ..DnsConfig::default()
            },
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include timestamps
    #[serde(default = "default_true")]
    pub timestamps: bool,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl LogConfig {
    /// Validate logging configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an unknown level or format.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(
            self.level.to_ascii_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level: {}",
                self.level
            )));
        }
        if !matches!(self.format.as_str(), "json" | "text") {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log format: {} (expected json or text)",
                self.format
            )));
        }
        Ok(())
    }

    /// Whether JSON output is selected
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == "json"
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            timestamps: true,
            target: true,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.log.level, "info");
        assert!(!config.log.is_json());
    }

    #[test]
    fn test_log_config_defaults_from_json() {
        let log: LogConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(log.level, "info");
        assert_eq!(log.format, "text");
        assert!(log.timestamps);
        assert!(log.target);
    }

    #[test]
    fn test_invalid_log_level() {
        let log = LogConfig {
            level: "loud".into(),
            ..LogConfig::default()
        };
        assert!(matches!(log.validate(), Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_invalid_log_format() {
        let log = LogConfig {
            format: "yaml".into(),
            ..LogConfig::default()
        };
        assert!(log.validate().is_err());
    }

    #[test]
    fn test_empty_nameserver_rejected() {
        let config = Config::default();
        assert!(config.validate().is_err());
    }
}
