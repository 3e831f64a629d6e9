//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::dns::EnhancedMode;
use crate::error::ConfigError;

/// Environment variable overriding the log level
pub const ENV_LOG_LEVEL: &str = "RUST_RESOLVER_LOG_LEVEL";

/// Environment variable overriding `dns.ipv6`
pub const ENV_IPV6: &str = "RUST_RESOLVER_IPV6";

/// Environment variable overriding `dns.enhanced-mode`
pub const ENV_ENHANCED_MODE: &str = "RUST_RESOLVER_ENHANCED_MODE";

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        "Configuration loaded: {} nameservers, {} fallback, enhanced-mode={}",
        config.dns.nameserver.len(),
        config.dns.fallback.len(),
        config.dns.enhanced_mode
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `RUST_RESOLVER_LOG_LEVEL`: Override log level
/// - `RUST_RESOLVER_IPV6`: Override `dns.ipv6` (`true`/`false`)
/// - `RUST_RESOLVER_ENHANCED_MODE`: Override `dns.enhanced-mode`
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;

    // Re-validate after overrides
    config.validate()?;

    Ok(config)
}

fn apply_env_overrides(
    config: &mut Config,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(level) = var(ENV_LOG_LEVEL) {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(ipv6) = var(ENV_IPV6) {
        config.dns.ipv6 = ipv6.parse().map_err(|_| ConfigError::EnvError {
            name: ENV_IPV6.into(),
            reason: format!("Invalid boolean: {ipv6}"),
        })?;
        debug!("IPv6 overridden to {}", config.dns.ipv6);
    }

    if let Some(mode) = var(ENV_ENHANCED_MODE) {
        config.dns.enhanced_mode =
            mode.parse::<EnhancedMode>().map_err(|reason| ConfigError::EnvError {
                name: ENV_ENHANCED_MODE.into(),
                reason,
            })?;
        debug!("Enhanced mode overridden to {}", config.dns.enhanced_mode);
    }

    Ok(())
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_config() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        let config = Config::default_config();
        let json = serde_json::to_string_pretty(&config).unwrap();
        file.write_all(json.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_config() {
        let file = create_temp_config();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.dns.nameserver.len(), 2);
    }

    #[test]
    fn test_load_config_file_not_found() {
        let result = load_config("/nonexistent/path/config.json");
        assert!(matches!(result, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_load_config_str() {
        let json = r#"{
            "log": { "level": "debug" },
            "dns": {
                "nameserver": ["8.8.8.8", "https://dns.google/dns-query"],
                "default-nameserver": ["8.8.8.8"],
                "enhanced-mode": "fake-ip",
                "fake-ip-range": "198.18.0.1/16"
            }
        }"#;
        let config = load_config_str(json).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.dns.enhanced_mode, EnhancedMode::FakeIp);
    }

    #[test]
    fn test_load_config_invalid_json() {
        let result = load_config_str("not valid json");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_create_default_config_round_trip() {
        let file = NamedTempFile::new().unwrap();
        create_default_config(file.path()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.dns.default_nameserver, vec!["223.5.5.5".to_string()]);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            (ENV_LOG_LEVEL, "warn"),
            (ENV_IPV6, "true"),
            (ENV_ENHANCED_MODE, "redir-host"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default_config();
        apply_env_overrides(&mut config, |name| vars.get(name).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.log.level, "warn");
        assert!(config.dns.ipv6);
        assert_eq!(config.dns.enhanced_mode, EnhancedMode::Mapping);
    }

    #[test]
    fn test_env_override_invalid_bool() {
        let mut config = Config::default_config();
        let result = apply_env_overrides(&mut config, |name| {
            (name == ENV_IPV6).then(|| "maybe".to_string())
        });
        assert!(matches!(result, Err(ConfigError::EnvError { .. })));
    }
}
