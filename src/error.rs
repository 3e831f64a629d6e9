//! Error types for rust-resolver
//!
//! Each subsystem owns its error enum:
//!
//! - [`ConfigError`]: configuration files, environment overrides, validation
//! - [`DnsError`](crate::dns::DnsError): resolution, upstream transports, caching
//! - [`FakeIpError`](crate::fakeip::FakeIpError): fake-IP pool construction and persistence
//!
//! [`ResolverError`] joins them at the crate boundary.

use std::io;

use thiserror::Error;

use crate::dns::DnsError;
use crate::fakeip::FakeIpError;

/// Top-level error type for rust-resolver
#[derive(Debug, Error)]
pub enum ResolverError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Resolution errors
    #[error("DNS error: {0}")]
    Dns(#[from] DnsError),

    /// Fake-IP pool errors
    #[error("Fake-IP error: {0}")]
    FakeIp(#[from] FakeIpError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ResolverError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(e) => e.is_recoverable(),
            Self::Dns(e) => e.is_recoverable(),
            Self::FakeIp(_) => false,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are generally not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

impl From<ConfigError> for DnsError {
    fn from(err: ConfigError) -> Self {
        DnsError::config(err.to_string())
    }
}
