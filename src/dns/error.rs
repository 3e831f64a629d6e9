//! Error types for the DNS resolution subsystem
//!
//! This module defines the error hierarchy shared by the resolver, the
//! upstream clients, the domain matchers and the cache layer.
//!
//! # Error Categories
//!
//! - **Lookup errors**: no address found, address family mismatch
//! - **Parse/Serialize errors**: DNS message encoding/decoding failures
//! - **Network errors**: socket I/O and connection issues
//! - **Upstream errors**: upstream server failures and error rcodes
//! - **Config errors**: invalid nameserver URLs, policies or prefixes
//! - **Cancellation**: the caller stopped waiting for the answer
//!
//! `DnsError` is `Clone` because a single upstream result is handed to every
//! waiter of a single-flight group. I/O sources are therefore kept behind an
//! `Arc`.
//!
//! # Example
//!
//! ```
//! use rust_resolver::dns::DnsError;
//!
//! let err = DnsError::timeout("query to 8.8.8.8:53", std::time::Duration::from_secs(5));
//! assert!(err.is_recoverable());
//! assert!(err.to_string().contains("timed out"));
//! ```

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error types for DNS operations
///
/// # Recoverability
///
/// - **Recoverable**: transient issues that may succeed on retry (timeouts,
///   network errors, upstream failures)
/// - **Non-recoverable**: failures that need a different input or config
#[derive(Debug, Clone, Error)]
pub enum DnsError {
    /// A domain could not be inserted into or looked up in a matcher
    #[error("invalid domain: {domain}")]
    InvalidDomain {
        /// The offending domain string
        domain: String,
    },

    /// The lookup produced no address of the requested family
    #[error("couldn't find ip for {host}")]
    IpNotFound {
        /// Host that was looked up
        host: String,
    },

    /// A literal IP host does not belong to the requested family
    #[error("ip version error: {host}")]
    IpVersionMismatch {
        /// The literal host
        host: String,
    },

    /// An IPv6 lookup was requested while IPv6 is disabled
    #[error("ipv6 disabled")]
    Ipv6Disabled,

    /// The query message is unusable (e.g. empty question section)
    #[error("Invalid DNS query: {reason}")]
    InvalidQuery {
        /// Description of why the query is invalid
        reason: String,
    },

    /// DNS message parsing failed
    #[error("Failed to parse DNS message: {reason}")]
    ParseError {
        /// Description of what went wrong during parsing
        reason: String,
    },

    /// DNS message serialization failed
    #[error("Failed to serialize DNS message: {reason}")]
    SerializeError {
        /// Description of what went wrong during serialization
        reason: String,
    },

    /// Network I/O error
    ///
    /// `retryable` marks transport failures after which a fresh connection
    /// is expected to succeed (idle QUIC timeouts, resets, closed streams).
    #[error("Network error: {reason}")]
    NetworkError {
        /// Description of the network failure
        reason: String,
        /// Whether a cached connection should be recreated and the query retried
        retryable: bool,
        /// The underlying I/O error, if available
        #[source]
        source: Option<Arc<io::Error>>,
    },

    /// Query timeout
    #[error("DNS query timed out after {timeout:?}: {context}")]
    TimeoutError {
        /// Description of what timed out
        context: String,
        /// The timeout duration that was exceeded
        timeout: Duration,
    },

    /// Upstream server error
    #[error("Upstream server error ({upstream}): {reason}")]
    UpstreamError {
        /// The upstream server address
        upstream: String,
        /// Description of the upstream failure
        reason: String,
        /// The DNS response code, if available (e.g., SERVFAIL, REFUSED)
        rcode: Option<u16>,
    },

    /// Every client of a batch failed
    #[error("all DNS requests failed, first error: {first}")]
    AllFailed {
        /// The first error observed in the batch
        first: Box<DnsError>,
    },

    /// No upstream available
    #[error("No upstream DNS server available: {reason}")]
    NoUpstream {
        /// Reason why no upstream is available
        reason: String,
    },

    /// The caller gave up waiting
    #[error("DNS query cancelled: {context}")]
    Cancelled {
        /// What was being waited on
        context: String,
    },

    /// Invalid configuration
    #[error("Invalid DNS configuration: {reason}")]
    ConfigError {
        /// Description of the configuration error
        reason: String,
        /// The configuration field that is invalid, if applicable
        field: Option<String>,
    },

    /// Persistent store failure
    #[error("Store error: {reason}")]
    StoreError {
        /// Description of the store failure
        reason: String,
    },

    /// Internal processing error
    #[error("Internal DNS error: {reason}")]
    InternalError {
        /// Description of the internal error
        reason: String,
    },
}

impl DnsError {
    // ========================================================================
    // Constructor methods
    // ========================================================================

    /// Create an invalid domain error
    ///
    /// # Example
    ///
    /// ```
    /// use rust_resolver::dns::DnsError;
    ///
    /// let err = DnsError::invalid_domain("..dev");
    /// assert!(err.to_string().contains("..dev"));
    /// ```
    pub fn invalid_domain(domain: impl Into<String>) -> Self {
        Self::InvalidDomain {
            domain: domain.into(),
        }
    }

    /// Create an IP-not-found error
    pub fn ip_not_found(host: impl Into<String>) -> Self {
        Self::IpNotFound { host: host.into() }
    }

    /// Create an IP version mismatch error
    pub fn ip_version_mismatch(host: impl Into<String>) -> Self {
        Self::IpVersionMismatch { host: host.into() }
    }

    /// Create an invalid query error
    ///
    /// # Example
    ///
    /// ```
    /// use rust_resolver::dns::DnsError;
    ///
    /// let err = DnsError::invalid_query("should have one question at least");
    /// assert!(err.to_string().contains("one question"));
    /// ```
    pub fn invalid_query(reason: impl Into<String>) -> Self {
        Self::InvalidQuery {
            reason: reason.into(),
        }
    }

    /// Create a parse error
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::ParseError {
            reason: reason.into(),
        }
    }

    /// Create a serialization error
    pub fn serialize(reason: impl Into<String>) -> Self {
        Self::SerializeError {
            reason: reason.into(),
        }
    }

    /// Create a network error
    ///
    /// # Example
    ///
    /// ```
    /// use rust_resolver::dns::DnsError;
    ///
    /// let err = DnsError::network("connection refused");
    /// assert!(err.to_string().contains("connection refused"));
    /// assert!(!err.is_retryable());
    /// ```
    pub fn network(reason: impl Into<String>) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            retryable: false,
            source: None,
        }
    }

    /// Create a network error that invites a reconnect-and-retry
    pub fn network_retryable(reason: impl Into<String>) -> Self {
        Self::NetworkError {
            reason: reason.into(),
            retryable: true,
            source: None,
        }
    }

    /// Create a network error from an I/O error
    ///
    /// Connection resets and aborts, broken pipes and unexpected EOFs are
    /// flagged retryable.
    ///
    /// # Example
    ///
    /// ```
    /// use rust_resolver::dns::DnsError;
    /// use std::io;
    ///
    /// let io_err = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
    /// let err = DnsError::network_io("read failed", io_err);
    /// assert!(err.is_retryable());
    /// ```
    pub fn network_io(reason: impl Into<String>, source: io::Error) -> Self {
        let retryable = matches!(
            source.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::NotConnected
        );
        Self::NetworkError {
            reason: reason.into(),
            retryable,
            source: Some(Arc::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(context: impl Into<String>, timeout: Duration) -> Self {
        Self::TimeoutError {
            context: context.into(),
            timeout,
        }
    }

    /// Create an upstream error
    ///
    /// # Example
    ///
    /// ```
    /// use rust_resolver::dns::DnsError;
    ///
    /// let err = DnsError::upstream("udp://8.8.8.8:53", "connection reset");
    /// assert!(err.to_string().contains("8.8.8.8:53"));
    /// ```
    pub fn upstream(upstream: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UpstreamError {
            upstream: upstream.into(),
            reason: reason.into(),
            rcode: None,
        }
    }

    /// Create an upstream error carrying the response code
    pub fn upstream_rcode(
        upstream: impl Into<String>,
        reason: impl Into<String>,
        rcode: u16,
    ) -> Self {
        Self::UpstreamError {
            upstream: upstream.into(),
            reason: reason.into(),
            rcode: Some(rcode),
        }
    }

    /// Wrap the first error of a failed batch
    ///
    /// # Example
    ///
    /// ```
    /// use rust_resolver::dns::DnsError;
    ///
    /// let err = DnsError::all_failed(DnsError::network("unreachable"));
    /// assert!(err.to_string().starts_with("all DNS requests failed, first error:"));
    /// ```
    pub fn all_failed(first: DnsError) -> Self {
        Self::AllFailed {
            first: Box::new(first),
        }
    }

    /// Create a no upstream available error
    pub fn no_upstream(reason: impl Into<String>) -> Self {
        Self::NoUpstream {
            reason: reason.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled {
            context: context.into(),
        }
    }

    /// Create a configuration error
    ///
    /// # Example
    ///
    /// ```
    /// use rust_resolver::dns::DnsError;
    ///
    /// let err = DnsError::config("unsupported scheme: ftp");
    /// assert!(err.to_string().contains("unsupported scheme"));
    /// ```
    pub fn config(reason: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
            field: None,
        }
    }

    /// Create a configuration error with field context
    pub fn config_field(reason: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ConfigError {
            reason: reason.into(),
            field: Some(field.into()),
        }
    }

    /// Create a store error
    pub fn store(reason: impl Into<String>) -> Self {
        Self::StoreError {
            reason: reason.into(),
        }
    }

    /// Create an internal error
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::InternalError {
            reason: reason.into(),
        }
    }

    // ========================================================================
    // Classification methods
    // ========================================================================

    /// Check if this error is recoverable
    ///
    /// # Recoverable errors:
    /// - `NetworkError`, `TimeoutError`, `UpstreamError`, `AllFailed`
    ///
    /// Everything else needs a different query or a configuration change.
    ///
    /// # Example
    ///
    /// ```
    /// use rust_resolver::dns::DnsError;
    /// use std::time::Duration;
    ///
    /// assert!(DnsError::timeout("query", Duration::from_secs(5)).is_recoverable());
    /// assert!(!DnsError::config("bad url").is_recoverable());
    /// ```
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::NetworkError { .. }
            | Self::TimeoutError { .. }
            | Self::UpstreamError { .. }
            | Self::AllFailed { .. } => true,
            Self::InvalidDomain { .. }
            | Self::IpNotFound { .. }
            | Self::IpVersionMismatch { .. }
            | Self::Ipv6Disabled
            | Self::InvalidQuery { .. }
            | Self::ParseError { .. }
            | Self::SerializeError { .. }
            | Self::NoUpstream { .. }
            | Self::Cancelled { .. }
            | Self::ConfigError { .. }
            | Self::StoreError { .. }
            | Self::InternalError { .. } => false,
        }
    }

    /// Whether a DoH/DoQ client should drop its cached connection and retry
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NetworkError { retryable, .. } => *retryable,
            Self::TimeoutError { .. } => true,
            _ => false,
        }
    }

    /// Check if this error indicates a timeout
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutError { .. })
    }

    /// Check if this error is a caller cancellation
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Check if the lookup simply produced no address
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::IpNotFound { .. })
    }

    /// Get the upstream address associated with this error, if any
    #[must_use]
    pub fn upstream_addr(&self) -> Option<&str> {
        match self {
            Self::UpstreamError { upstream, .. } => Some(upstream),
            Self::AllFailed { first } => first.upstream_addr(),
            _ => None,
        }
    }
}

impl From<io::Error> for DnsError {
    fn from(err: io::Error) -> Self {
        Self::network_io(err.to_string(), err)
    }
}

/// Type alias for Result with [`DnsError`]
pub type DnsResult<T> = std::result::Result<T, DnsError>;
