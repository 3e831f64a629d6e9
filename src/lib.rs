//! rust-resolver: policy-driven DNS resolution for a transparent proxy
//!
//! This crate provides the DNS side of a proxy platform: a caching,
//! request-coalescing resolver with per-domain nameserver policies, fallback
//! filtering, fake-IP allocation and many upstream transports.
//!
//! # Features
//!
//! - **Upstreams**: UDP, TCP, TLS, DNS over HTTPS (HTTP/1.1, /2, /3), DNS over
//!   QUIC, DHCP-discovered, system resolvers, static response codes
//! - **Routing**: per-domain nameserver policies, fallback on suspect answers,
//!   upstream connections through proxies
//! - **Caching**: LRU or ARC, stale serving with background refresh
//! - **Fake-IP**: synthetic addresses with reverse lookup, optionally
//!   persisted in SQLite
//! - **Matching**: domain tries with wildcards and succinct domain sets
//!
//! # Architecture
//!
//! ```text
//! Consumer → Registry → Resolver → policy / main / fallback → DnsClient → Dialer
//!                 ↓
//!         ResolverEnhancer → fake-ip Pool
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use rust_resolver::config::load_config;
//! use rust_resolver::dns::{self, Registry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/rust-resolver/config.json")?;
//!
//! let registry = Arc::new(Registry::new());
//! registry.install(dns::build(&config.dns, None)?);
//!
//! let ips = registry.lookup_ip("example.com").await?;
//! println!("{ips:?}");
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`dns`]: Resolver, upstream clients, policies, registry
//! - [`cache`]: LRU and ARC expiring caches
//! - [`trie`]: Domain trie and succinct domain set
//! - [`fakeip`]: Fake-IP pool and stores
//! - [`error`]: Error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod cache;
pub mod config;
pub mod dns;
pub mod error;
pub mod fakeip;
pub mod trie;

// Re-export commonly used types at the crate root
pub use config::{Config, LogConfig};
pub use dns::{DnsConfig, DnsError, DnsResult, Registry, Resolver, ResolverEnhancer};
pub use error::{ConfigError, ResolverError};
pub use fakeip::{FakeIpError, Pool};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
