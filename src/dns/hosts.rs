//! Static host entries
//!
//! A hosts entry maps a domain pattern to addresses or to another name:
//!
//! ```json
//! {
//!   "router.lan": "192.168.1.1",
//!   "+.dev.internal": ["10.0.0.2", "fd00::2"],
//!   "mirror.example": "cdn.example.net"
//! }
//! ```
//!
//! Aliases are followed through the table up to [`MAX_ALIAS_DEPTH`] steps.

use std::collections::HashMap;
use std::net::IpAddr;

use super::config::HostsValue;
use super::error::{DnsError, DnsResult};
use crate::trie::DomainTrie;

/// Longest alias chain followed inside the table
pub const MAX_ALIAS_DEPTH: usize = 8;

/// TTL of answers synthesized from host entries
pub const HOSTS_TTL: u32 = 10;

/// What a domain maps to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostValue {
    /// Fixed addresses
    Ips(Vec<IpAddr>),
    /// Resolve this name instead
    Alias(String),
}

impl HostValue {
    /// Addresses of the requested family (`v6` selects IPv6)
    #[must_use]
    pub fn ips_of_family(&self, v6: bool) -> Vec<IpAddr> {
        match self {
            Self::Ips(ips) => ips.iter().copied().filter(|ip| ip.is_ipv6() == v6).collect(),
            Self::Alias(_) => Vec::new(),
        }
    }
}

/// Host table
#[derive(Debug, Default)]
pub struct Hosts {
    trie: DomainTrie<HostValue>,
}

impl Hosts {
    /// Build the table from configuration
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` for an invalid domain pattern, or a
    /// value list mixing addresses and names.
    pub fn from_config(entries: &HashMap<String, HostsValue>) -> DnsResult<Self> {
        let mut trie = DomainTrie::new();
        for (domain, value) in entries {
            let values = value.values();
            let ips: Vec<IpAddr> = values.iter().filter_map(|v| v.parse().ok()).collect();
            let host = if ips.len() == values.len() && !ips.is_empty() {
                HostValue::Ips(ips)
            } else if let [alias] = values.as_slice() {
                HostValue::Alias(alias.trim_end_matches('.').to_ascii_lowercase())
            } else {
                return Err(DnsError::config_field(
                    format!("hosts entry {domain}: expected addresses or a single alias"),
                    "hosts",
                ));
            };
            trie.insert(domain, host)
                .map_err(|e| DnsError::config_field(format!("hosts entry {domain}: {e}"), "hosts"))?;
        }
        Ok(Self { trie })
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.trie.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trie.is_empty()
    }

    /// Resolve `domain` inside the table
    ///
    /// Returns the addresses of the end of the alias chain, or the last alias
    /// when the chain leaves the table or gets too long.
    #[must_use]
    pub fn lookup(&self, domain: &str) -> Option<HostValue> {
        let mut value = self.trie.search(domain)?.clone();
        for _ in 0..MAX_ALIAS_DEPTH {
            let HostValue::Alias(name) = &value else {
                break;
            };
            match self.trie.search(name) {
                Some(next) => value = next.clone(),
                None => break,
            }
        }
        Some(value)
    }
}
