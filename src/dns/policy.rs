//! Per-domain nameserver policies
//!
//! `nameserver-policy` is an ordered list. Each entry keys a nameserver group
//! by one of:
//!
//! - domain patterns (`example.com`, `+.example.com`, `*.example.com`, ...)
//! - `rule-set:<name>`: a named domain list file
//! - `geosite:<code>[,<code>...]`: GeoSite codes, `!code` inverts the match
//!
//! Consecutive domain entries are merged into one trie. The first policy that
//! matches a domain decides the group.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use super::client::{transform, ClientContext, DnsClient};
use super::config::{parse_nameservers, NameServer, PolicyEntry};
use super::error::{DnsError, DnsResult};
use super::geosite::{load_domain_list, GeoSiteDb, GeoSiteMatcher, ListFormat};
use crate::trie::{DomainSet, DomainTrie};

const RULE_SET_PREFIX: &str = "rule-set:";
const GEOSITE_PREFIX: &str = "geosite:";

/// A nameserver group shared by every policy declaring the same servers
pub type ClientGroup = Arc<Vec<DnsClient>>;

/// One matcher → group mapping
pub enum Policy {
    /// Merged run of domain-pattern entries
    Trie(DomainTrie<ClientGroup>),
    /// Named domain list
    DomainSet {
        /// Rule-set name
        name: String,
        /// Compiled list, `None` when the file has no usable entry
        set: Option<Arc<DomainSet>>,
        /// Group for matching domains
        clients: ClientGroup,
    },
    /// GeoSite code
    GeoSite {
        /// Code matcher
        matcher: Arc<GeoSiteMatcher>,
        /// Match domains outside the code instead
        inverse: bool,
        /// Group for matching domains
        clients: ClientGroup,
    },
}

impl std::fmt::Debug for Policy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trie(trie) => f.debug_tuple("Trie").field(&trie.len()).finish(),
            Self::DomainSet { name, .. } => f.debug_tuple("DomainSet").field(name).finish(),
            Self::GeoSite {
                matcher, inverse, ..
            } => f
                .debug_struct("GeoSite")
                .field("code", &matcher.code())
                .field("inverse", inverse)
                .finish(),
        }
    }
}

impl Policy {
    /// The group serving `domain`, if this policy matches it
    #[must_use]
    pub fn matches(&self, domain: &str) -> Option<&ClientGroup> {
        match self {
            Self::Trie(trie) => trie.search(domain),
            Self::DomainSet { set, clients, .. } => set
                .as_ref()
                .is_some_and(|s| s.match_domain(domain))
                .then_some(clients),
            Self::GeoSite {
                matcher,
                inverse,
                clients,
            } => (matcher.match_domain(domain) != *inverse).then_some(clients),
        }
    }
}

/// Inputs needed to turn policy entries into matchers
pub struct PolicyBuilder<'a> {
    /// How clients dial
    pub ctx: &'a ClientContext,
    /// Route upstream connections by rules
    pub respect_rules: bool,
    /// Race HTTP/3 for DoH
    pub prefer_h3: bool,
    /// `rule-set:` name → list file
    pub rule_sets: &'a HashMap<String, PathBuf>,
    /// GeoSite lists
    pub geosite: &'a GeoSiteDb,
}

impl PolicyBuilder<'_> {
    /// Compile `entries` in declaration order
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` for an unparsable nameserver, an
    /// invalid domain pattern, or an unknown rule-set or GeoSite code.
    pub fn build(&self, entries: &[PolicyEntry]) -> DnsResult<Vec<Policy>> {
        let mut groups: Vec<(Vec<NameServer>, ClientGroup)> = Vec::new();
        let mut policies = Vec::new();
        let mut pending: Option<DomainTrie<ClientGroup>> = None;

        for entry in entries {
            let servers = parse_nameservers(&entry.nameserver, self.respect_rules, self.prefer_h3)
                .map_err(|e| DnsError::config_field(e.to_string(), "nameserver-policy"))?;
            let clients = self.group(&mut groups, servers);
            let key = entry.domain.trim();

            if let Some(name) = key.strip_prefix(RULE_SET_PREFIX) {
                policies.extend(pending.take().map(Policy::Trie));
                policies.push(self.rule_set(name.trim(), clients)?);
            } else if let Some(codes) = key.strip_prefix(GEOSITE_PREFIX) {
                policies.extend(pending.take().map(Policy::Trie));
                for code in codes.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                    let (code, inverse) = match code.strip_prefix('!') {
                        Some(code) => (code, true),
                        None => (code, false),
                    };
                    policies.push(Policy::GeoSite {
                        matcher: self.geosite.matcher(code)?,
                        inverse,
                        clients: Arc::clone(&clients),
                    });
                }
            } else {
                let trie = pending.get_or_insert_with(DomainTrie::new);
                for domain in key.split(',').map(str::trim).filter(|d| !d.is_empty()) {
                    trie.insert(domain, Arc::clone(&clients)).map_err(|e| {
                        DnsError::config_field(format!("nameserver-policy {domain}: {e}"), "nameserver-policy")
                    })?;
                }
            }
        }
        policies.extend(pending.take().map(Policy::Trie));

        debug!(policies = policies.len(), groups = groups.len(), "nameserver policies built");
        Ok(policies)
    }

    /// Reuse the clients of an identical server list
    fn group(&self, groups: &mut Vec<(Vec<NameServer>, ClientGroup)>, servers: Vec<NameServer>) -> ClientGroup {
        if let Some((_, clients)) = groups.iter().find(|(known, _)| *known == servers) {
            return Arc::clone(clients);
        }
        let clients = Arc::new(transform(&servers, self.ctx));
        groups.push((servers, Arc::clone(&clients)));
        clients
    }

    fn rule_set(&self, name: &str, clients: ClientGroup) -> DnsResult<Policy> {
        let path = self
            .rule_sets
            .get(name)
            .ok_or_else(|| DnsError::config_field(format!("unknown rule-set: {name}"), "nameserver-policy"))?;
        let set = load_domain_list(path, ListFormat::RuleSet)?;
        if set.is_none() {
            warn!(rule_set = name, "rule-set has no usable entry");
        }
        Ok(Policy::DomainSet {
            name: name.to_owned(),
            set: set.map(Arc::new),
            clients,
        })
    }
}
