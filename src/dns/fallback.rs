//! Fallback filters
//!
//! The main group's answer is trusted unless an [`IpFilter`] flags one of its
//! addresses. Domains matching a [`DomainFilter`] skip the main group and go
//! straight to the fallback group.

use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;

use super::geosite::GeoSiteMatcher;
use crate::trie::DomainTrie;

/// Flags answer addresses that must not be trusted
#[derive(Debug, Clone)]
pub enum IpFilter {
    /// Address inside any of the prefixes
    Cidr(Vec<IpNet>),
}

impl IpFilter {
    /// Whether `ip` should send the query to the fallback group
    #[must_use]
    pub fn matches(&self, ip: IpAddr) -> bool {
        match self {
            Self::Cidr(nets) => nets.iter().any(|net| net.contains(&ip)),
        }
    }
}

/// Flags domains that bypass the main group
#[derive(Debug)]
pub enum DomainFilter {
    /// Domain patterns
    Trie(DomainTrie<()>),
    /// A GeoSite code
    GeoSite(Arc<GeoSiteMatcher>),
}

impl DomainFilter {
    /// Whether `domain` should be resolved by the fallback group only
    #[must_use]
    pub fn matches(&self, domain: &str) -> bool {
        match self {
            Self::Trie(trie) => trie.search(domain).is_some(),
            Self::GeoSite(matcher) => matcher.match_domain(domain),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::geosite::{parse_domain_list, ListFormat};

    #[test]
    fn test_cidr_filter() {
        let filter = IpFilter::Cidr(vec![
            "240.0.0.0/4".parse().unwrap(),
            "fc00::/7".parse().unwrap(),
        ]);
        assert!(filter.matches("240.1.2.3".parse().unwrap()));
        assert!(filter.matches("fd00::1".parse().unwrap()));
        assert!(!filter.matches("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn test_domain_filters() {
        let mut trie = DomainTrie::new();
        trie.insert("+.google.com", ()).unwrap();
        let filter = DomainFilter::Trie(trie);
        assert!(filter.matches("google.com"));
        assert!(filter.matches("www.google.com"));
        assert!(!filter.matches("example.com"));

        let set = parse_domain_list("domain:youtube.com", ListFormat::GeoSite);
        let filter = DomainFilter::GeoSite(Arc::new(GeoSiteMatcher::new("youtube", set)));
        assert!(filter.matches("m.youtube.com"));
        assert!(!filter.matches("youtube.org"));
    }
}
