//! DNS resolution subsystem
//!
//! A policy-driven resolver for a transparent proxy: queries are routed to
//! nameserver groups by domain, answers from the main group are checked
//! against fallback filters, identical in-flight questions are coalesced and
//! address answers are cached.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!   Registry ─────────▶│   Resolver   │──── hosts ──▶ synthesized answer
//!      │               └──────┬───────┘
//!      │                      │ cache miss
//!      │               ┌──────▼───────┐
//!      │               │ single-flight│
//!      │               └──────┬───────┘
//!      │        ┌─────────────┼──────────────┐
//!      │   policy group     main group     fallback group
//!      │        └─────────────┼──────────────┘
//!      │               ┌──────▼───────┐
//!      │               │  DnsClient   │ udp/tcp/tls/doh/doq/dhcp/system/rcode
//!      │               └──────┬───────┘
//!      │                      │ Dialer (direct, interface or proxy)
//!      ▼
//!  ResolverEnhancer ── fake-ip Pool / address → host mapping
//! ```
//!
//! # Example
//!
//! ```no_run
//! use rust_resolver::dns::{self, DnsConfig, Registry};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DnsConfig {
//!     nameserver: vec!["223.5.5.5".into(), "https://dns.alidns.com/dns-query".into()],
//!     default_nameserver: vec!["223.5.5.5".into()],
//!     ..Default::default()
//! };
//!
//! let registry = Arc::new(Registry::new());
//! registry.install(dns::build(&config, None)?);
//!
//! let ip = registry.resolve_ip("example.com").await?;
//! println!("{ip}");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod dialer;
pub mod enhancer;
pub mod error;
pub mod fallback;
pub mod geosite;
pub mod hosts;
pub mod message;
pub mod policy;
pub mod registry;
pub mod resolver;
pub mod singleflight;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use tracing::{debug, info};

pub use client::{batch_exchange, transform, ClientContext, DnsClient};
pub use config::{
    parse_nameserver, parse_nameservers, DnsConfig, EnhancedMode, FallbackFilterConfig,
    HostsValue, NameServer, NameServerNet, PolicyEntry,
};
pub use dialer::{Dialer, Dispatcher, Metadata, ProxyAdapter};
pub use enhancer::ResolverEnhancer;
pub use error::{DnsError, DnsResult};
pub use fallback::{DomainFilter, IpFilter};
pub use hosts::{HostValue, Hosts};
pub use policy::{ClientGroup, Policy, PolicyBuilder};
pub use registry::Registry;
pub use resolver::{Resolver, ResolverOptions};

use crate::fakeip::{Pool, PoolOptions};
use crate::trie::DomainTrie;
use geosite::GeoSiteDb;

/// Default deadline of one exchange
pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Fake-IP database used when `store-fake-ip` is set without a path
pub const DEFAULT_FAKE_IP_STORE: &str = "fakeip.db";

/// Everything [`build`] produces from one configuration
#[derive(Debug)]
pub struct Components {
    /// Main resolver
    pub resolver: Resolver,
    /// Resolver for proxy server hostnames, when configured
    pub proxy_server_resolver: Option<Resolver>,
    /// Fake-IP / mapping enhancer
    pub enhancer: ResolverEnhancer,
    /// Fake-IP pool, in `fake-ip` mode
    pub pool: Option<Arc<Pool>>,
}

fn nameservers(urls: &[String], respect_rules: bool, prefer_h3: bool, field: &str) -> DnsResult<Vec<NameServer>> {
    parse_nameservers(urls, respect_rules, prefer_h3).map_err(|e| DnsError::config_field(e.to_string(), field))
}

/// Compose the resolver, proxy-server resolver, enhancer and pool
///
/// Upstream hostnames are resolved by a bootstrap resolver built from
/// `default-nameserver`. `dispatcher` is required for proxied upstreams.
///
/// # Errors
///
/// Returns `DnsError::ConfigError` for an unparsable nameserver, filter,
/// policy or fake-IP range, and `DnsError::StoreError` when the fake-IP
/// database cannot be opened.
pub fn build(config: &DnsConfig, dispatcher: Option<Arc<dyn Dispatcher>>) -> DnsResult<Components> {
    config
        .validate()
        .map_err(|e| DnsError::config(e.to_string()))?;

    let bootstrap = Resolver::new(ResolverOptions {
        ipv6: config.ipv6,
        ipv6_timeout: config.ipv6_timeout(),
        main: transform(
            &nameservers(&config.default_nameserver, false, false, "default-nameserver")?,
            &ClientContext {
                resolver: None,
                dispatcher: dispatcher.clone(),
            },
        ),
        cache_algorithm: config.cache_algorithm,
        ..Default::default()
    });
    let ctx = ClientContext {
        resolver: Some(bootstrap),
        dispatcher,
    };

    let geosite = GeoSiteDb::new(&config.geosite);
    let policies = PolicyBuilder {
        ctx: &ctx,
        respect_rules: config.respect_rules,
        prefer_h3: config.prefer_h3,
        rule_sets: &config.rule_sets,
        geosite: &geosite,
    }
    .build(&config.nameserver_policy)?;

    let hosts = if config.hosts.is_empty() {
        None
    } else {
        Some(Arc::new(Hosts::from_config(&config.hosts)?))
    };

    let resolver = Resolver::new(ResolverOptions {
        ipv6: config.ipv6,
        ipv6_timeout: config.ipv6_timeout(),
        main: transform(
            &nameservers(&config.nameserver, config.respect_rules, config.prefer_h3, "nameserver")?,
            &ctx,
        ),
        fallback: transform(
            &nameservers(&config.fallback, config.respect_rules, config.prefer_h3, "fallback")?,
            &ctx,
        ),
        proxy_server: transform(
            &nameservers(
                &config.proxy_server_nameserver,
                false,
                config.prefer_h3,
                "proxy-server-nameserver",
            )?,
            &ctx,
        ),
        policies,
        fallback_ip_filters: fallback_ip_filters(&config.fallback_filter)?,
        fallback_domain_filters: fallback_domain_filters(&config.fallback_filter, &geosite)?,
        hosts,
        cache_algorithm: config.cache_algorithm,
    });
    let proxy_server_resolver = resolver.proxy_server_host_resolver();

    let pool = if config.enhanced_mode == EnhancedMode::FakeIp {
        Some(Arc::new(fake_ip_pool(config)?))
    } else {
        None
    };
    let enhancer = ResolverEnhancer::new(config.enhanced_mode, pool.clone());

    info!(
        mode = %config.enhanced_mode,
        ipv6 = config.ipv6,
        proxy_server = proxy_server_resolver.is_some(),
        "dns resolver built"
    );
    Ok(Components {
        resolver,
        proxy_server_resolver,
        enhancer,
        pool,
    })
}

fn fallback_ip_filters(filter: &FallbackFilterConfig) -> DnsResult<Vec<IpFilter>> {
    if filter.ipcidr.is_empty() {
        return Ok(Vec::new());
    }
    let nets = filter
        .ipcidr
        .iter()
        .map(|cidr| {
            cidr.parse::<IpNet>()
                .map_err(|e| DnsError::config_field(format!("{cidr}: {e}"), "fallback-filter.ipcidr"))
        })
        .collect::<DnsResult<Vec<_>>>()?;
    Ok(vec![IpFilter::Cidr(nets)])
}

fn fallback_domain_filters(filter: &FallbackFilterConfig, geosite: &GeoSiteDb) -> DnsResult<Vec<DomainFilter>> {
    let mut filters = Vec::new();
    if !filter.domain.is_empty() {
        let mut trie = DomainTrie::new();
        for domain in &filter.domain {
            trie.insert(domain, ())
                .map_err(|e| DnsError::config_field(format!("{domain}: {e}"), "fallback-filter.domain"))?;
        }
        filters.push(DomainFilter::Trie(trie));
    }
    for code in &filter.geosite {
        filters.push(DomainFilter::GeoSite(geosite.matcher(code)?));
    }
    debug!(filters = filters.len(), "fallback domain filters built");
    Ok(filters)
}

fn fake_ip_pool(config: &DnsConfig) -> DnsResult<Pool> {
    let ipnet = config
        .fake_ip_net()
        .map_err(|e| DnsError::config_field(e.to_string(), "fake-ip-range"))?;
    let mut options = PoolOptions::new(ipnet);

    if !config.fake_ip_filter.is_empty() {
        let mut skip = DomainTrie::new();
        for domain in &config.fake_ip_filter {
            skip.insert(domain, ())
                .map_err(|e| DnsError::config_field(format!("{domain}: {e}"), "fake-ip-filter"))?;
        }
        options = options.with_host(Arc::new(skip));
    }
    if config.store_fake_ip {
        let path = config
            .fake_ip_store_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FAKE_IP_STORE));
        options = options.with_persistence(path);
    }

    Pool::new(options).map_err(|e| match e {
        crate::fakeip::FakeIpError::InvalidPrefix(_) => DnsError::config_field(e.to_string(), "fake-ip-range"),
        crate::fakeip::FakeIpError::Store(_) => DnsError::store(e.to_string()),
    })
}
