//! Current resolver handles
//!
//! Consumers such as dialers and metadata builders hold an `Arc<Registry>`
//! and read the resolver, proxy-server resolver and enhancer through it.
//! A reload swaps all three without blocking readers.
//!
//! The composition root may additionally [`install_global`] one registry so
//! the free functions below work without threading a handle through.

use std::net::IpAddr;
use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwapOption;
use hickory_proto::op::Message;
use tracing::info;

use super::enhancer::ResolverEnhancer;
use super::error::{DnsError, DnsResult};
use super::message::{msg_to_domain, msg_to_ip};
use super::resolver::Resolver;

/// Hot-swappable handles to the active DNS components
#[derive(Debug, Default)]
pub struct Registry {
    resolver: ArcSwapOption<Resolver>,
    proxy_server_resolver: ArcSwapOption<Resolver>,
    enhancer: ArcSwapOption<ResolverEnhancer>,
}

impl Registry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current resolver
    #[must_use]
    pub fn resolver(&self) -> Option<Arc<Resolver>> {
        self.resolver.load_full()
    }

    /// Current proxy-server resolver
    #[must_use]
    pub fn proxy_server_resolver(&self) -> Option<Arc<Resolver>> {
        self.proxy_server_resolver.load_full()
    }

    /// Current enhancer
    #[must_use]
    pub fn enhancer(&self) -> Option<Arc<ResolverEnhancer>> {
        self.enhancer.load_full()
    }

    /// Replace the resolver
    pub fn set_resolver(&self, resolver: Option<Resolver>) {
        self.resolver.store(resolver.map(Arc::new));
    }

    /// Replace the proxy-server resolver
    pub fn set_proxy_server_resolver(&self, resolver: Option<Resolver>) {
        self.proxy_server_resolver.store(resolver.map(Arc::new));
    }

    /// Replace the enhancer, carrying state over from the previous one
    pub fn set_enhancer(&self, enhancer: Option<ResolverEnhancer>) {
        let enhancer = enhancer.map(Arc::new);
        if let (Some(new), Some(old)) = (&enhancer, self.enhancer.load_full()) {
            new.patch_from(&old);
        }
        if let Some(old) = self.enhancer.swap(enhancer) {
            old.store_fake_pool_state();
        }
    }

    /// Install every component built from one configuration
    pub fn install(&self, components: super::Components) {
        self.set_resolver(Some(components.resolver));
        self.set_proxy_server_resolver(components.proxy_server_resolver);
        self.set_enhancer(Some(components.enhancer));
        info!("dns components installed");
    }

    // ========================================================================
    // Resolution helpers
    // ========================================================================

    fn current(&self) -> DnsResult<Arc<Resolver>> {
        self.resolver()
            .ok_or_else(|| DnsError::no_upstream("no resolver installed"))
    }

    /// Answer a client query
    ///
    /// In `fake-ip` mode A queries outside the fake-ip filter get a pool
    /// address. Everything else goes to the resolver; in the mapping modes
    /// the returned addresses are recorded against the queried name.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::NoUpstream` without a resolver, else the exchange
    /// error.
    pub async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        let enhancer = self.enhancer();
        if let Some(answer) = enhancer.as_ref().and_then(|e| e.fake_ip_answer(query)) {
            return Ok(answer);
        }

        let response = self.current()?.exchange(query).await?;
        if let Some(enhancer) = enhancer.filter(|e| e.mapping_enabled()) {
            if let Some(host) = msg_to_domain(query) {
                for ip in msg_to_ip(&response) {
                    enhancer.insert_host_by_ip(ip, &host);
                }
            }
        }
        Ok(response)
    }

    /// Resolve `host` for a proxy server connection
    ///
    /// Uses the proxy-server resolver when one is installed.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::NoUpstream` without a resolver, else the lookup
    /// error.
    pub async fn resolve_proxy_server_host(&self, host: &str) -> DnsResult<IpAddr> {
        let resolver = match self.proxy_server_resolver() {
            Some(resolver) => resolver,
            None => self.current()?,
        };
        resolver.resolve_ip(host).await
    }

    /// Resolve `host` to one address of either family
    ///
    /// # Errors
    ///
    /// Returns `DnsError::NoUpstream` without a resolver, else the lookup
    /// error.
    pub async fn resolve_ip(&self, host: &str) -> DnsResult<IpAddr> {
        self.current()?.resolve_ip(host).await
    }

    /// Resolve `host` to one IPv4 address
    ///
    /// # Errors
    ///
    /// Returns `DnsError::NoUpstream` without a resolver, else the lookup
    /// error.
    pub async fn resolve_ipv4(&self, host: &str) -> DnsResult<IpAddr> {
        self.current()?.resolve_ipv4(host).await
    }

    /// Resolve `host` to one IPv6 address
    ///
    /// # Errors
    ///
    /// Returns `DnsError::NoUpstream` without a resolver, else the lookup
    /// error.
    pub async fn resolve_ipv6(&self, host: &str) -> DnsResult<IpAddr> {
        self.current()?.resolve_ipv6(host).await
    }

    /// Every address of `host`
    ///
    /// # Errors
    ///
    /// Returns `DnsError::NoUpstream` without a resolver, else the lookup
    /// error.
    pub async fn lookup_ip(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        self.current()?.lookup_ip(host).await
    }

    /// Host behind `ip` according to the enhancer
    #[must_use]
    pub fn find_host_by_ip(&self, ip: IpAddr) -> Option<String> {
        self.enhancer()?.find_host_by_ip(ip)
    }

    /// Whether `ip` is a fake address
    #[must_use]
    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        self.enhancer().is_some_and(|e| e.is_fake_ip(ip))
    }
}

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

/// Install the process-wide registry
///
/// Only the first call wins; later calls return the registry passed in back
/// as the error.
///
/// # Errors
///
/// Returns `Err(registry)` if a global registry was already installed.
pub fn install_global(registry: Arc<Registry>) -> Result<(), Arc<Registry>> {
    GLOBAL.set(registry)
}

/// The process-wide registry, if installed
#[must_use]
pub fn global() -> Option<&'static Arc<Registry>> {
    GLOBAL.get()
}

fn global_or_err() -> DnsResult<&'static Arc<Registry>> {
    global().ok_or_else(|| DnsError::no_upstream("no global dns registry installed"))
}

/// [`Registry::resolve_ip`] on the global registry
///
/// # Errors
///
/// Returns `DnsError::NoUpstream` without a global registry, else the
/// lookup error.
pub async fn resolve_ip(host: &str) -> DnsResult<IpAddr> {
    global_or_err()?.resolve_ip(host).await
}

/// [`Registry::resolve_ipv4`] on the global registry
///
/// # Errors
///
/// Same as [`resolve_ip`].
pub async fn resolve_ipv4(host: &str) -> DnsResult<IpAddr> {
    global_or_err()?.resolve_ipv4(host).await
}

/// [`Registry::resolve_ipv6`] on the global registry
///
/// # Errors
///
/// Same as [`resolve_ip`].
pub async fn resolve_ipv6(host: &str) -> DnsResult<IpAddr> {
    global_or_err()?.resolve_ipv6(host).await
}

/// [`Registry::resolve_proxy_server_host`] on the global registry
///
/// # Errors
///
/// Same as [`resolve_ip`].
pub async fn resolve_proxy_server_host(host: &str) -> DnsResult<IpAddr> {
    global_or_err()?.resolve_proxy_server_host(host).await
}

/// [`Registry::find_host_by_ip`] on the global registry
#[must_use]
pub fn find_host_by_ip(ip: IpAddr) -> Option<String> {
    global()?.find_host_by_ip(ip)
}
