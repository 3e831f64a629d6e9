//! Resolver orchestrator
//!
//! # Query path
//!
//! ```text
//! exchange(query)
//!     │
//!     ├── hosts entry ─────────────────────────▶ synthesized answer
//!     │
//!     ├── cache hit, fresh ────────────────────▶ copy, TTLs shifted
//!     ├── cache hit, expired ──────────────────▶ copy, TTL 1 + background refresh
//!     │
//!     ▼ miss
//! single-flight by question (own task, own timeout)
//!     │
//!     ├── address query ──▶ ip_exchange: policy │ fallback-only domain │ main, fallback on suspect answer
//!     ├── policy match ───▶ policy clients
//!     └── otherwise ──────▶ main clients
//!     │
//!     ▼
//! cache write (address queries, TTL > 0, capped)
//! ```
//!
//! A caller that gives up does not cancel the shared fetch; failed fetches
//! are retried in the background a bounded number of times so the cache is
//! warm for the next caller.

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::Message;
use hickory_proto::rr::RecordType;
use rand::seq::SliceRandom;
use tokio::time::timeout;
use tracing::{debug, trace};

use super::client::{batch_exchange, DnsClient};
use super::error::{DnsError, DnsResult};
use super::fallback::{DomainFilter, IpFilter};
use super::hosts::{HostValue, Hosts, HOSTS_TTL};
use super::message::{
    cache_ttl, is_ip_request, msg_to_domain, msg_to_ip, new_query, question_key, reply_with_ips,
    set_msg_ttl, strip_opt, update_msg_ttl,
};
use super::policy::{ClientGroup, Policy};
use super::singleflight::SingleFlight;
use super::DEFAULT_DNS_TIMEOUT;
use crate::cache::{now_unix, CacheAlgorithm, DnsMessageCache, DEFAULT_CACHE_SIZE};

/// Upstream fetches per question before a failure is final, counting the
/// first one and the background re-fetches after it
pub const MAX_FETCH_ATTEMPTS: usize = 3;

/// Default wait for AAAA once A has answered
pub const DEFAULT_IPV6_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
struct FetchFailure {
    error: DnsError,
    attempt: usize,
}

type FetchOutcome = Result<Message, FetchFailure>;

/// Everything a [`Resolver`] is built from
#[derive(Debug)]
pub struct ResolverOptions {
    /// Answer AAAA in `lookup_ip` and allow `lookup_ipv6`
    pub ipv6: bool,
    /// Wait for AAAA after A in `lookup_ip`
    pub ipv6_timeout: Duration,
    /// Main group
    pub main: Vec<DnsClient>,
    /// Fallback group
    pub fallback: Vec<DnsClient>,
    /// Group behind [`Resolver::proxy_server_host_resolver`]
    pub proxy_server: Vec<DnsClient>,
    /// Ordered nameserver policies
    pub policies: Vec<Policy>,
    /// Answers with an address matching any of these go to fallback
    pub fallback_ip_filters: Vec<IpFilter>,
    /// Domains matching any of these skip the main group
    pub fallback_domain_filters: Vec<DomainFilter>,
    /// Static host entries
    pub hosts: Option<Arc<Hosts>>,
    /// Cache replacement policy
    pub cache_algorithm: CacheAlgorithm,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            ipv6: false,
            ipv6_timeout: DEFAULT_IPV6_TIMEOUT,
            main: Vec::new(),
            fallback: Vec::new(),
            proxy_server: Vec::new(),
            policies: Vec::new(),
            fallback_ip_filters: Vec::new(),
            fallback_domain_filters: Vec::new(),
            hosts: None,
            cache_algorithm: CacheAlgorithm::Lru,
        }
    }
}

struct Inner {
    ipv6: bool,
    ipv6_timeout: Duration,
    hosts: Option<Arc<Hosts>>,
    main: ClientGroup,
    fallback: Option<ClientGroup>,
    proxy_server: Option<ClientGroup>,
    policies: Arc<Vec<Policy>>,
    fallback_ip_filters: Arc<Vec<IpFilter>>,
    fallback_domain_filters: Arc<Vec<DomainFilter>>,
    cache: Arc<DnsMessageCache>,
    group: SingleFlight<FetchOutcome>,
}

/// Policy-driven, caching, request-coalescing DNS resolver
///
/// Cheap to clone; clones share the cache and the single-flight group.
///
/// # Example
///
/// ```no_run
/// use rust_resolver::dns::client::{transform, ClientContext};
/// use rust_resolver::dns::{parse_nameservers, Resolver, ResolverOptions};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let servers = parse_nameservers(&["223.5.5.5".into()], false, false)?;
/// let resolver = Resolver::new(ResolverOptions {
///     main: transform(&servers, &ClientContext::default()),
///     ..Default::default()
/// });
///
/// let ips = resolver.lookup_ip("example.com").await?;
/// println!("{ips:?}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Resolver {
    inner: Arc<Inner>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("ipv6", &self.inner.ipv6)
            .field("main", &self.inner.main.len())
            .field("fallback", &self.inner.fallback.as_ref().map(|g| g.len()))
            .field("policies", &self.inner.policies.len())
            .field("cached", &self.inner.cache.len())
            .finish_non_exhaustive()
    }
}

fn non_empty(clients: Vec<DnsClient>) -> Option<ClientGroup> {
    (!clients.is_empty()).then(|| Arc::new(clients))
}

impl Resolver {
    /// Build a resolver with a fresh cache
    #[must_use]
    pub fn new(options: ResolverOptions) -> Self {
        let cache = Arc::new(DnsMessageCache::new(options.cache_algorithm, DEFAULT_CACHE_SIZE));
        Self {
            inner: Arc::new(Inner {
                ipv6: options.ipv6,
                ipv6_timeout: options.ipv6_timeout,
                hosts: options.hosts,
                main: Arc::new(options.main),
                fallback: non_empty(options.fallback),
                proxy_server: non_empty(options.proxy_server),
                policies: Arc::new(options.policies),
                fallback_ip_filters: Arc::new(options.fallback_ip_filters),
                fallback_domain_filters: Arc::new(options.fallback_domain_filters),
                cache,
                group: SingleFlight::new(),
            }),
        }
    }

    /// Whether IPv6 answers are enabled
    #[must_use]
    pub fn ipv6(&self) -> bool {
        self.inner.ipv6
    }

    /// Whether the resolver has a main group to query
    #[must_use]
    pub fn invalid(&self) -> bool {
        !self.inner.main.is_empty()
    }

    /// A resolver over the proxy-server group sharing this cache and hosts
    ///
    /// Returns `None` when no proxy-server nameserver is configured.
    #[must_use]
    pub fn proxy_server_host_resolver(&self) -> Option<Self> {
        let proxy_server = self.inner.proxy_server.clone()?;
        Some(Self {
            inner: Arc::new(Inner {
                ipv6: self.inner.ipv6,
                ipv6_timeout: self.inner.ipv6_timeout,
                hosts: self.inner.hosts.clone(),
                main: proxy_server,
                fallback: None,
                proxy_server: None,
                policies: Arc::new(Vec::new()),
                fallback_ip_filters: Arc::new(Vec::new()),
                fallback_domain_filters: Arc::new(Vec::new()),
                cache: Arc::clone(&self.inner.cache),
                group: SingleFlight::new(),
            }),
        })
    }

    /// Drop every cached answer
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        debug!("dns cache cleared");
    }

    /// Number of cached answers
    #[must_use]
    pub fn cache_len(&self) -> usize {
        self.inner.cache.len()
    }

    /// Copy cached answers into `other`, for configuration reloads
    pub fn clone_cache_to(&self, other: &Resolver) {
        self.inner.cache.clone_to(&other.inner.cache);
    }

    /// Close pooled DoH and DoQ connections of every group
    pub async fn reset_connection(&self) {
        let mut groups: Vec<ClientGroup> = vec![Arc::clone(&self.inner.main)];
        groups.extend(self.inner.fallback.iter().cloned());
        groups.extend(self.inner.proxy_server.iter().cloned());
        for policy in self.inner.policies.iter() {
            match policy {
                Policy::Trie(trie) => trie.foreach(|_, group| {
                    groups.push(Arc::clone(group));
                    true
                }),
                Policy::DomainSet { clients, .. } | Policy::GeoSite { clients, .. } => {
                    groups.push(Arc::clone(clients));
                }
            }
        }

        let mut seen: Vec<ClientGroup> = Vec::new();
        for group in groups {
            if seen.iter().any(|known| Arc::ptr_eq(known, &group)) {
                continue;
            }
            seen.push(Arc::clone(&group));
            for client in group.iter() {
                client.reset_connection().await;
            }
        }
    }

    // ========================================================================
    // Exchange
    // ========================================================================

    /// Resolve `query` through hosts, cache and upstreams
    ///
    /// # Errors
    ///
    /// - `DnsError::InvalidQuery` if the query has no question
    /// - `DnsError::TimeoutError` if nothing answered within the default timeout
    /// - the upstream error otherwise
    pub async fn exchange(&self, query: &Message) -> DnsResult<Message> {
        self.exchange_with_timeout(query, DEFAULT_DNS_TIMEOUT).await
    }

    /// [`exchange`](Self::exchange) with a caller deadline
    ///
    /// The shared fetch outlives the deadline and still fills the cache.
    ///
    /// # Errors
    ///
    /// Same as [`exchange`](Self::exchange).
    pub async fn exchange_with_timeout(&self, query: &Message, deadline: Duration) -> DnsResult<Message> {
        if query.queries().is_empty() {
            return Err(DnsError::invalid_query("should have one question at least"));
        }

        if let Some(reply) = self.answer_from_hosts(query).await {
            return reply;
        }

        let result = self.exchange_cached(query, deadline).await;
        if let Err(e) = &result {
            if e.is_cancelled() || e.is_timeout() {
                self.spawn_refresh(query.clone());
            }
        }
        result
    }

    async fn exchange_cached(&self, query: &Message, deadline: Duration) -> DnsResult<Message> {
        let key = question_key(query)
            .ok_or_else(|| DnsError::invalid_query("should have one question at least"))?;

        if let Some((cached, expires)) = self.inner.cache.get_with_expire(&key) {
            let mut msg = cached;
            msg.set_id(query.id());
            let now = now_unix();
            if expires <= now {
                trace!(question = %key, "stale cache hit, refreshing");
                set_msg_ttl(&mut msg, 1);
                self.spawn_refresh(query.clone());
            } else {
                let remaining = u32::try_from(expires - now).unwrap_or(u32::MAX);
                trace!(question = %key, remaining, "cache hit");
                update_msg_ttl(&mut msg, remaining);
            }
            return Ok(msg);
        }

        self.exchange_without_cache_timeout(query, deadline).await
    }

    /// Resolve `query` upstream, bypassing the cache lookup
    ///
    /// Concurrent identical questions share one fetch.
    ///
    /// # Errors
    ///
    /// Same as [`exchange`](Self::exchange).
    pub async fn exchange_without_cache(&self, query: &Message) -> DnsResult<Message> {
        self.exchange_without_cache_timeout(query, DEFAULT_DNS_TIMEOUT).await
    }

    async fn exchange_without_cache_timeout(&self, query: &Message, deadline: Duration) -> DnsResult<Message> {
        let this = self.clone();
        let owned = query.clone();
        let handle = tokio::spawn(async move { this.fetch_shared(owned).await });

        match timeout(deadline, handle).await {
            Ok(Ok(result)) => result.map(|mut msg| {
                msg.set_id(query.id());
                msg
            }),
            Ok(Err(e)) if e.is_cancelled() => Err(DnsError::cancelled("dns exchange")),
            Ok(Err(e)) => Err(DnsError::internal(format!("dns exchange task failed: {e}"))),
            // the detached task keeps running and retries on failure
            Err(_) => Err(DnsError::timeout("dns exchange", deadline)),
        }
    }

    fn spawn_refresh(&self, query: Message) {
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.exchange_without_cache_timeout(&query, DEFAULT_DNS_TIMEOUT).await {
                debug!(error = %e, "background dns refresh failed");
            }
        });
    }

    async fn fetch_shared(self, query: Message) -> DnsResult<Message> {
        let key = question_key(&query)
            .ok_or_else(|| DnsError::invalid_query("should have one question at least"))?;
        let attempts = Arc::new(AtomicUsize::new(0));

        let (outcome, shared) = self
            .inner
            .group
            .work(&key, || self.clone().fetch(query.clone(), key.clone(), Arc::clone(&attempts)))
            .await
            .ok_or_else(|| DnsError::internal(format!("dns fetch for {key} panicked")))?;

        match outcome {
            Ok(msg) => Ok(msg),
            Err(failure) => {
                if !shared && failure.attempt + 1 < MAX_FETCH_ATTEMPTS {
                    self.spawn_retry(query, key, attempts);
                }
                Err(failure.error)
            }
        }
    }

    fn spawn_retry(&self, query: Message, key: String, attempts: Arc<AtomicUsize>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let outcome = this
                    .inner
                    .group
                    .work(&key, || this.clone().fetch(query.clone(), key.clone(), Arc::clone(&attempts)))
                    .await;
                match outcome {
                    Some((Err(failure), false)) if failure.attempt + 1 < MAX_FETCH_ATTEMPTS => {
                        debug!(question = %key, attempt = failure.attempt, "retrying failed dns fetch");
                    }
                    _ => break,
                }
            }
        });
    }

    /// One upstream round for `query`, writing the cache on success
    async fn fetch(self, mut query: Message, key: String, attempts: Arc<AtomicUsize>) -> FetchOutcome {
        // upstreams see a fresh id per fetch
        query.set_id(rand::random());

        let result = match timeout(DEFAULT_DNS_TIMEOUT, self.route_exchange(&query)).await {
            Ok(result) => result,
            Err(_) => Err(DnsError::timeout(format!("resolve {key}"), DEFAULT_DNS_TIMEOUT)),
        };

        match result {
            Ok((mut msg, cacheable)) => {
                if cacheable {
                    strip_opt(&mut msg);
                    self.put_cache(&key, &msg);
                }
                Ok(msg)
            }
            Err(error) => {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                debug!(question = %key, attempt, error = %error, "dns fetch failed");
                Err(FetchFailure { error, attempt })
            }
        }
    }

    fn put_cache(&self, key: &str, msg: &Message) {
        let ttl = cache_ttl(msg);
        if ttl == 0 {
            return;
        }
        self.inner
            .cache
            .set_with_expire(key.to_owned(), msg.clone(), now_unix() + u64::from(ttl));
    }

    /// Pick the group for `query` and race it
    ///
    /// Returns the answer and whether it may be cached.
    async fn route_exchange(&self, query: &Message) -> DnsResult<(Message, bool)> {
        if is_ip_request(query) {
            return self.ip_exchange(query).await;
        }

        let clients = self.match_policy(query).unwrap_or_else(|| Arc::clone(&self.inner.main));
        let (msg, _) = batch_exchange(&clients, query).await?;
        Ok((msg, false))
    }

    /// The group of the first policy matching the queried domain
    #[must_use]
    pub fn match_policy(&self, query: &Message) -> Option<ClientGroup> {
        if self.inner.policies.is_empty() {
            return None;
        }
        let domain = msg_to_domain(query)?;
        self.inner
            .policies
            .iter()
            .find_map(|policy| policy.matches(&domain))
            .cloned()
    }

    fn should_only_query_fallback(&self, query: &Message) -> bool {
        if self.inner.fallback.is_none() || self.inner.fallback_domain_filters.is_empty() {
            return false;
        }
        msg_to_domain(query).is_some_and(|domain| {
            self.inner
                .fallback_domain_filters
                .iter()
                .any(|filter| filter.matches(&domain))
        })
    }

    fn should_ip_fallback(&self, ip: IpAddr) -> bool {
        self.inner.fallback_ip_filters.iter().any(|filter| filter.matches(ip))
    }

    /// Address query routing: policy, fallback-only domain, or main with a
    /// fallback on suspect answers
    ///
    /// # Errors
    ///
    /// Returns the batch error of the last group queried.
    pub async fn ip_exchange(&self, query: &Message) -> DnsResult<(Message, bool)> {
        if let Some(clients) = self.match_policy(query) {
            return batch_exchange(&clients, query).await;
        }

        let Some(fallback) = self.inner.fallback.as_ref() else {
            return batch_exchange(&self.inner.main, query).await;
        };

        if self.should_only_query_fallback(query) {
            return batch_exchange(fallback, query).await;
        }

        match batch_exchange(&self.inner.main, query).await {
            Ok((msg, cacheable)) => {
                let ips = msg_to_ip(&msg);
                if !ips.is_empty() && ips.iter().all(|ip| !self.should_ip_fallback(*ip)) {
                    return Ok((msg, cacheable));
                }
                debug!(answers = ips.len(), "main answer rejected, querying fallback");
            }
            Err(e) => debug!(error = %e, "main group failed, querying fallback"),
        }
        batch_exchange(fallback, query).await
    }

    /// Synthesized answer for A/AAAA questions covered by a hosts entry
    async fn answer_from_hosts(&self, query: &Message) -> Option<DnsResult<Message>> {
        let hosts = self.inner.hosts.as_ref()?;
        let q = query.queries().first()?;
        let v6 = match q.query_type() {
            RecordType::A => false,
            RecordType::AAAA => true,
            _ => return None,
        };
        let domain = msg_to_domain(query)?;

        match hosts.lookup(&domain)? {
            value @ HostValue::Ips(_) => {
                let ips = value.ips_of_family(v6);
                if ips.is_empty() {
                    return None;
                }
                trace!(domain = %domain, "answered from hosts");
                Some(Ok(reply_with_ips(query, &ips, HOSTS_TTL)))
            }
            HostValue::Alias(alias) => {
                let alias_query = match new_query(&alias, q.query_type()) {
                    Ok(msg) => msg,
                    Err(e) => return Some(Err(e)),
                };
                let result = self
                    .exchange_cached(&alias_query, DEFAULT_DNS_TIMEOUT)
                    .await
                    .map(|msg| reply_with_ips(query, &msg_to_ip(&msg), HOSTS_TTL));
                Some(result)
            }
        }
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    async fn lookup_by_type(&self, host: &str, record_type: RecordType) -> DnsResult<Vec<IpAddr>> {
        let v6 = record_type == RecordType::AAAA;
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return if ip.is_ipv6() == v6 || ip.to_canonical().is_ipv6() == v6 {
                Ok(vec![ip])
            } else {
                Err(DnsError::ip_version_mismatch(host))
            };
        }

        let mut name = host.trim_end_matches('.').to_ascii_lowercase();
        if let Some(hosts) = &self.inner.hosts {
            match hosts.lookup(&name) {
                Some(value @ HostValue::Ips(_)) => {
                    let ips = value.ips_of_family(v6);
                    if !ips.is_empty() {
                        return Ok(ips);
                    }
                }
                Some(HostValue::Alias(alias)) => name = alias,
                None => {}
            }
        }

        let query = new_query(&name, record_type)?;
        let msg = self.exchange(&query).await?;
        let ips: Vec<IpAddr> = msg_to_ip(&msg)
            .into_iter()
            .filter(|ip| ip.is_ipv6() == v6)
            .collect();
        if ips.is_empty() {
            return Err(DnsError::ip_not_found(host));
        }
        Ok(ips)
    }

    /// A and AAAA addresses of `host`
    ///
    /// A and AAAA are queried together. After A answers, AAAA gets at most
    /// the configured IPv6 timeout more. Without IPv6 only A is queried.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::IpNotFound` when neither family produced an
    /// address.
    pub async fn lookup_ip(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if !self.inner.ipv6 {
            return self.lookup_by_type(host, RecordType::A).await;
        }

        let a = self.lookup_by_type(host, RecordType::A);
        let aaaa = self.lookup_by_type(host, RecordType::AAAA);
        tokio::pin!(a, aaaa);

        let mut aaaa_result = None;
        let a_result = loop {
            tokio::select! {
                result = &mut a => break result,
                result = &mut aaaa, if aaaa_result.is_none() => aaaa_result = Some(result),
            }
        };
        let aaaa_result = match aaaa_result {
            Some(result) => result,
            None => timeout(self.inner.ipv6_timeout, &mut aaaa)
                .await
                .unwrap_or_else(|_| Err(DnsError::timeout(format!("AAAA for {host}"), self.inner.ipv6_timeout))),
        };

        let mut ips = a_result.unwrap_or_default();
        ips.extend(aaaa_result.unwrap_or_default());
        if ips.is_empty() {
            return Err(DnsError::ip_not_found(host));
        }
        Ok(ips)
    }

    /// A addresses of `host`, AAAA only if A failed
    ///
    /// # Errors
    ///
    /// Returns `DnsError::IpNotFound` when both failed.
    pub async fn lookup_ip_primary_ipv4(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        if !self.inner.ipv6 {
            return self.lookup_by_type(host, RecordType::A).await;
        }

        let a = self.lookup_by_type(host, RecordType::A);
        let aaaa = self.lookup_by_type(host, RecordType::AAAA);
        tokio::pin!(a, aaaa);

        let mut aaaa_result = None;
        let a_result = loop {
            tokio::select! {
                result = &mut a => break result,
                result = &mut aaaa, if aaaa_result.is_none() => aaaa_result = Some(result),
            }
        };
        if let Ok(ips) = a_result {
            return Ok(ips);
        }

        let aaaa_result = match aaaa_result {
            Some(result) => result,
            None => aaaa.await,
        };
        aaaa_result.map_err(|_| DnsError::ip_not_found(host))
    }

    /// A addresses of `host`
    ///
    /// # Errors
    ///
    /// `DnsError::IpVersionMismatch` for an IPv6 literal, else the lookup
    /// error.
    pub async fn lookup_ipv4(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        self.lookup_by_type(host, RecordType::A).await
    }

    /// AAAA addresses of `host`
    ///
    /// # Errors
    ///
    /// `DnsError::Ipv6Disabled` when IPv6 is off, `IpVersionMismatch` for an
    /// IPv4 literal, else the lookup error.
    pub async fn lookup_ipv6(&self, host: &str) -> DnsResult<Vec<IpAddr>> {
        if !self.inner.ipv6 {
            return Err(DnsError::Ipv6Disabled);
        }
        self.lookup_by_type(host, RecordType::AAAA).await
    }

    /// One random address from [`lookup_ip`](Self::lookup_ip)
    ///
    /// # Errors
    ///
    /// Same as [`lookup_ip`](Self::lookup_ip).
    pub async fn resolve_ip(&self, host: &str) -> DnsResult<IpAddr> {
        pick(host, self.lookup_ip(host).await?)
    }

    /// One random address from [`lookup_ip_primary_ipv4`](Self::lookup_ip_primary_ipv4)
    ///
    /// # Errors
    ///
    /// Same as [`lookup_ip_primary_ipv4`](Self::lookup_ip_primary_ipv4).
    pub async fn resolve_ip_primary_ipv4(&self, host: &str) -> DnsResult<IpAddr> {
        pick(host, self.lookup_ip_primary_ipv4(host).await?)
    }

    /// One random address from [`lookup_ipv4`](Self::lookup_ipv4)
    ///
    /// # Errors
    ///
    /// Same as [`lookup_ipv4`](Self::lookup_ipv4).
    pub async fn resolve_ipv4(&self, host: &str) -> DnsResult<IpAddr> {
        pick(host, self.lookup_ipv4(host).await?)
    }

    /// One random address from [`lookup_ipv6`](Self::lookup_ipv6)
    ///
    /// # Errors
    ///
    /// Same as [`lookup_ipv6`](Self::lookup_ipv6).
    pub async fn resolve_ipv6(&self, host: &str) -> DnsResult<IpAddr> {
        pick(host, self.lookup_ipv6(host).await?)
    }
}

fn pick(host: &str, ips: Vec<IpAddr>) -> DnsResult<IpAddr> {
    ips.choose(&mut rand::thread_rng())
        .copied()
        .ok_or_else(|| DnsError::ip_not_found(host))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
    use std::sync::atomic::AtomicUsize;

    use hickory_proto::op::ResponseCode;
    use tokio::net::UdpSocket;

    use super::*;
    use crate::dns::client::tests::{mock_udp_server, udp_client};
    use crate::dns::config::HostsValue;

    // ========================================================================
    // Helper Functions
    // ========================================================================

    fn resolver(main: Vec<DnsClient>) -> Resolver {
        Resolver::new(ResolverOptions {
            main,
            ..Default::default()
        })
    }

    async fn server(ip: [u8; 4]) -> (SocketAddr, Arc<AtomicUsize>) {
        mock_udp_server(IpAddr::V4(Ipv4Addr::from(ip)), Duration::ZERO, None).await
    }

    /// Answers A with `v4` and AAAA with `v6` after `aaaa_delay`
    async fn dual_stack_server(v4: Ipv4Addr, v6: Ipv6Addr, aaaa_delay: Duration) -> SocketAddr {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let query = Message::from_vec(&buf[..n]).unwrap();
                let socket = socket.clone();
                tokio::spawn(async move {
                    let qtype = query.queries()[0].query_type();
                    let reply = if qtype == RecordType::AAAA {
                        tokio::time::sleep(aaaa_delay).await;
                        reply_with_ips(&query, &[IpAddr::V6(v6)], 60)
                    } else {
                        reply_with_ips(&query, &[IpAddr::V4(v4)], 60)
                    };
                    let _ = socket.send_to(&reply.to_vec().unwrap(), peer).await;
                });
            }
        });
        addr
    }

    /// Answers every query with `rcode`, no answers and an SOA in authority
    async fn negative_server(rcode: ResponseCode) -> (SocketAddr, Arc<AtomicUsize>) {
        use hickory_proto::rr::rdata::SOA;
        use hickory_proto::rr::{Name, RData, Record};

        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let addr = socket.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                counter.fetch_add(1, Ordering::SeqCst);
                let query = Message::from_vec(&buf[..n]).unwrap();
                let mut reply = crate::dns::message::reply_with_rcode(&query, rcode);
                let zone = Name::from_ascii("example.").unwrap();
                let soa = SOA::new(
                    Name::from_ascii("ns.example.").unwrap(),
                    Name::from_ascii("admin.example.").unwrap(),
                    1,
                    3600,
                    600,
                    86400,
                    300,
                );
                reply.add_name_server(Record::from_rdata(zone, 300, RData::SOA(soa)));
                let _ = socket.send_to(&reply.to_vec().unwrap(), peer).await;
            }
        });
        (addr, hits)
    }

    // ========================================================================
    // Exchange and cache
    // ========================================================================

    #[tokio::test]
    async fn test_empty_question_rejected() {
        let r = resolver(Vec::new());
        let err = r.exchange(&Message::new()).await.unwrap_err();
        assert!(matches!(err, DnsError::InvalidQuery { .. }));
    }

    #[tokio::test]
    async fn test_answer_is_cached() {
        let (addr, hits) = server([1, 2, 3, 4]).await;
        let r = resolver(vec![udp_client(addr)]);

        let query = new_query("cached.example", RecordType::A).unwrap();
        let first = r.exchange(&query).await.unwrap();
        assert_eq!(first.id(), query.id());
        let second = r.exchange(&query).await.unwrap();
        assert_eq!(msg_to_ip(&second), msg_to_ip(&first));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(r.cache_len(), 1);

        r.clear_cache();
        assert_eq!(r.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_non_address_query_not_cached() {
        let (addr, hits) = server([1, 2, 3, 4]).await;
        let r = resolver(vec![udp_client(addr)]);

        let query = new_query("example.com", RecordType::TXT).unwrap();
        r.exchange(&query).await.unwrap();
        r.exchange(&query).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(r.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_stale_hit_returns_ttl_one_and_refreshes() {
        let (addr, hits) = server([5, 5, 5, 5]).await;
        let r = resolver(vec![udp_client(addr)]);

        let query = new_query("stale.example", RecordType::A).unwrap();
        let key = question_key(&query).unwrap();
        let stale = reply_with_ips(&query, &[IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))], 60);
        r.inner.cache.set_with_expire(key.clone(), stale, now_unix() - 10);

        let msg = r.exchange(&query).await.unwrap();
        assert_eq!(msg.answers()[0].ttl(), 1);
        assert_eq!(msg_to_ip(&msg), vec![IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9))]);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        let (fresh, expires) = r.inner.cache.get_with_expire(&key).unwrap();
        assert!(expires > now_unix());
        assert_eq!(msg_to_ip(&fresh), vec![IpAddr::V4(Ipv4Addr::new(5, 5, 5, 5))]);
    }

    #[tokio::test]
    async fn test_concurrent_queries_share_one_upstream_call() {
        let (addr, hits) =
            mock_udp_server(IpAddr::V4(Ipv4Addr::new(7, 7, 7, 7)), Duration::from_millis(100), None).await;
        let r = resolver(vec![udp_client(addr)]);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let r = r.clone();
            handles.push(tokio::spawn(async move {
                let query = new_query("shared.example", RecordType::A).unwrap();
                r.exchange_without_cache(&query).await
            }));
        }
        for handle in handles {
            let msg = handle.await.unwrap().unwrap();
            assert_eq!(msg_to_ip(&msg), vec![IpAddr::V4(Ipv4Addr::new(7, 7, 7, 7))]);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_caller_deadline_does_not_cancel_fetch() {
        let (addr, hits) =
            mock_udp_server(IpAddr::V4(Ipv4Addr::new(8, 8, 4, 4)), Duration::from_millis(150), None).await;
        let r = resolver(vec![udp_client(addr)]);

        let query = new_query("slow.example", RecordType::A).unwrap();
        let err = r
            .exchange_with_timeout(&query, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(hits.load(Ordering::SeqCst) >= 1);
        assert_eq!(r.cache_len(), 1);
    }

    #[tokio::test]
    async fn test_failed_fetch_bounded_attempts() {
        let (addr, hits) =
            mock_udp_server(IpAddr::V4(Ipv4Addr::LOCALHOST), Duration::ZERO, Some(ResponseCode::ServFail)).await;
        let r = resolver(vec![udp_client(addr)]);

        let query = new_query("broken.example", RecordType::A).unwrap();
        assert!(r.exchange(&query).await.is_err());

        // background re-fetches stop once the attempts are used up
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(hits.load(Ordering::SeqCst), MAX_FETCH_ATTEMPTS);
        assert_eq!(r.cache_len(), 0);
    }

    #[tokio::test]
    async fn test_negative_answers_not_cached() {
        for rcode in [ResponseCode::NXDomain, ResponseCode::NoError] {
            let (addr, hits) = negative_server(rcode).await;
            let r = resolver(vec![udp_client(addr)]);
            let query = new_query("missing.example", RecordType::A).unwrap();

            for _ in 0..2 {
                let msg = r.exchange(&query).await.unwrap();
                assert_eq!(msg.response_code(), rcode);
                assert!(msg.answers().is_empty());
            }
            assert_eq!(hits.load(Ordering::SeqCst), 2, "{rcode:?} answer was cached");
            assert_eq!(r.cache_len(), 0);
        }
    }

    #[tokio::test]
    async fn test_rcode_answer_not_cached() {
        let rcode = crate::dns::client::transform(
            &[crate::dns::NameServer::new(crate::dns::NameServerNet::Rcode, "name_error")],
            &crate::dns::client::ClientContext::default(),
        );
        let r = resolver(rcode);
        let query = new_query("blocked.example", RecordType::A).unwrap();
        let msg = r.exchange(&query).await.unwrap();
        assert_eq!(msg.response_code(), ResponseCode::NXDomain);
        assert_eq!(r.cache_len(), 0);
    }

    // ========================================================================
    // Fallback and policy routing
    // ========================================================================

    #[tokio::test]
    async fn test_trusted_main_answer_skips_fallback() {
        let (main, _) = server([114, 114, 114, 114]).await;
        let (fallback, fallback_hits) = server([8, 8, 8, 8]).await;
        let r = Resolver::new(ResolverOptions {
            main: vec![udp_client(main)],
            fallback: vec![udp_client(fallback)],
            fallback_ip_filters: vec![IpFilter::Cidr(vec!["240.0.0.0/4".parse().unwrap()])],
            ..Default::default()
        });

        let query = new_query("local.example", RecordType::A).unwrap();
        let msg = r.exchange(&query).await.unwrap();
        assert_eq!(msg_to_ip(&msg), vec![IpAddr::V4(Ipv4Addr::new(114, 114, 114, 114))]);
        assert_eq!(fallback_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_suspect_main_answer_uses_fallback() {
        let (main, _) = server([240, 0, 0, 1]).await;
        let (fallback, fallback_hits) = server([8, 8, 8, 8]).await;
        let r = Resolver::new(ResolverOptions {
            main: vec![udp_client(main)],
            fallback: vec![udp_client(fallback)],
            fallback_ip_filters: vec![IpFilter::Cidr(vec!["240.0.0.0/4".parse().unwrap()])],
            ..Default::default()
        });

        let query = new_query("poisoned.example", RecordType::A).unwrap();
        let msg = r.exchange(&query).await.unwrap();
        assert_eq!(msg_to_ip(&msg), vec![IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))]);
        assert_eq!(fallback_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_domain_skips_main() {
        let (main, main_hits) = server([1, 1, 1, 1]).await;
        let (fallback, _) = server([2, 2, 2, 2]).await;
        let mut trie = crate::trie::DomainTrie::new();
        trie.insert("+.google.com", ()).unwrap();
        let r = Resolver::new(ResolverOptions {
            main: vec![udp_client(main)],
            fallback: vec![udp_client(fallback)],
            fallback_domain_filters: vec![DomainFilter::Trie(trie)],
            ..Default::default()
        });

        let query = new_query("www.google.com", RecordType::A).unwrap();
        let msg = r.exchange(&query).await.unwrap();
        assert_eq!(msg_to_ip(&msg), vec![IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2))]);
        assert_eq!(main_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_policy_overrides_main() {
        let (main, main_hits) = server([1, 1, 1, 1]).await;
        let (corp, _) = server([10, 0, 0, 53]).await;
        let mut trie = crate::trie::DomainTrie::new();
        trie.insert("+.corp.example", Arc::new(vec![udp_client(corp)])).unwrap();
        let r = Resolver::new(ResolverOptions {
            main: vec![udp_client(main)],
            policies: vec![Policy::Trie(trie)],
            ..Default::default()
        });

        let ips = r.lookup_ipv4("git.corp.example").await.unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 53))]);
        assert_eq!(main_hits.load(Ordering::SeqCst), 0);
        assert!(r.match_policy(&new_query("other.example", RecordType::A).unwrap()).is_none());
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    #[tokio::test]
    async fn test_literal_hosts() {
        let r = resolver(Vec::new());
        assert_eq!(r.lookup_ip("10.0.0.1").await.unwrap(), vec![IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))]);
        assert_eq!(r.resolve_ipv4("10.0.0.1").await.unwrap(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(matches!(
            r.lookup_ipv4("::1").await.unwrap_err(),
            DnsError::IpVersionMismatch { .. }
        ));
        assert!(matches!(r.lookup_ipv6("::1").await.unwrap_err(), DnsError::Ipv6Disabled));
    }

    #[tokio::test]
    async fn test_lookup_ip_waits_briefly_for_aaaa() {
        let v4 = Ipv4Addr::new(93, 184, 216, 34);
        let v6: Ipv6Addr = "2606:2800:220:1::1".parse().unwrap();

        let fast = dual_stack_server(v4, v6, Duration::ZERO).await;
        let r = Resolver::new(ResolverOptions {
            ipv6: true,
            main: vec![udp_client(fast)],
            ..Default::default()
        });
        let mut ips = r.lookup_ip("dual.example").await.unwrap();
        ips.sort();
        assert_eq!(ips, vec![IpAddr::V4(v4), IpAddr::V6(v6)]);

        let slow = dual_stack_server(v4, v6, Duration::from_millis(500)).await;
        let r = Resolver::new(ResolverOptions {
            ipv6: true,
            ipv6_timeout: Duration::from_millis(50),
            main: vec![udp_client(slow)],
            ..Default::default()
        });
        assert_eq!(r.lookup_ip("dual.example").await.unwrap(), vec![IpAddr::V4(v4)]);
    }

    #[tokio::test]
    async fn test_hosts_answer_before_upstream() {
        let (addr, hits) = server([1, 1, 1, 1]).await;
        let hosts = Hosts::from_config(&HashMap::from([
            ("router.lan".to_string(), HostsValue::One("192.168.1.1".into())),
            ("alias.lan".to_string(), HostsValue::One("upstream.example".into())),
        ]))
        .unwrap();
        let r = Resolver::new(ResolverOptions {
            main: vec![udp_client(addr)],
            hosts: Some(Arc::new(hosts)),
            ..Default::default()
        });

        let query = new_query("router.lan", RecordType::A).unwrap();
        let msg = r.exchange(&query).await.unwrap();
        assert_eq!(msg_to_ip(&msg), vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))]);
        assert_eq!(msg.answers()[0].ttl(), HOSTS_TTL);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let ips = r.lookup_ipv4("alias.lan").await.unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_proxy_server_resolver_shares_cache() {
        let (main, _) = server([1, 1, 1, 1]).await;
        let (proxy, proxy_hits) = server([6, 6, 6, 6]).await;
        let r = Resolver::new(ResolverOptions {
            main: vec![udp_client(main)],
            proxy_server: vec![udp_client(proxy)],
            ..Default::default()
        });
        assert!(r.invalid());

        let proxy_resolver = r.proxy_server_host_resolver().unwrap();
        let ips = proxy_resolver.lookup_ipv4("proxy.example").await.unwrap();
        assert_eq!(ips, vec![IpAddr::V4(Ipv4Addr::new(6, 6, 6, 6))]);
        assert_eq!(proxy_hits.load(Ordering::SeqCst), 1);
        assert_eq!(r.cache_len(), 1);

        assert!(resolver(Vec::new()).proxy_server_host_resolver().is_none());
        assert!(!resolver(Vec::new()).invalid());
    }
}
