//! Fake-IP and mapping enhancer
//!
//! In `fake-ip` mode clients get synthetic addresses from the pool; in
//! `mapping` mode they get real addresses and the dispatcher records which
//! host each address came from. Either way [`ResolverEnhancer::find_host_by_ip`]
//! turns a destination address back into a hostname.

use std::net::IpAddr;
use std::sync::Arc;

use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, RecordType};
use tracing::{debug, trace, warn};

use super::config::EnhancedMode;
use super::error::{DnsError, DnsResult};
use super::message::{msg_to_domain, reply_with_ips};
use crate::cache::{LruCache, LruOptions};
use crate::fakeip::Pool;

/// Size of the address → host mapping
pub const MAPPING_SIZE: usize = 4096;

/// TTL of fake-IP answers; clients re-ask instead of caching the binding
pub const FAKE_IP_TTL: u32 = 1;

/// Address → host translation for the active enhanced mode
pub struct ResolverEnhancer {
    mode: EnhancedMode,
    pool: Option<Arc<Pool>>,
    mapping: Option<LruCache<IpAddr, String>>,
}

impl std::fmt::Debug for ResolverEnhancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverEnhancer")
            .field("mode", &self.mode)
            .field("pool", &self.pool.as_ref().map(|p| p.ipnet()))
            .field("mapping", &self.mapping.as_ref().map(LruCache::len))
            .finish()
    }
}

impl ResolverEnhancer {
    /// Build an enhancer for `mode`
    ///
    /// The pool is only kept in `fake-ip` mode; any non-normal mode gets a
    /// stale-serving mapping cache.
    #[must_use]
    pub fn new(mode: EnhancedMode, pool: Option<Arc<Pool>>) -> Self {
        let pool = if mode == EnhancedMode::FakeIp { pool } else { None };
        let mapping = (mode != EnhancedMode::Normal).then(|| {
            LruCache::with_options(LruOptions::default().max_size(MAPPING_SIZE).stale(true))
        });
        Self {
            mode,
            pool,
            mapping,
        }
    }

    /// Configured mode
    #[must_use]
    pub fn mode(&self) -> EnhancedMode {
        self.mode
    }

    /// The fake-IP pool, in `fake-ip` mode
    #[must_use]
    pub fn pool(&self) -> Option<&Arc<Pool>> {
        self.pool.as_ref()
    }

    /// Whether answers are replaced with fake addresses
    #[must_use]
    pub fn fake_ip_enabled(&self) -> bool {
        self.mode == EnhancedMode::FakeIp
    }

    /// Whether an address → host mapping is kept
    #[must_use]
    pub fn mapping_enabled(&self) -> bool {
        matches!(self.mode, EnhancedMode::FakeIp | EnhancedMode::Mapping)
    }

    /// Whether `ip` is a fake address currently bound to a host
    #[must_use]
    pub fn is_exist_fake_ip(&self, ip: IpAddr) -> bool {
        self.fake_ip_enabled() && self.pool.as_ref().is_some_and(|pool| pool.exist(ip))
    }

    /// Whether `ip` lies in the fake range, excluding gateway and broadcast
    #[must_use]
    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        if !self.fake_ip_enabled() {
            return false;
        }
        self.pool.as_ref().is_some_and(|pool| {
            pool.ipnet().contains(&ip) && ip != pool.gateway() && ip != pool.broadcast()
        })
    }

    /// Whether `ip` is the fake range's broadcast address
    #[must_use]
    pub fn is_fake_broadcast_ip(&self, ip: IpAddr) -> bool {
        self.fake_ip_enabled() && self.pool.as_ref().is_some_and(|pool| ip == pool.broadcast())
    }

    /// Host behind `ip`: the pool first, then the mapping
    #[must_use]
    pub fn find_host_by_ip(&self, ip: IpAddr) -> Option<String> {
        if self.fake_ip_enabled() {
            if let Some(host) = self.pool.as_ref().and_then(|pool| pool.look_back(ip)) {
                return Some(host);
            }
        }
        self.mapping.as_ref()?.get(&ip)
    }

    /// Answer an A query with a fake address
    ///
    /// Returns `None` outside `fake-ip` mode, for anything but an IN A query,
    /// and for names matching the fake-ip filter; those go to the resolver.
    #[must_use]
    pub fn fake_ip_answer(&self, query: &Message) -> Option<Message> {
        let pool = self.pool.as_ref().filter(|_| self.fake_ip_enabled())?;
        let question = query.queries().first()?;
        if question.query_class() != DNSClass::IN || question.query_type() != RecordType::A {
            return None;
        }
        let host = msg_to_domain(query)?.to_ascii_lowercase();
        if host.is_empty() || pool.should_skipped(&host) {
            return None;
        }

        let ip = pool.lookup(&host);
        trace!(%host, %ip, "fake-ip answer");
        Some(reply_with_ips(query, &[ip], FAKE_IP_TTL))
    }

    /// Record that `ip` was resolved for `host`
    pub fn insert_host_by_ip(&self, ip: IpAddr, host: &str) {
        if let Some(mapping) = &self.mapping {
            mapping.set(ip, host.to_owned());
        }
    }

    /// Drop every fake-IP binding
    ///
    /// # Errors
    ///
    /// Returns `DnsError::StoreError` if the persistent store cannot be
    /// cleared.
    pub fn flush_fake_ip(&self) -> DnsResult<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        pool.flush_fake_ip()
            .map_err(|e| DnsError::store(format!("flush fake-ip pool: {e}")))?;
        debug!(ipnet = %pool.ipnet(), "fake-ip pool flushed");
        Ok(())
    }

    /// Carry mapping and pool state over from the previous enhancer
    ///
    /// Called on configuration reload before the old enhancer is dropped.
    pub fn patch_from(&self, old: &ResolverEnhancer) {
        if let (Some(mine), Some(theirs)) = (&self.mapping, &old.mapping) {
            theirs.clone_to(mine);
        }
        if let (Some(mine), Some(theirs)) = (&self.pool, &old.pool) {
            if mine.ipnet() == theirs.ipnet() {
                Pool::clone_from(mine, theirs);
            } else {
                warn!(old = %theirs.ipnet(), new = %mine.ipnet(), "fake-ip range changed, pool not carried over");
            }
        }
    }

    /// Persist the pool's allocator position
    pub fn store_fake_pool_state(&self) {
        if let Some(pool) = &self.pool {
            pool.store_state();
        }
    }
}
