//! Fake-IP allocator

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;

use ipnet::IpNet;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{FakeIpError, FakeIpStore, MemoryStore, PersistentStore, CYCLE_KEY, OFFSET_KEY};
use crate::trie::DomainTrie;

/// Options for [`Pool::new`]
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Prefix to allocate from
    pub ipnet: IpNet,
    /// Domains that must never get a fake address
    pub host: Option<Arc<DomainTrie<()>>>,
    /// Maximum mappings per direction in memory; ignored when persistent
    pub size: usize,
    /// Database path; `None` keeps mappings in memory
    pub persistence: Option<PathBuf>,
}

impl PoolOptions {
    /// In-memory pool over `ipnet` holding up to 65535 mappings
    #[must_use]
    pub fn new(ipnet: IpNet) -> Self {
        Self {
            ipnet,
            host: None,
            size: 65535,
            persistence: None,
        }
    }

    /// Set the skip list
    #[must_use]
    pub fn with_host(mut self, host: Arc<DomainTrie<()>>) -> Self {
        self.host = Some(host);
        self
    }

    /// Set the in-memory size
    #[must_use]
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Persist mappings at `path`
    #[must_use]
    pub fn with_persistence(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence = Some(path.into());
        self
    }
}

#[derive(Debug)]
struct Cursor {
    offset: IpAddr,
    cycle: bool,
}

/// Fake-IP pool
///
/// `lookup` and `look_back` are serialized on one mutex; the store has its
/// own locking and is never touched across an `.await`.
#[derive(Debug)]
pub struct Pool {
    gateway: IpAddr,
    first: IpAddr,
    last: IpAddr,
    ipnet: IpNet,
    host: Option<Arc<DomainTrie<()>>>,
    cursor: Mutex<Cursor>,
    store: FakeIpStore,
}

fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn from_u128(template: IpAddr, value: u128) -> Option<IpAddr> {
    match template {
        IpAddr::V4(_) => u32::try_from(value).ok().map(|v| IpAddr::V4(Ipv4Addr::from(v))),
        IpAddr::V6(_) => Some(IpAddr::V6(Ipv6Addr::from(value))),
    }
}

fn add(ip: IpAddr, n: u128) -> Option<IpAddr> {
    from_u128(ip, to_u128(ip).checked_add(n)?)
}

fn sub(ip: IpAddr, n: u128) -> Option<IpAddr> {
    from_u128(ip, to_u128(ip).checked_sub(n)?)
}

impl Pool {
    /// Build a pool
    ///
    /// Gateway is `network + 1`, allocation starts at `network + 3` and stops
    /// before the broadcast address.
    ///
    /// # Errors
    ///
    /// - `FakeIpError::InvalidPrefix` when the prefix is too small (`/31`,
    ///   `/30` and narrower for IPv4)
    /// - `FakeIpError::Store` when the persistent store cannot be opened
    pub fn new(options: PoolOptions) -> Result<Self, FakeIpError> {
        let invalid = || FakeIpError::InvalidPrefix(options.ipnet.to_string());

        let network = options.ipnet.network();
        let broadcast = options.ipnet.broadcast();
        let gateway = add(network, 1).ok_or_else(invalid)?;
        let first = add(gateway, 2).ok_or_else(invalid)?;
        let last = broadcast;

        if first >= last || !options.ipnet.contains(&last) {
            return Err(invalid());
        }
        let offset = sub(first, 1).ok_or_else(invalid)?;

        let store = match &options.persistence {
            Some(path) => FakeIpStore::Persistent(PersistentStore::open(path)?),
            None => FakeIpStore::Memory(MemoryStore::new(options.size)),
        };

        let pool = Self {
            gateway,
            first,
            last,
            ipnet: options.ipnet,
            host: options.host,
            cursor: Mutex::new(Cursor {
                offset,
                cycle: false,
            }),
            store,
        };
        pool.restore_state();

        debug!(
            ipnet = %pool.ipnet,
            gateway = %pool.gateway,
            persistent = matches!(pool.store, FakeIpStore::Persistent(_)),
            "fake-ip pool ready"
        );
        Ok(pool)
    }

    /// Return the fake address for `host`, allocating one if needed
    ///
    /// Hosts are case-folded.
    pub fn lookup(&self, host: &str) -> IpAddr {
        let host = host.to_lowercase();
        let mut cursor = self.cursor.lock();

        if let Some(ip) = self.store.get_by_host(&host) {
            return ip;
        }

        let ip = self.next_ip(&mut cursor, &host);
        self.store.put_by_host(&host, ip);
        ip
    }

    fn next_ip(&self, cursor: &mut Cursor, host: &str) -> IpAddr {
        cursor.offset = add(cursor.offset, 1).unwrap_or(self.first);
        if cursor.offset >= self.last {
            cursor.cycle = true;
            cursor.offset = self.first;
        }

        if cursor.cycle || self.store.exist(cursor.offset) {
            self.store.del_by_ip(cursor.offset);
        }

        self.store.put_by_ip(cursor.offset, host);
        cursor.offset
    }

    /// Host behind a fake address
    pub fn look_back(&self, ip: IpAddr) -> Option<String> {
        let _guard = self.cursor.lock();
        self.store.get_by_ip(ip)
    }

    /// Whether `domain` is on the skip list
    pub fn should_skipped(&self, domain: &str) -> bool {
        self.host
            .as_ref()
            .is_some_and(|trie| trie.search(domain).is_some())
    }

    /// Whether `ip` is currently mapped
    pub fn exist(&self, ip: IpAddr) -> bool {
        let _guard = self.cursor.lock();
        self.store.exist(ip)
    }

    /// Gateway address (`network + 1`)
    #[must_use]
    pub fn gateway(&self) -> IpAddr {
        self.gateway
    }

    /// Broadcast address, the exclusive end of allocation
    #[must_use]
    pub fn broadcast(&self) -> IpAddr {
        self.last
    }

    /// The prefix as configured
    #[must_use]
    pub fn ipnet(&self) -> IpNet {
        self.ipnet
    }

    /// Copy mappings from an older pool
    ///
    /// Only memory-to-memory copies happen; a persistent pool already has
    /// its history on disk.
    pub fn clone_from(&self, other: &Pool) {
        other.store.clone_to(&self.store);
    }

    /// Drop every mapping and restart allocation at the first address
    ///
    /// # Errors
    ///
    /// Returns `FakeIpError::Store` if the persistent store cannot be cleared.
    pub fn flush_fake_ip(&self) -> Result<(), FakeIpError> {
        let mut cursor = self.cursor.lock();
        self.store.flush()?;
        cursor.cycle = false;
        cursor.offset = sub(self.first, 1).unwrap_or(self.first);
        Ok(())
    }

    /// Persist the allocator position (persistent store only)
    pub fn store_state(&self) {
        let FakeIpStore::Persistent(store) = &self.store else {
            return;
        };
        let cursor = self.cursor.lock();
        store.put_by_host(OFFSET_KEY, cursor.offset);
        if cursor.cycle {
            store.put_by_host(CYCLE_KEY, cursor.offset);
        }
    }

    fn restore_state(&self) {
        let FakeIpStore::Persistent(store) = &self.store else {
            return;
        };

        let mut cursor = self.cursor.lock();
        if store.get_by_host(CYCLE_KEY).is_some() {
            cursor.cycle = true;
        }

        // without a saved offset allocation starts over at `first`; existing
        // bindings stay until their address comes up again
        let flush = match store.get_by_host(OFFSET_KEY) {
            Some(offset) if self.ipnet.contains(&offset) => {
                cursor.offset = offset;
                false
            }
            Some(_) => true,
            None => false,
        };

        if flush {
            if let Err(e) = store.flush() {
                warn!(error = %e, "flush stale fake-ip store failed");
            }
            cursor.cycle = false;
            cursor.offset = sub(self.first, 1).unwrap_or(self.first);
        }
    }
}
