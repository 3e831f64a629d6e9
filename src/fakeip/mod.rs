//! Fake-IP allocation
//!
//! A [`Pool`] hands out synthetic addresses from a configured prefix and
//! remembers the host behind each one, so a transparent proxy can turn a
//! connection to a fake address back into the original hostname.
//!
//! # Address layout
//!
//! ```text
//! network      network+1    network+2   network+3 ... broadcast-1   broadcast
//!    │             │            │           │               │            │
//!  (unused)     gateway      (unused)     first   ...   (allocated)    last
//! ```
//!
//! Allocation walks `first..last` and wraps; after the first wrap every
//! allocation evicts whatever host held the address.
//!
//! # Stores
//!
//! - [`MemoryStore`]: two bounded LRUs (host → ip, ip → host)
//! - [`PersistentStore`]: SQLite tables that survive restarts, plus the
//!   allocator offset and cycle flag
//!
//! # Example
//!
//! ```
//! use rust_resolver::fakeip::{Pool, PoolOptions};
//!
//! let pool = Pool::new(PoolOptions::new("198.18.0.0/16".parse().unwrap())).unwrap();
//! let ip = pool.lookup("example.com");
//! assert_eq!(pool.look_back(ip).as_deref(), Some("example.com"));
//! assert_eq!(pool.lookup("EXAMPLE.com"), ip);
//! ```

mod memory;
mod persistent;
mod pool;

use std::net::IpAddr;

use thiserror::Error;

pub use memory::MemoryStore;
pub use persistent::PersistentStore;
pub use pool::{Pool, PoolOptions};

/// Reserved host key holding the allocator offset
pub const OFFSET_KEY: &str = "key-offset-fake-ip";

/// Reserved host key present once the allocator has wrapped
pub const CYCLE_KEY: &str = "key-cycle-fake-ip";

/// Errors from fake-IP pool construction and persistence
#[derive(Debug, Error)]
pub enum FakeIpError {
    /// The prefix leaves no room between gateway and broadcast
    #[error("ipnet {0} don't have valid ip")]
    InvalidPrefix(String),

    /// The persistent store could not be opened or written
    #[error("fake-ip store error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Backing store of a pool
#[derive(Debug)]
pub enum FakeIpStore {
    /// Bounded in-memory LRUs
    Memory(MemoryStore),
    /// SQLite-backed store
    Persistent(PersistentStore),
}

impl FakeIpStore {
    pub(crate) fn get_by_host(&self, host: &str) -> Option<IpAddr> {
        match self {
            Self::Memory(s) => s.get_by_host(host),
            Self::Persistent(s) => s.get_by_host(host),
        }
    }

    pub(crate) fn put_by_host(&self, host: &str, ip: IpAddr) {
        match self {
            Self::Memory(s) => s.put_by_host(host, ip),
            Self::Persistent(s) => s.put_by_host(host, ip),
        }
    }

    pub(crate) fn get_by_ip(&self, ip: IpAddr) -> Option<String> {
        match self {
            Self::Memory(s) => s.get_by_ip(ip),
            Self::Persistent(s) => s.get_by_ip(ip),
        }
    }

    pub(crate) fn put_by_ip(&self, ip: IpAddr, host: &str) {
        match self {
            Self::Memory(s) => s.put_by_ip(ip, host),
            Self::Persistent(s) => s.put_by_ip(ip, host),
        }
    }

    pub(crate) fn del_by_ip(&self, ip: IpAddr) {
        match self {
            Self::Memory(s) => s.del_by_ip(ip),
            Self::Persistent(s) => s.del_by_ip(ip),
        }
    }

    pub(crate) fn exist(&self, ip: IpAddr) -> bool {
        match self {
            Self::Memory(s) => s.exist(ip),
            Self::Persistent(s) => s.exist(ip),
        }
    }

    pub(crate) fn flush(&self) -> Result<(), FakeIpError> {
        match self {
            Self::Memory(s) => {
                s.flush();
                Ok(())
            }
            Self::Persistent(s) => s.flush(),
        }
    }

    /// Copy mappings into `other`; only memory-to-memory copies happen
    pub(crate) fn clone_to(&self, other: &FakeIpStore) {
        if let (Self::Memory(src), Self::Memory(dst)) = (self, other) {
            src.clone_to(dst);
        }
    }
}
