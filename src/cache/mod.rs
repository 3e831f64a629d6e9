//! Expiring caches
//!
//! Two replacement policies behind one contract:
//!
//! - [`LruCache`]: least-recently-used with optional max-age, stale reads and
//!   sliding expiry. Backs fake-IP stores and the enhancer's reverse mapping.
//! - [`ArcCache`]: adaptive replacement (T1/T2 resident lists, B1/B2 ghost
//!   lists, adaptive target `p`).
//!
//! [`ExpiringCache`] is the enum the resolver holds, picked from the
//! `cache-algorithm` setting.
//!
//! Expiry is an absolute unix timestamp in seconds. Both caches lock one
//! internal mutex per call and never hold it across `.await`.

mod arc;
mod lru;

use std::fmt;
use std::hash::Hash;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use hickory_proto::op::Message;
use serde::{Deserialize, Serialize};

pub use self::arc::ArcCache;
pub use self::lru::{LruCache, LruOptions};

/// Default resolver cache size
pub const DEFAULT_CACHE_SIZE: usize = 4096;

/// Current unix time in whole seconds
#[must_use]
pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}

/// Replacement policy selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheAlgorithm {
    /// Least recently used
    #[default]
    Lru,
    /// Adaptive replacement cache
    Arc,
}

impl FromStr for CacheAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "lru" => Ok(Self::Lru),
            "arc" => Ok(Self::Arc),
            other => Err(format!("unknown cache algorithm: {other}")),
        }
    }
}

impl fmt::Display for CacheAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lru => write!(f, "lru"),
            Self::Arc => write!(f, "arc"),
        }
    }
}

/// A cache of either policy
pub enum ExpiringCache<K, V> {
    /// LRU with TTL
    Lru(LruCache<K, V>),
    /// Adaptive replacement
    Arc(ArcCache<K, V>),
}

/// The resolver's response cache, keyed by canonical question string
pub type DnsMessageCache = ExpiringCache<String, Message>;

impl<K, V> fmt::Debug for ExpiringCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lru(_) => f.write_str("ExpiringCache::Lru"),
            Self::Arc(_) => f.write_str("ExpiringCache::Arc"),
        }
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Build a stale-serving cache of `size` entries with the given policy
    #[must_use]
    pub fn new(algorithm: CacheAlgorithm, size: usize) -> Self {
        match algorithm {
            CacheAlgorithm::Lru => Self::Lru(LruCache::with_options(
                LruOptions::default().max_size(size).stale(true),
            )),
            CacheAlgorithm::Arc => Self::Arc(ArcCache::new(size)),
        }
    }

    /// Look up a value, updating recency
    pub fn get(&self, key: &K) -> Option<V> {
        match self {
            Self::Lru(c) => c.get(key),
            Self::Arc(c) => c.get(key),
        }
    }

    /// Look up a value and its absolute expiry
    pub fn get_with_expire(&self, key: &K) -> Option<(V, u64)> {
        match self {
            Self::Lru(c) => c.get_with_expire(key),
            Self::Arc(c) => c.get_with_expire(key),
        }
    }

    /// Store a value with the cache's default expiry
    pub fn set(&self, key: K, value: V) {
        match self {
            Self::Lru(c) => c.set(key, value),
            Self::Arc(c) => c.set(key, value),
        }
    }

    /// Store a value expiring at `expires` (unix seconds)
    pub fn set_with_expire(&self, key: K, value: V, expires: u64) {
        match self {
            Self::Lru(c) => c.set_with_expire(key, value, expires),
            Self::Arc(c) => c.set_with_expire(key, value, expires),
        }
    }

    /// Remove a key
    pub fn delete(&self, key: &K) {
        match self {
            Self::Lru(c) => c.delete(key),
            Self::Arc(c) => c.delete(key),
        }
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        match self {
            Self::Lru(c) => c.len(),
            Self::Arc(c) => c.len(),
        }
    }

    /// Whether no entry is resident
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        match self {
            Self::Lru(c) => c.clear(),
            Self::Arc(c) => c.clear(),
        }
    }

    /// Copy the contents into another cache of the same policy
    ///
    /// Mixed policies are skipped.
    pub fn clone_to(&self, other: &Self) {
        match (self, other) {
            (Self::Lru(a), Self::Lru(b)) => a.clone_to(b),
            (Self::Arc(a), Self::Arc(b)) => a.clone_to(b),
            _ => tracing::debug!("cache policies differ, skipping clone"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_algorithm_parse() {
        assert_eq!("arc".parse::<CacheAlgorithm>().unwrap(), CacheAlgorithm::Arc);
        assert_eq!("LRU".parse::<CacheAlgorithm>().unwrap(), CacheAlgorithm::Lru);
        assert_eq!("".parse::<CacheAlgorithm>().unwrap(), CacheAlgorithm::Lru);
        assert!("fifo".parse::<CacheAlgorithm>().is_err());
    }

    #[test]
    fn test_cache_algorithm_serde() {
        let alg: CacheAlgorithm = serde_json::from_str("\"arc\"").unwrap();
        assert_eq!(alg, CacheAlgorithm::Arc);
        assert_eq!(CacheAlgorithm::default(), CacheAlgorithm::Lru);
    }

    #[test]
    fn test_expiring_cache_dispatch() {
        for alg in [CacheAlgorithm::Lru, CacheAlgorithm::Arc] {
            let cache: ExpiringCache<String, u32> = ExpiringCache::new(alg, 8);
            cache.set_with_expire("a".into(), 1, 42);
            assert_eq!(cache.get_with_expire(&"a".to_string()), Some((1, 42)));
            assert_eq!(cache.len(), 1);
            cache.clear();
            assert!(cache.is_empty());
        }
    }

    #[test]
    fn test_clone_to_same_policy() {
        let src: ExpiringCache<u32, u32> = ExpiringCache::new(CacheAlgorithm::Lru, 8);
        let dst: ExpiringCache<u32, u32> = ExpiringCache::new(CacheAlgorithm::Lru, 8);
        src.set(1, 10);
        src.set(2, 20);

        src.clone_to(&dst);
        assert_eq!(dst.get(&1), Some(10));
        assert_eq!(dst.get(&2), Some(20));
    }

    #[test]
    fn test_now_unix_is_recent() {
        // 2020-01-01
        assert!(now_unix() > 1_577_836_800);
    }
}
