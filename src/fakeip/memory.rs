//! In-memory fake-IP store

use std::net::IpAddr;

use crate::cache::LruCache;

/// Two bounded LRUs mapping host ↔ address
///
/// A hit in either direction refreshes the opposite entry as well, so a hot
/// mapping is never half-evicted.
#[derive(Debug)]
pub struct MemoryStore {
    cache_ip: LruCache<IpAddr, String>,
    cache_host: LruCache<String, IpAddr>,
}

impl MemoryStore {
    /// Create a store holding at most `size` mappings per direction
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self {
            cache_ip: LruCache::new(size),
            cache_host: LruCache::new(size),
        }
    }

    pub fn get_by_host(&self, host: &str) -> Option<IpAddr> {
        let ip = self.cache_host.get(&host.to_owned())?;
        // keep ip -> host at the hot end too
        self.cache_ip.get(&ip);
        Some(ip)
    }

    pub fn put_by_host(&self, host: &str, ip: IpAddr) {
        self.cache_host.set(host.to_owned(), ip);
    }

    pub fn get_by_ip(&self, ip: IpAddr) -> Option<String> {
        let host = self.cache_ip.get(&ip)?;
        self.cache_host.get(&host);
        Some(host)
    }

    pub fn put_by_ip(&self, ip: IpAddr, host: &str) {
        self.cache_ip.set(ip, host.to_owned());
    }

    /// Drop the mapping in both directions
    pub fn del_by_ip(&self, ip: IpAddr) {
        if let Some(host) = self.cache_ip.get(&ip) {
            self.cache_host.delete(&host);
        }
        self.cache_ip.delete(&ip);
    }

    pub fn exist(&self, ip: IpAddr) -> bool {
        self.cache_ip.exist(&ip)
    }

    pub fn flush(&self) {
        self.cache_ip.clear();
        self.cache_host.clear();
    }

    pub fn clone_to(&self, other: &MemoryStore) {
        self.cache_ip.clone_to(&other.cache_ip);
        self.cache_host.clone_to(&other.cache_host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_del_by_ip_removes_both_directions() {
        let store = MemoryStore::new(4);
        let ip: IpAddr = "198.18.0.3".parse().unwrap();
        store.put_by_ip(ip, "foo.com");
        store.put_by_host("foo.com", ip);

        store.del_by_ip(ip);
        assert!(store.get_by_host("foo.com").is_none());
        assert!(store.get_by_ip(ip).is_none());
        assert!(!store.exist(ip));
    }

    #[test]
    fn test_host_hit_refreshes_ip_side() {
        let store = MemoryStore::new(2);
        let a: IpAddr = "198.18.0.3".parse().unwrap();
        let b: IpAddr = "198.18.0.4".parse().unwrap();
        let c: IpAddr = "198.18.0.5".parse().unwrap();
        store.put_by_ip(a, "a");
        store.put_by_host("a", a);
        store.put_by_ip(b, "b");
        store.put_by_host("b", b);

        // touching a by host keeps a's ip entry alive
        assert_eq!(store.get_by_host("a"), Some(a));
        store.put_by_ip(c, "c");

        assert!(store.exist(a));
        assert!(!store.exist(b));
    }
}
