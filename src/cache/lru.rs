//! LRU cache with per-entry expiry

use std::fmt;
use std::hash::Hash;

use parking_lot::Mutex;

use super::now_unix;

type EvictCallback<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

/// Options for [`LruCache`]
///
/// # Example
///
/// ```
/// use rust_resolver::cache::{LruCache, LruOptions};
///
/// let cache: LruCache<String, u32> =
///     LruCache::with_options(LruOptions::default().max_size(2).max_age(60));
/// cache.set("a".into(), 1);
/// assert_eq!(cache.get(&"a".into()), Some(1));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct LruOptions {
    max_size: usize,
    max_age: u64,
    update_age_on_get: bool,
    stale: bool,
}

impl LruOptions {
    /// Maximum number of entries; `0` means unbounded
    #[must_use]
    pub fn max_size(mut self, size: usize) -> Self {
        self.max_size = size;
        self
    }

    /// Default lifetime in seconds for [`LruCache::set`]; `0` means no expiry
    #[must_use]
    pub fn max_age(mut self, secs: u64) -> Self {
        self.max_age = secs;
        self
    }

    /// Push the expiry forward on every successful `get`
    #[must_use]
    pub fn update_age_on_get(mut self, enabled: bool) -> Self {
        self.update_age_on_get = enabled;
        self
    }

    /// Keep returning expired entries instead of purging them
    #[must_use]
    pub fn stale(mut self, enabled: bool) -> Self {
        self.stale = enabled;
        self
    }
}

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    expires: u64,
}

/// Thread-safe LRU cache with optional TTL
///
/// Recency order lives in an unbounded [`::lru::LruCache`]; size and age limits
/// are enforced here so every removal goes through the eviction callback.
/// The callback runs after the internal lock is released and may use the
/// cache itself.
///
/// Expired entries are removed lazily: on `get` of the entry itself, and as a
/// run from the least-recently-used end after every `set`. With `stale`
/// enabled nothing is ever purged for age.
pub struct LruCache<K, V> {
    inner: Mutex<::lru::LruCache<K, Entry<V>>>,
    options: LruOptions,
    on_evict: Option<EvictCallback<K, V>>,
}

impl<K: Hash + Eq, V> fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruCache")
            .field("len", &self.inner.lock().len())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a cache bounded to `max_size` entries without expiry
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self::with_options(LruOptions::default().max_size(max_size))
    }

    /// Create a cache from options
    #[must_use]
    pub fn with_options(options: LruOptions) -> Self {
        Self {
            inner: Mutex::new(::lru::LruCache::unbounded()),
            options,
            on_evict: None,
        }
    }

    /// Register a callback invoked for every evicted or deleted entry
    #[must_use]
    pub fn with_evict<F>(mut self, callback: F) -> Self
    where
        F: Fn(&K, &V) + Send + Sync + 'static,
    {
        self.on_evict = Some(Box::new(callback));
        self
    }

    fn expired(&self, entry: &Entry<V>, now: u64) -> bool {
        !self.options.stale && self.options.max_age > 0 && entry.expires <= now
    }

    /// Fire the eviction callback; called with the cache lock released
    fn notify(&self, evicted: Vec<(K, Entry<V>)>) {
        if let Some(cb) = &self.on_evict {
            for (key, entry) in &evicted {
                cb(key, &entry.value);
            }
        }
    }

    fn get_entry(&self, key: &K) -> Option<Entry<V>> {
        let mut evicted = Vec::new();
        let hit = {
            let mut inner = self.inner.lock();
            let now = now_unix();

            if self.expired(inner.peek(key)?, now) {
                if let Some(entry) = inner.pop(key) {
                    evicted.push((key.clone(), entry));
                }
                self.delete_expired(&mut inner, now, &mut evicted);
                None
            } else {
                let entry = inner.get_mut(key)?;
                if self.options.max_age > 0 && self.options.update_age_on_get {
                    entry.expires = now + self.options.max_age;
                }
                Some(entry.clone())
            }
        };
        self.notify(evicted);
        hit
    }

    /// Look up a value, marking it most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_entry(key).map(|e| e.value)
    }

    /// Look up a value and its expiry (unix seconds)
    pub fn get_with_expire(&self, key: &K) -> Option<(V, u64)> {
        self.get_entry(key).map(|e| (e.value, e.expires))
    }

    /// Whether the key is present, without touching recency or expiry
    pub fn exist(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    /// Store a value; it expires after `max_age` when one is configured
    pub fn set(&self, key: K, value: V) {
        let expires = if self.options.max_age > 0 {
            now_unix() + self.options.max_age
        } else {
            0
        };
        self.set_with_expire(key, value, expires);
    }

    /// Store a value expiring at `expires` (unix seconds)
    pub fn set_with_expire(&self, key: K, value: V, expires: u64) {
        let mut evicted = Vec::new();
        {
            let mut inner = self.inner.lock();

            if let Some(entry) = inner.get_mut(&key) {
                entry.value = value;
                entry.expires = expires;
            } else {
                inner.put(key, Entry { value, expires });
                if self.options.max_size > 0 && inner.len() > self.options.max_size {
                    evicted.extend(inner.pop_lru());
                }
            }

            self.delete_expired(&mut inner, now_unix(), &mut evicted);
        }
        self.notify(evicted);
    }

    /// Return the cached value or store the one produced by `constructor`
    pub fn get_or_store<F>(&self, key: K, constructor: F) -> V
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let value = constructor();
        self.set(key, value.clone());
        value
    }

    /// Remove a key, firing the eviction callback
    pub fn delete(&self, key: &K) {
        let removed = self.inner.lock().pop(key);
        if let Some(entry) = removed {
            self.notify(vec![(key.clone(), entry)]);
        }
    }

    /// Drop every entry without callbacks
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Number of stored entries, expired ones included until purged
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the cache holds no entry
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Replace the contents of `other` with a copy of this cache
    ///
    /// Recency order and expiries are preserved.
    pub fn clone_to(&self, other: &LruCache<K, V>) {
        if std::ptr::eq(self, other) {
            return;
        }
        let src = self.inner.lock();
        let mut dst = other.inner.lock();
        dst.clear();
        // iter() walks most-recent first
        for (k, e) in src.iter().rev() {
            dst.put(k.clone(), e.clone());
        }
    }

    fn delete_expired(
        &self,
        inner: &mut ::lru::LruCache<K, Entry<V>>,
        now: u64,
        evicted: &mut Vec<(K, Entry<V>)>,
    ) {
        if self.options.stale || self.options.max_age == 0 {
            return;
        }
        while inner.peek_lru().is_some_and(|(_, e)| e.expires <= now) {
            evicted.extend(inner.pop_lru());
        }
    }
}
