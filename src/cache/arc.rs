//! Adaptive replacement cache
//!
//! Entries live in an arena (`Vec<Option<Node>>` plus a free list); the four
//! ARC lists are intrusive doubly-linked lists of arena indexes. The head of
//! each list is the most recently used end.
//!
//! - `T1`: resident, seen once recently
//! - `T2`: resident, seen at least twice
//! - `B1`/`B2`: ghosts (key only) recently evicted from `T1`/`T2`
//!
//! `p` is the adaptive target size of `T1`, kept within `[0, capacity]`.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListId {
    T1 = 0,
    T2 = 1,
    B1 = 2,
    B2 = 3,
}

#[derive(Debug, Clone)]
struct Node<K, V> {
    key: K,
    value: Option<V>,
    expires: u64,
    list: ListId,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
struct List {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Clone)]
struct State<K, V> {
    p: usize,
    capacity: usize,
    lists: [List; 4],
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
}

impl<K, V> State<K, V>
where
    K: Hash + Eq + Clone,
{
    fn new(capacity: usize) -> Self {
        Self {
            p: 0,
            capacity,
            lists: [List::default(); 4],
            nodes: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn len_of(&self, list: ListId) -> usize {
        self.lists[list as usize].len
    }

    fn node(&self, idx: usize) -> Option<&Node<K, V>> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node<K, V>> {
        self.nodes.get_mut(idx).and_then(Option::as_mut)
    }

    fn alloc(&mut self, node: Node<K, V>) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn unlink(&mut self, idx: usize) {
        let Some((list, prev, next)) = self.node(idx).map(|n| (n.list, n.prev, n.next)) else {
            return;
        };

        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = next;
                }
            }
            None => self.lists[list as usize].head = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.node_mut(nx) {
                    n.prev = prev;
                }
            }
            None => self.lists[list as usize].tail = prev,
        }
        self.lists[list as usize].len -= 1;
    }

    fn push_front(&mut self, list: ListId, idx: usize) {
        let old_head = self.lists[list as usize].head;
        if let Some(n) = self.node_mut(idx) {
            n.list = list;
            n.prev = None;
            n.next = old_head;
        }
        match old_head {
            Some(h) => {
                if let Some(n) = self.node_mut(h) {
                    n.prev = Some(idx);
                }
            }
            None => self.lists[list as usize].tail = Some(idx),
        }
        let l = &mut self.lists[list as usize];
        l.head = Some(idx);
        l.len += 1;
    }

    fn set_mru(&mut self, list: ListId, idx: usize) {
        self.unlink(idx);
        self.push_front(list, idx);
    }

    /// Remove the least recently used entry of `list` entirely
    fn del_lru(&mut self, list: ListId) {
        let Some(idx) = self.lists[list as usize].tail else {
            return;
        };
        self.unlink(idx);
        if let Some(node) = self.nodes[idx].take() {
            self.index.remove(&node.key);
        }
        self.free.push(idx);
    }

    /// Demote one resident entry to a ghost list
    fn replace(&mut self, from_b2: bool) {
        let t1 = self.len_of(ListId::T1);
        let (src, dst) = if t1 > 0 && (t1 > self.p || (from_b2 && t1 == self.p)) {
            (ListId::T1, ListId::B1)
        } else {
            (ListId::T2, ListId::B2)
        };

        let Some(idx) = self.lists[src as usize].tail else {
            return;
        };
        if let Some(n) = self.node_mut(idx) {
            n.value = None;
        }
        self.set_mru(dst, idx);
    }

    /// Admit a key that has no node yet (case IV)
    fn admit_new(&mut self, node: Node<K, V>) {
        let c = self.capacity;
        let t1 = self.len_of(ListId::T1);
        let b1 = self.len_of(ListId::B1);
        let total = t1 + b1 + self.len_of(ListId::T2) + self.len_of(ListId::B2);

        if t1 + b1 == c {
            if t1 < c {
                self.del_lru(ListId::B1);
                self.replace(false);
            } else {
                self.del_lru(ListId::T1);
            }
        } else if t1 + b1 < c && total >= c {
            if total == 2 * c {
                self.del_lru(ListId::B2);
            }
            self.replace(false);
        }

        let key = node.key.clone();
        let idx = self.alloc(node);
        // the node is not linked anywhere yet
        if let Some(n) = self.node_mut(idx) {
            n.prev = None;
            n.next = None;
        }
        self.push_front(ListId::T1, idx);
        self.index.insert(key, idx);
    }

    /// Shift the T1 target towards the ghost list that was just accessed
    fn adapt(&mut self, ghost: ListId) {
        let b1 = self.len_of(ListId::B1);
        let b2 = self.len_of(ListId::B2);
        match ghost {
            ListId::B1 => {
                let d = if b1 >= b2 { 1 } else { b2 / b1 };
                self.p = (self.p + d).min(self.capacity);
            }
            ListId::B2 => {
                let d = if b2 >= b1 { 1 } else { b1 / b2 };
                self.p = self.p.saturating_sub(d);
            }
            ListId::T1 | ListId::T2 => {}
        }
    }

    /// Re-admit an existing node (cases I to III)
    fn admit_existing(&mut self, idx: usize) {
        let Some(list) = self.node(idx).map(|n| n.list) else {
            return;
        };

        match list {
            ListId::T1 | ListId::T2 => {}
            ListId::B1 => {
                self.adapt(ListId::B1);
                self.replace(false);
            }
            ListId::B2 => {
                self.adapt(ListId::B2);
                self.replace(true);
            }
        }
        self.set_mru(ListId::T2, idx);
    }
}

/// Thread-safe adaptive replacement cache
///
/// At most `capacity` entries hold values; up to another `capacity` ghost
/// keys remember recent evictions and steer the T1/T2 balance.
///
/// Looking up a ghost is a miss that adapts `p` but leaves the lists
/// untouched; storing a ghost's key again adapts `p` and re-admits it into
/// `T2`.
///
/// # Example
///
/// ```
/// use rust_resolver::cache::ArcCache;
///
/// let cache = ArcCache::new(2);
/// cache.set("a", 1);
/// cache.set("b", 2);
/// cache.set("c", 3);
/// assert_eq!(cache.len(), 2);
/// assert_eq!(cache.get(&"c"), Some(3));
/// ```
pub struct ArcCache<K, V> {
    state: Mutex<State<K, V>>,
}

impl<K, V> fmt::Debug for ArcCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.state.lock();
        f.debug_struct("ArcCache")
            .field("capacity", &s.capacity)
            .field("p", &s.p)
            .field("t1", &s.lists[ListId::T1 as usize].len)
            .field("t2", &s.lists[ListId::T2 as usize].len)
            .field("b1", &s.lists[ListId::B1 as usize].len)
            .field("b2", &s.lists[ListId::B2 as usize].len)
            .finish()
    }
}

impl<K, V> ArcCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a cache holding at most `capacity` values (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::new(capacity.max(1))),
        }
    }

    /// Store a value without expiry
    pub fn set(&self, key: K, value: V) {
        self.set_with_expire(key, value, 0);
    }

    /// Store a value expiring at `expires` (unix seconds)
    pub fn set_with_expire(&self, key: K, value: V, expires: u64) {
        let mut state = self.state.lock();

        if let Some(&idx) = state.index.get(&key) {
            if let Some(n) = state.node_mut(idx) {
                n.value = Some(value);
                n.expires = expires;
            }
            state.admit_existing(idx);
            return;
        }

        state.admit_new(Node {
            key,
            value: Some(value),
            expires,
            list: ListId::T1,
            prev: None,
            next: None,
        });
    }

    fn get_node(&self, key: &K) -> Option<(V, u64)> {
        let mut state = self.state.lock();
        let idx = *state.index.get(key)?;
        let node = state.node(idx)?;
        let list = node.list;
        if matches!(list, ListId::B1 | ListId::B2) {
            state.adapt(list);
            return None;
        }
        let hit = (node.value.clone()?, node.expires);
        state.set_mru(ListId::T2, idx);
        Some(hit)
    }

    /// Look up a value; a hit moves the entry to the frequent list
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_node(key).map(|(v, _)| v)
    }

    /// Look up a value and its expiry (unix seconds)
    pub fn get_with_expire(&self, key: &K) -> Option<(V, u64)> {
        self.get_node(key)
    }

    /// Forget a key, resident or ghost
    pub fn delete(&self, key: &K) {
        let mut state = self.state.lock();
        let Some(idx) = state.index.remove(key) else {
            return;
        };
        state.unlink(idx);
        state.nodes[idx] = None;
        state.free.push(idx);
    }

    /// Number of resident (non-ghost) entries
    pub fn len(&self) -> usize {
        let s = self.state.lock();
        s.len_of(ListId::T1) + s.len_of(ListId::T2)
    }

    /// Whether no value is resident
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry and ghost, resetting adaptation
    pub fn clear(&self) {
        let mut s = self.state.lock();
        let capacity = s.capacity;
        *s = State::new(capacity);
    }

    /// Replace the state of `other` with a copy of this cache
    pub fn clone_to(&self, other: &ArcCache<K, V>) {
        if std::ptr::eq(self, other) {
            return;
        }
        let snapshot = self.state.lock().clone();
        *other.state.lock() = snapshot;
    }

    #[cfg(test)]
    fn lens(&self) -> (usize, usize, usize, usize, usize) {
        let s = self.state.lock();
        (
            s.len_of(ListId::T1),
            s.len_of(ListId::T2),
            s.len_of(ListId::B1),
            s.len_of(ListId::B2),
            s.p,
        )
    }
}
