//! Succinct domain set
//!
//! A level-order (LOUDS) encoding of the reversed, sorted domain keys of a
//! [`DomainTrie`](super::DomainTrie):
//!
//! - `labels` holds one byte per edge, in breadth-first order.
//! - `label_bitmap` has a `0` per edge and a `1` closing every node.
//! - `leaves` has bit `n` set when node `n` ends a key.
//!
//! The child of the edge at bitmap position `b` is node
//! `count_zeros(b + 1)`, whose edges start right after the
//! `(node - 1)`-th one.

use super::bitmap::BitVec;

const COMPLEX_WILDCARD: u8 = b'+';
const WILDCARD: u8 = b'*';
const DOMAIN_STEP: u8 = b'.';

/// Immutable, compact domain set with wildcard matching
///
/// Built once through [`DomainTrie::new_domain_set`](super::DomainTrie::new_domain_set)
/// and shared behind `Arc`. Never edited: reloads build a new set.
#[derive(Debug, Clone)]
pub struct DomainSet {
    leaves: BitVec,
    label_bitmap: BitVec,
    labels: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct WildcardCursor {
    bm_idx: usize,
    index: usize,
}

enum Backtrack {
    Accept,
    Resume {
        node_id: usize,
        bm_idx: usize,
        index: usize,
    },
    Reject,
}

impl DomainSet {
    /// Build from reversed, lowercased keys
    pub(crate) fn from_reversed_keys(mut keys: Vec<String>) -> Option<Self> {
        // equal prefixes become contiguous, shorter keys first
        keys.sort_unstable();
        keys.dedup();
        if keys.is_empty() {
            return None;
        }

        let keys: Vec<&[u8]> = keys.iter().map(String::as_bytes).collect();
        let mut leaves = BitVec::new();
        let mut label_bitmap = BitVec::new();
        let mut labels = Vec::new();
        let mut l_idx = 0usize;

        // (start, end, column) ranges of keys sharing a prefix
        let mut queue = vec![(0usize, keys.len(), 0usize)];
        let mut i = 0;
        while i < queue.len() {
            let (mut s, e, col) = queue[i];
            if col == keys[s].len() {
                s += 1;
                leaves.set(i);
            }

            let mut j = s;
            while j < e {
                let from = j;
                while j < e && keys[j][col] == keys[from][col] {
                    j += 1;
                }
                queue.push((from, j, col + 1));
                labels.push(keys[from][col]);
                label_bitmap.reserve_bit(l_idx);
                l_idx += 1;
            }
            label_bitmap.set(l_idx);
            l_idx += 1;
            i += 1;
        }

        leaves.build_index();
        label_bitmap.build_index();
        Some(Self {
            leaves,
            label_bitmap,
            labels,
        })
    }

    fn child_node(&self, bm_idx: usize) -> usize {
        self.label_bitmap.count_zeros(bm_idx + 1)
    }

    fn first_edge(&self, node_id: usize) -> usize {
        if node_id == 0 {
            0
        } else {
            self.label_bitmap.select1(node_id - 1) + 1
        }
    }

    fn label(&self, bm_idx: usize, node_id: usize) -> u8 {
        self.labels[bm_idx - node_id]
    }

    /// Check whether a domain is matched by the set
    ///
    /// Matching is case-insensitive and follows the trie semantics:
    /// exact labels, `*` for exactly one label, `+`/dot-wildcard for one or
    /// more leading labels.
    pub fn has(&self, domain: &str) -> bool {
        let reversed = domain.chars().rev().collect::<String>().to_lowercase();
        let key = reversed.as_bytes();

        let mut node_id = 0usize;
        let mut bm_idx = 0usize;
        let mut stack: Vec<WildcardCursor> = Vec::new();
        let mut i = 0usize;

        'chars: while i < key.len() {
            let c = key[i];
            loop {
                if self.label_bitmap.get(bm_idx) {
                    // no more edges in this node
                    match self.backtrack(key, &mut stack) {
                        Backtrack::Accept => return true,
                        Backtrack::Reject => return false,
                        Backtrack::Resume {
                            node_id: n,
                            bm_idx: b,
                            index,
                        } => {
                            node_id = n;
                            bm_idx = b;
                            i = index;
                            continue 'chars;
                        }
                    }
                }

                match self.label(bm_idx, node_id) {
                    COMPLEX_WILDCARD => return true,
                    WILDCARD => stack.push(WildcardCursor { bm_idx, index: i }),
                    label if label == c => break,
                    _ => {}
                }
                bm_idx += 1;
            }

            node_id = self.child_node(bm_idx);
            bm_idx = self.first_edge(node_id);
            i += 1;
        }

        self.leaves.get(node_id)
    }

    /// Pop wildcard checkpoints until one lets the walk continue
    ///
    /// A `*` consumes the input up to the next `.`; the walk then resumes on
    /// the `.` edge of the wildcard's child node.
    fn backtrack(&self, key: &[u8], stack: &mut Vec<WildcardCursor>) -> Backtrack {
        while let Some(cursor) = stack.pop() {
            let next_node = self.child_node(cursor.bm_idx);
            let mut next_bm = self.first_edge(next_node);

            let mut j = cursor.index;
            while j < key.len() && key[j] != DOMAIN_STEP {
                j += 1;
            }
            if j == key.len() {
                if self.leaves.get(next_node) {
                    return Backtrack::Accept;
                }
                continue;
            }

            while !self.label_bitmap.get(next_bm) {
                if self.label(next_bm, next_node) == DOMAIN_STEP {
                    return Backtrack::Resume {
                        node_id: next_node,
                        bm_idx: next_bm,
                        index: j,
                    };
                }
                next_bm += 1;
            }
        }
        Backtrack::Reject
    }

    /// Visit every key in the set, in its original (un-reversed) form
    ///
    /// Returning `false` from `f` stops the walk.
    pub fn foreach<F>(&self, mut f: F)
    where
        F: FnMut(&str) -> bool,
    {
        let mut current = Vec::new();
        self.traverse(0, 0, &mut current, &mut f);
    }

    fn traverse<F>(&self, node_id: usize, mut bm_idx: usize, current: &mut Vec<u8>, f: &mut F) -> bool
    where
        F: FnMut(&str) -> bool,
    {
        if self.leaves.get(node_id) {
            let key = String::from_utf8_lossy(current).chars().rev().collect::<String>();
            if !f(&key) {
                return false;
            }
        }

        while !self.label_bitmap.get(bm_idx) {
            current.push(self.label(bm_idx, node_id));
            let next_node = self.child_node(bm_idx);
            let next_bm = self.first_edge(next_node);
            if !self.traverse(next_node, next_bm, current, f) {
                return false;
            }
            current.pop();
            bm_idx += 1;
        }
        true
    }

    /// Whether the domain matches; alias used by policy matchers
    pub fn match_domain(&self, domain: &str) -> bool {
        self.has(domain)
    }
}
