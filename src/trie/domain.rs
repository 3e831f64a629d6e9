//! Label trie over reversed domain labels

use std::collections::HashMap;

use super::domain_set::DomainSet;
use super::{COMPLEX_WILDCARD, DOMAIN_STEP, DOT_WILDCARD, WILDCARD};
use crate::dns::error::{DnsError, DnsResult};

/// Validate a domain pattern and split it into lowercase labels
///
/// Rejected:
/// - the empty string
/// - a trailing `.`
/// - any empty label other than a single leading one (the `.suffix` form)
///
/// # Example
///
/// ```
/// use rust_resolver::trie::valid_and_split_domain;
///
/// assert_eq!(
///     valid_and_split_domain(".Example.org"),
///     Some(vec![String::new(), "example".into(), "org".into()])
/// );
/// assert_eq!(valid_and_split_domain("..dev"), None);
/// assert_eq!(valid_and_split_domain("example.com."), None);
/// ```
pub fn valid_and_split_domain(domain: &str) -> Option<Vec<String>> {
    if domain.ends_with('.') {
        return None;
    }

    let lowered = domain.to_lowercase();
    let parts: Vec<String> = lowered.split(DOMAIN_STEP).map(str::to_owned).collect();
    if parts.len() == 1 {
        if parts[0].is_empty() {
            return None;
        }
        return Some(parts);
    }

    if parts[1..].iter().any(String::is_empty) {
        return None;
    }

    Some(parts)
}

#[derive(Debug, Clone)]
struct Node<T> {
    children: HashMap<String, Node<T>>,
    data: Option<T>,
}

impl<T> Node<T> {
    fn new() -> Self {
        Self {
            children: HashMap::new(),
            data: None,
        }
    }

    fn child(&self, label: &str) -> Option<&Node<T>> {
        self.children.get(label)
    }
}

/// Domain trie with wildcard support
///
/// Stores a payload per domain pattern. Labels are kept right-to-left so
/// `www.example.com` lives at `com -> example -> www`.
///
/// A node without payload never matches: a search that ends on such a node
/// keeps backtracking through the `*` and dot-wildcard alternatives.
#[derive(Debug, Clone)]
pub struct DomainTrie<T> {
    root: Node<T>,
    len: usize,
}

impl<T> Default for DomainTrie<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> DomainTrie<T> {
    /// Create an empty trie
    pub fn new() -> Self {
        Self {
            root: Node::new(),
            len: 0,
        }
    }

    /// Insert a domain pattern
    ///
    /// Supported forms:
    /// 1. `www.example.com`
    /// 2. `*.example.com`
    /// 3. `subdomain.*.example.com`
    /// 4. `.example.com`
    /// 5. `+.example.com`
    ///
    /// Inserting an existing pattern replaces its payload.
    ///
    /// # Errors
    ///
    /// Returns `DnsError::InvalidDomain` if the pattern fails
    /// [`valid_and_split_domain`].
    pub fn insert(&mut self, domain: &str, data: T) -> DnsResult<()>
    where
        T: Clone,
    {
        let mut parts =
            valid_and_split_domain(domain).ok_or_else(|| DnsError::invalid_domain(domain))?;

        if parts[0] == COMPLEX_WILDCARD {
            self.insert_parts(&parts[1..], data.clone());
            parts[0] = DOT_WILDCARD.to_owned();
        }
        self.insert_parts(&parts, data);

        Ok(())
    }

    fn insert_parts(&mut self, parts: &[String], data: T) {
        let mut node = &mut self.root;
        for part in parts.iter().rev() {
            node = node
                .children
                .entry(part.clone())
                .or_insert_with(Node::new);
        }
        if node.data.replace(data).is_none() {
            self.len += 1;
        }
    }

    /// Look up the payload for a concrete domain
    ///
    /// Priority:
    /// 1. static label
    /// 2. `*` wildcard
    /// 3. dot wildcard
    pub fn search(&self, domain: &str) -> Option<&T> {
        let parts = valid_and_split_domain(domain)?;
        if parts[0].is_empty() {
            return None;
        }

        search_node(&self.root, &parts)?.data.as_ref()
    }

    /// Visit every stored pattern with its payload
    ///
    /// Dot-wildcard entries are reported as `+.suffix`. Returning `false`
    /// from `f` stops the walk.
    pub fn foreach<F>(&self, mut f: F)
    where
        F: FnMut(&str, &T) -> bool,
    {
        let mut labels = Vec::new();
        walk(&self.root, &mut labels, &mut f);
    }

    /// Number of stored patterns (a `+.` entry counts twice)
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no pattern is stored
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Build an immutable [`DomainSet`] with the same match semantics
    ///
    /// Returns `None` for an empty trie.
    pub fn new_domain_set(&self) -> Option<DomainSet> {
        let mut keys = Vec::with_capacity(self.len);
        self.foreach(|domain, _| {
            keys.push(domain.chars().rev().collect::<String>());
            true
        });
        DomainSet::from_reversed_keys(keys)
    }
}

fn search_node<'a, T>(node: &'a Node<T>, parts: &[String]) -> Option<&'a Node<T>> {
    let Some((last, rest)) = parts.split_last() else {
        return Some(node);
    };

    if let Some(child) = node.child(last) {
        if let Some(found) = search_node(child, rest).filter(|n| n.data.is_some()) {
            return Some(found);
        }
    }

    if let Some(child) = node.child(WILDCARD) {
        if let Some(found) = search_node(child, rest).filter(|n| n.data.is_some()) {
            return Some(found);
        }
    }

    node.child(DOT_WILDCARD)
}

fn walk<T, F>(node: &Node<T>, labels: &mut Vec<String>, f: &mut F) -> bool
where
    F: FnMut(&str, &T) -> bool,
{
    for (label, child) in &node.children {
        labels.push(label.clone());
        if let Some(data) = child.data.as_ref() {
            let mut domain = labels
                .iter()
                .rev()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(DOMAIN_STEP);
            if domain.starts_with(DOMAIN_STEP) {
                domain.insert_str(0, COMPLEX_WILDCARD);
            }
            if !f(&domain, data) {
                return false;
            }
        }
        let keep_going = walk(child, labels, f);
        labels.pop();
        if !keep_going {
            return false;
        }
    }
    true
}
