//! Domain matchers
//!
//! Two structures share one matching language:
//!
//! - [`DomainTrie`]: a mutable label trie carrying a payload per domain,
//!   used for nameserver policies, fallback filters, hosts and the fake-IP
//!   skip list.
//! - [`DomainSet`]: an immutable succinct (LOUDS-style) encoding built from a
//!   trie snapshot, used for large rule-set and GeoSite lists.
//!
//! # Pattern syntax
//!
//! | Pattern          | Matches                                   |
//! |------------------|-------------------------------------------|
//! | `www.example.com`| exactly that name                         |
//! | `*.example.com`  | one label in front of `example.com`       |
//! | `.example.com`   | any number (≥ 1) of labels in front       |
//! | `+.example.com`  | `example.com` itself and every subdomain  |
//!
//! Lookup priority is exact label, then `*`, then dot-wildcard.
//!
//! # Example
//!
//! ```
//! use rust_resolver::trie::DomainTrie;
//!
//! let mut trie = DomainTrie::new();
//! trie.insert("+.google.com", "google").unwrap();
//! trie.insert("*.example.com", "example").unwrap();
//!
//! assert_eq!(trie.search("google.com"), Some(&"google"));
//! assert_eq!(trie.search("mail.google.com"), Some(&"google"));
//! assert_eq!(trie.search("a.b.example.com"), None);
//!
//! let set = trie.new_domain_set().unwrap();
//! assert!(set.has("www.example.com"));
//! ```

mod bitmap;
mod domain;
mod domain_set;

pub use domain::{valid_and_split_domain, DomainTrie};
pub use domain_set::DomainSet;

/// Single-label wildcard
pub(crate) const WILDCARD: &str = "*";

/// Pseudo-label under which `.suffix` entries are stored
pub(crate) const DOT_WILDCARD: &str = "";

/// Prefix expanding to both the bare suffix and its dot-wildcard
pub(crate) const COMPLEX_WILDCARD: &str = "+";

/// Label separator
pub(crate) const DOMAIN_STEP: &str = ".";
