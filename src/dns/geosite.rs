//! Domain list files for rule-set and GeoSite policies
//!
//! Both formats are plain text, one entry per line, `#` starting a comment.
//!
//! Rule-set lines use the trie pattern syntax directly:
//!
//! ```text
//! example.com
//! +.google.com
//! *.cdn.example
//! ```
//!
//! GeoSite lines carry a type prefix; a bare domain means `domain:`:
//!
//! ```text
//! full:www.example.com     exactly this name
//! domain:example.org       the name and all subdomains
//! example.net              same as domain:
//! keyword:ads              not supported, skipped
//! regexp:^ad\d+\.          not supported, skipped
//! ```
//!
//! Trailing ` @attr` tags are ignored. Invalid lines are skipped with a
//! warning. Each file compiles to an immutable [`DomainSet`].

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::error::{DnsError, DnsResult};
use crate::trie::{DomainSet, DomainTrie};

/// Line syntax of a domain list file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFormat {
    /// Trie patterns
    RuleSet,
    /// Typed GeoSite entries
    GeoSite,
}

fn pattern_for(line: &str, format: ListFormat) -> Option<String> {
    let entry = line.split_whitespace().next()?;
    match format {
        ListFormat::RuleSet => Some(entry.to_owned()),
        ListFormat::GeoSite => match entry.split_once(':') {
            Some(("full", domain)) => Some(domain.to_owned()),
            Some(("domain", domain)) => Some(format!("+.{domain}")),
            Some((kind, _)) => {
                warn!(entry, kind, "unsupported geosite entry type, skipping");
                None
            }
            None => Some(format!("+.{entry}")),
        },
    }
}

/// Compile list text into a domain set
///
/// Returns `None` when no valid entry remains.
#[must_use]
pub fn parse_domain_list(text: &str, format: ListFormat) -> Option<DomainSet> {
    let mut trie: DomainTrie<()> = DomainTrie::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some(pattern) = pattern_for(line, format) else {
            continue;
        };
        if let Err(e) = trie.insert(&pattern, ()) {
            warn!(entry = %pattern, error = %e, "invalid domain list entry, skipping");
        }
    }
    trie.new_domain_set()
}

/// Read and compile a list file
///
/// # Errors
///
/// Returns `DnsError::ConfigError` if the file cannot be read.
pub fn load_domain_list(path: &Path, format: ListFormat) -> DnsResult<Option<DomainSet>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        DnsError::config(format!("read domain list {}: {e}", path.display()))
    })?;
    let set = parse_domain_list(&text, format);
    debug!(path = %path.display(), empty = set.is_none(), "loaded domain list");
    Ok(set)
}

/// Domains of one GeoSite code
pub struct GeoSiteMatcher {
    code: String,
    set: Option<Arc<DomainSet>>,
}

impl fmt::Debug for GeoSiteMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeoSiteMatcher")
            .field("code", &self.code)
            .field("empty", &self.set.is_none())
            .finish()
    }
}

impl GeoSiteMatcher {
    /// Matcher over an already compiled set
    #[must_use]
    pub fn new(code: impl Into<String>, set: Option<DomainSet>) -> Self {
        Self {
            code: code.into(),
            set: set.map(Arc::new),
        }
    }

    /// GeoSite code, lowercase
    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Whether `domain` belongs to the code
    #[must_use]
    pub fn match_domain(&self, domain: &str) -> bool {
        self.set.as_ref().is_some_and(|s| s.match_domain(domain))
    }
}

/// GeoSite code → list file, compiled on first use
#[derive(Debug, Default)]
pub struct GeoSiteDb {
    files: HashMap<String, PathBuf>,
    loaded: Mutex<HashMap<String, Arc<GeoSiteMatcher>>>,
}

impl GeoSiteDb {
    /// Database over the given files, keyed case-insensitively
    #[must_use]
    pub fn new(files: &HashMap<String, PathBuf>) -> Self {
        Self {
            files: files
                .iter()
                .map(|(code, path)| (code.to_ascii_lowercase(), path.clone()))
                .collect(),
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Matcher for `code`
    ///
    /// # Errors
    ///
    /// Returns `DnsError::ConfigError` for an unknown code or an unreadable
    /// file.
    pub fn matcher(&self, code: &str) -> DnsResult<Arc<GeoSiteMatcher>> {
        let code = code.trim().to_ascii_lowercase();
        if let Some(matcher) = self.loaded.lock().get(&code) {
            return Ok(Arc::clone(matcher));
        }

        let path = self
            .files
            .get(&code)
            .ok_or_else(|| DnsError::config_field(format!("unknown geosite code: {code}"), "geosite"))?;
        let set = load_domain_list(path, ListFormat::GeoSite)?;
        let matcher = Arc::new(GeoSiteMatcher::new(code.clone(), set));
        self.loaded.lock().insert(code, Arc::clone(&matcher));
        Ok(matcher)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_rule_set_patterns() {
        let set = parse_domain_list(
            "# comment\n\nexample.com\n+.google.com\n*.cdn.example\n",
            ListFormat::RuleSet,
        )
        .unwrap();
        assert!(set.has("example.com"));
        assert!(!set.has("www.example.com"));
        assert!(set.has("google.com"));
        assert!(set.has("mail.google.com"));
        assert!(set.has("img.cdn.example"));
        assert!(!set.has("a.img.cdn.example"));
    }

    #[test]
    fn test_geosite_typed_entries() {
        let set = parse_domain_list(
            "full:www.example.com\ndomain:example.org @ads\nexample.net\nkeyword:ads\nregexp:^ad\\d+\n",
            ListFormat::GeoSite,
        )
        .unwrap();
        assert!(set.has("www.example.com"));
        assert!(!set.has("example.com"));
        assert!(set.has("example.org"));
        assert!(set.has("a.b.example.org"));
        assert!(set.has("example.net"));
        assert!(!set.has("ads.com"));
    }

    #[test]
    fn test_invalid_entries_skipped() {
        let set = parse_domain_list("bad..domain\ntrailing.dot.\nok.com\n", ListFormat::RuleSet)
            .unwrap();
        assert!(set.has("ok.com"));

        assert!(parse_domain_list("keyword:x\n", ListFormat::GeoSite).is_none());
    }

    #[test]
    fn test_geosite_db_loads_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "domain:baidu.com").unwrap();

        let mut files = HashMap::new();
        files.insert("CN".to_string(), file.path().to_path_buf());
        let db = GeoSiteDb::new(&files);

        let first = db.matcher("cn").unwrap();
        let second = db.matcher("CN").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(first.match_domain("www.baidu.com"));
        assert_eq!(first.code(), "cn");

        assert!(db.matcher("private").is_err());
    }
}
