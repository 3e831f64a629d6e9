//! DNS configuration types
//!
//! Two layers:
//!
//! - [`DnsConfig`]: the serde-facing settings block (kebab-case keys).
//! - [`NameServer`]: one upstream, parsed from a URL string.
//!
//! # Nameserver URLs
//!
//! ```text
//! 8.8.8.8                           udp://8.8.8.8:53
//! [2001:db8::1]:5353                udp://[2001:db8::1]:5353
//! tcp://1.1.1.1                     tcp  1.1.1.1:53
//! tls://dns.google                  tls  dns.google:853
//! https://dns.google/dns-query      https://dns.google:443/dns-query
//! quic://dns.adguard.com            quic dns.adguard.com:853
//! dhcp://en0                        dhcp on interface en0
//! system                            system resolver
//! rcode://refused                   static REFUSED answers
//! tls://1.1.1.1#proxy-a             dialed through proxy "proxy-a"
//! https://dns.google/dns-query#h3=true&ecs=1.2.3.0/24
//! ```
//!
//! The fragment holds `&`-separated tokens: a bare token names a proxy (or,
//! when no such proxy exists, an interface), `key=value` tokens become
//! params. `respect-rules` sets the proxy name to `RULES` for servers that
//! have none.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use url::Url;

use super::client::RCODE_NAMES;
use super::dialer::{ProxyAdapter, RESPECT_RULES};
use crate::cache::CacheAlgorithm;
use crate::error::ConfigError;

/// Default port for plain DNS
pub const DEFAULT_DNS_PORT: u16 = 53;

/// Default port for DNS over TLS and DNS over QUIC
pub const DEFAULT_DOT_PORT: u16 = 853;

/// Default fake-IP range
pub const DEFAULT_FAKE_IP_RANGE: &str = "198.18.0.1/16";

/// Default wait for the AAAA answer in milliseconds
pub const DEFAULT_IPV6_TIMEOUT_MS: u64 = 100;

/// Transport of a nameserver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NameServerNet {
    /// Plain DNS over UDP
    Udp,
    /// Plain DNS over TCP
    Tcp,
    /// DNS over TLS
    Tls,
    /// DNS over HTTPS
    Https,
    /// DNS over QUIC
    Quic,
    /// Servers discovered by DHCP on an interface
    Dhcp,
    /// The operating system's resolvers
    System,
    /// Static response code
    Rcode,
}

impl fmt::Display for NameServerNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
            Self::Tls => "tls",
            Self::Https => "https",
            Self::Quic => "quic",
            Self::Dhcp => "dhcp",
            Self::System => "system",
            Self::Rcode => "rcode",
        };
        f.write_str(s)
    }
}

/// One configured upstream
#[derive(Clone)]
pub struct NameServer {
    /// Transport
    pub net: NameServerNet,
    /// `host:port` for socket transports, the full URL for DoH, the
    /// interface for DHCP, the rcode name for rcode
    pub addr: String,
    /// Interface to bind direct sockets to
    pub interface: Option<String>,
    /// Adapter the connection must traverse
    pub proxy_adapter: Option<Arc<dyn ProxyAdapter>>,
    /// Proxy to look up at dial time, or `RULES`
    pub proxy_name: Option<String>,
    /// Extra `key=value` options from the URL fragment
    pub params: BTreeMap<String, String>,
    /// Race HTTP/3 against TLS for DoH
    pub prefer_h3: bool,
}

impl NameServer {
    /// A plain UDP server at `addr`
    #[must_use]
    pub fn udp(addr: impl Into<String>) -> Self {
        Self::new(NameServerNet::Udp, addr)
    }

    /// A server with no interface, proxy or params
    #[must_use]
    pub fn new(net: NameServerNet, addr: impl Into<String>) -> Self {
        Self {
            net,
            addr: addr.into(),
            interface: None,
            proxy_adapter: None,
            proxy_name: None,
            params: BTreeMap::new(),
            prefer_h3: false,
        }
    }

    /// Whether the server address is a literal IP
    #[must_use]
    pub fn is_ip_based(&self) -> bool {
        match self.net {
            NameServerNet::Udp | NameServerNet::Tcp | NameServerNet::Tls | NameServerNet::Quic => {
                split_host_port(&self.addr).is_some_and(|(host, _)| host.parse::<IpAddr>().is_ok())
            }
            NameServerNet::Https => Url::parse(&self.addr)
                .ok()
                .and_then(|u| u.host_str().map(|h| h.trim_matches(['[', ']']).parse::<IpAddr>().is_ok()))
                .unwrap_or(false),
            NameServerNet::Dhcp | NameServerNet::System | NameServerNet::Rcode => true,
        }
    }
}

impl PartialEq for NameServer {
    fn eq(&self, other: &Self) -> bool {
        let adapter_name = |s: &Self| s.proxy_adapter.as_ref().map(|a| a.name().to_owned());
        self.net == other.net
            && self.addr == other.addr
            && self.interface == other.interface
            && adapter_name(self) == adapter_name(other)
            && self.proxy_name == other.proxy_name
            && self.params == other.params
            && self.prefer_h3 == other.prefer_h3
    }
}

impl Eq for NameServer {}

impl fmt::Debug for NameServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NameServer")
            .field("net", &self.net)
            .field("addr", &self.addr)
            .field("interface", &self.interface)
            .field("proxy_adapter", &self.proxy_adapter.as_ref().map(|a| a.name().to_owned()))
            .field("proxy_name", &self.proxy_name)
            .field("params", &self.params)
            .field("prefer_h3", &self.prefer_h3)
            .finish()
    }
}

impl fmt::Display for NameServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.net {
            NameServerNet::Https => f.write_str(&self.addr),
            net => write!(f, "{net}://{}", self.addr),
        }
    }
}

/// Split `host:port`, accepting a bracketed IPv6 host
pub(crate) fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let (host, port) = addr.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    Some((host, port))
}

fn host_port(url: &Url, default_port: u16) -> Result<String, ConfigError> {
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ConfigError::ValidationError(format!("DNS NameServer missing host: {url}")))?;
    let port = url.port().unwrap_or(default_port);
    Ok(format!("{host}:{port}"))
}

/// Parse one nameserver URL
///
/// # Errors
///
/// Returns `ConfigError::ValidationError` for an unknown scheme, a missing
/// host or an unknown rcode name.
///
/// # Example
///
/// ```
/// use rust_resolver::dns::{parse_nameserver, NameServerNet};
///
/// let ns = parse_nameserver("tls://1.1.1.1#proxy-a&ecs=1.2.3.0/24", false, false).unwrap();
/// assert_eq!(ns.net, NameServerNet::Tls);
/// assert_eq!(ns.addr, "1.1.1.1:853");
/// assert_eq!(ns.proxy_name.as_deref(), Some("proxy-a"));
/// assert_eq!(ns.params.get("ecs").map(String::as_str), Some("1.2.3.0/24"));
/// ```
pub fn parse_nameserver(
    raw: &str,
    respect_rules: bool,
    prefer_h3: bool,
) -> Result<NameServer, ConfigError> {
    let raw = raw.trim();
    let normalized = if raw == "system" {
        "system://".to_owned()
    } else if raw.contains("://") {
        raw.to_owned()
    } else if let Ok(ip) = raw.parse::<IpAddr>() {
        match ip {
            IpAddr::V4(v4) => format!("udp://{v4}"),
            IpAddr::V6(v6) => format!("udp://[{v6}]"),
        }
    } else {
        format!("udp://{raw}")
    };

    let url = Url::parse(&normalized)
        .map_err(|e| ConfigError::ValidationError(format!("DNS NameServer [{raw}] format error: {e}")))?;

    let mut server = match url.scheme() {
        "udp" => NameServer::new(NameServerNet::Udp, host_port(&url, DEFAULT_DNS_PORT)?),
        "tcp" => NameServer::new(NameServerNet::Tcp, host_port(&url, DEFAULT_DNS_PORT)?),
        "tls" => NameServer::new(NameServerNet::Tls, host_port(&url, DEFAULT_DOT_PORT)?),
        "quic" => NameServer::new(NameServerNet::Quic, host_port(&url, DEFAULT_DOT_PORT)?),
        "https" | "http" => {
            let default_port = if url.scheme() == "https" { 443 } else { 80 };
            let host_port = host_port(&url, default_port)?;
            let mut addr = format!("{}://{host_port}{}", url.scheme(), url.path());
            if let Some(query) = url.query() {
                addr.push('?');
                addr.push_str(query);
            }
            let mut server = NameServer::new(NameServerNet::Https, addr);
            server.prefer_h3 = prefer_h3;
            server
        }
        "dhcp" => {
            let iface = url.host_str().unwrap_or_default();
            if iface.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "DNS NameServer [{raw}] missing interface"
                )));
            }
            NameServer::new(NameServerNet::Dhcp, iface)
        }
        "system" => NameServer::new(NameServerNet::System, ""),
        "rcode" => {
            let code = url.host_str().unwrap_or_default().to_ascii_lowercase();
            if !RCODE_NAMES.contains(&code.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "DNS NameServer [{raw}] unsupported rcode: {code}"
                )));
            }
            NameServer::new(NameServerNet::Rcode, code)
        }
        other => {
            return Err(ConfigError::ValidationError(format!(
                "DNS NameServer [{raw}] unsupported scheme: {other}"
            )))
        }
    };

    if let Some(fragment) = url.fragment() {
        for token in fragment.split('&').filter(|t| !t.is_empty()) {
            match token.split_once('=') {
                Some((key, value)) => {
                    server.params.insert(key.to_owned(), value.to_owned());
                }
                None => server.proxy_name = Some(token.to_owned()),
            }
        }
    }

    if respect_rules && server.proxy_name.is_none() && server.proxy_adapter.is_none() {
        server.proxy_name = Some(RESPECT_RULES.to_owned());
    }

    Ok(server)
}

/// Parse a list of nameserver URLs, dropping duplicates
///
/// # Errors
///
/// Returns the first parse error.
pub fn parse_nameservers(
    raw: &[String],
    respect_rules: bool,
    prefer_h3: bool,
) -> Result<Vec<NameServer>, ConfigError> {
    let mut servers: Vec<NameServer> = Vec::with_capacity(raw.len());
    for s in raw {
        let server = parse_nameserver(s, respect_rules, prefer_h3)?;
        if !servers.contains(&server) {
            servers.push(server);
        }
    }
    Ok(servers)
}

/// How resolved addresses are presented to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub enum EnhancedMode {
    /// Real addresses, no reverse mapping
    #[default]
    Normal,
    /// Real addresses with an address → host mapping
    Mapping,
    /// Synthetic addresses from the fake-IP pool
    FakeIp,
}

impl FromStr for EnhancedMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "" | "normal" => Ok(Self::Normal),
            "mapping" | "redir-host" => Ok(Self::Mapping),
            "fake-ip" | "fakeip" => Ok(Self::FakeIp),
            other => Err(format!("unknown enhanced mode: {other}")),
        }
    }
}

impl fmt::Display for EnhancedMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => f.write_str("normal"),
            Self::Mapping => f.write_str("mapping"),
            Self::FakeIp => f.write_str("fake-ip"),
        }
    }
}

impl Serialize for EnhancedMode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EnhancedMode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One `nameserver-policy` entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PolicyEntry {
    /// Domain pattern, `rule-set:<name>` or `geosite:<codes>`
    pub domain: String,
    /// Nameserver URLs serving the matched domains
    #[serde(deserialize_with = "one_or_many")]
    pub nameserver: Vec<String>,
}

/// Conditions that route an answer or a domain to the fallback group
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FallbackFilterConfig {
    /// Answers containing an address in one of these prefixes are rejected
    #[serde(default)]
    pub ipcidr: Vec<String>,
    /// Domains matching these patterns skip the main group
    #[serde(default)]
    pub domain: Vec<String>,
    /// GeoSite codes whose domains skip the main group
    #[serde(default)]
    pub geosite: Vec<String>,
}

/// A hosts entry: one address, several addresses, or a domain alias
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum HostsValue {
    /// A single address or alias
    One(String),
    /// Several addresses
    Many(Vec<String>),
}

impl HostsValue {
    /// Entries as a list
    #[must_use]
    pub fn values(&self) -> Vec<&str> {
        match self {
            Self::One(v) => vec![v.as_str()],
            Self::Many(v) => v.iter().map(String::as_str).collect(),
        }
    }
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match HostsValue::deserialize(deserializer)? {
        HostsValue::One(s) => Ok(vec![s]),
        HostsValue::Many(v) => Ok(v),
    }
}

/// DNS subsystem configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DnsConfig {
    /// Answer AAAA queries and race AAAA in lookups
    #[serde(default)]
    pub ipv6: bool,

    /// How long `lookup_ip` waits for AAAA after A, in milliseconds
    #[serde(default = "default_ipv6_timeout")]
    pub ipv6_timeout: u64,

    /// Race HTTP/3 against TLS for DoH servers
    #[serde(default)]
    pub prefer_h3: bool,

    /// Route upstream connections through the dispatcher's rules
    #[serde(default)]
    pub respect_rules: bool,

    /// Main nameservers
    #[serde(default)]
    pub nameserver: Vec<String>,

    /// Fallback nameservers
    #[serde(default)]
    pub fallback: Vec<String>,

    /// Nameservers resolving other nameservers' hostnames (IP-only)
    #[serde(default)]
    pub default_nameserver: Vec<String>,

    /// Nameservers resolving proxy server hostnames
    #[serde(default)]
    pub proxy_server_nameserver: Vec<String>,

    /// Ordered per-domain nameserver overrides
    #[serde(default)]
    pub nameserver_policy: Vec<PolicyEntry>,

    /// Fallback routing conditions
    #[serde(default)]
    pub fallback_filter: FallbackFilterConfig,

    /// Address presentation mode
    #[serde(default)]
    pub enhanced_mode: EnhancedMode,

    /// Fake-IP prefix, the host part is ignored
    #[serde(default = "default_fake_ip_range")]
    pub fake_ip_range: String,

    /// Domains that never receive a fake address
    #[serde(default)]
    pub fake_ip_filter: Vec<String>,

    /// Keep fake-IP mappings across restarts
    #[serde(default)]
    pub store_fake_ip: bool,

    /// Database file for persisted fake-IP mappings
    #[serde(default)]
    pub fake_ip_store_path: Option<PathBuf>,

    /// Response cache replacement policy
    #[serde(default)]
    pub cache_algorithm: CacheAlgorithm,

    /// Static host entries
    #[serde(default)]
    pub hosts: HashMap<String, HostsValue>,

    /// Named rule-set files (one domain pattern per line)
    #[serde(default)]
    pub rule_sets: HashMap<String, PathBuf>,

    /// GeoSite code → list file
    #[serde(default)]
    pub geosite: HashMap<String, PathBuf>,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            ipv6: false,
            ipv6_timeout: DEFAULT_IPV6_TIMEOUT_MS,
            prefer_h3: false,
            respect_rules: false,
            nameserver: Vec::new(),
            fallback: Vec::new(),
            default_nameserver: Vec::new(),
            proxy_server_nameserver: Vec::new(),
            nameserver_policy: Vec::new(),
            fallback_filter: FallbackFilterConfig::default(),
            enhanced_mode: EnhancedMode::Normal,
            fake_ip_range: default_fake_ip_range(),
            fake_ip_filter: Vec::new(),
            store_fake_ip: false,
            fake_ip_store_path: None,
            cache_algorithm: CacheAlgorithm::Lru,
            hosts: HashMap::new(),
            rule_sets: HashMap::new(),
            geosite: HashMap::new(),
        }
    }
}

const fn default_ipv6_timeout() -> u64 {
    DEFAULT_IPV6_TIMEOUT_MS
}

fn default_fake_ip_range() -> String {
    DEFAULT_FAKE_IP_RANGE.into()
}

impl DnsConfig {
    /// Validate the DNS settings
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - no main nameserver is configured
    /// - any nameserver URL fails to parse
    /// - a default nameserver is not IP-based
    /// - `respect-rules` is set without proxy-server nameservers
    /// - the fake-IP range or a fallback CIDR does not parse
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nameserver.is_empty() {
            return Err(ConfigError::ValidationError(
                "dns.nameserver must have at least one server".into(),
            ));
        }

        parse_nameservers(&self.nameserver, false, self.prefer_h3)?;
        parse_nameservers(&self.fallback, false, self.prefer_h3)?;
        parse_nameservers(&self.proxy_server_nameserver, false, self.prefer_h3)?;
        for entry in &self.nameserver_policy {
            if entry.domain.is_empty() {
                return Err(ConfigError::ValidationError(
                    "dns.nameserver-policy entry has an empty domain".into(),
                ));
            }
            parse_nameservers(&entry.nameserver, false, self.prefer_h3)?;
        }

        for server in parse_nameservers(&self.default_nameserver, false, false)? {
            if !server.is_ip_based() {
                return Err(ConfigError::ValidationError(format!(
                    "dns.default-nameserver only supports IP-based servers: {server}"
                )));
            }
        }

        if self.respect_rules && self.proxy_server_nameserver.is_empty() {
            return Err(ConfigError::ValidationError(
                "dns.respect-rules needs dns.proxy-server-nameserver".into(),
            ));
        }

        self.fake_ip_net()?;
        for cidr in &self.fallback_filter.ipcidr {
            cidr.parse::<IpNet>().map_err(|e| {
                ConfigError::ValidationError(format!("dns.fallback-filter.ipcidr [{cidr}]: {e}"))
            })?;
        }

        Ok(())
    }

    /// The fake-IP prefix, truncated to its network
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if the range does not parse.
    pub fn fake_ip_net(&self) -> Result<IpNet, ConfigError> {
        self.fake_ip_range
            .parse::<IpNet>()
            .map(|net| net.trunc())
            .map_err(|e| {
                ConfigError::ValidationError(format!(
                    "dns.fake-ip-range [{}]: {e}",
                    self.fake_ip_range
                ))
            })
    }

    /// AAAA wait as a duration
    #[must_use]
    pub fn ipv6_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ipv6_timeout)
    }
}
