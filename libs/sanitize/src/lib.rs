//! Cluster ID normalisation and connection allowlisting.
//!
//! `normal_id` turns an arbitrary user-supplied cluster identifier into the
//! token used both as the registry key and the on-disk state directory name.
//! `Allowlist` is a small host:port / CIDR matcher used upstream of the
//! reverse proxy to constrain which destinations may be dialed.

use std::net::IpAddr;

/// Normalise a cluster ID to `[a-z0-9-]+`, or `"default"` if nothing survives.
///
/// Uppercase is folded to lowercase, `.` and `_` become `-`, every other
/// byte outside `[a-z0-9-]` is dropped. Idempotent: `normal_id(normal_id(s))
/// == normal_id(s)`.
pub fn normal_id(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        let folded = ch.to_ascii_lowercase();
        match folded {
            'a'..='z' | '0'..='9' | '-' => out.push(folded),
            '.' | '_' => out.push('-'),
            _ => {}
        }
    }
    if out.is_empty() {
        "default".to_string()
    } else {
        out
    }
}

/// One allowlist entry: either a host:port pair or a CIDR block (port-agnostic).
#[derive(Debug, Clone)]
enum Entry {
    HostPort { host: String, port: u16 },
    Cidr(ipnet::IpNet),
}

/// Parse error for a single allowlist rule.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("empty allowlist entry")]
    Empty,
    #[error("invalid host:port entry {0:?}")]
    InvalidHostPort(String),
    #[error("invalid CIDR entry {0:?}: {1}")]
    InvalidCidr(String, ipnet::AddrParseError),
}

/// A set of host:port and CIDR rules. An empty allowlist means "no
/// allowlist constraint" — policy is enforced upstream of this component.
#[derive(Debug, Clone, Default)]
pub struct Allowlist {
    entries: Vec<Entry>,
}

impl Allowlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a list of raw rule strings. CIDR entries contain `/`; everything
    /// else is parsed as `host:port`.
    pub fn parse<I, S>(rules: I) -> Result<Self, ParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = Vec::new();
        for raw in rules {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                return Err(ParseError::Empty);
            }
            if raw.contains('/') {
                let net = raw
                    .parse::<ipnet::IpNet>()
                    .map_err(|e| ParseError::InvalidCidr(raw.to_string(), e))?;
                entries.push(Entry::Cidr(net));
            } else {
                let (host, port) = raw
                    .rsplit_once(':')
                    .ok_or_else(|| ParseError::InvalidHostPort(raw.to_string()))?;
                let port: u16 = port
                    .parse()
                    .map_err(|_| ParseError::InvalidHostPort(raw.to_string()))?;
                entries.push(Entry::HostPort {
                    host: host.to_ascii_lowercase(),
                    port,
                });
            }
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `host:port` matches any entry. An empty allowlist
    /// always returns true (no constraint).
    pub fn allowed(&self, host: &str, port: u16) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let host_ip = host.parse::<IpAddr>().ok();
        self.entries.iter().any(|entry| match entry {
            Entry::Cidr(net) => host_ip.is_some_and(|ip| net.contains(&ip)),
            Entry::HostPort {
                host: rule_host,
                port: rule_port,
            } => *rule_port == port && rule_host.eq_ignore_ascii_case(host),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_id_folds_and_strips() {
        assert_eq!(normal_id("My_Cluster.01"), "my-cluster-01");
        assert_eq!(normal_id("C-1"), "c-1");
        assert_eq!(normal_id("c-1"), "c-1");
        assert_eq!(normal_id("!!!"), "default");
        assert_eq!(normal_id(""), "default");
    }

    #[test]
    fn normal_id_is_idempotent() {
        for raw in ["My_Cluster.01", "C-1", "", "!!!", "already-ok"] {
            let once = normal_id(raw);
            let twice = normal_id(&once);
            assert_eq!(once, twice);
            assert!(twice.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        }
    }

    #[test]
    fn empty_allowlist_allows_everything() {
        let list = Allowlist::new();
        assert!(list.allowed("example.com", 443));
    }

    #[test]
    fn host_port_rule_is_case_insensitive_on_host() {
        let list = Allowlist::parse(["Workspace.Svc:8080"]).unwrap();
        assert!(list.allowed("workspace.svc", 8080));
        assert!(!list.allowed("workspace.svc", 8081));
        assert!(!list.allowed("other.svc", 8080));
    }

    #[test]
    fn cidr_rule_matches_ip_literal_hosts_only() {
        let list = Allowlist::parse(["10.0.0.0/8"]).unwrap();
        assert!(list.allowed("10.1.2.3", 9999));
        assert!(!list.allowed("11.1.2.3", 9999));
        assert!(!list.allowed("not-an-ip", 9999));
    }
}
