//! Parses the three request shapes the reverse proxy accepts into a single
//! [`ProxyTarget`] and computes the base prefix used by response rewriting.

use std::collections::HashMap;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl ProxyTarget {
    pub fn hostport(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_scheme_for_port(port: u16) -> &'static str {
    match port {
        443 | 8443 => "https",
        _ => "http",
    }
}

fn split_hostport(hostport: &str) -> Result<(String, u16)> {
    let (host, port) = hostport
        .rsplit_once(':')
        .ok_or_else(|| Error::InvalidAddress(format!("missing port in {hostport:?}")))?;
    if host.is_empty() {
        return Err(Error::InvalidAddress(format!("missing host in {hostport:?}")));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| Error::InvalidAddress(format!("invalid port in {hostport:?}")))?;
    if port == 0 {
        return Err(Error::InvalidAddress(format!("port out of range in {hostport:?}")));
    }
    Ok((host.to_string(), port))
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidAddress(format!("path {path:?} must start with /")));
    }
    Ok(())
}

fn validate_scheme(scheme: &str) -> Result<()> {
    match scheme {
        "http" | "https" => Ok(()),
        other => Err(Error::InvalidAddress(format!("unsupported scheme {other:?}"))),
    }
}

/// Form 1: `/proxy?to=<host:port>&path=/&scheme=http|https`.
pub fn from_query(query: &HashMap<String, String>) -> Result<ProxyTarget> {
    let hostport = query
        .get("to")
        .ok_or_else(|| Error::InvalidAddress("missing `to` query parameter".to_string()))?;
    let (host, port) = split_hostport(hostport)?;
    let path = query.get("path").cloned().unwrap_or_else(|| "/".to_string());
    validate_path(&path)?;
    let scheme = query
        .get("scheme")
        .cloned()
        .unwrap_or_else(|| default_scheme_for_port(port).to_string());
    validate_scheme(&scheme)?;
    Ok(ProxyTarget { scheme, host, port, path })
}

/// Form 2: `/proxy/<host:port>/<rest>`.
pub fn from_path(remainder: &str) -> Result<ProxyTarget> {
    let remainder = remainder.trim_start_matches('/');
    let (hostport, rest) = remainder.split_once('/').unwrap_or((remainder, ""));
    let (host, port) = split_hostport(hostport)?;
    let path = format!("/{rest}");
    validate_path(&path)?;
    Ok(ProxyTarget {
        scheme: default_scheme_for_port(port).to_string(),
        host,
        port,
        path,
    })
}

/// Resolves form 3 (`/proxy/server/<id>/<rest>`) given a caller-supplied
/// resolution of the logical server id to `(scheme, hostport, path)`.
pub fn from_resolved(scheme: String, hostport: String, path: String) -> Result<ProxyTarget> {
    validate_scheme(&scheme)?;
    validate_path(&path)?;
    let (host, port) = split_hostport(&hostport)?;
    Ok(ProxyTarget { scheme, host, port, path })
}

/// Finds the longest suffix of `full_path` starting with `/proxy/server/<id>`
/// or `/proxy/<host:port>`, and returns the prefix that precedes it. Any
/// outer prefix (e.g. `/api/cluster/<id>`) is preserved verbatim, which is
/// what makes this the single source of truth for Location/cookie rewrites.
pub fn base_prefix_from_path(full_path: &str) -> String {
    let markers = ["/proxy/server/", "/proxy/"];
    for marker in markers {
        if let Some(idx) = full_path.find(marker) {
            let after_marker = &full_path[idx + marker.len()..];
            let segment_end = after_marker.find('/').unwrap_or(after_marker.len());
            return full_path[..idx + marker.len() + segment_end].to_string();
        }
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_form_defaults_path_and_scheme_by_port() {
        let mut q = HashMap::new();
        q.insert("to".to_string(), "workspace-1:8443".to_string());
        let target = from_query(&q).unwrap();
        assert_eq!(target.scheme, "https");
        assert_eq!(target.path, "/");
    }

    #[test]
    fn query_form_rejects_relative_path() {
        let mut q = HashMap::new();
        q.insert("to".to_string(), "host:80".to_string());
        q.insert("path".to_string(), "rel".to_string());
        assert!(from_query(&q).is_err());
    }

    #[test]
    fn query_form_rejects_invalid_scheme() {
        let mut q = HashMap::new();
        q.insert("to".to_string(), "host:80".to_string());
        q.insert("scheme".to_string(), "ftp".to_string());
        assert!(from_query(&q).is_err());
    }

    #[test]
    fn path_form_splits_hostport_and_rest() {
        let target = from_path("host:9000/a/b").unwrap();
        assert_eq!(target.host, "host");
        assert_eq!(target.port, 9000);
        assert_eq!(target.path, "/a/b");
        assert_eq!(target.scheme, "http");
    }

    #[test]
    fn path_form_with_no_rest_targets_root() {
        let target = from_path("host:9000").unwrap();
        assert_eq!(target.path, "/");
    }

    #[test]
    fn split_hostport_rejects_port_zero() {
        assert!(split_hostport("host:0").is_err());
    }

    #[test]
    fn base_prefix_finds_server_form() {
        let prefix = base_prefix_from_path("/api/cluster/clid/proxy/server/ws-1/some/rest");
        assert_eq!(prefix, "/api/cluster/clid/proxy/server/ws-1");
    }

    #[test]
    fn base_prefix_finds_hostport_form() {
        let prefix = base_prefix_from_path("/proxy/host:8080/rest");
        assert_eq!(prefix, "/proxy/host:8080");
    }

    #[test]
    fn base_prefix_empty_when_no_marker() {
        assert_eq!(base_prefix_from_path("/api/db"), "");
    }
}
