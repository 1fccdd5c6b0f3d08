//! Builds the forwarded-header set and decides, for a given request path,
//! whether the API-server-proxy transport applies.

use crate::address::ProxyTarget;

pub const CONTROL_PARAMS: &[&str] = &["to", "path", "scheme"];

/// `true` when `path` (already stripped of `base_prefix`) falls under
/// `/api/` or `/apis/`, the shapes the Kubernetes API-server-proxy rewrites.
pub fn is_api_server_proxy_path(path: &str) -> bool {
    path.starts_with("/api/") || path.starts_with("/apis/")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedHeaders {
    pub host: String,
    pub proto: String,
    pub prefix: String,
}

pub fn forwarded_headers(original_host: &str, original_proto: &str, base_prefix: &str) -> ForwardedHeaders {
    ForwardedHeaders {
        host: original_host.to_string(),
        proto: original_proto.to_string(),
        prefix: base_prefix.to_string(),
    }
}

/// Strips `to`/`path`/`scheme` from a raw query string, since those are
/// proxy control parameters, not parameters meant for the upstream.
pub fn strip_control_params(query: &str) -> String {
    query
        .split('&')
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("");
            !CONTROL_PARAMS.contains(&key)
        })
        .collect::<Vec<_>>()
        .join("&")
}

/// Rewrites the outbound request URI for the non-API-server-proxy path:
/// scheme/host set directly from the resolved target, with the base prefix
/// stripped off the incoming path.
pub fn rewrite_direct_uri(target: &ProxyTarget, incoming_path: &str, base_prefix: &str, query: &str) -> String {
    let remainder = incoming_path.strip_prefix(base_prefix).unwrap_or(incoming_path);
    let remainder = if remainder.is_empty() { "/" } else { remainder };
    let stripped_query = strip_control_params(query);
    let mut uri = format!("{}://{}{}{}", target.scheme, target.hostport(), target.path.trim_end_matches('/'), remainder);
    if !stripped_query.is_empty() {
        uri.push('?');
        uri.push_str(&stripped_query);
    }
    uri
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> ProxyTarget {
        ProxyTarget {
            scheme: "http".to_string(),
            host: "workspace-1".to_string(),
            port: 8080,
            path: "/".to_string(),
        }
    }

    #[test]
    fn api_server_proxy_path_detection() {
        assert!(is_api_server_proxy_path("/api/v1/pods"));
        assert!(is_api_server_proxy_path("/apis/apps/v1"));
        assert!(!is_api_server_proxy_path("/app/page"));
    }

    #[test]
    fn strip_control_params_removes_only_known_keys() {
        assert_eq!(strip_control_params("to=x&path=/&scheme=http&tab=1"), "tab=1");
    }

    #[test]
    fn rewrite_direct_uri_strips_base_prefix() {
        let uri = rewrite_direct_uri(&target(), "/proxy/workspace-1:8080/app/page", "/proxy/workspace-1:8080", "tab=1");
        assert_eq!(uri, "http://workspace-1:8080/app/page?tab=1");
    }

    #[test]
    fn rewrite_direct_uri_defaults_to_root() {
        let uri = rewrite_direct_uri(&target(), "/proxy/workspace-1:8080", "/proxy/workspace-1:8080", "");
        assert_eq!(uri, "http://workspace-1:8080/");
    }
}
