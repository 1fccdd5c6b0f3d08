//! Response rewriting for iframe-safe embedding (spec §4.9). Every function
//! here is pure: given headers and a base prefix, produce the rewritten
//! value. The HTTP-layer glue (`handler.rs`) is the only place that touches
//! an actual response.

/// Rewrites the `frame-ancestors` directive of a CSP value to `*`,
/// preserving every other directive. Returns a fresh value to set when no
/// CSP header was present.
pub fn rewrite_csp(existing: Option<&str>) -> String {
    let Some(existing) = existing else {
        return "frame-ancestors *".to_string();
    };
    let mut directives: Vec<String> = Vec::new();
    let mut replaced = false;
    for directive in existing.split(';') {
        let trimmed = directive.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.starts_with("frame-ancestors") {
            directives.push("frame-ancestors *".to_string());
            replaced = true;
        } else {
            directives.push(trimmed.to_string());
        }
    }
    if !replaced {
        directives.push("frame-ancestors *".to_string());
    }
    directives.join("; ")
}

/// Rewrites a `Location` header so it stays rooted under `base_prefix`.
/// Absolute URLs keep only their path; root-relative paths get the prefix
/// prepended; anything else is joined as a relative path.
pub fn rewrite_location(location: &str, base_prefix: &str) -> String {
    let path = if let Some(idx) = location.find("://") {
        match location[idx + 3..].find('/') {
            Some(slash) => &location[idx + 3 + slash..],
            None => "/",
        }
    } else {
        location
    };

    if let Some(stripped) = path.strip_prefix('/') {
        format!("{base_prefix}/{stripped}")
    } else {
        format!("{base_prefix}/{path}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetCookie {
    pub attributes: Vec<(String, Option<String>)>,
}

/// Parses, rewrites, and re-serializes a single `Set-Cookie` header value:
/// drop `Domain`, force `Secure`/`SameSite=None`/`Partitioned`, and coerce
/// `Path` to `base_prefix_path` (or `/` if the prefix is empty).
pub fn rewrite_set_cookie(value: &str, base_prefix_path: &str) -> String {
    let mut name_value = None;
    let mut attrs: Vec<(String, Option<String>)> = Vec::new();

    for (i, part) in value.split(';').enumerate() {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            name_value = Some(part.to_string());
            continue;
        }
        let (key, val) = match part.split_once('=') {
            Some((k, v)) => (k.trim().to_string(), Some(v.trim().to_string())),
            None => (part.to_string(), None),
        };
        let lower = key.to_ascii_lowercase();
        if lower == "domain" || lower == "path" || lower == "secure" || lower == "samesite" || lower == "partitioned" {
            continue;
        }
        attrs.push((key, val));
    }

    let cookie_path = if base_prefix_path.is_empty() { "/" } else { base_prefix_path };
    let mut out = name_value.unwrap_or_default();
    for (key, val) in attrs {
        match val {
            Some(v) => out.push_str(&format!("; {key}={v}")),
            None => out.push_str(&format!("; {key}")),
        }
    }
    out.push_str(&format!("; Path={cookie_path}"));
    out.push_str("; Secure; SameSite=None; Partitioned");
    out
}

/// Header names that should be removed entirely from the upstream response
/// (spec §4.9: `X-Frame-Options`, `Content-Security-Policy` handled
/// separately, COEP dropped outright).
pub const HEADERS_TO_STRIP: &[&str] = &["x-frame-options", "cross-origin-embedder-policy"];

/// Fixed header values set unconditionally on every rewritten response.
pub const FIXED_HEADERS: &[(&str, &str)] = &[
    ("cross-origin-opener-policy", "same-origin-allow-popups"),
    ("cross-origin-resource-policy", "cross-origin"),
];

pub fn service_worker_allowed(base_prefix: &str) -> String {
    if base_prefix.is_empty() {
        "/".to_string()
    } else {
        base_prefix.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_csp_preserves_other_directives() {
        let rewritten = rewrite_csp(Some("default-src 'self'; frame-ancestors 'none'"));
        assert_eq!(rewritten, "default-src 'self'; frame-ancestors *");
    }

    #[test]
    fn rewrite_csp_appends_when_directive_absent() {
        let rewritten = rewrite_csp(Some("default-src 'self'"));
        assert_eq!(rewritten, "default-src 'self'; frame-ancestors *");
    }

    #[test]
    fn rewrite_csp_sets_default_when_header_absent() {
        assert_eq!(rewrite_csp(None), "frame-ancestors *");
    }

    #[test]
    fn rewrite_location_strips_scheme_and_host_from_absolute_url() {
        let rewritten = rewrite_location("https://workspace:8080/app/page", "/proxy/host:8080");
        assert_eq!(rewritten, "/proxy/host:8080/app/page");
    }

    #[test]
    fn rewrite_location_prefixes_root_relative_path() {
        assert_eq!(rewrite_location("/page", "/proxy/host:8080"), "/proxy/host:8080/page");
    }

    #[test]
    fn rewrite_location_joins_relative_path() {
        assert_eq!(rewrite_location("page", "/proxy/host:8080"), "/proxy/host:8080/page");
    }

    #[test]
    fn rewrite_set_cookie_drops_domain_and_forces_security_attributes() {
        let rewritten = rewrite_set_cookie(
            "sid=abc123; Domain=workspace.internal; Path=/old; HttpOnly",
            "/proxy/host:8080",
        );
        assert!(rewritten.starts_with("sid=abc123"));
        assert!(rewritten.contains("HttpOnly"));
        assert!(!rewritten.contains("Domain"));
        assert!(rewritten.contains("Path=/proxy/host:8080"));
        assert!(rewritten.contains("Secure"));
        assert!(rewritten.contains("SameSite=None"));
        assert!(rewritten.contains("Partitioned"));
    }

    #[test]
    fn rewrite_set_cookie_defaults_path_to_root_for_empty_prefix() {
        let rewritten = rewrite_set_cookie("sid=abc", "");
        assert!(rewritten.contains("Path=/"));
    }
}
