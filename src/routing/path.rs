//! Inbound path parsing and upstream URL composition.
//!
//! Inbound:  `/proxy/{serviceId}/{*path}?{query}`
//! Upstream: `{baseUrl}{path or "/"}?{query}`

pub const PROXY_PREFIX: &str = "/proxy/";

/// Split an inbound path into `(service_id, rest)`.
///
/// Returns `None` when the path is not under `/proxy/` or the service
/// segment is empty. `rest` keeps its leading slash (or is empty).
pub fn split_proxy_path(path: &str) -> Option<(&str, &str)> {
    let tail = path.strip_prefix(PROXY_PREFIX)?;
    let (service_id, rest) = match tail.find('/') {
        Some(idx) => tail.split_at(idx),
        None => (tail, ""),
    };
    if service_id.is_empty() {
        return None;
    }
    Some((service_id, rest))
}

/// The path forwarded upstream: the inbound path with `/proxy/{serviceId}`
/// stripped. An empty remainder becomes `/`.
pub fn forwarded_path<'a>(service_id: &str, inbound_path: &'a str) -> &'a str {
    let rest = inbound_path
        .strip_prefix(PROXY_PREFIX)
        .and_then(|tail| tail.strip_prefix(service_id))
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or(inbound_path);
    if rest.is_empty() {
        "/"
    } else {
        rest
    }
}

/// Compose the full backend URL. The query string is appended unchanged.
pub fn target_url(base_url: &str, forwarded_path: &str, query: Option<&str>) -> String {
    let base = base_url.trim_end_matches('/');
    let mut url = String::with_capacity(target_url_capacity(base, forwarded_path, query));
    url.push_str(base);
    if !forwarded_path.starts_with('/') {
        url.push('/');
    }
    url.push_str(forwarded_path);
    if let Some(q) = query {
        url.push('?');
        url.push_str(q);
    }
    url
}

#[inline]
fn target_url_capacity(base: &str, path: &str, query: Option<&str>) -> usize {
    base.len() + path.len() + 2 + query.map(str::len).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_proxy_path() {
        assert_eq!(
            split_proxy_path("/proxy/user-service/api/users/1"),
            Some(("user-service", "/api/users/1"))
        );
        assert_eq!(split_proxy_path("/proxy/user-service"), Some(("user-service", "")));
        assert_eq!(split_proxy_path("/proxy/user-service/"), Some(("user-service", "/")));
        assert_eq!(split_proxy_path("/proxy/"), None);
        assert_eq!(split_proxy_path("/proxy//api"), None);
        assert_eq!(split_proxy_path("/api/users"), None);
        assert_eq!(split_proxy_path("/proxyuser/x"), None);
    }

    #[test]
    fn test_forwarded_path_strips_prefix() {
        assert_eq!(
            forwarded_path("user-service", "/proxy/user-service/api/users/1"),
            "/api/users/1"
        );
    }

    #[test]
    fn test_forwarded_path_empty_defaults_to_root() {
        assert_eq!(forwarded_path("user-service", "/proxy/user-service"), "/");
        assert_eq!(forwarded_path("user-service", "/proxy/user-service/"), "/");
    }

    #[test]
    fn test_forwarded_path_requires_segment_boundary() {
        assert_eq!(
            forwarded_path("user", "/proxy/user-service/x"),
            "/proxy/user-service/x"
        );
    }

    #[test]
    fn test_target_url_with_query() {
        assert_eq!(
            target_url("http://localhost:8081", "/api/search", Some("q=test&page=2")),
            "http://localhost:8081/api/search?q=test&page=2"
        );
    }

    #[test]
    fn test_target_url_without_query() {
        assert_eq!(
            target_url("http://localhost:8081/", "/api/users/1", None),
            "http://localhost:8081/api/users/1"
        );
    }

    #[test]
    fn test_target_url_root() {
        assert_eq!(target_url("http://backend", "/", None), "http://backend/");
    }
}
