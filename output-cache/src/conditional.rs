//! §4.8: does a cached response count as "not modified" relative to the request.

use http::HeaderMap;

use crate::entry::CachedResponse;

/// True if the cached response should be served as `304 Not Modified` instead of
/// replaying its body, per §4.8's `If-None-Match`/`If-Modified-Since` precedence.
pub fn is_not_modified(
    request_headers: &HeaderMap,
    cached: &CachedResponse,
) -> bool {
    if let Some(if_none_match) = request_headers
        .get(http::header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
    {
        return matches_if_none_match(if_none_match, cached.header("etag"));
    }

    if let Some(if_modified_since) = request_headers
        .get(http::header::IF_MODIFIED_SINCE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
    {
        let cached_last_modified = cached
            .header("last-modified")
            .or_else(|| cached.header("date"))
            .and_then(|v| httpdate::parse_http_date(v).ok());
        return cached_last_modified
            .is_some_and(|lm| lm <= if_modified_since);
    }

    false
}

fn matches_if_none_match(if_none_match: &str, cached_etag: Option<&str>) -> bool {
    if if_none_match.trim() == "*" {
        return true;
    }
    let Some(cached_etag) = cached_etag else {
        return false;
    };
    if_none_match
        .split(',')
        .map(str::trim)
        .any(|candidate| weak_etag_eq(candidate, cached_etag))
}

/// RFC 9110 weak comparison: compare validators after stripping any `W/` prefix.
fn weak_etag_eq(a: &str, b: &str) -> bool {
    a.trim_start_matches("W/").trim() == b.trim_start_matches("W/").trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::SystemTime;

    fn cached(etag: &str) -> CachedResponse {
        let mut headers = HashMap::new();
        headers.insert("etag".to_string(), vec![etag.to_string()]);
        CachedResponse {
            created: SystemTime::now(),
            status: 200,
            headers,
            body: vec![],
        }
    }

    fn headers(name: &str, value: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert(
            http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
            value.parse().unwrap(),
        );
        map
    }

    #[test]
    fn star_matches_any_etag() {
        assert!(is_not_modified(&headers("if-none-match", "*"), &cached("\"v1\"")));
    }

    #[test]
    fn weak_comparison_ignores_weak_prefix() {
        let req = headers("if-none-match", "W/\"v1\"");
        assert!(is_not_modified(&req, &cached("\"v1\"")));
    }

    #[test]
    fn mismatched_etag_is_modified() {
        let req = headers("if-none-match", "\"other\"");
        assert!(!is_not_modified(&req, &cached("\"v1\"")));
    }

    #[test]
    fn if_modified_since_before_last_modified_is_modified() {
        let mut c = cached("\"v1\"");
        c.headers.insert(
            "last-modified".to_string(),
            vec!["Sun, 06 Nov 1994 08:49:37 GMT".to_string()],
        );
        let req = headers("if-modified-since", "Sun, 06 Nov 1994 08:00:00 GMT");
        assert!(!is_not_modified(&req, &c));
    }

    #[test]
    fn if_modified_since_after_last_modified_is_not_modified() {
        let mut c = cached("\"v1\"");
        c.headers.insert(
            "last-modified".to_string(),
            vec!["Sun, 06 Nov 1994 08:00:00 GMT".to_string()],
        );
        let req = headers("if-modified-since", "Sun, 06 Nov 1994 08:49:37 GMT");
        assert!(is_not_modified(&req, &c));
    }
}
