//! The per-request carrier passed to every collaborator. Single-owner for the lifetime
//! of one request; never shared across concurrent requests.

use std::time::{Duration, SystemTime};

use http::{HeaderMap, Method};

use crate::entry::CachedResponse;
use crate::key::{KeyableRequest, VaryByRules};

/// Mutable state threaded through one request's pass through the engine.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// The request method, needed by the key provider and policy.
    pub method: Method,
    /// The request scheme (`"http"`/`"https"`).
    pub scheme: String,
    /// The request host.
    pub host: String,
    /// The request path.
    pub path: String,
    /// The request headers, needed by the key provider and policy.
    pub request_headers: HeaderMap,
    /// The request's query parameters, in `(name, value)` wire order.
    pub query_pairs: Vec<(String, String)>,

    /// Set by `on_request`: whether this request participates in caching at all.
    pub attempt_caching: bool,
    /// Set by `on_request`: whether a cache lookup may be attempted.
    pub allow_lookup: bool,
    /// Set by `on_request`: whether a fresh response may be captured and stored.
    pub allow_storage: bool,
    /// Set by `on_serve_response`: whether the captured response is cacheable.
    pub is_response_cacheable: bool,

    /// The resolved cache key, set once the key provider has run.
    pub cache_key: Option<String>,
    /// The vary-by rules active for the matched resource.
    pub vary_by_rules: VaryByRules,
    /// Present after a cache hit, or after a response has been captured.
    pub cached_response: Option<CachedResponse>,

    /// Wall-clock time captured when a response starts (hit replay or fresh capture).
    pub response_time: Option<SystemTime>,
    /// The `Date` header value of the response being served or captured.
    pub response_date: Option<SystemTime>,
    /// `max(0, response_time - cached_response.created)`, set when serving a hit.
    pub cached_entry_age: Option<Duration>,
    /// The TTL a freshly captured response should be stored with.
    pub cached_response_valid_for: Option<Duration>,

    /// One-way `false` → `true` transition marking headers as finalized.
    pub response_started: bool,
}

impl RequestContext {
    /// Start a new context for a request, with all policy flags defaulted to "do
    /// nothing" until `on_request` runs.
    pub fn new(
        method: Method,
        scheme: String,
        host: String,
        path: String,
        request_headers: HeaderMap,
    ) -> Self {
        Self {
            method,
            scheme,
            host,
            path,
            request_headers,
            query_pairs: Vec::new(),
            attempt_caching: false,
            allow_lookup: false,
            allow_storage: false,
            is_response_cacheable: false,
            cache_key: None,
            vary_by_rules: VaryByRules::default(),
            cached_response: None,
            response_time: None,
            response_date: None,
            cached_entry_age: None,
            cached_response_valid_for: None,
            response_started: false,
        }
    }

    /// All values of the named request header, lowercase-insensitively.
    pub fn request_header_values(&self, name: &str) -> Vec<&str> {
        self.request_headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// True if the request's `Cache-Control` header carries `only-if-cached`.
    pub fn only_if_cached(&self) -> bool {
        self.request_headers
            .get(http::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|cc| has_directive(cc, "only-if-cached"))
    }

    /// Populate `query_pairs` by parsing a raw (percent-decoded by the caller, if
    /// needed) query string of `name=value&name=value` pairs.
    pub fn set_query_string(&mut self, query: &str) {
        self.query_pairs = query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| match pair.split_once('=') {
                Some((name, value)) => (name.to_string(), value.to_string()),
                None => (pair.to_string(), String::new()),
            })
            .collect();
    }
}

impl KeyableRequest for RequestContext {
    fn method(&self) -> &Method {
        &self.method
    }

    fn scheme(&self) -> &str {
        &self.scheme
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn header_values(&self, name: &str) -> Vec<&str> {
        self.request_header_values(name)
    }

    fn query_values(&self, name: &str) -> Vec<&str> {
        self.query_pairs
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }
}

pub(crate) fn has_directive(cache_control: &str, directive: &str) -> bool {
    cache_control.split(',').map(str::trim).any(|d| {
        d.eq_ignore_ascii_case(directive)
            || d.len() > directive.len()
                && d[..directive.len()].eq_ignore_ascii_case(directive)
                && d.as_bytes()[directive.len()] == b'='
    })
}

pub(crate) fn directive_value<'a>(
    cache_control: &'a str,
    directive: &str,
) -> Option<&'a str> {
    cache_control.split(',').map(str::trim).find_map(|d| {
        let (name, value) = d.split_once('=')?;
        name.eq_ignore_ascii_case(directive).then_some(value.trim())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_directive_matches_exact_and_valued_forms() {
        assert!(has_directive("public, max-age=60", "public"));
        assert!(has_directive("public, max-age=60", "max-age"));
        assert!(!has_directive("public, max-age=60", "max"));
    }

    #[test]
    fn directive_value_extracts_numeric_suffix() {
        assert_eq!(directive_value("max-age=60", "max-age"), Some("60"));
        assert_eq!(directive_value("public", "max-age"), None);
    }
}
