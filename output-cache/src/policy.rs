//! The policy contract: three hooks that classify the request and the response, plus
//! the default freshness/cacheability rules of §4.7, grounded in the teacher's
//! `should_cache`/`parse_max_age`/`parse_s_maxage`/`apply_ttl_constraints` functions,
//! generalized from a single free function into an overridable trait.

use std::time::Duration;

use http::{HeaderMap, Method, StatusCode};

use crate::context::{directive_value, has_directive, RequestContext};
use crate::entry::CachedResponse;

/// Classifies requests and responses for the engine. The three required hooks mutate
/// `ctx` in place so that callers composing multiple policies can chain them; the
/// provided `is_response_cacheable`/`is_fresh` methods hold the default §4.7 rules and
/// may be overridden independently of the hooks that call them.
pub trait PolicyProvider: Send + Sync + 'static {
    /// Classify the request: sets `attempt_caching`, `allow_lookup`, `allow_storage`.
    fn on_request(&self, ctx: &mut RequestContext);

    /// Called after a cache hit, before serving it. May adjust freshness-related
    /// fields on `ctx`; the default implementation leaves them as the engine set them.
    fn on_serve_from_cache(
        &self,
        _ctx: &mut RequestContext,
        _cached: &CachedResponse,
    ) {
    }

    /// Called once the downstream response is known. Sets `is_response_cacheable` and,
    /// when cacheable, `cached_response_valid_for`.
    fn on_serve_response(
        &self,
        ctx: &mut RequestContext,
        status: StatusCode,
        headers: &HeaderMap,
    );

    /// Whether a cached entry is still fresh enough to serve without revalidation.
    /// Default implements §4.7's freshness rules.
    fn is_fresh(&self, ctx: &RequestContext, cached: &CachedResponse) -> bool {
        default_is_fresh(ctx, cached)
    }
}

/// The default policy: caches idempotent `GET`/`HEAD` requests, applies §4.7's
/// cacheability predicate, and RFC 9111 §3.5's `Authorization` handling.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPolicy;

impl PolicyProvider for DefaultPolicy {
    fn on_request(&self, ctx: &mut RequestContext) {
        let cacheable_method =
            matches!(ctx.method, Method::GET | Method::HEAD);
        let client_forbids_lookup = ctx
            .request_headers
            .get(http::header::CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|cc| has_directive(cc, "no-cache"));

        ctx.attempt_caching = cacheable_method;
        ctx.allow_lookup = cacheable_method && !client_forbids_lookup;
        ctx.allow_storage = cacheable_method;
    }

    fn on_serve_response(
        &self,
        ctx: &mut RequestContext,
        status: StatusCode,
        headers: &HeaderMap,
    ) {
        let has_authorization =
            ctx.request_headers.contains_key(http::header::AUTHORIZATION);
        ctx.is_response_cacheable =
            default_is_response_cacheable(status, headers, has_authorization);
    }
}

/// §4.7's cacheability predicate: `public` present and none of
/// `no-store`/`no-cache`/`private`, no `Set-Cookie`, `Vary` not bare `*`, status `200`,
/// and (per RFC 9111 §3.5) a request carrying `Authorization` only cached when the
/// response explicitly permits it.
pub fn default_is_response_cacheable(
    status: StatusCode,
    headers: &HeaderMap,
    request_has_authorization: bool,
) -> bool {
    if status != StatusCode::OK {
        return false;
    }
    if headers.contains_key(http::header::SET_COOKIE) {
        return false;
    }
    if headers
        .get(http::header::VARY)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim() == "*")
    {
        return false;
    }

    let cache_control = headers
        .get(http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok());

    let Some(cc) = cache_control else {
        return false;
    };

    if has_directive(cc, "no-store")
        || has_directive(cc, "no-cache")
        || has_directive(cc, "private")
    {
        return false;
    }
    if !has_directive(cc, "public") {
        return false;
    }
    if request_has_authorization && !response_permits_authorized_caching(cc) {
        return false;
    }
    true
}

fn response_permits_authorized_caching(cache_control: &str) -> bool {
    has_directive(cache_control, "s-maxage")
        || has_directive(cache_control, "must-revalidate")
}

/// §4.5's TTL fallback chain: `s-maxage ?? max-age ?? (Expires - now) ?? default_ttl`.
/// `default_ttl` is the engine's configured `CacheEngineOptions::default_expiration`
/// (60s by default), not a hardcoded constant.
pub fn cached_response_valid_for(
    headers: &HeaderMap,
    response_time: std::time::SystemTime,
    default_ttl: Duration,
) -> Duration {
    let cache_control = headers
        .get(http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok());

    if let Some(cc) = cache_control {
        if let Some(s_maxage) = directive_value(cc, "s-maxage")
            .and_then(|v| v.parse::<u64>().ok())
        {
            return Duration::from_secs(s_maxage);
        }
        if let Some(max_age) =
            directive_value(cc, "max-age").and_then(|v| v.parse::<u64>().ok())
        {
            return Duration::from_secs(max_age);
        }
    }

    if let Some(expires) = headers
        .get(http::header::EXPIRES)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
    {
        if let Ok(remaining) = expires.duration_since(response_time) {
            return remaining;
        }
    }

    default_ttl
}

/// §4.7's freshness predicate.
fn default_is_fresh(ctx: &RequestContext, cached: &CachedResponse) -> bool {
    let request_cc = ctx
        .request_headers
        .get(http::header::CACHE_CONTROL)
        .and_then(|v| v.to_str().ok());
    let cached_cc = cached.header("cache-control");

    let min_fresh = request_cc
        .and_then(|cc| directive_value(cc, "min-fresh"))
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_default();

    let age = ctx.cached_entry_age.unwrap_or_default() + min_fresh;

    if let Some(s_maxage) = cached_cc
        .and_then(|cc| directive_value(cc, "s-maxage"))
        .and_then(|v| v.parse::<u64>().ok())
    {
        return age < Duration::from_secs(s_maxage);
    }

    let cached_max_age = cached_cc
        .and_then(|cc| directive_value(cc, "max-age"))
        .and_then(|v| v.parse::<u64>().ok());
    let request_max_age = request_cc
        .and_then(|cc| directive_value(cc, "max-age"))
        .and_then(|v| v.parse::<u64>().ok());

    if let Some(lowest) = [cached_max_age, request_max_age]
        .into_iter()
        .flatten()
        .min()
    {
        if age < Duration::from_secs(lowest) {
            return true;
        }
        let must_revalidate = cached_cc.is_some_and(|cc| {
            has_directive(cc, "must-revalidate")
                || has_directive(cc, "proxy-revalidate")
        });
        if must_revalidate {
            return false;
        }
        return match request_cc.and_then(|cc| directive_value(cc, "max-stale")) {
            Some(value) => match value.parse::<u64>() {
                Ok(seconds) => age < Duration::from_secs(lowest) + Duration::from_secs(seconds),
                Err(_) => true,
            },
            None => request_cc.is_some_and(|cc| has_directive(cc, "max-stale")),
        };
    }

    match cached
        .header("expires")
        .and_then(|v| httpdate::parse_http_date(v).ok())
    {
        Some(expires) => {
            let response_time = ctx.response_time.unwrap_or(cached.created);
            response_time < expires
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RequestContext;
    use std::collections::HashMap;
    use std::time::SystemTime;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                v.parse().unwrap(),
            );
        }
        map
    }

    fn ctx_with_age(age: Duration) -> RequestContext {
        let mut ctx = RequestContext::new(
            Method::GET,
            "https".into(),
            "example.com".into(),
            "/a".into(),
            HeaderMap::new(),
        );
        ctx.cached_entry_age = Some(age);
        ctx
    }

    fn cached_with_cc(cc: &str) -> CachedResponse {
        let mut h = HashMap::new();
        h.insert("cache-control".to_string(), vec![cc.to_string()]);
        CachedResponse { created: SystemTime::now(), status: 200, headers: h, body: vec![] }
    }

    #[test]
    fn cacheable_requires_public_and_no_blocking_directives() {
        assert!(default_is_response_cacheable(
            StatusCode::OK,
            &headers(&[("cache-control", "public, max-age=60")]),
            false
        ));
        assert!(!default_is_response_cacheable(
            StatusCode::OK,
            &headers(&[("cache-control", "public, no-store")]),
            false
        ));
        assert!(!default_is_response_cacheable(
            StatusCode::OK,
            &headers(&[("cache-control", "private")]),
            false
        ));
    }

    #[test]
    fn cacheable_rejects_wildcard_vary() {
        assert!(!default_is_response_cacheable(
            StatusCode::OK,
            &headers(&[("cache-control", "public"), ("vary", "*")]),
            false
        ));
    }

    #[test]
    fn authorized_requests_need_explicit_permission() {
        assert!(!default_is_response_cacheable(
            StatusCode::OK,
            &headers(&[("cache-control", "public")]),
            true
        ));
        assert!(default_is_response_cacheable(
            StatusCode::OK,
            &headers(&[("cache-control", "public, s-maxage=60")]),
            true
        ));
    }

    #[test]
    fn fresh_within_max_age_stale_after() {
        let cached = cached_with_cc("public, max-age=60");
        assert!(default_is_fresh(&ctx_with_age(Duration::from_secs(30)), &cached));
        assert!(!default_is_fresh(&ctx_with_age(Duration::from_secs(90)), &cached));
    }

    #[test]
    fn must_revalidate_forbids_stale_serving() {
        let cached = cached_with_cc("public, max-age=60, must-revalidate");
        assert!(!default_is_fresh(&ctx_with_age(Duration::from_secs(90)), &cached));
    }
}
