//! The request-lifecycle state machine (§4.1), plus the collaborators it drives:
//! lookup/serve (§4.2), response-start/header-finalization (§4.5), and body commit
//! (§4.6). This module holds no knowledge of any concrete HTTP framework; the adapter
//! crate drives these methods around its own `inner.call(req).await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Extensions, StatusCode};

use crate::clock::{Clock, SystemClock};
use crate::conditional;
use crate::context::RequestContext;
use crate::entry::CachedResponse;
use crate::error::{CacheError, Result};
use crate::key::{DefaultKeyProvider, KeyProvider};
use crate::policy::{cached_response_valid_for, DefaultPolicy, PolicyProvider};
use crate::storage::Storage;

/// Configuration for a [`CacheEngine`], matching §6's enumerated options.
///
/// §6 also lists `sizeLimit`, but §4.9 is explicit that it is the storage backend's own
/// bound ("an optional `sizeLimit`... eviction policy is backend-defined"), not something
/// the engine enforces on the caller's behalf — the engine never touches cached bytes
/// once committed. Configure it on the backend directly, e.g.
/// [`crate::storage::InMemoryStorage::with_size_limit`].
#[derive(Debug, Clone)]
pub struct CacheEngineOptions {
    /// Per-response capture ceiling; responses larger than this are never committed.
    pub maximum_body_size: usize,
    /// Fallback TTL used when `cached_response_valid_for` cannot be computed from
    /// response headers (no `s-maxage`/`max-age`/`Expires`).
    pub default_expiration: Duration,
    /// Whether the request path contributes to the cache key case-sensitively.
    pub use_case_sensitive_paths: bool,
}

impl Default for CacheEngineOptions {
    fn default() -> Self {
        Self {
            maximum_body_size: 64 * 1024,
            default_expiration: Duration::from_secs(60),
            use_case_sensitive_paths: true,
        }
    }
}

/// Cache performance counters, supplementing §4.1's decision machine with the ambient
/// observability every complete implementation of this kind of middleware carries.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Requests served from a fresh cache entry.
    pub hits: AtomicU64,
    /// Requests that missed (including entries found but stale).
    pub misses: AtomicU64,
    /// Responses successfully committed to storage.
    pub stores: AtomicU64,
    /// Responses not committed (uncacheable, too large, or inconsistent).
    pub skipped: AtomicU64,
    /// Captures abandoned before completion because the client disconnected
    /// mid-response (§7 `ClientAbort`); never committed, never an error.
    pub aborted: AtomicU64,
}

impl CacheMetrics {
    /// A fresh, zeroed metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hit rate as a fraction in `[0.0, 1.0]`; `0.0` when no lookups have happened yet.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// Reset every counter to zero.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.stores.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        self.aborted.store(0, Ordering::Relaxed);
    }
}

/// Outcome of §4.1 step 2 (lookup).
#[derive(Debug)]
pub enum LookupOutcome {
    /// A fresh entry was found and should be served.
    Hit(Box<CachedResponse>),
    /// No usable entry; the caller should fall through to capture.
    Miss,
    /// No usable entry and the request carried `only-if-cached`; emit `504`.
    OnlyIfCachedMiss,
}

/// Outcome of preparing to serve a cache hit (§4.2).
pub enum ServeDecision {
    /// Serve `304 Not Modified` with only the listed header subset; no body.
    NotModified(HeaderMap),
    /// Serve the cached response in full, with `Age` stamped.
    Full { status: StatusCode, headers: HeaderMap, body: Bytes },
}

/// The feature marker (§9): a sentinel placed in the request's extensions to announce
/// that output caching is active for the duration of this request.
#[derive(Debug, Clone, Copy)]
pub struct OutputCachingFeature;

/// Install the feature marker, failing if one is already present (§4.1:
/// `DuplicateMiddleware`).
pub fn install_feature_marker(extensions: &mut Extensions) -> Result<()> {
    if extensions.insert(OutputCachingFeature).is_some() {
        return Err(CacheError::ConfigurationError(
            "output-caching middleware installed twice for this request".into(),
        ));
    }
    Ok(())
}

/// Remove the feature marker. Called on every exit path, including exceptional ones.
pub fn remove_feature_marker(extensions: &mut Extensions) {
    extensions.remove::<OutputCachingFeature>();
}

const REPLAY_HEADER_SUBSET: [&str; 6] =
    ["cache-control", "content-location", "date", "etag", "expires", "vary"];

/// The orchestrator: clock, storage, key provider, and policy provider wired together
/// into the four-state lifecycle of §4.1.
pub struct CacheEngine<K = DefaultKeyProvider, P = DefaultPolicy, C = SystemClock> {
    storage: Arc<dyn Storage>,
    key_provider: K,
    policy: P,
    clock: C,
    options: CacheEngineOptions,
    metrics: Arc<CacheMetrics>,
}

impl CacheEngine<DefaultKeyProvider, DefaultPolicy, SystemClock> {
    /// A new engine over `storage`, with the default key provider, default policy, and
    /// the system clock.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            key_provider: DefaultKeyProvider,
            policy: DefaultPolicy,
            clock: SystemClock,
            options: CacheEngineOptions::default(),
            metrics: Arc::new(CacheMetrics::new()),
        }
    }
}

impl<K, P, C> CacheEngine<K, P, C>
where
    K: KeyProvider,
    P: PolicyProvider,
    C: Clock,
{
    /// Replace the key provider.
    pub fn with_key_provider<K2: KeyProvider>(
        self,
        key_provider: K2,
    ) -> CacheEngine<K2, P, C> {
        CacheEngine {
            storage: self.storage,
            key_provider,
            policy: self.policy,
            clock: self.clock,
            options: self.options,
            metrics: self.metrics,
        }
    }

    /// Replace the policy provider.
    pub fn with_policy<P2: PolicyProvider>(self, policy: P2) -> CacheEngine<K, P2, C> {
        CacheEngine {
            storage: self.storage,
            key_provider: self.key_provider,
            policy,
            clock: self.clock,
            options: self.options,
            metrics: self.metrics,
        }
    }

    /// Replace the clock (tests supply a [`crate::clock::FixedClock`]).
    pub fn with_clock<C2: Clock>(self, clock: C2) -> CacheEngine<K, P, C2> {
        CacheEngine {
            storage: self.storage,
            key_provider: self.key_provider,
            policy: self.policy,
            clock,
            options: self.options,
            metrics: self.metrics,
        }
    }

    /// Replace the engine options.
    pub fn with_options(mut self, options: CacheEngineOptions) -> Self {
        self.options = options;
        self
    }

    /// The engine's metrics, shareable across request handlers.
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Remove a specific entry from storage, e.g. for cache-busting admin endpoints.
    pub async fn invalidate(&self, key: &str) -> Result<()> {
        self.storage
            .delete(key)
            .await
            .map_err(CacheError::Storage)
    }

    /// §4.1 step 1: classify the request via the policy's `on_request` hook.
    pub fn classify(&self, ctx: &mut RequestContext) {
        self.policy.on_request(ctx);
    }

    /// §4.1 step 2 / §4.3: compute the cache key and query storage. Normalizes the
    /// vary-by key before ever touching storage, resolving the spec's own open question
    /// about lookup-before-normalization ordering.
    pub async fn lookup(&self, ctx: &mut RequestContext) -> Result<LookupOutcome> {
        let rules = ctx.vary_by_rules.clone();
        let key = self.key_provider.create_vary_by_key(
            ctx,
            &rules,
            self.options.use_case_sensitive_paths,
        );
        if key.is_empty() {
            return Err(CacheError::CacheKeyUndefined);
        }
        ctx.cache_key = Some(key.clone());

        let cached = match self.storage.get(&key).await {
            Ok(found) => found,
            Err(e) => {
                log::warn!("output-cache: storage get({key}) failed: {e}");
                None
            }
        };

        let Some(cached) = cached else {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(self.miss_outcome(ctx));
        };

        ctx.response_time = Some(self.clock.now());
        ctx.cached_entry_age = Some(
            ctx.response_time
                .unwrap()
                .duration_since(cached.created)
                .unwrap_or_default(),
        );
        self.policy.on_serve_from_cache(ctx, &cached);

        if !self.policy.is_fresh(ctx, &cached) {
            self.metrics.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(self.miss_outcome(ctx));
        }

        self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        Ok(LookupOutcome::Hit(Box::new(cached)))
    }

    fn miss_outcome(&self, ctx: &RequestContext) -> LookupOutcome {
        if ctx.only_if_cached() {
            LookupOutcome::OnlyIfCachedMiss
        } else {
            LookupOutcome::Miss
        }
    }

    /// §4.2: decide how to serve a hit — `304`, or the full cached body with `Age`
    /// stamped. A pure function of `ctx`/`cached`; does not need the engine's
    /// collaborators, so it is also exposed as the free function
    /// [`prepare_serve`] for callers that only have a hit on hand.
    pub fn prepare_serve(
        &self,
        ctx: &RequestContext,
        cached: &CachedResponse,
    ) -> ServeDecision {
        prepare_serve(ctx, cached)
    }

    /// §4.5: the idempotent "start response" transition. Safe to call multiple times;
    /// only the first call (per request) has any effect.
    pub fn start_response(
        &self,
        ctx: &mut RequestContext,
        status: StatusCode,
        headers: &mut HeaderMap,
    ) {
        if ctx.response_started {
            return;
        }
        ctx.response_started = true;
        ctx.response_time = Some(self.clock.now());
        self.policy.on_serve_response(ctx, status, headers);

        if !ctx.is_response_cacheable {
            return;
        }

        let response_time = ctx.response_time.unwrap();
        ctx.cached_response_valid_for = Some(cached_response_valid_for(
            headers,
            response_time,
            self.options.default_expiration,
        ));

        if !headers.contains_key(http::header::DATE) {
            headers.insert(
                http::header::DATE,
                HeaderValue::from_str(&httpdate::fmt_http_date(response_time))
                    .unwrap(),
            );
        }
        ctx.response_date = headers
            .get(http::header::DATE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| httpdate::parse_http_date(v).ok())
            .or(Some(response_time));
    }

    /// §4.6: commit the captured body to storage, if the consistency checks pass.
    /// Returns whether the entry was committed.
    pub async fn commit_body(
        &self,
        ctx: &RequestContext,
        status: StatusCode,
        headers: &mut HeaderMap,
        buffered: &Bytes,
        buffering_enabled: bool,
        is_head_request: bool,
    ) -> bool {
        if !ctx.is_response_cacheable || !buffering_enabled {
            self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let content_length = headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());

        let consistent = match content_length {
            None => true,
            Some(len) => {
                len == buffered.len() || (buffered.is_empty() && is_head_request)
            }
        };
        if !consistent {
            self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if content_length.is_none()
            && !headers.contains_key(http::header::TRANSFER_ENCODING)
        {
            headers.insert(
                http::header::CONTENT_LENGTH,
                HeaderValue::from_str(&buffered.len().to_string()).unwrap(),
            );
        }

        let Some(key) = ctx.cache_key.clone() else {
            self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let cached = CachedResponse {
            created: ctx.response_date.or(ctx.response_time).unwrap_or(
                std::time::SystemTime::now(),
            ),
            status: status.as_u16(),
            headers: header_map_to_store(headers),
            body: buffered.to_vec(),
        };
        let ttl = ctx
            .cached_response_valid_for
            .unwrap_or(self.options.default_expiration);

        match self.storage.set(key.clone(), cached, ttl).await {
            Ok(()) => {
                self.metrics.stores.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                log::warn!("output-cache: storage set({key}) failed: {e}");
                self.metrics.skipped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// The configured capture ceiling, for constructing a [`crate::capture::CaptureBody`].
    pub fn maximum_body_size(&self) -> usize {
        self.options.maximum_body_size
    }
}

/// §4.2's decision as a free function: `304` vs. the full cached response with `Age`
/// stamped. Depends only on `ctx` and `cached`, so it needs no [`CacheEngine`] instance.
pub fn prepare_serve(ctx: &RequestContext, cached: &CachedResponse) -> ServeDecision {
    if conditional::is_not_modified(&ctx.request_headers, cached) {
        let mut headers = HeaderMap::new();
        for name in REPLAY_HEADER_SUBSET {
            if let Some(value) = cached.header(name) {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    headers.insert(name, value);
                }
            }
        }
        return ServeDecision::NotModified(headers);
    }

    let mut headers = store_to_header_map(&cached.headers);
    let age_secs = ctx.cached_entry_age.unwrap_or_default().as_secs();
    headers.insert(http::header::AGE, HeaderValue::from_str(&age_secs.to_string()).unwrap());
    ServeDecision::Full {
        status: StatusCode::from_u16(cached.status).unwrap_or(StatusCode::OK),
        headers,
        body: Bytes::from(cached.body.clone()),
    }
}

fn header_map_to_store(headers: &HeaderMap) -> HashMap<String, Vec<String>> {
    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers.iter() {
        if name == http::header::AGE {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.entry(name.as_str().to_ascii_lowercase())
                .or_default()
                .push(value.to_string());
        }
    }
    out
}

fn store_to_header_map(stored: &HashMap<String, Vec<String>>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, values) in stored {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in values {
            if let Ok(header_value) = HeaderValue::from_str(value) {
                headers.append(header_name.clone(), header_value);
            }
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::storage::InMemoryStorage;
    use http::Method;
    use std::time::SystemTime;

    fn ctx() -> RequestContext {
        let mut ctx = RequestContext::new(
            Method::GET,
            "https".into(),
            "example.com".into(),
            "/a".into(),
            HeaderMap::new(),
        );
        ctx.attempt_caching = true;
        ctx.allow_lookup = true;
        ctx.allow_storage = true;
        ctx
    }

    fn engine_at(
        now: SystemTime,
    ) -> (CacheEngine<DefaultKeyProvider, DefaultPolicy, FixedClock>, FixedClock) {
        let clock = FixedClock::new(now);
        let engine = CacheEngine::new(Arc::new(InMemoryStorage::new()))
            .with_clock(clock.clone());
        (engine, clock)
    }

    #[tokio::test]
    async fn miss_then_hit_with_age() {
        let start = SystemTime::UNIX_EPOCH;
        let (engine, clock) = engine_at(start);
        let mut request_ctx = ctx();

        // Miss.
        match engine.lookup(&mut request_ctx).await.unwrap() {
            LookupOutcome::Miss => {}
            _ => panic!("expected miss"),
        }

        // Capture + commit.
        let mut headers = HeaderMap::new();
        headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("public, max-age=60"),
        );
        engine.start_response(&mut request_ctx, StatusCode::OK, &mut headers);
        assert!(request_ctx.is_response_cacheable);
        let committed = engine
            .commit_body(
                &request_ctx,
                StatusCode::OK,
                &mut headers,
                &Bytes::from_static(b"hello"),
                true,
                false,
            )
            .await;
        assert!(committed);

        // Hit 30s later, same engine and storage.
        clock.advance(Duration::from_secs(30));
        let mut serve_ctx = ctx();
        match engine.lookup(&mut serve_ctx).await.unwrap() {
            LookupOutcome::Hit(cached) => {
                match engine.prepare_serve(&serve_ctx, &cached) {
                    ServeDecision::Full { status, headers, body } => {
                        assert_eq!(status, StatusCode::OK);
                        assert_eq!(body, Bytes::from_static(b"hello"));
                        assert_eq!(
                            headers.get(http::header::AGE).unwrap(),
                            "30"
                        );
                    }
                    ServeDecision::NotModified(_) => panic!("expected full serve"),
                }
            }
            other => panic!("expected hit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn only_if_cached_miss_is_reported() {
        let (engine, _clock) = engine_at(SystemTime::UNIX_EPOCH);
        let mut request_ctx = ctx();
        request_ctx.request_headers.insert(
            http::header::CACHE_CONTROL,
            HeaderValue::from_static("only-if-cached"),
        );
        match engine.lookup(&mut request_ctx).await.unwrap() {
            LookupOutcome::OnlyIfCachedMiss => {}
            _ => panic!("expected only-if-cached miss"),
        }
    }

    #[tokio::test]
    async fn empty_key_is_fatal() {
        struct EmptyKeyProvider;
        impl KeyProvider for EmptyKeyProvider {
            fn create_base_key<R: crate::key::KeyableRequest + ?Sized>(
                &self,
                _req: &R,
                _use_case_sensitive_paths: bool,
            ) -> String {
                String::new()
            }
            fn create_vary_by_key<R: crate::key::KeyableRequest + ?Sized>(
                &self,
                _req: &R,
                _rules: &crate::key::VaryByRules,
                _use_case_sensitive_paths: bool,
            ) -> String {
                String::new()
            }
        }

        let engine = CacheEngine::new(Arc::new(InMemoryStorage::new()))
            .with_key_provider(EmptyKeyProvider);
        let mut request_ctx = ctx();
        let err = engine.lookup(&mut request_ctx).await.unwrap_err();
        assert!(matches!(err, CacheError::CacheKeyUndefined));
    }

    #[test]
    fn duplicate_feature_marker_is_rejected() {
        let mut extensions = Extensions::new();
        install_feature_marker(&mut extensions).unwrap();
        let err = install_feature_marker(&mut extensions).unwrap_err();
        assert!(matches!(err, CacheError::ConfigurationError(_)));
    }

    /// A backend whose `get` always fails, for exercising §7's "treat `get` failure as a
    /// miss" storage-error policy.
    struct FailingStorage;

    #[async_trait::async_trait]
    impl crate::storage::Storage for FailingStorage {
        async fn get(
            &self,
            _key: &str,
        ) -> std::result::Result<Option<CachedResponse>, crate::storage::StorageError> {
            Err("backend unreachable".into())
        }

        async fn set(
            &self,
            _key: String,
            _entry: CachedResponse,
            _ttl: Duration,
        ) -> std::result::Result<(), crate::storage::StorageError> {
            Ok(())
        }

        async fn delete(&self, _key: &str) -> std::result::Result<(), crate::storage::StorageError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn storage_get_failure_is_logged_and_treated_as_miss() {
        let _ = env_logger::builder().is_test(true).try_init();

        let engine = CacheEngine::new(Arc::new(FailingStorage));
        let mut request_ctx = ctx();
        match engine.lookup(&mut request_ctx).await.unwrap() {
            LookupOutcome::Miss => {}
            other => panic!("expected a `get` failure to be treated as a miss, got {other:?}"),
        }
    }
}
