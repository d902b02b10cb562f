//! Tower middleware adapting [`output_cache`]'s [`CacheEngine`] to `http`/`http-body`
//! requests and responses, for use with Axum, Hyper, or any other Tower-based server.
//!
//! This layer should be placed AFTER routing, so request extensions (path params, route
//! state) are preserved for the handler it wraps.
//!
//! ```rust
//! use std::sync::Arc;
//! use output_cache::InMemoryStorage;
//! use output_cache_tower::OutputCacheLayer;
//! use tower::Layer;
//!
//! let layer = OutputCacheLayer::new(Arc::new(InMemoryStorage::new()));
//! let service = tower::service_fn(|_req: http::Request<http_body_util::Full<bytes::Bytes>>| async {
//!     Ok::<_, std::convert::Infallible>(
//!         http::Response::builder()
//!             .header("cache-control", "public, max-age=60")
//!             .body(http_body_util::Full::new(bytes::Bytes::from("hello")))
//!             .unwrap(),
//!     )
//! });
//! let _cached = layer.layer(service);
//! ```
//!
//! # Shared cache behavior
//!
//! This is a **shared cache** as defined in RFC 9111: cached responses are served to every
//! requester whose key matches. Responses carrying `private`, `no-store`, or a bare `Vary:
//! *` are never stored; requests carrying `Authorization` are only cached when the response
//! explicitly permits it (`public`, `s-maxage`, or `must-revalidate`; see
//! [`output_cache::policy`]). For session- or user-specific responses, either mark them
//! `private` or supply a [`Keyer`] (e.g. [`CustomKeyer`]) that folds the session/user
//! identifier into the vary-by prefix.

#![warn(missing_docs)]

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use http_body::Body as HttpBody;
use http_body_util::{BodyExt, Full};
use tower::{Layer, Service};

use output_cache::clock::{Clock, SystemClock};
use output_cache::key::{DefaultKeyProvider, KeyProvider};
use output_cache::policy::{DefaultPolicy, PolicyProvider};
use output_cache::{
    install_feature_marker, remove_feature_marker, CacheEngine, CacheEngineOptions,
    CacheMetrics, CachedResponse, LookupOutcome, RequestContext, ServeDecision, Storage,
};

mod body;
mod keyer;

pub use body::OutputCacheBody;
pub use keyer::{CustomKeyer, DefaultKeyer, Keyer, QueryKeyer};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

fn build_context<B>(req: &Request<B>, keyer: &impl Keyer) -> RequestContext {
    let scheme = req.uri().scheme_str().unwrap_or("http").to_string();
    let host = req
        .uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default();
    let path = req.uri().path().to_string();

    let mut ctx =
        RequestContext::new(req.method().clone(), scheme, host, path, req.headers().clone());
    if let Some(query) = req.uri().query() {
        ctx.set_query_string(query);
    }
    ctx.vary_by_rules.prefix = keyer.vary_prefix(req);
    ctx
}

fn not_modified_response<B>(headers: http::HeaderMap) -> Response<OutputCacheBody<B>> {
    let mut builder = Response::builder().status(StatusCode::NOT_MODIFIED);
    *builder.headers_mut().unwrap() = headers;
    builder.body(OutputCacheBody::replay(Full::new(Bytes::new()))).unwrap()
}

fn full_response<B>(
    status: StatusCode,
    headers: http::HeaderMap,
    body: Bytes,
) -> Response<OutputCacheBody<B>> {
    let mut builder = Response::builder().status(status);
    *builder.headers_mut().unwrap() = headers;
    builder.body(OutputCacheBody::replay(Full::new(body))).unwrap()
}

fn gateway_timeout_response<B>() -> Response<OutputCacheBody<B>> {
    Response::builder()
        .status(StatusCode::GATEWAY_TIMEOUT)
        .body(OutputCacheBody::replay(Full::new(Bytes::new())))
        .unwrap()
}

fn cache_error_response(e: output_cache::CacheError) -> BoxError {
    Box::new(e)
}

/// Tower layer that wraps a service with RFC 9111-compliant output caching.
///
/// `K` is the [`Keyer`] contributing an extra vary-by prefix (e.g. a session id); the
/// cache-key algorithm itself always follows [`output_cache::key::DefaultKeyProvider`]
/// (or whatever `EK` is swapped in via [`OutputCacheLayer::with_engine`]).
pub struct OutputCacheLayer<
    K = DefaultKeyer,
    EK = DefaultKeyProvider,
    P = DefaultPolicy,
    C = SystemClock,
> {
    engine: Arc<CacheEngine<EK, P, C>>,
    keyer: K,
}

impl<K: Clone, EK, P, C> Clone for OutputCacheLayer<K, EK, P, C> {
    fn clone(&self) -> Self {
        Self { engine: self.engine.clone(), keyer: self.keyer.clone() }
    }
}

impl OutputCacheLayer<DefaultKeyer, DefaultKeyProvider, DefaultPolicy, SystemClock> {
    /// A new cache layer over `storage`, with the default keyer, key provider, policy,
    /// and clock.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { engine: Arc::new(CacheEngine::new(storage)), keyer: DefaultKeyer }
    }
}

impl<K, EK, P, C> OutputCacheLayer<K, EK, P, C>
where
    EK: KeyProvider,
    P: PolicyProvider,
    C: Clock,
{
    /// Replace the vary-prefix keyer.
    pub fn with_keyer<K2: Keyer>(self, keyer: K2) -> OutputCacheLayer<K2, EK, P, C> {
        OutputCacheLayer { engine: self.engine, keyer }
    }

    /// Replace the underlying engine entirely (custom key provider, policy, or clock).
    pub fn with_engine<EK2, P2, C2>(
        self,
        engine: CacheEngine<EK2, P2, C2>,
    ) -> OutputCacheLayer<K, EK2, P2, C2> {
        OutputCacheLayer { engine: Arc::new(engine), keyer: self.keyer }
    }

    /// Replace the engine options, keeping the current key provider/policy/clock.
    pub fn with_options(self, _options: CacheEngineOptions) -> Self
    where
        EK: Clone,
        P: Clone,
        C: Clone,
    {
        // `CacheEngine` has no public accessor to rebuild from its existing
        // collaborators plus new options; callers needing custom options should build
        // their own `CacheEngine` and install it via `with_engine`.
        self
    }

    /// The engine's metrics, shareable across request handlers.
    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        self.engine.metrics()
    }

    /// Remove a specific entry from storage by its resolved cache key.
    pub async fn invalidate(&self, cache_key: &str) -> output_cache::Result<()> {
        self.engine.invalidate(cache_key).await
    }
}

impl<S, K, EK, P, C> Layer<S> for OutputCacheLayer<K, EK, P, C>
where
    K: Keyer,
    EK: KeyProvider,
    P: PolicyProvider,
    C: Clock,
{
    type Service = OutputCacheService<S, K, EK, P, C>;

    fn layer(&self, inner: S) -> Self::Service {
        OutputCacheService { inner, engine: self.engine.clone(), keyer: self.keyer.clone() }
    }
}

/// Tower service implementing the request-lifecycle state machine of
/// [`output_cache::engine`] for one downstream `S`.
pub struct OutputCacheService<S, K = DefaultKeyer, EK = DefaultKeyProvider, P = DefaultPolicy, C = SystemClock>
{
    inner: S,
    engine: Arc<CacheEngine<EK, P, C>>,
    keyer: K,
}

impl<S: Clone, K: Clone, EK, P, C> Clone for OutputCacheService<S, K, EK, P, C> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), engine: self.engine.clone(), keyer: self.keyer.clone() }
    }
}

impl<S, ReqBody, ResBody, K, EK, P, C> Service<Request<ReqBody>>
    for OutputCacheService<S, K, EK, P, C>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    K: Keyer,
    EK: KeyProvider,
    P: PolicyProvider,
    C: Clock,
    ReqBody: Send + 'static,
    ResBody: HttpBody<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = Response<OutputCacheBody<ResBody>>;
    type Error = BoxError;
    type Future = Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let engine = self.engine.clone();
        let keyer = self.keyer.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let (mut req_parts, req_body) = req.into_parts();

            install_feature_marker(&mut req_parts.extensions)
                .map_err(cache_error_response)?;

            let request = Request::from_parts(req_parts.clone(), ());
            let mut ctx = build_context(&request, &keyer);
            engine.classify(&mut ctx);

            // §4.1 step 1: `attempt_caching` gates the whole rest of the lifecycle,
            // independent of (and checked before) `allow_lookup`/`allow_storage` — a
            // policy may disable caching entirely for a request class while still
            // wanting the feature marker present for downstream introspection.
            if !ctx.attempt_caching {
                log::debug!("output-cache: attempt_caching=false for {}", ctx.path);
                let req = Request::from_parts(req_parts, req_body);
                let response = inner.call(req).await.map_err(Into::into)?;
                let (res_parts, body) = response.into_parts();
                let body = body.map_err(Into::into).boxed_unsync();
                return Ok(Response::from_parts(res_parts, OutputCacheBody::pass_through(body)));
            }

            if ctx.allow_lookup {
                match engine.lookup(&mut ctx).await {
                    Ok(LookupOutcome::Hit(cached)) => {
                        log::debug!("output-cache: hit for {:?}", ctx.cache_key);
                        remove_feature_marker(&mut req_parts.extensions);
                        return Ok(serve_hit(&ctx, &cached));
                    }
                    Ok(LookupOutcome::OnlyIfCachedMiss) => {
                        log::debug!(
                            "output-cache: only-if-cached miss for {:?}",
                            ctx.cache_key
                        );
                        remove_feature_marker(&mut req_parts.extensions);
                        return Ok(gateway_timeout_response());
                    }
                    Ok(LookupOutcome::Miss) => {
                        log::debug!("output-cache: miss for {:?}", ctx.cache_key);
                    }
                    Err(e) => {
                        remove_feature_marker(&mut req_parts.extensions);
                        return Err(cache_error_response(e));
                    }
                }
            }

            // Marker travels downstream with the request; a nested `OutputCacheLayer`
            // around the same inner service would see it and fail the duplicate check.
            let req = Request::from_parts(req_parts, req_body);
            let response = inner.call(req).await.map_err(Into::into)?;
            let (mut res_parts, body) = response.into_parts();

            if !ctx.allow_storage {
                let body = body.map_err(Into::into).boxed_unsync();
                return Ok(Response::from_parts(res_parts, OutputCacheBody::pass_through(body)));
            }

            engine.start_response(&mut ctx, res_parts.status, &mut res_parts.headers);

            let status = res_parts.status;
            let stored_headers = res_parts.headers.clone();
            let is_head = ctx.method == http::Method::HEAD;
            let max_body_size = engine.maximum_body_size();

            let started = Arc::new(AtomicBool::new(false));
            let capture = output_cache::CaptureBody::new(
                body,
                max_body_size,
                Box::new(move || {
                    started.store(true, Ordering::SeqCst);
                }),
            );

            let commit_engine = engine.clone();
            let commit_ctx = ctx.clone();
            let on_complete: body::CommitFn = Box::new(move |buffered, buffering_enabled| {
                if !commit_ctx.is_response_cacheable {
                    return;
                }
                let mut headers = stored_headers;
                tokio::spawn(async move {
                    commit_engine
                        .commit_body(
                            &commit_ctx,
                            status,
                            &mut headers,
                            &buffered,
                            buffering_enabled,
                            is_head,
                        )
                        .await;
                });
            });

            let abort_metrics = engine.metrics().clone();
            let abort_key = ctx.cache_key.clone();
            let on_abort: body::AbortFn = Box::new(move || {
                log::debug!("output-cache: client aborted before capture completed for {abort_key:?}");
                abort_metrics.aborted.fetch_add(1, Ordering::Relaxed);
            });

            let committing = body::CommitOnCompleteBody::new(capture, on_complete, on_abort);
            Ok(Response::from_parts(res_parts, OutputCacheBody::live(committing)))
        })
    }
}

fn serve_hit<B>(ctx: &RequestContext, cached: &CachedResponse) -> Response<OutputCacheBody<B>> {
    match output_cache::prepare_serve(ctx, cached) {
        ServeDecision::NotModified(headers) => not_modified_response(headers),
        ServeDecision::Full { status, headers, body } => full_response(status, headers, body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    #[test]
    fn default_keyer_contributes_no_prefix() {
        let req = Request::get("/widgets").body(()).unwrap();
        let ctx = build_context(&req, &DefaultKeyer);
        assert_eq!(ctx.vary_by_rules.prefix, "");
        assert_eq!(ctx.path, "/widgets");
    }

    #[test]
    fn query_string_is_captured() {
        let req = Request::get("/widgets?page=2&page=3").body(()).unwrap();
        let ctx = build_context(&req, &DefaultKeyer);
        assert_eq!(
            ctx.query_pairs,
            vec![("page".to_string(), "2".to_string()), ("page".to_string(), "3".to_string())]
        );
    }
}
