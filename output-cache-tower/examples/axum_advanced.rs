//! Advanced output caching: custom keyers, invalidation, and metrics.
//!
//! ```bash
//! cargo run --example axum_advanced
//!
//! curl http://localhost:3000/metrics
//! curl -i http://localhost:3000/search?q=rust      # MISS
//! curl -i http://localhost:3000/search?q=rust      # HIT
//! curl -i http://localhost:3000/search?q=cache     # MISS, distinct key
//! curl http://localhost:3000/metrics
//! ```

use std::sync::Arc;

use axum::{
    error_handling::HandleErrorLayer,
    extract::{Query, State},
    response::{IntoResponse, Response},
    routing::get,
    BoxError, Router,
};
use http::{Request, StatusCode};
use output_cache::{CacheMetrics, InMemoryStorage};
use output_cache_tower::{CustomKeyer, OutputCacheLayer, QueryKeyer};
use serde::Deserialize;
use std::time::Duration;
use tower::ServiceBuilder;

#[derive(Clone)]
struct AppState {
    metrics: Arc<CacheMetrics>,
}

#[tokio::main]
async fn main() {
    let storage = Arc::new(InMemoryStorage::with_size_limit(8 * 1024 * 1024));
    let cache_layer = OutputCacheLayer::new(storage).with_keyer(QueryKeyer);

    let state = AppState { metrics: cache_layer.metrics().clone() };

    let cached_routes = Router::new()
        .route("/search", get(search))
        .route("/dashboard", get(dashboard))
        .route("/products/{id}", get(get_product))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_cache_error))
                .layer(cache_layer),
        );

    let admin_routes = Router::new().route("/metrics", get(metrics));

    let app = Router::new().merge(cached_routes).merge(admin_routes).with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await.unwrap();

    println!("Server running at http://localhost:3000");
    println!();
    println!("Endpoints:");
    println!("  GET /search?q=...    - cached by query string");
    println!("  GET /dashboard       - private, never shared-cached");
    println!("  GET /products/:id   - cached for 10 minutes");
    println!("  GET /metrics        - cache statistics");

    axum::serve(listener, app).await.unwrap();
}

async fn handle_cache_error(err: BoxError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("Cache error: {}", err)).into_response()
}

#[derive(Deserialize)]
struct SearchQuery {
    q: String,
}

async fn search(Query(params): Query<SearchQuery>) -> Response {
    tokio::time::sleep(Duration::from_millis(50)).await;
    (
        StatusCode::OK,
        [("cache-control", "public, max-age=300")],
        format!("Search results for: {}", params.q),
    )
        .into_response()
}

async fn dashboard() -> Response {
    // A real deployment would fold the session id into the vary-by prefix via a
    // CustomKeyer instead of relying on `private` alone.
    (StatusCode::OK, [("cache-control", "private, max-age=60")], "User dashboard - private cache only")
        .into_response()
}

async fn get_product(axum::extract::Path(id): axum::extract::Path<u32>) -> Response {
    tokio::time::sleep(Duration::from_millis(100)).await;
    (
        StatusCode::OK,
        [("cache-control", "public, max-age=600")],
        format!("Product {} details - cached for 10 minutes", id),
    )
        .into_response()
}

async fn metrics(State(state): State<AppState>) -> Response {
    let metrics = &state.metrics;
    let hits = metrics.hits.load(std::sync::atomic::Ordering::Relaxed);
    let misses = metrics.misses.load(std::sync::atomic::Ordering::Relaxed);
    let stores = metrics.stores.load(std::sync::atomic::Ordering::Relaxed);
    let hit_rate = metrics.hit_rate() * 100.0;

    let body = format!(
        "Cache Metrics:\n  Hits: {}\n  Misses: {}\n  Stores: {}\n  Hit Rate: {:.1}%",
        hits, misses, stores, hit_rate
    );

    (StatusCode::OK, [("cache-control", "no-store")], body).into_response()
}

// Demonstrates a session-aware keyer: folds a cookie-derived session id into the
// vary-by prefix so distinct users never share a cache entry for the same path.
#[allow(dead_code)]
fn create_session_cache_layer(
    storage: Arc<dyn output_cache::Storage>,
) -> OutputCacheLayer<CustomKeyer<impl Fn(&Request<()>) -> String + Clone>> {
    let keyer = CustomKeyer::new(|req: &Request<()>| {
        let session = req
            .headers()
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .and_then(|cookies| cookies.split(';').find_map(|c| c.trim().strip_prefix("session=")))
            .unwrap_or("anonymous");
        format!("{} session:{}", req.uri().path(), session)
    });

    OutputCacheLayer::new(storage).with_keyer(keyer)
}
