//! Basic HTTP output caching with output-cache-tower and Axum.
//!
//! ```bash
//! cargo run --example axum_basic
//!
//! curl -v http://localhost:3000/           # First request: MISS
//! curl -v http://localhost:3000/           # Second request: HIT
//! curl -v http://localhost:3000/users/42   # User endpoint with 30s cache
//! curl -v http://localhost:3000/no-cache   # Never cached
//! ```

use std::sync::Arc;

use axum::{
    error_handling::HandleErrorLayer,
    extract::Path,
    response::{IntoResponse, Response},
    routing::get,
    BoxError, Router,
};
use http::StatusCode;
use output_cache::InMemoryStorage;
use output_cache_tower::OutputCacheLayer;
use tower::ServiceBuilder;

#[tokio::main]
async fn main() {
    let storage = Arc::new(InMemoryStorage::with_size_limit(1024 * 1024));

    let app = Router::new()
        .route("/", get(index))
        .route("/users/{id}", get(get_user))
        .route("/no-cache", get(no_cache))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_cache_error))
                .layer(OutputCacheLayer::new(storage)),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await.unwrap();

    println!("Server running at http://localhost:3000");
    println!();
    println!("Try these commands:");
    println!("  curl -v http://localhost:3000/           # Watch repeated hits");
    println!("  curl -v http://localhost:3000/users/42   # User-specific endpoint");
    println!("  curl -v http://localhost:3000/no-cache   # Never cached");

    axum::serve(listener, app).await.unwrap();
}

async fn handle_cache_error(err: BoxError) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, format!("Cache error: {}", err)).into_response()
}

async fn index() -> Response {
    (
        StatusCode::OK,
        [("cache-control", "public, max-age=60")],
        "Hello! This response is cached for 60 seconds.",
    )
        .into_response()
}

async fn get_user(Path(id): Path<u32>) -> Response {
    (
        StatusCode::OK,
        [("cache-control", "public, max-age=30")],
        format!("User {} - cached for 30 seconds", id),
    )
        .into_response()
}

async fn no_cache() -> Response {
    (StatusCode::OK, [("cache-control", "no-store")], "This response is never cached")
        .into_response()
}
