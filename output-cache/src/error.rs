use miette::Diagnostic;
use thiserror::Error;

/// A `Result` typedef to use with the [`CacheError`] type.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors raised by the output-caching decision engine.
///
/// Per the engine's error-handling contract, only [`CacheError::ConfigurationError`]
/// and [`CacheError::CacheKeyUndefined`] are fatal to a request. Storage failures are
/// downgraded to a miss (on `get`) or a no-op (on `set`) by the engine itself and never
/// reach a caller as this type; they are logged instead.
#[derive(Error, Diagnostic, Debug)]
pub enum CacheError {
    /// The middleware was installed twice for the same request, or a required
    /// collaborator (storage backend, policy provider) was missing.
    #[error("configuration error: {0}")]
    #[diagnostic(code(output_cache::configuration))]
    ConfigurationError(String),

    /// The key provider returned an empty key when a key was required for lookup.
    #[error("cache key provider returned an empty key")]
    #[diagnostic(code(output_cache::cache_key_undefined))]
    CacheKeyUndefined,

    /// Error from the storage backend's `get` or `set`.
    #[error(transparent)]
    #[diagnostic(code(output_cache::storage))]
    Storage(#[from] Box<dyn std::error::Error + Send + Sync>),

    /// Error from the `http` crate while building or reading headers.
    #[error(transparent)]
    #[diagnostic(code(output_cache::http))]
    Http(#[from] http::Error),

    /// There was an error converting a header value to a string.
    #[error(transparent)]
    #[diagnostic(code(output_cache::header_to_str))]
    HeaderToStr(#[from] http::header::ToStrError),

    /// There was an error parsing a header value.
    #[error(transparent)]
    #[diagnostic(code(output_cache::invalid_header_value))]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),
}
