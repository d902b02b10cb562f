//! Core decision engine for an HTTP output-caching middleware.
//!
//! This crate is transport-agnostic: it knows nothing of Tower, Axum, or any other
//! server framework. It exposes the request-lifecycle state machine
//! ([`engine::CacheEngine`]), the pluggable collaborators it's built from
//! ([`storage::Storage`], [`policy::PolicyProvider`], [`key::KeyProvider`],
//! [`clock::Clock`]), and the response-capture body wrapper
//! ([`capture::CaptureBody`]) that an adapter crate (e.g. `output-cache-tower`) wires
//! into an actual request/response cycle.

pub mod capture;
pub mod clock;
pub mod conditional;
pub mod context;
pub mod engine;
pub mod entry;
pub mod error;
pub mod key;
pub mod policy;
pub mod storage;

pub use capture::CaptureBody;
pub use clock::{Clock, FixedClock, SystemClock};
pub use context::RequestContext;
pub use engine::{
    install_feature_marker, prepare_serve, remove_feature_marker, CacheEngine,
    CacheEngineOptions, CacheMetrics, LookupOutcome, OutputCachingFeature, ServeDecision,
};
pub use entry::CachedResponse;
pub use error::{CacheError, Result};
pub use key::{DefaultKeyProvider, KeyProvider, KeyableRequest, VaryByRules};
pub use policy::{DefaultPolicy, PolicyProvider};
pub use storage::{InMemoryStorage, SharedStorage, Storage, StorageError};
