//! The immutable, committed cache entry.

use std::collections::HashMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// An immutable snapshot of a captured response, from commit until TTL expiry or
/// eviction.
///
/// `body` is exactly the bytes the downstream handler wrote, bounded by
/// `maximum_body_size`; responses exceeding that bound are never committed, so an
/// entry's presence in storage implies its body fit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CachedResponse {
    /// When the response was captured; equals the `Date` header value, which equals the
    /// response-start time taken from the clock.
    pub created: SystemTime,
    /// The captured status code.
    pub status: u16,
    /// All response headers at commit time, except `Age` (which is computed fresh on
    /// every serve).
    pub headers: HashMap<String, Vec<String>>,
    /// The captured response body.
    pub body: Vec<u8>,
}

impl CachedResponse {
    /// The first value of `name`, if the header is present.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase())?.first().map(String::as_str)
    }
}
