//! The pluggable storage backend interface, plus an in-memory reference implementation.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use lru::LruCache;
use tokio::sync::Mutex;

use crate::entry::CachedResponse;

/// Error type a [`Storage`] backend may return from `get`/`set`.
///
/// Per the engine's error-handling contract, a `get` failure is treated as a miss and a
/// `set` failure as a no-op; neither ever fails the request.
pub type StorageError = Box<dyn std::error::Error + Send + Sync>;

/// A keyed store of cache entries with TTL-based expiration and an optional overall
/// size bound.
///
/// Implementations must be safe for concurrent `get`/`set` from many request tasks; the
/// engine does not serialize access on the caller's behalf.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Look up `key`. An expired entry is equivalent to absent.
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<CachedResponse>, StorageError>;

    /// Install `entry` under `key` with absolute expiry `now + ttl`.
    async fn set(
        &self,
        key: String,
        entry: CachedResponse,
        ttl: Duration,
    ) -> Result<(), StorageError>;

    /// Remove `key`, if present.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
}

struct Stored {
    entry: CachedResponse,
    expires_at: SystemTime,
}

/// Reference [`Storage`] backend: an `lru::LruCache` behind a `tokio::sync::Mutex`,
/// evicting the least-recently-used entry under size pressure.
///
/// `size_limit`, when set, bounds the sum of all cached response bodies in bytes.
pub struct InMemoryStorage {
    inner: Mutex<LruCache<String, Stored>>,
    size_limit: Option<usize>,
    size_in_use: Mutex<usize>,
}

impl InMemoryStorage {
    /// An unbounded-capacity, unbounded-size in-memory store.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LruCache::unbounded()),
            size_limit: None,
            size_in_use: Mutex::new(0),
        }
    }

    /// An in-memory store that evicts least-recently-used entries once the sum of
    /// cached bodies would exceed `size_limit` bytes.
    pub fn with_size_limit(size_limit: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::unbounded()),
            size_limit: Some(size_limit),
            size_in_use: Mutex::new(0),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get(
        &self,
        key: &str,
    ) -> Result<Option<CachedResponse>, StorageError> {
        let mut guard = self.inner.lock().await;
        let Some(stored) = guard.get(key) else {
            return Ok(None);
        };
        if stored.expires_at <= SystemTime::now() {
            guard.pop(key);
            return Ok(None);
        }
        Ok(Some(stored.entry.clone()))
    }

    async fn set(
        &self,
        key: String,
        entry: CachedResponse,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let expires_at = SystemTime::now() + ttl;
        let incoming_size = entry.body.len();

        let mut guard = self.inner.lock().await;
        let mut size_guard = self.size_in_use.lock().await;

        if let Some(old) = guard.pop(&key) {
            *size_guard = size_guard.saturating_sub(old.entry.body.len());
        }

        if let Some(limit) = self.size_limit {
            while *size_guard + incoming_size > limit {
                match guard.pop_lru() {
                    Some((_, evicted)) => {
                        *size_guard =
                            size_guard.saturating_sub(evicted.entry.body.len());
                    }
                    None => break,
                }
            }
        }

        *size_guard += incoming_size;
        guard.put(key, Stored { entry, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut guard = self.inner.lock().await;
        let mut size_guard = self.size_in_use.lock().await;
        if let Some(removed) = guard.pop(key) {
            *size_guard = size_guard.saturating_sub(removed.entry.body.len());
        }
        Ok(())
    }
}

/// A `Storage` handle shared across clones of a middleware (e.g. across Tower service
/// clones per request).
pub type SharedStorage = Arc<dyn Storage>;

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(body: &[u8]) -> CachedResponse {
        CachedResponse {
            created: SystemTime::now(),
            status: 200,
            headers: Default::default(),
            body: body.to_vec(),
        }
    }

    #[tokio::test]
    async fn get_before_ttl_hits_after_expiry_misses() {
        let storage = InMemoryStorage::new();
        storage
            .set("k".into(), entry(b"hello"), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(storage.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(storage.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn size_pressure_evicts_least_recently_used() {
        let storage = InMemoryStorage::with_size_limit(10);
        storage
            .set("a".into(), entry(b"12345"), Duration::from_secs(60))
            .await
            .unwrap();
        storage
            .set("b".into(), entry(b"12345"), Duration::from_secs(60))
            .await
            .unwrap();
        // touch "a" so "b" becomes the least-recently-used entry
        assert!(storage.get("a").await.unwrap().is_some());
        storage
            .set("c".into(), entry(b"12345"), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(storage.get("a").await.unwrap().is_some());
        assert!(storage.get("b").await.unwrap().is_none());
        assert!(storage.get("c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let storage = InMemoryStorage::new();
        storage
            .set("k".into(), entry(b"hello"), Duration::from_secs(60))
            .await
            .unwrap();
        storage.delete("k").await.unwrap();
        assert!(storage.get("k").await.unwrap().is_none());
    }
}
