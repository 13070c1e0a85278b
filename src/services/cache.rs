//! In-memory result cache with TTL and single-flight computation
//!
//! Used for caching remote catalogue and episode-db responses per media id.
//! Expired entries are dropped lazily when read. Concurrent
//! [`ResultCache::get_or_compute`] callers for the same key share one
//! computation; failed computations are not stored.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};

/// A cached entry with optional expiration time
#[derive(Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

type SharedResult<V> = Result<V, Arc<anyhow::Error>>;
type InFlight<V> = Shared<BoxFuture<'static, SharedResult<V>>>;

struct Inner<K, V> {
    entries: RwLock<HashMap<K, CacheEntry<V>>>,
    in_flight: Mutex<HashMap<K, InFlight<V>>>,
    default_ttl: Option<Duration>,
}

/// Concurrent key/value cache; clones share the same storage
pub struct ResultCache<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for ResultCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Default for ResultCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ResultCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Cache whose entries never expire
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Cache whose entries expire after `ttl` unless set otherwise
    pub fn with_ttl(ttl: Duration) -> Self {
        Self::build(Some(ttl))
    }

    fn build(default_ttl: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                default_ttl,
            }),
        }
    }

    /// Get a cached value if it exists and hasn't expired
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let entries = self.inner.entries.read();
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
                Some(_) => {}
                None => return None,
            }
        }
        // Expired: drop it so the map does not grow with dead entries
        let mut entries = self.inner.entries.write();
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        None
    }

    /// Set a value with the default TTL
    pub fn set(&self, key: K, value: V) {
        self.insert(key, value, self.inner.default_ttl);
    }

    /// Set a value with a custom TTL
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.insert(key, value, Some(ttl));
    }

    fn insert(&self, key: K, value: V, ttl: Option<Duration>) {
        let entry = CacheEntry {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.inner.entries.write().insert(key, entry);
    }

    pub fn remove(&self, key: &K) {
        self.inner.entries.write().remove(key);
    }

    pub fn clear(&self) {
        self.inner.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every live value
    pub fn values(&self) -> Vec<V> {
        let now = Instant::now();
        self.inner
            .entries
            .read()
            .values()
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
            .collect()
    }

    /// Return the cached value or compute it once for all concurrent callers.
    ///
    /// `compute` runs at most once per key while a computation is in flight.
    /// Every waiter receives the same outcome. Errors are not cached, so the
    /// next call after a failure computes again.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> anyhow::Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        if let Some(value) = self.get(&key) {
            return Ok(value);
        }

        let shared = {
            let mut in_flight = self.inner.in_flight.lock();
            // The computing future stores its value before leaving the in-flight
            // map, so a re-check under this lock cannot miss a finished result.
            if let Some(value) = self.get(&key) {
                return Ok(value);
            }
            match in_flight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let fut = compute();
                    let inner = self.inner.clone();
                    let owned_key = key.clone();
                    let shared = async move {
                        let result = fut.await.map_err(Arc::new);
                        if let Ok(value) = &result {
                            let entry = CacheEntry {
                                value: value.clone(),
                                expires_at: inner.default_ttl.map(|ttl| Instant::now() + ttl),
                            };
                            inner.entries.write().insert(owned_key.clone(), entry);
                        }
                        inner.in_flight.lock().remove(&owned_key);
                        result
                    }
                    .boxed()
                    .shared();
                    in_flight.insert(key, shared.clone());
                    shared
                }
            }
        };

        shared.await.map_err(|e| anyhow::anyhow!("{e:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread::sleep;

    #[test]
    fn test_cache_set_and_get() {
        let cache = ResultCache::new();
        cache.set("key".to_string(), "value".to_string());
        assert_eq!(cache.get(&"key".to_string()), Some("value".to_string()));
    }

    #[test]
    fn test_cache_expiration() {
        let cache = ResultCache::new();
        cache.set_with_ttl(1, "value", Duration::from_millis(50));
        assert_eq!(cache.get(&1), Some("value"));

        sleep(Duration::from_millis(60));
        assert_eq!(cache.get(&1), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_get_or_compute_single_flight() {
        let cache: ResultCache<i32, String> = ResultCache::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute(7, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Ok("seven".to_string())
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "seven");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_compute_does_not_cache_errors() {
        let cache: ResultCache<i32, i32> = ResultCache::new();

        let first = cache
            .get_or_compute(1, || async { Err(anyhow::anyhow!("remote down")) })
            .await;
        assert!(first.unwrap_err().to_string().contains("remote down"));
        assert!(cache.get(&1).is_none());

        let second = cache.get_or_compute(1, || async { Ok(42) }).await.unwrap();
        assert_eq!(second, 42);
        assert_eq!(cache.get(&1), Some(42));
    }
}
