//! TTL-keyed response memoization with single-flight production.
//!
//! At most one producer runs per key across every process sharing the
//! store: the winner holds a set-if-absent lock while it computes, local
//! concurrent callers wait on a broadcast channel, and callers in other
//! processes poll the store with backoff until the winner publishes.

use crate::clock::Clock;
use crate::error::GatewayError;
use crate::sleeper::Sleeper;
use crate::store::{AtomicScript, Keyspace, KvStore, ScriptReply, StoreError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// How long a producer may hold the single-flight lock before other
/// callers treat it as dead and contend for production themselves.
const LOCK_TTL: Duration = Duration::from_secs(10);

const POLL_INITIAL: Duration = Duration::from_millis(25);
const POLL_MAX: Duration = Duration::from_millis(250);

/// One cached response, immutable until its TTL lapses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_b64")]
    pub body: Bytes,
    pub expires_at: Option<f64>,
}

mod body_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map(Bytes::from).map_err(serde::de::Error::custom)
    }
}

type ProduceResult = Result<CachedResponse, String>;

/// Keyed memoization over the shared store.
#[derive(Clone)]
pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    keyspace: Keyspace,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    inflight: Arc<Mutex<HashMap<String, broadcast::Sender<ProduceResult>>>>,
}

impl ResponseCache {
    pub fn new(
        store: Arc<dyn KvStore>,
        keyspace: Keyspace,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            store,
            keyspace,
            clock,
            sleeper,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cache key for an HTTP response: method, path, and the query string
    /// with its parameters sorted so equivalent URLs collide.
    pub fn response_key(method: &str, path: &str, query: Option<&str>) -> String {
        let normalized_query = query
            .map(|raw| {
                let mut params: Vec<&str> = raw.split('&').filter(|p| !p.is_empty()).collect();
                params.sort_unstable();
                params.join("&")
            })
            .unwrap_or_default();
        let mut digest = Sha256::new();
        digest.update(method.as_bytes());
        digest.update(b" ");
        digest.update(path.as_bytes());
        digest.update(b"?");
        digest.update(normalized_query.as_bytes());
        hex::encode(digest.finalize())
    }

    /// Fetch `key` if present and unexpired.
    pub async fn lookup(&self, key: &str) -> Result<Option<CachedResponse>, GatewayError> {
        let store_key = self.keyspace.cache(key);
        let Some(raw) = self.store.get(&store_key).await? else {
            return Ok(None);
        };
        let entry: CachedResponse = serde_json::from_slice(&raw).map_err(|err| {
            StoreError::Decode { key: store_key.clone(), detail: err.to_string() }
        })?;
        if entry.expires_at.is_some_and(|at| at <= self.clock.now()) {
            self.store.delete(&store_key).await?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    /// Write `entry` under `key` with the given lifetime.
    pub async fn insert(
        &self,
        key: &str,
        entry: &CachedResponse,
        ttl: Duration,
    ) -> Result<(), GatewayError> {
        let store_key = self.keyspace.cache(key);
        let raw = serde_json::to_vec(entry).map_err(|err| StoreError::Decode {
            key: store_key.clone(),
            detail: err.to_string(),
        })?;
        self.store.set(&store_key, Bytes::from(raw), Some(ttl)).await?;
        Ok(())
    }

    /// Drop every cached entry, or only those under `prefix`.
    pub async fn clear(&self, prefix: Option<&str>) -> Result<u64, GatewayError> {
        let full = self.keyspace.cache(prefix.unwrap_or(""));
        Ok(self.store.delete_prefix(&full).await?)
    }

    /// Return the cached value for `key`, producing it at most once.
    ///
    /// The boolean is true when the value came from cache (including values
    /// published by a concurrent producer). `cacheable` gates storage:
    /// rejected entries are returned to the caller but not persisted.
    pub async fn get_or_compute<F, Fut, C>(
        &self,
        key: &str,
        ttl: Duration,
        cacheable: C,
        producer: F,
    ) -> Result<(CachedResponse, bool), GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse, GatewayError>>,
        C: Fn(&CachedResponse) -> bool,
    {
        let lock_key = self.keyspace.cache(&format!("{key}:sf"));
        let mut producer = Some(producer);
        let mut poll_wait = POLL_INITIAL;

        loop {
            if let Some(entry) = self.lookup(key).await? {
                return Ok((entry, true));
            }

            // A local producer in flight means we can wait on its channel
            // instead of polling the store.
            let waiter = {
                let inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
                inflight.get(key).map(|tx| tx.subscribe())
            };
            if let Some(mut rx) = waiter {
                match rx.recv().await {
                    Ok(Ok(entry)) => return Ok((entry, true)),
                    Ok(Err(message)) => {
                        return Err(GatewayError::Upstream(format!(
                            "cache producer failed: {message}"
                        )));
                    }
                    // Producer dropped mid-flight; contend again.
                    Err(_) => continue,
                }
            }

            match self
                .store
                .atomic(&lock_key, &AtomicScript::AcquireLock { ttl: LOCK_TTL })
                .await?
            {
                ScriptReply::Acquired => {
                    let Some(producer) = producer.take() else {
                        return Err(StoreError::UnexpectedReply(lock_key).into());
                    };
                    return self.produce(key, &lock_key, ttl, cacheable, producer).await;
                }
                ScriptReply::Busy => {
                    self.sleeper.sleep(poll_wait).await;
                    poll_wait = (poll_wait * 2).min(POLL_MAX);
                }
                _ => return Err(StoreError::UnexpectedReply(lock_key).into()),
            }
        }
    }

    async fn produce<F, Fut, C>(
        &self,
        key: &str,
        lock_key: &str,
        ttl: Duration,
        cacheable: C,
        producer: F,
    ) -> Result<(CachedResponse, bool), GatewayError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CachedResponse, GatewayError>>,
        C: Fn(&CachedResponse) -> bool,
    {
        let (tx, _) = broadcast::channel(1);
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            inflight.insert(key.to_string(), tx.clone());
        }
        let guard = ProducerGuard {
            cache: self,
            key: key.to_string(),
            lock_key: lock_key.to_string(),
            lock_released: false,
        };

        let result = producer().await;
        match result {
            Ok(mut entry) => {
                if cacheable(&entry) {
                    entry.expires_at = Some(self.clock.now() + ttl.as_secs_f64());
                    self.insert(key, &entry, ttl).await?;
                }
                guard.release().await;
                let _ = tx.send(Ok(entry.clone()));
                Ok((entry, false))
            }
            Err(err) => {
                guard.release().await;
                let _ = tx.send(Err(err.to_string()));
                Err(err)
            }
        }
    }
}

/// Cleans up lock and waiter registration even when the producing future
/// is dropped by a pipeline timeout.
struct ProducerGuard<'a> {
    cache: &'a ResponseCache,
    key: String,
    lock_key: String,
    lock_released: bool,
}

impl ProducerGuard<'_> {
    async fn release(mut self) {
        if let Err(err) = self.cache.store.delete(&self.lock_key).await {
            tracing::warn!(key = %self.lock_key, %err, "failed to release single-flight lock");
        }
        self.lock_released = true;
        // Drop runs next and clears the in-flight registration.
    }
}

impl Drop for ProducerGuard<'_> {
    fn drop(&mut self) {
        let mut inflight = self.cache.inflight.lock().unwrap_or_else(|p| p.into_inner());
        inflight.remove(&self.key);
        drop(inflight);

        if !self.lock_released {
            // Cancelled mid-produce: free the lock so another caller can
            // take over without waiting out the lock TTL.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let store = Arc::clone(&self.cache.store);
                let lock_key = std::mem::take(&mut self.lock_key);
                handle.spawn(async move {
                    let _ = store.delete(&lock_key).await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sleeper::TokioSleeper;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(body: &str) -> CachedResponse {
        CachedResponse {
            status: 200,
            content_type: Some("text/plain".to_string()),
            headers: vec![("x-test".to_string(), "1".to_string())],
            body: Bytes::from(body.to_string()),
            expires_at: None,
        }
    }

    fn cache_at(start: f64) -> (Arc<ResponseCache>, ManualClock) {
        let clock = ManualClock::starting_at(start);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let cache = ResponseCache::new(
            Arc::new(store),
            Keyspace::new("test"),
            Arc::new(clock.clone()),
            Arc::new(TokioSleeper),
        );
        (Arc::new(cache), clock)
    }

    #[tokio::test]
    async fn insert_then_lookup_until_expiry() {
        let (cache, clock) = cache_at(0.0);
        let mut value = entry("hello");
        value.expires_at = Some(60.0);

        cache.insert("k", &value, Duration::from_secs(60)).await.unwrap();
        assert_eq!(cache.lookup("k").await.unwrap(), Some(value));

        clock.advance(61.0);
        assert_eq!(cache.lookup("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn response_key_normalizes_query_order() {
        let a = ResponseCache::response_key("GET", "/api/users", Some("b=2&a=1"));
        let b = ResponseCache::response_key("GET", "/api/users", Some("a=1&b=2"));
        let c = ResponseCache::response_key("GET", "/api/users", Some("a=1&b=3"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(
            ResponseCache::response_key("GET", "/api/users", None),
            ResponseCache::response_key("HEAD", "/api/users", None)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn producer_runs_once_for_concurrent_callers() {
        let (cache, _clock) = cache_at(0.0);
        let produced = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let produced = Arc::clone(&produced);
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k", Duration::from_secs(60), |_| true, || async move {
                        produced.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(entry("computed"))
                    })
                    .await
            }));
        }

        let mut hits = 0;
        for task in tasks {
            let (value, hit) = task.await.unwrap().unwrap();
            assert_eq!(value.body, Bytes::from_static(b"computed"));
            if hit {
                hits += 1;
            }
        }

        assert_eq!(produced.load(Ordering::SeqCst), 1, "single producer");
        assert_eq!(hits, 7, "everyone but the winner sees a cache hit");
    }

    #[tokio::test(start_paused = true)]
    async fn producer_error_reaches_waiters() {
        let (cache, _clock) = cache_at(0.0);

        let winner = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute("k", Duration::from_secs(60), |_| true, || async {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err(GatewayError::Upstream("backend exploded".into()))
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;
        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute("k", Duration::from_secs(60), |_| true, || async {
                        Ok(entry("should not run"))
                    })
                    .await
            })
        };

        assert!(winner.await.unwrap().is_err());
        let err = waiter.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("backend exploded"));
    }

    #[tokio::test]
    async fn uncacheable_entries_are_returned_but_not_stored() {
        let (cache, _clock) = cache_at(0.0);
        let produced = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let produced = Arc::clone(&produced);
            let (value, hit) = cache
                .get_or_compute(
                    "k",
                    Duration::from_secs(60),
                    |entry| entry.status < 500,
                    || async move {
                        produced.fetch_add(1, Ordering::SeqCst);
                        let mut failure = entry("oops");
                        failure.status = 502;
                        Ok(failure)
                    },
                )
                .await
                .unwrap();
            assert_eq!(value.status, 502);
            assert!(!hit);
        }
        assert_eq!(produced.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_removes_entries_by_prefix() {
        let (cache, _clock) = cache_at(0.0);
        cache.insert("a1", &entry("1"), Duration::from_secs(60)).await.unwrap();
        cache.insert("a2", &entry("2"), Duration::from_secs(60)).await.unwrap();
        cache.insert("b1", &entry("3"), Duration::from_secs(60)).await.unwrap();

        assert_eq!(cache.clear(Some("a")).await.unwrap(), 2);
        assert!(cache.lookup("a1").await.unwrap().is_none());
        assert!(cache.lookup("b1").await.unwrap().is_some());

        assert_eq!(cache.clear(None).await.unwrap(), 1);
        assert!(cache.lookup("b1").await.unwrap().is_none());
    }
}
