//! In-process store: sharded maps behind mutexes, lazy TTL, optional sweeper.

use super::script::{self, AtomicScript, BreakerFields, BucketWrite, ScriptReply};
use super::{KvStore, StoreError};
use crate::breaker::CircuitState;
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone)]
enum Value {
    Bytes(Bytes),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<f64>,
}

struct Shared {
    shards: Vec<Mutex<HashMap<String, Entry>>>,
    clock: Arc<dyn Clock>,
}

impl Shared {
    fn shard(&self, key: &str) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = hasher.finish() as usize % self.shards.len();
        self.shards[index].lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock the owning shard and drop `key` if its TTL has lapsed.
    fn shard_fresh(&self, key: &str) -> (MutexGuard<'_, HashMap<String, Entry>>, f64) {
        let now = self.clock.now();
        let mut guard = self.shard(key);
        let expired = guard
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|at| at <= now);
        if expired {
            guard.remove(key);
        }
        (guard, now)
    }

    fn sweep(&self) {
        let now = self.clock.now();
        for shard in &self.shards {
            let mut guard = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        }
    }
}

struct SweeperGuard(tokio::task::JoinHandle<()>);

impl Drop for SweeperGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Single-process [`KvStore`]. Cheap to clone; clones share state.
///
/// Expiry is enforced lazily on access; [`with_sweeper`] adds a periodic
/// scan so idle keys do not accumulate.
///
/// [`with_sweeper`]: MemoryStore::with_sweeper
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Shared>,
    _sweeper: Option<Arc<SweeperGuard>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect();
        Self {
            inner: Arc::new(Shared { shards, clock }),
            _sweeper: None,
        }
    }

    /// Spawn a background task that evicts expired entries every `every`.
    /// Must be called from within a tokio runtime; the task stops when the
    /// last clone of this store is dropped.
    pub fn with_sweeper(mut self, every: Duration) -> Self {
        let shared = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match shared.upgrade() {
                    Some(shared) => shared.sweep(),
                    None => break,
                }
            }
        });
        self._sweeper = Some(Arc::new(SweeperGuard(handle)));
        self
    }

    fn decode_err(key: &str, detail: &str) -> StoreError {
        StoreError::Decode { key: key.to_string(), detail: detail.to_string() }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_u64(map: &HashMap<String, String>, key: &str, field: &str) -> Result<Option<u64>, StoreError> {
    map.get(field)
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|_| MemoryStore::decode_err(key, &format!("field `{field}` is not an integer")))
        })
        .transpose()
}

fn hash_f64(map: &HashMap<String, String>, key: &str, field: &str) -> Result<Option<f64>, StoreError> {
    map.get(field)
        .map(|raw| {
            raw.parse::<f64>()
                .map_err(|_| MemoryStore::decode_err(key, &format!("field `{field}` is not a number")))
        })
        .transpose()
}

fn breaker_fields(map: &HashMap<String, String>, key: &str) -> Result<BreakerFields, StoreError> {
    let state = match map.get("state").map(String::as_str) {
        None => CircuitState::Closed,
        Some(raw) => CircuitState::parse(raw)
            .ok_or_else(|| MemoryStore::decode_err(key, "unknown circuit state"))?,
    };
    Ok(BreakerFields {
        state,
        failure_count: hash_u64(map, key, "failure_count")?.unwrap_or(0) as u32,
        opened_at: hash_f64(map, key, "opened_at")?.unwrap_or(0.0),
        probe_in_flight: map.get("probe").map(String::as_str) == Some("1"),
    })
}

fn apply_write(
    guard: &mut HashMap<String, Entry>,
    key: &str,
    write: BucketWrite,
    now: f64,
) {
    let entry = guard.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::Hash(HashMap::new()),
        expires_at: None,
    });
    if !matches!(entry.value, Value::Hash(_)) {
        entry.value = Value::Hash(HashMap::new());
    }
    if let Value::Hash(map) = &mut entry.value {
        for (field, value) in write.fields {
            map.insert(field.to_string(), value);
        }
    }
    if let Some(ttl) = write.ttl {
        entry.expires_at = Some(now + ttl.as_secs_f64());
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let (guard, _) = self.inner.shard_fresh(key);
        match guard.get(key) {
            None => Ok(None),
            Some(entry) => match &entry.value {
                Value::Bytes(bytes) => Ok(Some(bytes.clone())),
                Value::Hash(_) => Err(Self::decode_err(key, "holds a hash, not bytes")),
            },
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let (mut guard, now) = self.inner.shard_fresh(key);
        guard.insert(
            key.to_string(),
            Entry {
                value: Value::Bytes(value),
                expires_at: ttl.map(|ttl| now + ttl.as_secs_f64()),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let (mut guard, _) = self.inner.shard_fresh(key);
        guard.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, StoreError> {
        let (mut guard, now) = self.inner.shard_fresh(key);
        match guard.get_mut(key) {
            None => {
                guard.insert(
                    key.to_string(),
                    Entry {
                        value: Value::Bytes(Bytes::from(delta.to_string())),
                        expires_at: ttl.map(|ttl| now + ttl.as_secs_f64()),
                    },
                );
                Ok(delta)
            }
            Some(entry) => match &entry.value {
                Value::Bytes(bytes) => {
                    let current: i64 = std::str::from_utf8(bytes)
                        .ok()
                        .and_then(|raw| raw.parse().ok())
                        .ok_or_else(|| Self::decode_err(key, "value is not an integer"))?;
                    let next = current + delta;
                    entry.value = Value::Bytes(Bytes::from(next.to_string()));
                    Ok(next)
                }
                Value::Hash(_) => Err(Self::decode_err(key, "holds a hash, not an integer")),
            },
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let (guard, _) = self.inner.shard_fresh(key);
        match guard.get(key) {
            None => Ok(None),
            Some(Entry { value: Value::Hash(map), .. }) => Ok(map.get(field).cloned()),
            Some(_) => Err(Self::decode_err(key, "holds bytes, not a hash")),
        }
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        self.hmset(key, &[(field, value.to_string())]).await
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        let (guard, _) = self.inner.shard_fresh(key);
        match guard.get(key) {
            None => Ok(vec![None; fields.len()]),
            Some(Entry { value: Value::Hash(map), .. }) => {
                Ok(fields.iter().map(|field| map.get(*field).cloned()).collect())
            }
            Some(_) => Err(Self::decode_err(key, "holds bytes, not a hash")),
        }
    }

    async fn hmset(&self, key: &str, entries: &[(&str, String)]) -> Result<(), StoreError> {
        let (mut guard, _) = self.inner.shard_fresh(key);
        let entry = guard.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            Value::Hash(map) => {
                for (field, value) in entries {
                    map.insert(field.to_string(), value.clone());
                }
                Ok(())
            }
            Value::Bytes(_) => Err(Self::decode_err(key, "holds bytes, not a hash")),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let (mut guard, now) = self.inner.shard_fresh(key);
        if let Some(entry) = guard.get_mut(key) {
            entry.expires_at = Some(now + ttl.as_secs_f64());
        }
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut removed = 0;
        for shard in &self.inner.shards {
            let mut guard = shard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let before = guard.len();
            guard.retain(|key, _| !key.starts_with(prefix));
            removed += (before - guard.len()) as u64;
        }
        Ok(removed)
    }

    async fn atomic(&self, key: &str, script: &AtomicScript) -> Result<ScriptReply, StoreError> {
        let (mut guard, now) = self.inner.shard_fresh(key);

        let hash_of = |guard: &HashMap<String, Entry>| -> Result<HashMap<String, String>, StoreError> {
            match guard.get(key) {
                None => Ok(HashMap::new()),
                Some(Entry { value: Value::Hash(map), .. }) => Ok(map.clone()),
                Some(_) => Err(Self::decode_err(key, "holds bytes, not a hash")),
            }
        };

        let (reply, write) = match script {
            AtomicScript::FixedWindow { quota, duration } => {
                let map = hash_of(&guard)?;
                let current = match (
                    hash_u64(&map, key, "window_end")?,
                    hash_u64(&map, key, "count")?,
                ) {
                    (Some(end), Some(count)) => Some((end, count)),
                    _ => None,
                };
                script::fixed_window(now as u64, *quota, *duration, current)
            }
            AtomicScript::SlidingWindow { quota, duration } => {
                let map = hash_of(&guard)?;
                let current = match (
                    hash_u64(&map, key, "window_start")?,
                    hash_u64(&map, key, "count")?,
                ) {
                    (Some(start), Some(count)) => Some((start, count)),
                    _ => None,
                };
                script::sliding_window(now as u64, *quota, *duration, current)
            }
            AtomicScript::TokenBucket { quota, duration } => {
                let map = hash_of(&guard)?;
                let current = match (
                    hash_f64(&map, key, "last_refill")?,
                    hash_f64(&map, key, "tokens")?,
                ) {
                    (Some(last), Some(tokens)) => Some((last, tokens)),
                    _ => None,
                };
                script::token_bucket(now, *quota, *duration, current)
            }
            AtomicScript::LeakyBucket { quota, duration, bucket_size } => {
                let map = hash_of(&guard)?;
                let current = match (
                    hash_f64(&map, key, "last_leak")?,
                    hash_f64(&map, key, "level")?,
                ) {
                    (Some(last), Some(level)) => Some((last, level)),
                    _ => None,
                };
                script::leaky_bucket(now, *quota, *duration, *bucket_size, current)
            }
            AtomicScript::AcquireLock { ttl } => {
                if guard.contains_key(key) {
                    (ScriptReply::Busy, None)
                } else {
                    guard.insert(
                        key.to_string(),
                        Entry {
                            value: Value::Bytes(Bytes::from_static(b"1")),
                            expires_at: Some(now + ttl.as_secs_f64()),
                        },
                    );
                    (ScriptReply::Acquired, None)
                }
            }
            AtomicScript::BreakerAdmit { recovery_timeout } => {
                let map = hash_of(&guard)?;
                let current = if map.is_empty() { None } else { Some(breaker_fields(&map, key)?) };
                script::breaker_admit(now, *recovery_timeout, current)
            }
            AtomicScript::BreakerRecord { success, failure_threshold } => {
                let map = hash_of(&guard)?;
                let current = if map.is_empty() { None } else { Some(breaker_fields(&map, key)?) };
                script::breaker_record(now, *success, *failure_threshold, current)
            }
        };

        if let Some(write) = write {
            apply_write(&mut guard, key, write, now);
        }
        Ok(reply)
    }
}
