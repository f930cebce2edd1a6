//! Shared key/value state with TTLs, hash fields, and atomic scripts.
//!
//! All cross-request mutable state (throttle buckets, cached responses,
//! circuit fields) lives behind [`KvStore`]. Two backends are provided:
//! [`MemoryStore`] for single-process deployments and [`RedisStore`] for a
//! shared remote store. Multi-step updates go through [`KvStore::atomic`],
//! which both backends execute linearizably per key.

mod memory;
mod redis;
mod script;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;
pub use self::script::{AtomicScript, ScriptReply};

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Store failures. Normal paths (missing keys, expired entries) are `Ok`.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store is unreachable or rejected the operation.
    #[error("store backend error: {0}")]
    Backend(String),
    /// A stored value could not be parsed as the expected shape.
    #[error("stored value malformed at `{key}`: {detail}")]
    Decode { key: String, detail: String },
    /// A script returned a reply the caller cannot interpret.
    #[error("unexpected script reply for `{0}`")]
    UnexpectedReply(String),
}

/// Abstract shared store; every operation is async and total.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Overwrite `key` with `value`, optionally bounding its lifetime.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>)
        -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Atomically add `delta`, creating the key at zero first. `ttl` only
    /// applies when the key is created by this call.
    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>)
        -> Result<i64, StoreError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    async fn hmget(&self, key: &str, fields: &[&str])
        -> Result<Vec<Option<String>>, StoreError>;

    async fn hmset(&self, key: &str, entries: &[(&str, String)]) -> Result<(), StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Remove every key starting with `prefix`; returns how many went away.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError>;

    /// Run a named script atomically against `key`.
    async fn atomic(&self, key: &str, script: &AtomicScript) -> Result<ScriptReply, StoreError>;
}

/// Namespace prefix applied to every shared key of one gateway instance.
///
/// Keys take the shape `{keyspace}:{category}:{logical_key}`.
#[derive(Debug, Clone)]
pub struct Keyspace {
    prefix: Arc<str>,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into().into() }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn throttle(&self, key: &str) -> String {
        format!("{}:throttle:{}", self.prefix, key)
    }

    pub fn cache(&self, key: &str) -> String {
        format!("{}:cache:{}", self.prefix, key)
    }

    pub fn circuit(&self, key: &str) -> String {
        format!("{}:cb:{}", self.prefix, key)
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new("premier")
    }
}
