//! Remote shared store backed by Redis.
//!
//! Multi-step updates ship as Lua so admission decisions stay linearizable
//! across every gateway instance pointing at the same server. The scripts
//! read the server clock (`TIME`), which keeps all instances on one
//! timeline regardless of local clock skew.

use super::script::{AtomicScript, ScriptReply};
use super::{KvStore, StoreError};
use crate::breaker::CircuitState;
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::sync::Arc;
use std::time::Duration;

const FIXED_WINDOW_LUA: &str = r#"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1])
local quota = tonumber(ARGV[1])
local duration = tonumber(ARGV[2])
local bucket = redis.call('HMGET', KEYS[1], 'window_end', 'count')
local window_end = tonumber(bucket[1])
local count = tonumber(bucket[2])
if window_end == nil or now >= window_end then
  redis.call('HMSET', KEYS[1], 'window_end', now + duration, 'count', 1)
  redis.call('EXPIRE', KEYS[1], duration)
  return '-1'
end
if count >= quota then
  return tostring(window_end - now)
end
redis.call('HINCRBY', KEYS[1], 'count', 1)
return '-1'
"#;

const SLIDING_WINDOW_LUA: &str = r#"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1])
local quota = tonumber(ARGV[1])
local duration = tonumber(ARGV[2])
local bucket = redis.call('HMGET', KEYS[1], 'window_start', 'count')
local start = tonumber(bucket[1])
local count = tonumber(bucket[2])
if start == nil then
  start = now
  count = 0
end
local elapsed = now - start
local progress = elapsed % duration
local periods = math.floor(elapsed / duration)
local adjusted = math.max(0, count - periods * quota)
if adjusted >= quota then
  return tostring((duration - progress) + ((adjusted - quota + 1) / quota) * duration)
end
redis.call('HMSET', KEYS[1], 'window_start', now - progress, 'count', adjusted + 1)
redis.call('EXPIRE', KEYS[1], duration)
return '-1'
"#;

const TOKEN_BUCKET_LUA: &str = r#"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000
local quota = tonumber(ARGV[1])
local duration = tonumber(ARGV[2])
local rate = quota / duration
local bucket = redis.call('HMGET', KEYS[1], 'last_refill', 'tokens')
local last = tonumber(bucket[1])
local tokens = tonumber(bucket[2])
if last == nil then
  last = now
  tokens = quota
end
local refilled = math.min(quota, tokens + math.max(0, now - last) * rate)
if refilled < 1 then
  return tostring((1 - refilled) / rate)
end
redis.call('HMSET', KEYS[1], 'last_refill', now, 'tokens', refilled - 1)
redis.call('EXPIRE', KEYS[1], duration * 2)
return '-1'
"#;

const LEAKY_BUCKET_LUA: &str = r#"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000
local quota = tonumber(ARGV[1])
local duration = tonumber(ARGV[2])
local bucket_size = tonumber(ARGV[3])
local rate = quota / duration
local bucket = redis.call('HMGET', KEYS[1], 'last_leak', 'level')
local last = tonumber(bucket[1])
local level = tonumber(bucket[2])
if last == nil then
  last = now
  level = 0
end
local drained = math.max(0, level - math.max(0, now - last) * rate)
if drained >= bucket_size then
  return 'full'
end
redis.call('HMSET', KEYS[1], 'last_leak', now, 'level', drained + 1)
redis.call('EXPIRE', KEYS[1], duration * 2)
local delay = drained / rate
if delay > 0 then
  return tostring(delay)
end
return '-1'
"#;

const BREAKER_ADMIT_LUA: &str = r#"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000
local recovery = tonumber(ARGV[1])
local fields = redis.call('HMGET', KEYS[1], 'state', 'opened_at', 'probe')
local state = fields[1]
if state == false or state == 'closed' then
  return 'pass'
end
if state == 'open' then
  local elapsed = now - (tonumber(fields[2]) or 0)
  if elapsed >= recovery then
    redis.call('HMSET', KEYS[1], 'state', 'half_open', 'probe', 1)
    return 'probe'
  end
  return 'open:' .. tostring(recovery - elapsed)
end
if fields[3] == '1' then
  return 'open:0'
end
redis.call('HSET', KEYS[1], 'probe', 1)
return 'probe'
"#;

const BREAKER_RECORD_LUA: &str = r#"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1]) + tonumber(time[2]) / 1000000
local success = ARGV[1] == '1'
local threshold = tonumber(ARGV[2])
local fields = redis.call('HMGET', KEYS[1], 'state', 'failure_count')
local state = fields[1]
if state == false then
  state = 'closed'
end
local failures = tonumber(fields[2]) or 0
if success then
  if state == 'open' then
    return 'open'
  end
  redis.call('HMSET', KEYS[1], 'state', 'closed', 'failure_count', 0, 'opened_at', 0, 'probe', 0)
  return 'closed'
end
if state == 'half_open' then
  redis.call('HMSET', KEYS[1], 'state', 'open', 'opened_at', now, 'probe', 0)
  return 'open'
end
if state == 'open' then
  redis.call('HINCRBY', KEYS[1], 'failure_count', 1)
  return 'open'
end
failures = failures + 1
if failures >= threshold then
  redis.call('HMSET', KEYS[1], 'state', 'open', 'failure_count', failures, 'opened_at', now)
  return 'open'
end
redis.call('HSET', KEYS[1], 'failure_count', failures)
return 'closed'
"#;

const INCR_LUA: &str = r#"
local next = redis.call('INCRBY', KEYS[1], ARGV[1])
local ttl_ms = tonumber(ARGV[2])
if ttl_ms > 0 and next == tonumber(ARGV[1]) then
  redis.call('PEXPIRE', KEYS[1], ttl_ms)
end
return next
"#;

struct Scripts {
    fixed_window: Script,
    sliding_window: Script,
    token_bucket: Script,
    leaky_bucket: Script,
    breaker_admit: Script,
    breaker_record: Script,
    incr: Script,
}

/// Redis-backed [`KvStore`]; clones share one multiplexed connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: MultiplexedConnection,
    scripts: Arc<Scripts>,
}

impl RedisStore {
    /// Connect to `url` (for example `redis://127.0.0.1/`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(backend)?;
        let scripts = Arc::new(Scripts {
            fixed_window: Script::new(FIXED_WINDOW_LUA),
            sliding_window: Script::new(SLIDING_WINDOW_LUA),
            token_bucket: Script::new(TOKEN_BUCKET_LUA),
            leaky_bucket: Script::new(LEAKY_BUCKET_LUA),
            breaker_admit: Script::new(BREAKER_ADMIT_LUA),
            breaker_record: Script::new(BREAKER_RECORD_LUA),
            incr: Script::new(INCR_LUA),
        });
        Ok(Self { conn, scripts })
    }
}

fn backend(err: redis::RedisError) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Throttle script replies: `-1` admitted, `full` saturated, else wait secs.
fn parse_throttle_reply(key: &str, raw: &str) -> Result<ScriptReply, StoreError> {
    if raw == "full" {
        return Ok(ScriptReply::Saturated);
    }
    let value: f64 = raw
        .parse()
        .map_err(|_| StoreError::UnexpectedReply(key.to_string()))?;
    if value < 0.0 {
        Ok(ScriptReply::Admitted)
    } else {
        Ok(ScriptReply::Throttled { wait: value })
    }
}

fn parse_admit_reply(key: &str, raw: &str) -> Result<ScriptReply, StoreError> {
    match raw {
        "pass" => Ok(ScriptReply::Pass),
        "probe" => Ok(ScriptReply::Probe),
        _ => {
            let wait = raw
                .strip_prefix("open:")
                .and_then(|rest| rest.parse::<f64>().ok())
                .ok_or_else(|| StoreError::UnexpectedReply(key.to_string()))?;
            Ok(ScriptReply::Open { retry_in: wait })
        }
    }
}

fn parse_state_reply(key: &str, raw: &str) -> Result<ScriptReply, StoreError> {
    CircuitState::parse(raw)
        .map(ScriptReply::State)
        .ok_or_else(|| StoreError::UnexpectedReply(key.to_string()))
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(backend)?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value.as_ref());
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<_, ()>(&mut conn).await.map_err(backend)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await.map_err(backend)
    }

    async fn incr(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.map(|ttl| ttl.as_millis() as u64).unwrap_or(0);
        self.scripts
            .incr
            .key(key)
            .arg(delta)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.hget(key, field).await.map_err(backend)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await.map_err(backend)
    }

    async fn hmget(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key);
        for field in fields {
            cmd.arg(*field);
        }
        cmd.query_async(&mut conn).await.map_err(backend)
    }

    async fn hmset(&self, key: &str, entries: &[(&str, String)]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pairs: Vec<(&str, &str)> = entries
            .iter()
            .map(|(field, value)| (*field, value.as_str()))
            .collect();
        conn.hset_multiple::<_, _, _, ()>(key, &pairs).await.map_err(backend)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis() as u64)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(backend)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut scan_conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = {
            let mut iter = scan_conn
                .scan_match::<_, String>(&pattern)
                .await
                .map_err(backend)?;
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(&keys).await.map_err(backend)?;
        Ok(removed)
    }

    async fn atomic(&self, key: &str, script: &AtomicScript) -> Result<ScriptReply, StoreError> {
        let mut conn = self.conn.clone();
        let scripts = &self.scripts;
        match script {
            AtomicScript::FixedWindow { quota, duration } => {
                let raw: String = scripts
                    .fixed_window
                    .key(key)
                    .arg(*quota)
                    .arg(*duration)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(backend)?;
                parse_throttle_reply(key, &raw)
            }
            AtomicScript::SlidingWindow { quota, duration } => {
                let raw: String = scripts
                    .sliding_window
                    .key(key)
                    .arg(*quota)
                    .arg(*duration)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(backend)?;
                parse_throttle_reply(key, &raw)
            }
            AtomicScript::TokenBucket { quota, duration } => {
                let raw: String = scripts
                    .token_bucket
                    .key(key)
                    .arg(*quota)
                    .arg(*duration)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(backend)?;
                parse_throttle_reply(key, &raw)
            }
            AtomicScript::LeakyBucket { quota, duration, bucket_size } => {
                let raw: String = scripts
                    .leaky_bucket
                    .key(key)
                    .arg(*quota)
                    .arg(*duration)
                    .arg(*bucket_size)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(backend)?;
                parse_throttle_reply(key, &raw)
            }
            AtomicScript::AcquireLock { ttl } => {
                let acquired: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg("1")
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn)
                    .await
                    .map_err(backend)?;
                Ok(if acquired.is_some() { ScriptReply::Acquired } else { ScriptReply::Busy })
            }
            AtomicScript::BreakerAdmit { recovery_timeout } => {
                let raw: String = scripts
                    .breaker_admit
                    .key(key)
                    .arg(*recovery_timeout)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(backend)?;
                parse_admit_reply(key, &raw)
            }
            AtomicScript::BreakerRecord { success, failure_threshold } => {
                let raw: String = scripts
                    .breaker_record
                    .key(key)
                    .arg(if *success { "1" } else { "0" })
                    .arg(*failure_threshold)
                    .invoke_async(&mut conn)
                    .await
                    .map_err(backend)?;
                parse_state_reply(key, &raw)
            }
        }
    }
}
