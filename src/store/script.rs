//! Named atomic scripts and their reference transitions.
//!
//! Every multi-step state change on shared keys runs as one of these scripts
//! so concurrent callers always observe a total order. The in-memory store
//! executes the transition functions below inside a shard critical section;
//! the Redis store ships Lua with the same semantics.

use crate::breaker::CircuitState;
use std::time::Duration;

/// A named script executed atomically against a single key.
#[derive(Debug, Clone, PartialEq)]
pub enum AtomicScript {
    /// Window admission: reset on expiry, admit while `count < quota`.
    FixedWindow { quota: u64, duration: u64 },
    /// Window admission with gradual decay of the carried count.
    SlidingWindow { quota: u64, duration: u64 },
    /// Token refill at `quota / duration` per second, one token per admit.
    TokenBucket { quota: u64, duration: u64 },
    /// Leak at `quota / duration` per second; admits enqueue with a delay.
    LeakyBucket { quota: u64, duration: u64, bucket_size: u64 },
    /// Set-if-absent lock used by the cache single-flight.
    AcquireLock { ttl: Duration },
    /// Circuit admission: pass, grant the single probe, or short-circuit.
    BreakerAdmit { recovery_timeout: f64 },
    /// Circuit outcome recording; returns the resulting state.
    BreakerRecord { success: bool, failure_threshold: u32 },
}

/// Result of an atomic script.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptReply {
    /// One unit admitted; state already advanced.
    Admitted,
    /// Not admissible for `wait` seconds. Leaky-bucket admits with a
    /// positive queueing delay also surface here, already enqueued.
    Throttled { wait: f64 },
    /// Leaky bucket at capacity; nothing was enqueued.
    Saturated,
    /// Lock obtained.
    Acquired,
    /// Lock already held elsewhere.
    Busy,
    /// Circuit closed; request may proceed.
    Pass,
    /// Circuit half-open and this caller won the single probe slot.
    Probe,
    /// Circuit open; retry after `retry_in` seconds.
    Open { retry_in: f64 },
    /// Circuit state after recording an outcome.
    State(CircuitState),
}

/// Field writes a transition wants applied, with an optional fresh TTL.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BucketWrite {
    pub fields: Vec<(&'static str, String)>,
    pub ttl: Option<Duration>,
}

impl BucketWrite {
    fn with_ttl(fields: Vec<(&'static str, String)>, ttl_secs: u64) -> Self {
        Self { fields, ttl: Some(Duration::from_secs(ttl_secs)) }
    }

    fn keep_ttl(fields: Vec<(&'static str, String)>) -> Self {
        Self { fields, ttl: None }
    }
}

/// Hash fields backing one circuit key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BreakerFields {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: f64,
    pub probe_in_flight: bool,
}

impl Default for BreakerFields {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            opened_at: 0.0,
            probe_in_flight: false,
        }
    }
}

fn fmt_f64(value: f64) -> String {
    format!("{value}")
}

pub(crate) fn fixed_window(
    now: u64,
    quota: u64,
    duration: u64,
    current: Option<(u64, u64)>,
) -> (ScriptReply, Option<BucketWrite>) {
    match current {
        // Windows are half-open: a request landing exactly on the boundary
        // starts the next window.
        Some((window_end, count)) if now < window_end => {
            if count >= quota {
                (ScriptReply::Throttled { wait: (window_end - now) as f64 }, None)
            } else {
                let write = BucketWrite::keep_ttl(vec![("count", (count + 1).to_string())]);
                (ScriptReply::Admitted, Some(write))
            }
        }
        _ => {
            let write = BucketWrite::with_ttl(
                vec![
                    ("window_end", (now + duration).to_string()),
                    ("count", "1".to_string()),
                ],
                duration,
            );
            (ScriptReply::Admitted, Some(write))
        }
    }
}

pub(crate) fn sliding_window(
    now: u64,
    quota: u64,
    duration: u64,
    current: Option<(u64, u64)>,
) -> (ScriptReply, Option<BucketWrite>) {
    let (start, count) = current.unwrap_or((now, 0));
    let elapsed = now.saturating_sub(start);
    let progress = if duration == 0 { 0 } else { elapsed % duration };
    let periods = if duration == 0 { 0 } else { elapsed / duration };
    let adjusted = count.saturating_sub(periods.saturating_mul(quota));

    if adjusted >= quota {
        let carry = (adjusted - quota + 1) as f64 / quota as f64;
        let wait = (duration - progress) as f64 + carry * duration as f64;
        (ScriptReply::Throttled { wait }, None)
    } else {
        let write = BucketWrite::with_ttl(
            vec![
                ("window_start", (now - progress).to_string()),
                ("count", (adjusted + 1).to_string()),
            ],
            duration,
        );
        (ScriptReply::Admitted, Some(write))
    }
}

pub(crate) fn token_bucket(
    now: f64,
    quota: u64,
    duration: u64,
    current: Option<(f64, f64)>,
) -> (ScriptReply, Option<BucketWrite>) {
    let rate = quota as f64 / duration as f64;
    let (last_refill, tokens) = current.unwrap_or((now, quota as f64));
    let refilled = (tokens + (now - last_refill).max(0.0) * rate).min(quota as f64);

    if refilled < 1.0 {
        (ScriptReply::Throttled { wait: (1.0 - refilled) / rate }, None)
    } else {
        let write = BucketWrite::with_ttl(
            vec![
                ("last_refill", fmt_f64(now)),
                ("tokens", fmt_f64(refilled - 1.0)),
            ],
            duration.saturating_mul(2),
        );
        (ScriptReply::Admitted, Some(write))
    }
}

pub(crate) fn leaky_bucket(
    now: f64,
    quota: u64,
    duration: u64,
    bucket_size: u64,
    current: Option<(f64, f64)>,
) -> (ScriptReply, Option<BucketWrite>) {
    let rate = quota as f64 / duration as f64;
    let (last_leak, level) = current.unwrap_or((now, 0.0));
    let drained = (level - (now - last_leak).max(0.0) * rate).max(0.0);

    if drained >= bucket_size as f64 {
        return (ScriptReply::Saturated, None);
    }

    let write = BucketWrite::with_ttl(
        vec![
            ("last_leak", fmt_f64(now)),
            ("level", fmt_f64(drained + 1.0)),
        ],
        duration.saturating_mul(2),
    );
    let delay = drained / rate;
    if delay > 0.0 {
        (ScriptReply::Throttled { wait: delay }, Some(write))
    } else {
        (ScriptReply::Admitted, Some(write))
    }
}

pub(crate) fn breaker_admit(
    now: f64,
    recovery_timeout: f64,
    current: Option<BreakerFields>,
) -> (ScriptReply, Option<BucketWrite>) {
    let fields = current.unwrap_or_default();
    match fields.state {
        CircuitState::Closed => (ScriptReply::Pass, None),
        CircuitState::Open => {
            let elapsed = now - fields.opened_at;
            if elapsed >= recovery_timeout {
                let write = BucketWrite::keep_ttl(vec![
                    ("state", CircuitState::HalfOpen.as_str().to_string()),
                    ("probe", "1".to_string()),
                ]);
                (ScriptReply::Probe, Some(write))
            } else {
                (ScriptReply::Open { retry_in: recovery_timeout - elapsed }, None)
            }
        }
        CircuitState::HalfOpen => {
            if fields.probe_in_flight {
                (ScriptReply::Open { retry_in: 0.0 }, None)
            } else {
                let write = BucketWrite::keep_ttl(vec![("probe", "1".to_string())]);
                (ScriptReply::Probe, Some(write))
            }
        }
    }
}

pub(crate) fn breaker_record(
    now: f64,
    success: bool,
    failure_threshold: u32,
    current: Option<BreakerFields>,
) -> (ScriptReply, Option<BucketWrite>) {
    let fields = current.unwrap_or_default();

    if success {
        return match fields.state {
            // A success landing after the circuit opened does not close it.
            CircuitState::Open => (ScriptReply::State(CircuitState::Open), None),
            _ => {
                let write = BucketWrite::keep_ttl(vec![
                    ("state", CircuitState::Closed.as_str().to_string()),
                    ("failure_count", "0".to_string()),
                    ("opened_at", "0".to_string()),
                    ("probe", "0".to_string()),
                ]);
                (ScriptReply::State(CircuitState::Closed), Some(write))
            }
        };
    }

    match fields.state {
        CircuitState::HalfOpen => {
            let write = BucketWrite::keep_ttl(vec![
                ("state", CircuitState::Open.as_str().to_string()),
                ("opened_at", fmt_f64(now)),
                ("probe", "0".to_string()),
            ]);
            (ScriptReply::State(CircuitState::Open), Some(write))
        }
        CircuitState::Open => {
            let write = BucketWrite::keep_ttl(vec![(
                "failure_count",
                (fields.failure_count + 1).to_string(),
            )]);
            (ScriptReply::State(CircuitState::Open), Some(write))
        }
        CircuitState::Closed => {
            let failures = fields.failure_count + 1;
            if failures >= failure_threshold {
                let write = BucketWrite::keep_ttl(vec![
                    ("state", CircuitState::Open.as_str().to_string()),
                    ("failure_count", failures.to_string()),
                    ("opened_at", fmt_f64(now)),
                ]);
                (ScriptReply::State(CircuitState::Open), Some(write))
            } else {
                let write =
                    BucketWrite::keep_ttl(vec![("failure_count", failures.to_string())]);
                (ScriptReply::State(CircuitState::Closed), Some(write))
            }
        }
    }
}
