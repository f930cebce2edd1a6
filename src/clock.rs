//! Epoch clock abstraction so bucket math and deadlines can be faked in tests.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of "now" as seconds since the Unix epoch.
///
/// Throttle buckets and circuit timestamps are stored as epoch seconds, so
/// every component that reasons about elapsed time reads through this trait.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current time as fractional epoch seconds.
    fn now(&self) -> f64;

    /// Current time truncated to whole epoch seconds.
    fn now_secs(&self) -> u64 {
        let now = self.now();
        if now <= 0.0 {
            0
        } else {
            now as u64
        }
    }
}

/// Wall clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }
}

/// Hand-driven clock for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<f64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the clock at the given epoch second.
    pub fn starting_at(epoch_secs: f64) -> Self {
        Self { now: Arc::new(Mutex::new(epoch_secs)) }
    }

    /// Move the clock forward by `secs`.
    pub fn advance(&self, secs: f64) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard += secs;
    }

    /// Jump the clock to an absolute epoch second.
    pub fn set(&self, epoch_secs: f64) {
        let mut guard = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = epoch_secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
