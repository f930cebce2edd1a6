//! Round-robin backend pool with consecutive-failure health marking.

use crate::clock::Clock;
use crate::error::GatewayError;
use crate::transport::HttpClient;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// One forwarding target.
#[derive(Debug)]
pub struct Backend {
    url: String,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    /// Epoch millis before which an unhealthy backend is not re-probed.
    next_probe_at: AtomicU64,
}

impl Backend {
    fn new(url: String) -> Self {
        Self {
            url,
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            next_probe_at: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }
}

/// Round-robin selection over a fixed backend list.
///
/// A backend goes unhealthy after `failure_threshold` consecutive
/// forwarding failures and is re-probed lazily at selection time once per
/// probe interval.
pub struct BackendPool {
    backends: Vec<Arc<Backend>>,
    cursor: AtomicUsize,
    failure_threshold: u32,
    probe_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl BackendPool {
    pub fn new(urls: Vec<String>, failure_threshold: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            backends: urls.into_iter().map(|url| Arc::new(Backend::new(url))).collect(),
            cursor: AtomicUsize::new(0),
            failure_threshold: failure_threshold.max(1),
            probe_interval: DEFAULT_PROBE_INTERVAL,
            clock,
        }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }

    pub fn backends(&self) -> &[Arc<Backend>] {
        &self.backends
    }

    /// Pick the next healthy backend, probing due unhealthy ones in
    /// passing. Fails with [`GatewayError::NoHealthyBackend`] when a full
    /// rotation finds nothing usable.
    pub async fn select(&self, client: &dyn HttpClient) -> Result<Arc<Backend>, GatewayError> {
        if self.backends.is_empty() {
            return Err(GatewayError::NoHealthyBackend);
        }

        for _ in 0..self.backends.len() {
            let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.backends.len();
            let backend = &self.backends[index];

            if backend.is_healthy() {
                return Ok(Arc::clone(backend));
            }
            if self.claim_probe(backend) {
                if client.probe(&backend.url).await {
                    backend.consecutive_failures.store(0, Ordering::Release);
                    backend.healthy.store(true, Ordering::Release);
                    tracing::info!(url = %backend.url, "backend recovered");
                    return Ok(Arc::clone(backend));
                }
                tracing::debug!(url = %backend.url, "probe failed");
            }
        }
        Err(GatewayError::NoHealthyBackend)
    }

    /// Reserve the probe slot for `backend` if its probe is due.
    fn claim_probe(&self, backend: &Backend) -> bool {
        let now_ms = (self.clock.now() * 1000.0) as u64;
        let due = backend.next_probe_at.load(Ordering::Acquire);
        if now_ms < due {
            return false;
        }
        let next = now_ms + self.probe_interval.as_millis() as u64;
        backend
            .next_probe_at
            .compare_exchange(due, next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Record a successful forward; returns true when this revived the
    /// backend.
    pub fn record_success(&self, backend: &Backend) -> bool {
        backend.consecutive_failures.store(0, Ordering::Release);
        let flipped = !backend.healthy.swap(true, Ordering::AcqRel);
        if flipped {
            tracing::info!(url = %backend.url, "backend healthy");
        }
        flipped
    }

    /// Record a failed forward; returns true when this took the backend
    /// out of rotation.
    pub fn record_failure(&self, backend: &Backend) -> bool {
        let failures = backend.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.failure_threshold {
            return false;
        }
        let flipped = backend.healthy.swap(false, Ordering::AcqRel);
        if flipped {
            let now_ms = (self.clock.now() * 1000.0) as u64;
            backend.next_probe_at.store(
                now_ms + self.probe_interval.as_millis() as u64,
                Ordering::Release,
            );
            tracing::warn!(url = %backend.url, failures, "backend unhealthy");
        }
        flipped
    }
}
