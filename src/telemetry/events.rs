//! Event records emitted by the request pipeline.

use crate::breaker::CircuitState;
use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Telemetry for one handled request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    pub path: String,
    /// Pattern the router matched, or the default policy's pattern.
    pub matched_pattern: String,
    pub status: u16,
    pub latency: Duration,
    pub cache_hit: bool,
    pub throttled: bool,
    /// Retries performed beyond the first attempt.
    pub retries: usize,
    pub timed_out: bool,
    /// Circuit state observed for this route, when a breaker was involved.
    pub circuit_state: Option<CircuitState>,
    /// Error kind for requests that did not complete normally.
    pub error_kind: Option<&'static str>,
}

impl RequestRecord {
    pub fn new(path: impl Into<String>, matched_pattern: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            matched_pattern: matched_pattern.into(),
            status: 0,
            latency: Duration::ZERO,
            cache_hit: false,
            throttled: false,
            retries: 0,
            timed_out: false,
            circuit_state: None,
            error_kind: None,
        }
    }
}

/// Everything the gateway reports to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// A request finished (successfully or not).
    Request(RequestRecord),
    /// A circuit moved between states.
    Circuit {
        key: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// A backend entered or left rotation.
    BackendHealth { url: String, healthy: bool },
}

impl fmt::Display for RequestRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {} ({}ms, hit={}, throttled={}, retries={})",
            self.matched_pattern,
            self.path,
            self.status,
            self.latency.as_millis(),
            self.cache_hit,
            self.throttled,
            self.retries,
        )
    }
}

impl fmt::Display for GatewayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayEvent::Request(record) => write!(f, "Request::{record}"),
            GatewayEvent::Circuit { key, from, to } => {
                write!(f, "Circuit::{key}({from} -> {to})")
            }
            GatewayEvent::BackendHealth { url, healthy } => {
                write!(f, "Backend::{url}(healthy={healthy})")
            }
        }
    }
}

#[inline]
fn clamp_u64(value: u128) -> u64 {
    value.min(u128::from(u64::MAX)) as u64
}

/// JSON rendering used by sinks that feed dashboards.
pub fn event_to_json(event: &GatewayEvent) -> serde_json::Value {
    match event {
        GatewayEvent::Request(record) => json!({
            "kind": "request",
            "path": record.path,
            "matched_pattern": record.matched_pattern,
            "status": record.status,
            "latency_ms": clamp_u64(record.latency.as_millis()),
            "cache_hit": record.cache_hit,
            "throttled": record.throttled,
            "retries": record.retries,
            "timed_out": record.timed_out,
            "circuit_state": record.circuit_state.map(|state| state.as_str()),
            "error_kind": record.error_kind,
        }),
        GatewayEvent::Circuit { key, from, to } => json!({
            "kind": "circuit_transition",
            "key": key,
            "from": from.as_str(),
            "to": to.as_str(),
        }),
        GatewayEvent::BackendHealth { url, healthy } => json!({
            "kind": "backend_health",
            "url": url,
            "healthy": healthy,
        }),
    }
}
