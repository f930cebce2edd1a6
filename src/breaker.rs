//! Per-key circuit breaker driven by atomic store scripts.
//!
//! The state machine (closed → open → half-open) lives in the shared store
//! so every gateway instance observes the same circuit. Admission and
//! outcome recording each run as one atomic script; the half-open state
//! grants exactly one probe across the whole deployment.

use crate::error::GatewayError;
use crate::store::{AtomicScript, Keyspace, KvStore, ScriptReply};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Circuit position for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "closed" => Some(Self::Closed),
            "open" => Some(Self::Open),
            "half_open" => Some(Self::HalfOpen),
            _ => None,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-route breaker parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before granting a probe.
    pub recovery_timeout: Duration,
    /// When set, only errors whose [`GatewayError::kind`] matches count as
    /// failures; other errors pass through without tripping the circuit.
    pub trip_on: Option<String>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            trip_on: None,
        }
    }
}

/// What happened to one guarded call.
#[derive(Debug)]
pub struct CircuitOutcome<T> {
    pub result: Result<T, GatewayError>,
    /// Circuit state after this call.
    pub state: CircuitState,
    /// Present when this call moved the circuit.
    pub transition: Option<(CircuitState, CircuitState)>,
}

/// Guards operations with the per-key circuit state machine.
#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn KvStore>,
    keyspace: Keyspace,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn KvStore>, keyspace: Keyspace) -> Self {
        Self { store, keyspace }
    }

    /// Run `op` under the circuit for `key`.
    ///
    /// Short-circuits with [`GatewayError::CircuitOpen`] while the circuit
    /// is open or another caller holds the half-open probe slot.
    pub async fn execute<T, Fut, Op>(
        &self,
        key: &str,
        settings: &BreakerSettings,
        op: Op,
    ) -> CircuitOutcome<T>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let store_key = self.keyspace.circuit(key);
        let admit = AtomicScript::BreakerAdmit {
            recovery_timeout: settings.recovery_timeout.as_secs_f64(),
        };

        let prior = match self.store.atomic(&store_key, &admit).await {
            Ok(ScriptReply::Pass) => CircuitState::Closed,
            Ok(ScriptReply::Probe) => {
                tracing::debug!(key, "circuit half-open, probing");
                CircuitState::HalfOpen
            }
            Ok(ScriptReply::Open { retry_in }) => {
                return CircuitOutcome {
                    result: Err(GatewayError::CircuitOpen {
                        key: key.to_string(),
                        retry_in: Duration::from_secs_f64(retry_in.max(0.0)),
                    }),
                    state: CircuitState::Open,
                    transition: None,
                };
            }
            Ok(_) => {
                return CircuitOutcome {
                    result: Err(crate::store::StoreError::UnexpectedReply(store_key).into()),
                    state: CircuitState::Closed,
                    transition: None,
                };
            }
            Err(err) => {
                return CircuitOutcome {
                    result: Err(err.into()),
                    state: CircuitState::Closed,
                    transition: None,
                };
            }
        };

        let result = op().await;
        let success = match &result {
            Ok(_) => true,
            // Errors outside the configured kind do not count against the
            // circuit; they clear the probe slot like a success would.
            Err(err) => !counts_as_failure(err, settings.trip_on.as_deref()),
        };

        let record = AtomicScript::BreakerRecord {
            success,
            failure_threshold: settings.failure_threshold,
        };
        let state = match self.store.atomic(&store_key, &record).await {
            Ok(ScriptReply::State(state)) => state,
            Ok(_) | Err(_) => prior,
        };

        let transition = (state != prior).then_some((prior, state));
        if let Some((from, to)) = transition {
            tracing::info!(key, %from, %to, "circuit transition");
        }

        CircuitOutcome { result, state, transition }
    }

    /// Current state for `key`; absent keys read as closed.
    pub async fn state(&self, key: &str) -> Result<CircuitState, GatewayError> {
        let raw = self.store.hget(&self.keyspace.circuit(key), "state").await?;
        Ok(raw
            .as_deref()
            .and_then(CircuitState::parse)
            .unwrap_or(CircuitState::Closed))
    }
}

fn counts_as_failure(err: &GatewayError, trip_on: Option<&str>) -> bool {
    match trip_on {
        Some(kind) => err.kind() == kind,
        None => true,
    }
}
