#![forbid(unsafe_code)]

//! # Premier
//!
//! Core of a pluggable HTTP/WebSocket API gateway: requests are matched to
//! a path policy and run through the features that policy enables
//! (response caching, rate limiting, timeouts, retries, circuit breaking,
//! load balancing, auth) over an abstract transport the host wires in.
//!
//! ## Features
//!
//! - **Four throttle algorithms** (fixed window, sliding window, token
//!   bucket, leaky bucket) with one admission contract, atomically backed
//!   by an in-process or Redis store
//! - **Response caching** with TTL and deployment-wide single-flight
//! - **Retry, timeout, circuit breaker** composed per route
//! - **Round-robin load balancing** with health probing (standalone mode)
//! - **Hot-reloaded configuration** read through one atomic pointer swap
//! - **Event telemetry** fanned out to composable sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use bytes::Bytes;
//! use premier::{
//!     upstream_fn, Clock, ConfigHandle, Gateway, GatewayConfig, KvStore, MemoryStore,
//!     Request, SystemClock,
//! };
//! use std::sync::Arc;
//!
//! const CONFIG: &str = r#"
//! premier:
//!   keyspace: demo
//!   paths:
//!     - pattern: "/api/**"
//!       features:
//!         rate_limit: {quota: 100, duration: 60, algorithm: token_bucket}
//!         timeout: {seconds: 5.0}
//! "#;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let clock: Arc<dyn Clock> = Arc::new(SystemClock);
//!     let snapshot = GatewayConfig::from_yaml(CONFIG)?.compile(Arc::clone(&clock))?;
//!     let config = Arc::new(ConfigHandle::new(snapshot));
//!     let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
//!
//!     // Plugin mode: the gateway wraps an in-process application.
//!     let app = upstream_fn(|req: Request| async move {
//!         Ok(http::Response::new(Bytes::from(format!("hello {}", req.uri().path()))))
//!     });
//!     let gateway = Gateway::builder(config, store).plugin(Arc::new(app));
//!
//!     let request = http::Request::builder().uri("/api/users").body(Bytes::new())?;
//!     let response = gateway.handle(request).await;
//!     assert_eq!(response.status(), 200);
//!     Ok(())
//! }
//! ```

mod auth;
mod balancer;
mod breaker;
mod cache;
mod clock;
mod config;
mod error;
mod proxy;
mod retry;
mod router;
mod sleeper;
mod store;
mod telemetry;
mod throttle;
mod transport;

// Re-exports
pub use auth::{AuthValidator, BasicAuth, JwtAuth, Principal, Rbac};
pub use balancer::{Backend, BackendPool};
pub use breaker::{BreakerSettings, CircuitBreaker, CircuitOutcome, CircuitState};
pub use cache::{CachedResponse, ResponseCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    AuthConfig, AuthKind, AuthPolicy, BreakerConfig, CacheConfig, CachePolicy, CompiledFeatures,
    ConfigError, ConfigHandle, ConfigWatcher, FeatureConfig, GatewayConfig, MonitoringConfig,
    MonitoringPolicy, PathConfig, RateLimitConfig, RatePolicy, RbacConfig, RetryConfig,
    RoutePolicy, Snapshot, TimeoutConfig, TimeoutPolicy, WaitConfig,
};
pub use error::GatewayError;
pub use proxy::{Gateway, GatewayBuilder};
pub use retry::{Jitter, RetryPolicy, WaitSchedule};
pub use router::PathRouter;
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{
    AtomicScript, Keyspace, KvStore, MemoryStore, RedisStore, ScriptReply, StoreError,
};
pub use telemetry::{
    emit_best_effort, event_to_json, ComposedSinkError, EventSink, GatewayEvent, LogSink,
    MemorySink, MulticastSink, NonBlockingSink, NullSink, RequestRecord, StreamingSink,
};
pub use throttle::{Decision, ThrottleAlgorithm, ThrottleSettings, Throttler};
pub use transport::{
    clone_request, error_response, is_websocket_upgrade, upstream_fn, wants_json, HttpClient,
    IoStream, Request, Response, Upstream,
};

pub mod prelude;
