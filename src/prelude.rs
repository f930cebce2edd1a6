//! Convenience imports for embedding hosts.
//!
//! ```rust
//! use premier::prelude::*;
//! ```

pub use crate::{
    Clock, ConfigHandle, ConfigWatcher, Decision, EventSink, Gateway, GatewayConfig,
    GatewayError, HttpClient, KvStore, MemoryStore, RedisStore, Request, Response,
    SystemClock, ThrottleAlgorithm, Throttler, Upstream,
};
