//! Per-request telemetry: event records and the sinks that consume them.
//!
//! The pipeline emits one [`GatewayEvent::Request`] per handled request and
//! circuit/backend transition events as they happen. Sinks implement
//! `tower::Service<GatewayEvent>` so they compose; wrap any sink in
//! [`NonBlockingSink`] to keep emission off the request path.

pub mod events;
pub mod sinks;

pub use events::{event_to_json, GatewayEvent, RequestRecord};
pub use sinks::{
    emit_best_effort, ComposedSinkError, EventSink, LogSink, MemorySink, MulticastSink,
    NonBlockingSink, NullSink, StreamingSink,
};
