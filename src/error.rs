//! Gateway error taxonomy and its mapping onto HTTP status codes.

use crate::config::ConfigError;
use crate::store::StoreError;
use http::StatusCode;
use std::time::Duration;

/// Unified error for every policy decision the gateway can make.
///
/// Policies construct the variant that names their failure; the pipeline
/// converts whatever reaches the top into an HTTP response via [`status`]
/// and records the [`kind`] in the request telemetry.
///
/// [`status`]: GatewayError::status
/// [`kind`]: GatewayError::kind
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Throttler rejected the request; retry after `wait`.
    #[error("quota exceeded, retry in {wait:?}")]
    QuotaExceeded { wait: Duration },

    /// Leaky bucket is at capacity.
    #[error("throttle bucket full")]
    BucketFull,

    /// The timeout budget elapsed before the guarded work finished.
    #[error("timed out after {elapsed:?} (limit {limit:?})")]
    TimedOut { elapsed: Duration, limit: Duration },

    /// Circuit breaker is open for this route.
    #[error("circuit open for `{key}`, retry in {retry_in:?}")]
    CircuitOpen { key: String, retry_in: Duration },

    /// Every backend in the pool is marked unhealthy.
    #[error("no healthy backend")]
    NoHealthyBackend,

    /// Credentials missing or invalid.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// Authenticated principal lacks a required permission.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Forwarding to the upstream or a backend failed.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// Shared-state store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Configuration rejected at load or reload time.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GatewayError {
    /// Default HTTP status for this error; per-feature config may override.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::QuotaExceeded { .. } | Self::BucketFull => StatusCode::TOO_MANY_REQUESTS,
            Self::TimedOut { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::CircuitOpen { .. } | Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::NoHealthyBackend => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::Store(_) | Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable name used in telemetry records and retry/breaker predicates.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::BucketFull => "bucket_full",
            Self::TimedOut { .. } => "timed_out",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NoHealthyBackend => "no_healthy_backend",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::Upstream(_) => "upstream_error",
            Self::Store(_) => "store_error",
            Self::Config(_) => "config_invalid",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. } | Self::BucketFull)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_match_taxonomy() {
        let quota = GatewayError::QuotaExceeded { wait: Duration::from_secs(1) };
        assert_eq!(quota.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(GatewayError::BucketFull.status(), StatusCode::TOO_MANY_REQUESTS);

        let timeout = GatewayError::TimedOut {
            elapsed: Duration::from_secs(2),
            limit: Duration::from_secs(1),
        };
        assert_eq!(timeout.status(), StatusCode::GATEWAY_TIMEOUT);

        let open = GatewayError::CircuitOpen {
            key: "/api/*".into(),
            retry_in: Duration::from_secs(30),
        };
        assert_eq!(open.status(), StatusCode::BAD_GATEWAY);

        assert_eq!(GatewayError::NoHealthyBackend.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            GatewayError::Unauthenticated("missing header".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GatewayError::Forbidden("no role".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GatewayError::Upstream("connection refused".into()).status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn kinds_are_stable_names() {
        assert_eq!(GatewayError::BucketFull.kind(), "bucket_full");
        assert_eq!(GatewayError::NoHealthyBackend.kind(), "no_healthy_backend");
        assert_eq!(
            GatewayError::Upstream("boom".into()).kind(),
            "upstream_error"
        );
    }

    #[test]
    fn predicates_cover_variants() {
        let quota = GatewayError::QuotaExceeded { wait: Duration::from_millis(250) };
        assert!(quota.is_throttled());
        assert!(!quota.is_timeout());

        let timeout = GatewayError::TimedOut {
            elapsed: Duration::from_secs(1),
            limit: Duration::from_secs(1),
        };
        assert!(timeout.is_timeout());

        let open = GatewayError::CircuitOpen { key: "k".into(), retry_in: Duration::ZERO };
        assert!(open.is_circuit_open());
    }

    #[test]
    fn display_includes_context() {
        let open = GatewayError::CircuitOpen {
            key: "/api/*".into(),
            retry_in: Duration::from_secs(30),
        };
        let msg = open.to_string();
        assert!(msg.contains("/api/*"));
        assert!(msg.contains("30"));
    }
}
