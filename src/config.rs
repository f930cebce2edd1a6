//! Typed configuration: YAML surface, validation, compiled snapshots, and
//! hot reload.
//!
//! A [`GatewayConfig`] is parsed once, validated, and compiled into an
//! immutable [`Snapshot`] (compiled router, per-route policies, backend
//! pool). The data plane reads snapshots through [`ConfigHandle`], a single
//! atomic pointer, so a reload never exposes a half-applied config:
//! in-flight requests finish with the snapshot they started with.

use crate::auth::{AuthValidator, BasicAuth, JwtAuth, Rbac};
use crate::balancer::BackendPool;
use crate::breaker::BreakerSettings;
use crate::clock::Clock;
use crate::retry::{RetryPolicy, WaitSchedule};
use crate::router::PathRouter;
use crate::store::Keyspace;
use crate::throttle::{ThrottleAlgorithm, ThrottleSettings};
use arc_swap::ArcSwap;
use http::StatusCode;
use notify::{RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Rejected configuration; the process keeps (or fails to gain) its
/// previous snapshot.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid pattern `{pattern}`: {detail}")]
    Pattern { pattern: String, detail: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("config watcher error: {0}")]
    Watch(String),
}

// ---------------------------------------------------------------------------
// Raw YAML surface
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, PartialEq)]
struct ConfigFile {
    premier: GatewayConfig,
}

/// The `premier:` document as written.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct GatewayConfig {
    #[serde(default = "default_keyspace")]
    pub keyspace: String,
    /// Backend URLs; non-empty selects standalone mode.
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub paths: Vec<PathConfig>,
    #[serde(default)]
    pub default_features: Option<FeatureConfig>,
}

fn default_keyspace() -> String {
    "premier".to_string()
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PathConfig {
    pub pattern: String,
    #[serde(default)]
    pub features: FeatureConfig,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FeatureConfig {
    pub cache: Option<CacheConfig>,
    pub rate_limit: Option<RateLimitConfig>,
    pub timeout: Option<TimeoutConfig>,
    pub retry: Option<RetryConfig>,
    pub circuit_breaker: Option<BreakerConfig>,
    pub monitoring: Option<MonitoringConfig>,
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct CacheConfig {
    pub expire_s: u64,
    /// Fixed cache key overriding the derived method/path/query key.
    pub cache_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    pub quota: u64,
    pub duration: u64,
    pub algorithm: ThrottleAlgorithm,
    pub bucket_size: Option<u64>,
    #[serde(default = "default_rate_limit_status")]
    pub error_status: u16,
    pub error_message: Option<String>,
}

fn default_rate_limit_status() -> u16 {
    429
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TimeoutConfig {
    pub seconds: f64,
    #[serde(default = "default_timeout_status")]
    pub error_status: u16,
    pub error_message: Option<String>,
}

fn default_timeout_status() -> u16 {
    504
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_wait")]
    pub wait: WaitConfig,
    /// Error kinds to retry; defaults to forwarding failures.
    pub exceptions: Option<Vec<String>>,
}

fn default_max_attempts() -> usize {
    3
}

fn default_wait() -> WaitConfig {
    WaitConfig::Seconds(1.0)
}

/// `wait:` accepts a scalar, an explicit schedule, or the name `expo`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WaitConfig {
    Seconds(f64),
    Schedule(Vec<f64>),
    Named(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout: f64,
    /// Error kind that counts toward the threshold; unset counts all.
    pub expected_exception: Option<String>,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout() -> f64 {
    60.0
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct MonitoringConfig {
    /// Requests slower than this many seconds are logged at warn level.
    pub log_threshold: f64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AuthConfig {
    #[serde(rename = "type")]
    pub kind: AuthKind,
    /// Basic: username -> password table.
    #[serde(default)]
    pub users: HashMap<String, String>,
    /// JWT: shared secret.
    pub secret: Option<String>,
    /// JWT: accepted algorithms; defaults to HS256.
    #[serde(default)]
    pub algorithms: Vec<String>,
    pub rbac: Option<RbacConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    Basic,
    Jwt,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct RbacConfig {
    #[serde(default)]
    pub roles: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub user_roles: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub route_permissions: HashMap<String, Vec<String>>,
    pub default_role: Option<String>,
    #[serde(default)]
    pub allow_any_permission: bool,
}

// ---------------------------------------------------------------------------
// Compiled policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct CachePolicy {
    pub ttl: Duration,
    pub cache_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RatePolicy {
    pub settings: ThrottleSettings,
    pub error_status: StatusCode,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TimeoutPolicy {
    pub limit: Duration,
    pub error_status: StatusCode,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringPolicy {
    pub log_threshold: Duration,
}

#[derive(Clone)]
pub struct AuthPolicy {
    pub validator: Arc<dyn AuthValidator>,
    pub rbac: Option<Rbac>,
}

/// Features enabled for one route, ready to execute.
#[derive(Clone, Default)]
pub struct CompiledFeatures {
    pub cache: Option<CachePolicy>,
    pub rate_limit: Option<RatePolicy>,
    pub timeout: Option<TimeoutPolicy>,
    pub retry: Option<RetryPolicy>,
    pub circuit_breaker: Option<BreakerSettings>,
    pub monitoring: Option<MonitoringPolicy>,
    pub auth: Option<AuthPolicy>,
}

/// A pattern with its compiled feature set.
#[derive(Clone)]
pub struct RoutePolicy {
    pub pattern: String,
    pub features: CompiledFeatures,
}

impl std::fmt::Debug for RoutePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutePolicy")
            .field("pattern", &self.pattern)
            .finish_non_exhaustive()
    }
}

impl RoutePolicy {
    pub fn new(pattern: impl Into<String>, features: CompiledFeatures) -> Self {
        Self { pattern: pattern.into(), features }
    }
}

/// An immutable compiled configuration generation.
pub struct Snapshot {
    pub keyspace: Keyspace,
    pub router: PathRouter,
    /// Present in standalone mode.
    pub pool: Option<Arc<BackendPool>>,
    /// The raw config this snapshot was compiled from.
    pub config: GatewayConfig,
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Parse + compile
// ---------------------------------------------------------------------------

impl GatewayConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(text)?;
        Ok(file.premier)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    /// Validate and compile into an immutable snapshot.
    pub fn compile(&self, clock: Arc<dyn Clock>) -> Result<Snapshot, ConfigError> {
        let mut policies = Vec::with_capacity(self.paths.len());
        for path in &self.paths {
            policies.push(RoutePolicy::new(
                &path.pattern,
                compile_features(&path.features)?,
            ));
        }
        let default_features = match &self.default_features {
            Some(features) => compile_features(features)?,
            None => CompiledFeatures::default(),
        };
        let router = PathRouter::build(policies, RoutePolicy::new("", default_features))?;

        let pool = if self.servers.is_empty() {
            None
        } else {
            // Backend health reuses the circuit breaker's failure threshold.
            let threshold = self
                .default_features
                .as_ref()
                .and_then(|features| features.circuit_breaker.as_ref())
                .map(|breaker| breaker.failure_threshold)
                .unwrap_or_else(default_failure_threshold);
            Some(Arc::new(BackendPool::new(self.servers.clone(), threshold, clock)))
        };

        Ok(Snapshot {
            keyspace: Keyspace::new(&self.keyspace),
            router,
            pool,
            config: self.clone(),
        })
    }
}

fn compile_features(raw: &FeatureConfig) -> Result<CompiledFeatures, ConfigError> {
    Ok(CompiledFeatures {
        cache: raw.cache.as_ref().map(compile_cache).transpose()?,
        rate_limit: raw.rate_limit.as_ref().map(compile_rate_limit).transpose()?,
        timeout: raw.timeout.as_ref().map(compile_timeout).transpose()?,
        retry: raw.retry.as_ref().map(compile_retry).transpose()?,
        circuit_breaker: raw.circuit_breaker.as_ref().map(compile_breaker).transpose()?,
        monitoring: raw.monitoring.as_ref().map(compile_monitoring).transpose()?,
        auth: raw.auth.as_ref().map(compile_auth).transpose()?,
    })
}

fn compile_cache(raw: &CacheConfig) -> Result<CachePolicy, ConfigError> {
    if raw.expire_s == 0 {
        return Err(ConfigError::Invalid("cache.expire_s must be > 0".into()));
    }
    Ok(CachePolicy {
        ttl: Duration::from_secs(raw.expire_s),
        cache_key: raw.cache_key.clone(),
    })
}

fn compile_rate_limit(raw: &RateLimitConfig) -> Result<RatePolicy, ConfigError> {
    if raw.quota == 0 {
        return Err(ConfigError::Invalid("rate_limit.quota must be > 0".into()));
    }
    if raw.duration == 0 {
        return Err(ConfigError::Invalid("rate_limit.duration must be > 0".into()));
    }
    if raw.bucket_size == Some(0) {
        return Err(ConfigError::Invalid("rate_limit.bucket_size must be > 0".into()));
    }
    Ok(RatePolicy {
        settings: ThrottleSettings {
            algorithm: raw.algorithm,
            quota: raw.quota,
            duration: raw.duration,
            bucket_size: raw.bucket_size,
        },
        error_status: status_code(raw.error_status, "rate_limit.error_status")?,
        error_message: raw.error_message.clone(),
    })
}

fn compile_timeout(raw: &TimeoutConfig) -> Result<TimeoutPolicy, ConfigError> {
    if !raw.seconds.is_finite() || raw.seconds <= 0.0 {
        return Err(ConfigError::Invalid("timeout.seconds must be > 0".into()));
    }
    Ok(TimeoutPolicy {
        limit: Duration::from_secs_f64(raw.seconds),
        error_status: status_code(raw.error_status, "timeout.error_status")?,
        error_message: raw.error_message.clone(),
    })
}

fn compile_retry(raw: &RetryConfig) -> Result<RetryPolicy, ConfigError> {
    if raw.max_attempts == 0 {
        return Err(ConfigError::Invalid("retry.max_attempts must be > 0".into()));
    }
    let wait = match &raw.wait {
        WaitConfig::Seconds(secs) => {
            if !secs.is_finite() || *secs < 0.0 {
                return Err(ConfigError::Invalid("retry.wait must be >= 0".into()));
            }
            WaitSchedule::Fixed(Duration::from_secs_f64(*secs))
        }
        WaitConfig::Schedule(waits) => {
            if waits.is_empty() {
                return Err(ConfigError::Invalid("retry.wait schedule is empty".into()));
            }
            if waits.iter().any(|secs| !secs.is_finite() || *secs < 0.0) {
                return Err(ConfigError::Invalid("retry.wait entries must be >= 0".into()));
            }
            WaitSchedule::Sequence(
                waits.iter().map(|secs| Duration::from_secs_f64(*secs)).collect(),
            )
        }
        WaitConfig::Named(name) if name == "expo" => WaitSchedule::expo(),
        WaitConfig::Named(name) => {
            return Err(ConfigError::Invalid(format!("unknown retry.wait `{name}`")));
        }
    };

    let kinds = raw
        .exceptions
        .clone()
        .unwrap_or_else(|| vec!["upstream_error".to_string(), "no_healthy_backend".to_string()]);
    Ok(RetryPolicy::new(raw.max_attempts, wait).retry_on_kinds(kinds))
}

fn compile_breaker(raw: &BreakerConfig) -> Result<BreakerSettings, ConfigError> {
    if raw.failure_threshold == 0 {
        return Err(ConfigError::Invalid(
            "circuit_breaker.failure_threshold must be > 0".into(),
        ));
    }
    if !raw.recovery_timeout.is_finite() || raw.recovery_timeout < 0.0 {
        return Err(ConfigError::Invalid(
            "circuit_breaker.recovery_timeout must be >= 0".into(),
        ));
    }
    Ok(BreakerSettings {
        failure_threshold: raw.failure_threshold,
        recovery_timeout: Duration::from_secs_f64(raw.recovery_timeout),
        trip_on: raw.expected_exception.clone(),
    })
}

fn compile_monitoring(raw: &MonitoringConfig) -> Result<MonitoringPolicy, ConfigError> {
    if !raw.log_threshold.is_finite() || raw.log_threshold < 0.0 {
        return Err(ConfigError::Invalid("monitoring.log_threshold must be >= 0".into()));
    }
    Ok(MonitoringPolicy {
        log_threshold: Duration::from_secs_f64(raw.log_threshold),
    })
}

fn compile_auth(raw: &AuthConfig) -> Result<AuthPolicy, ConfigError> {
    let validator: Arc<dyn AuthValidator> = match raw.kind {
        AuthKind::Basic => {
            if raw.users.is_empty() {
                return Err(ConfigError::Invalid("basic auth requires users".into()));
            }
            Arc::new(BasicAuth::new(raw.users.clone()))
        }
        AuthKind::Jwt => {
            let secret = raw
                .secret
                .as_deref()
                .ok_or_else(|| ConfigError::Invalid("jwt auth requires a secret".into()))?;
            Arc::new(
                JwtAuth::new(secret, &raw.algorithms)
                    .map_err(|err| ConfigError::Invalid(err.to_string()))?,
            )
        }
    };

    let rbac = raw.rbac.as_ref().map(|rbac| Rbac {
        role_permissions: rbac.roles.clone(),
        user_roles: rbac.user_roles.clone(),
        route_permissions: rbac.route_permissions.clone(),
        default_role: rbac.default_role.clone(),
        allow_any_permission: rbac.allow_any_permission,
    });

    Ok(AuthPolicy { validator, rbac })
}

fn status_code(raw: u16, field: &str) -> Result<StatusCode, ConfigError> {
    StatusCode::from_u16(raw)
        .map_err(|_| ConfigError::Invalid(format!("{field}: invalid status code {raw}")))
}

// ---------------------------------------------------------------------------
// Hot swap + file watch
// ---------------------------------------------------------------------------

/// Shared handle to the current snapshot; reads are one atomic load.
pub struct ConfigHandle {
    current: ArcSwap<Snapshot>,
}

impl ConfigHandle {
    pub fn new(snapshot: Snapshot) -> Self {
        Self { current: ArcSwap::from_pointee(snapshot) }
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    pub fn install(&self, snapshot: Snapshot) {
        self.current.store(Arc::new(snapshot));
    }

    /// Parse, validate, compile, and swap in `path`'s contents. On error
    /// the previous snapshot stays in place.
    pub fn reload_from_file(
        &self,
        path: &Path,
        clock: &Arc<dyn Clock>,
    ) -> Result<(), ConfigError> {
        let snapshot = GatewayConfig::from_file(path)?.compile(Arc::clone(clock))?;
        self.install(snapshot);
        tracing::info!(path = %path.display(), "configuration reloaded");
        Ok(())
    }
}

/// Watches a config file and swaps snapshots on change; dropping the
/// watcher stops both the notify backend and the reload task.
pub struct ConfigWatcher {
    _watcher: notify::RecommendedWatcher,
    task: tokio::task::JoinHandle<()>,
}

impl ConfigWatcher {
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        path: impl Into<PathBuf>,
        handle: Arc<ConfigHandle>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let path = path.into();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| {
                let _ = tx.send(result);
            },
        )
        .map_err(|err| ConfigError::Watch(err.to_string()))?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|err| ConfigError::Watch(err.to_string()))?;

        let task = tokio::spawn(async move {
            while let Some(result) = rx.recv().await {
                match result {
                    Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                        if let Err(err) = handle.reload_from_file(&path, &clock) {
                            tracing::warn!(%err, "config reload failed, keeping previous snapshot");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(%err, "config watcher error"),
                }
            }
        });

        Ok(Self { _watcher: watcher, task })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}
