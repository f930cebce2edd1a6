//! The request pipeline: policy resolution, guards, forwarding, telemetry.
//!
//! Per request: resolve the route policy, then auth → rate limit → cache
//! lookup → timeout[ retry[ circuit breaker[ forward ]]] → cache store →
//! event emit. Rate limiting runs before the cache so heavy callers cannot
//! saturate lookups; the timeout envelopes only the part that can block;
//! retry wraps the breaker so attempts observe circuit state.

use crate::auth::Principal;
use crate::breaker::CircuitBreaker;
use crate::cache::{CachedResponse, ResponseCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{ConfigHandle, RoutePolicy, Snapshot};
use crate::error::GatewayError;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::KvStore;
use crate::telemetry::{emit_best_effort, EventSink, GatewayEvent, NullSink, RequestRecord};
use crate::throttle::{Decision, Throttler};
use crate::transport::{
    clone_request, error_response, is_websocket_upgrade, wants_json, HttpClient, Request,
    Response, Upstream,
};
use http::header::CONTENT_TYPE;
use http::{Method, StatusCode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};

/// Statuses worth keeping in the response cache.
const CACHEABLE_STATUSES: [u16; 7] = [200, 203, 204, 300, 301, 404, 410];

fn response_cacheable(entry: &CachedResponse) -> bool {
    CACHEABLE_STATUSES.contains(&entry.status)
}

enum Mode {
    /// Wraps an in-process application.
    Plugin(Arc<dyn Upstream>),
    /// Forwards to the configured backend pool.
    Standalone(Arc<dyn HttpClient>),
}

/// Assembles a [`Gateway`] with its shared store and timing seams.
pub struct GatewayBuilder {
    config: Arc<ConfigHandle>,
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl GatewayBuilder {
    pub fn new(config: Arc<ConfigHandle>, store: Arc<dyn KvStore>) -> Self {
        Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Wrap an in-process upstream application.
    pub fn plugin(self, upstream: Arc<dyn Upstream>) -> Gateway {
        self.build(Mode::Plugin(upstream))
    }

    /// Forward to the configured backend servers through `client`.
    pub fn standalone(self, client: Arc<dyn HttpClient>) -> Gateway {
        self.build(Mode::Standalone(client))
    }

    fn build(self, mode: Mode) -> Gateway {
        // The keyspace is fixed at construction; reloads may change routes
        // and backends but not where shared state lives.
        let keyspace = self.config.snapshot().keyspace.clone();
        Gateway {
            throttler: Throttler::new(
                Arc::clone(&self.store),
                keyspace.clone(),
                Arc::clone(&self.sleeper),
            ),
            cache: ResponseCache::new(
                Arc::clone(&self.store),
                keyspace.clone(),
                Arc::clone(&self.clock),
                Arc::clone(&self.sleeper),
            ),
            breaker: CircuitBreaker::new(Arc::clone(&self.store), keyspace),
            config: self.config,
            mode,
            sink: NullSink,
            sleeper: self.sleeper,
        }
    }
}

/// The gateway pipeline; cheap to share behind an `Arc`.
pub struct Gateway<S = NullSink> {
    config: Arc<ConfigHandle>,
    mode: Mode,
    throttler: Throttler,
    cache: ResponseCache,
    breaker: CircuitBreaker,
    sink: S,
    sleeper: Arc<dyn Sleeper>,
}

impl Gateway<NullSink> {
    pub fn builder(config: Arc<ConfigHandle>, store: Arc<dyn KvStore>) -> GatewayBuilder {
        GatewayBuilder::new(config, store)
    }
}

impl<S> Gateway<S> {
    /// Attach an event sink; wrap it in
    /// [`NonBlockingSink`](crate::telemetry::NonBlockingSink) to keep slow
    /// observers off the request path.
    pub fn with_sink<S2: EventSink>(self, sink: S2) -> Gateway<S2>
    where
        <S2 as tower::Service<crate::telemetry::events::GatewayEvent>>::Future: Send,
    {
        Gateway {
            config: self.config,
            mode: self.mode,
            throttler: self.throttler,
            cache: self.cache,
            breaker: self.breaker,
            sink,
            sleeper: self.sleeper,
        }
    }

    /// The response cache, exposed for host-driven invalidation.
    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// The throttler, exposed for wrapping host-side functions.
    pub fn throttler(&self) -> &Throttler {
        &self.throttler
    }

    /// The attached event sink.
    pub fn sink(&self) -> &S {
        &self.sink
    }
}

impl<S: EventSink> Gateway<S>
where
    S::Future: Send + 'static,
{
    /// Handle one request end to end; errors become HTTP responses.
    pub async fn handle(&self, req: Request) -> Response {
        let started = Instant::now();
        let snapshot = self.config.snapshot();
        let path = req.uri().path().to_string();
        let policy = snapshot.router.resolve(req.method(), &path);
        let json = wants_json(req.headers());

        let mut record = RequestRecord::new(path, policy.pattern.clone());
        let retries = AtomicUsize::new(0);

        let outcome = self.run(&snapshot, &policy, req, &mut record, &retries).await;
        record.retries = retries.load(Ordering::SeqCst).saturating_sub(1);
        if policy.features.circuit_breaker.is_some() {
            record.circuit_state = self.breaker.state(&policy.pattern).await.ok();
        }

        let response = match outcome {
            Ok(response) => response,
            Err(err) => self.render_error(&policy, &err, json, &mut record),
        };

        record.status = response.status().as_u16();
        record.latency = started.elapsed();

        if let Some(monitoring) = &policy.features.monitoring {
            if record.latency >= monitoring.log_threshold {
                tracing::warn!(
                    path = %record.path,
                    latency_ms = record.latency.as_millis() as u64,
                    "slow request"
                );
            }
        }
        emit_best_effort(self.sink.clone(), GatewayEvent::Request(record)).await;
        response
    }

    async fn run(
        &self,
        snapshot: &Snapshot,
        policy: &RoutePolicy,
        req: Request,
        record: &mut RequestRecord,
        retries: &AtomicUsize,
    ) -> Result<Response, GatewayError> {
        let principal = self.authenticate(policy, &req).await?;
        self.check_rate_limit(policy, principal.as_ref()).await?;

        let idempotent = req.method() == Method::GET || req.method() == Method::HEAD;
        let cache_policy = policy.features.cache.as_ref().filter(|_| idempotent);

        match cache_policy {
            Some(cache_policy) => {
                let key = cache_policy.cache_key.clone().unwrap_or_else(|| {
                    ResponseCache::response_key(
                        req.method().as_str(),
                        req.uri().path(),
                        req.uri().query(),
                    )
                });
                let (entry, hit) = self
                    .cache
                    .get_or_compute(&key, cache_policy.ttl, response_cacheable, || async {
                        let response = self.execute(snapshot, policy, &req, retries).await?;
                        Ok(to_cached(&response))
                    })
                    .await?;
                record.cache_hit = hit;
                Ok(from_cached(entry))
            }
            None => self.execute(snapshot, policy, &req, retries).await,
        }
    }

    async fn authenticate(
        &self,
        policy: &RoutePolicy,
        req: &Request,
    ) -> Result<Option<Principal>, GatewayError> {
        let Some(auth) = &policy.features.auth else {
            return Ok(None);
        };
        let principal = auth.validator.validate(req).await?;
        if let Some(rbac) = &auth.rbac {
            rbac.authorize(&principal, &policy.pattern)?;
        }
        Ok(Some(principal))
    }

    async fn check_rate_limit(
        &self,
        policy: &RoutePolicy,
        principal: Option<&Principal>,
    ) -> Result<(), GatewayError> {
        let Some(rate) = &policy.features.rate_limit else {
            return Ok(());
        };
        let mut key = policy.pattern.clone();
        if let Some(principal) = principal {
            key.push(':');
            key.push_str(&principal.id);
        }
        match self.throttler.acquire(&key, &rate.settings).await? {
            Decision::Granted => Ok(()),
            Decision::Throttled { wait } => Err(GatewayError::QuotaExceeded { wait }),
        }
    }

    /// The part of the pipeline that can block: retry → breaker → forward,
    /// all under the route's timeout budget.
    async fn execute(
        &self,
        snapshot: &Snapshot,
        policy: &RoutePolicy,
        req: &Request,
        retries: &AtomicUsize,
    ) -> Result<Response, GatewayError> {
        let features = &policy.features;
        let attempt = || {
            retries.fetch_add(1, Ordering::SeqCst);
            let req = clone_request(req);
            async move { self.guarded(snapshot, policy, req).await }
        };

        let fut = async {
            match &features.retry {
                Some(retry) => retry.execute(self.sleeper.as_ref(), attempt).await,
                None => attempt().await,
            }
        };

        match &features.timeout {
            Some(timeout) => match tokio::time::timeout(timeout.limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(GatewayError::TimedOut {
                    elapsed: timeout.limit,
                    limit: timeout.limit,
                }),
            },
            None => fut.await,
        }
    }

    async fn guarded(
        &self,
        snapshot: &Snapshot,
        policy: &RoutePolicy,
        req: Request,
    ) -> Result<Response, GatewayError> {
        match &policy.features.circuit_breaker {
            Some(settings) => {
                let outcome = self
                    .breaker
                    .execute(&policy.pattern, settings, || self.forward(snapshot, req))
                    .await;
                if let Some((from, to)) = outcome.transition {
                    emit_best_effort(
                        self.sink.clone(),
                        GatewayEvent::Circuit {
                            key: policy.pattern.clone(),
                            from,
                            to,
                        },
                    )
                    .await;
                }
                outcome.result
            }
            None => self.forward(snapshot, req).await,
        }
    }

    async fn forward(&self, snapshot: &Snapshot, req: Request) -> Result<Response, GatewayError> {
        match &self.mode {
            Mode::Plugin(upstream) => upstream.call(req).await,
            Mode::Standalone(client) => {
                let pool = snapshot.pool.as_ref().ok_or(GatewayError::NoHealthyBackend)?;
                let backend = pool.select(client.as_ref()).await?;
                match client.forward(backend.url(), req).await {
                    Ok(response) => {
                        if pool.record_success(&backend) {
                            self.emit_backend_health(backend.url(), true).await;
                        }
                        Ok(response)
                    }
                    Err(err) => {
                        if pool.record_failure(&backend) {
                            self.emit_backend_health(backend.url(), false).await;
                        }
                        Err(err)
                    }
                }
            }
        }
    }

    async fn emit_backend_health(&self, url: &str, healthy: bool) {
        emit_best_effort(
            self.sink.clone(),
            GatewayEvent::BackendHealth {
                url: url.to_string(),
                healthy,
            },
        )
        .await;
    }

    fn render_error(
        &self,
        policy: &RoutePolicy,
        err: &GatewayError,
        json: bool,
        record: &mut RequestRecord,
    ) -> Response {
        record.error_kind = Some(err.kind());
        record.timed_out = err.is_timeout();
        record.throttled = err.is_throttled();

        let features = &policy.features;
        let (status, message): (StatusCode, String) = match err {
            GatewayError::QuotaExceeded { .. } | GatewayError::BucketFull => {
                match &features.rate_limit {
                    Some(rate) => (
                        rate.error_status,
                        rate.error_message.clone().unwrap_or_else(|| err.to_string()),
                    ),
                    None => (err.status(), err.to_string()),
                }
            }
            GatewayError::TimedOut { .. } => match &features.timeout {
                Some(timeout) => (
                    timeout.error_status,
                    timeout.error_message.clone().unwrap_or_else(|| err.to_string()),
                ),
                None => (err.status(), err.to_string()),
            },
            _ => (err.status(), err.to_string()),
        };

        if status.is_server_error() {
            tracing::debug!(kind = err.kind(), %err, "request failed");
        }
        error_response(status, &message, json)
    }

    /// Run the connect-time policy prefix (auth, rate limit) for a
    /// WebSocket upgrade and return the matched policy. Caching and retry
    /// do not apply to upgrades.
    pub async fn authorize_upgrade(&self, req: &Request) -> Result<Arc<RoutePolicy>, GatewayError> {
        if !is_websocket_upgrade(req) {
            return Err(GatewayError::Upstream("not a websocket upgrade".into()));
        }
        let snapshot = self.config.snapshot();
        let policy = snapshot.router.resolve(req.method(), req.uri().path());
        let principal = self.authenticate(&policy, req).await?;
        self.check_rate_limit(&policy, principal.as_ref()).await?;
        Ok(policy)
    }

    /// Standalone-mode upgrade: authorize, pick a backend, then pump bytes
    /// both ways until either side closes.
    pub async fn proxy_upgrade<IO>(&self, req: Request, mut client_io: IO) -> Result<(), GatewayError>
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let started = Instant::now();
        let policy = self.authorize_upgrade(&req).await?;
        let snapshot = self.config.snapshot();

        let client = match &self.mode {
            Mode::Standalone(client) => Arc::clone(client),
            Mode::Plugin(_) => {
                return Err(GatewayError::Upstream(
                    "plugin upstream owns upgraded connections".into(),
                ));
            }
        };
        let pool = snapshot.pool.as_ref().ok_or(GatewayError::NoHealthyBackend)?;
        let backend = pool.select(client.as_ref()).await?;
        let mut backend_io = client.open_stream(backend.url(), &req).await?;

        let pumped = tokio::io::copy_bidirectional(&mut client_io, &mut backend_io)
            .await
            .map_err(|err| GatewayError::Upstream(format!("websocket pump failed: {err}")));

        let mut record = RequestRecord::new(req.uri().path(), policy.pattern.clone());
        record.status = StatusCode::SWITCHING_PROTOCOLS.as_u16();
        record.latency = started.elapsed();
        record.error_kind = pumped.as_ref().err().map(|err| err.kind());
        emit_best_effort(self.sink.clone(), GatewayEvent::Request(record)).await;

        pumped.map(|_| ())
    }
}

fn to_cached(response: &Response) -> CachedResponse {
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(String::from);
    let headers = response
        .headers()
        .iter()
        .filter(|(name, _)| **name != CONTENT_TYPE)
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    CachedResponse {
        status: response.status().as_u16(),
        content_type,
        headers,
        body: response.body().clone(),
        expires_at: None,
    }
}

fn from_cached(entry: CachedResponse) -> Response {
    let mut response = http::Response::new(entry.body);
    *response.status_mut() =
        StatusCode::from_u16(entry.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in &entry.headers {
        if let (Ok(name), Ok(value)) = (
            http::HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    if let Some(content_type) = &entry.content_type {
        if let Ok(value) = http::HeaderValue::from_str(content_type) {
            response.headers_mut().insert(CONTENT_TYPE, value);
        }
    }
    response
}
