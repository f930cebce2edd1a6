//! Retry policy: bounded attempts with a configurable wait schedule.

use crate::error::GatewayError;
use crate::sleeper::Sleeper;
use rand::Rng as _;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Randomization applied to exponential waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Use the computed wait as-is.
    #[default]
    None,
    /// Uniform in `[0, wait]`.
    Full,
    /// Uniform in `[wait/2, wait]`.
    Equal,
}

impl Jitter {
    fn apply(&self, wait: Duration) -> Duration {
        let millis = wait.as_millis() as u64;
        if millis == 0 {
            return Duration::ZERO;
        }
        match self {
            Jitter::None => wait,
            Jitter::Full => Duration::from_millis(rand::rng().random_range(0..=millis)),
            Jitter::Equal => {
                Duration::from_millis(rand::rng().random_range(millis / 2..=millis))
            }
        }
    }
}

/// How long to wait before each retry.
#[derive(Clone)]
pub enum WaitSchedule {
    /// Same wait between every attempt.
    Fixed(Duration),
    /// Indexed by attempt; the last entry repeats once exhausted.
    Sequence(Vec<Duration>),
    /// Doubling from `base`, capped at `max`, with optional jitter.
    Exponential { base: Duration, max: Duration, jitter: Jitter },
    /// Computed from the attempt number (1-indexed).
    Custom(Arc<dyn Fn(usize) -> Duration + Send + Sync>),
}

impl std::fmt::Debug for WaitSchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fixed(wait) => f.debug_tuple("Fixed").field(wait).finish(),
            Self::Sequence(waits) => f.debug_tuple("Sequence").field(waits).finish(),
            Self::Exponential { base, max, jitter } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            Self::Custom(_) => f.debug_tuple("Custom").field(&"<fn>").finish(),
        }
    }
}

impl WaitSchedule {
    /// Conventional exponential schedule: 100 ms doubling, capped at 10 s.
    pub fn expo() -> Self {
        Self::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(10),
            jitter: Jitter::Full,
        }
    }

    /// Schedule computed by `f` from the attempt number.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Wait before retry number `attempt` (1-indexed).
    pub fn wait_for(&self, attempt: usize) -> Duration {
        match self {
            Self::Fixed(wait) => *wait,
            Self::Sequence(waits) => match waits.last() {
                None => Duration::ZERO,
                Some(last) => *waits.get(attempt.saturating_sub(1)).unwrap_or(last),
            },
            Self::Exponential { base, max, jitter } => {
                let doubled = base
                    .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1) as u32))
                    .unwrap_or(*max);
                jitter.apply(doubled.min(*max))
            }
            Self::Custom(f) => f(attempt),
        }
    }
}

/// Attempt loop around a fallible async operation.
///
/// Sleeps happen between attempts, never before the first. Errors outside
/// the configured retryable set propagate immediately; once attempts are
/// exhausted the final error is returned unchanged.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: usize,
    wait: WaitSchedule,
    retry_on: Arc<dyn Fn(&GatewayError) -> bool + Send + Sync>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("wait", &self.wait)
            .finish()
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first call; zero is clamped to one.
    pub fn new(max_attempts: usize, wait: WaitSchedule) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            wait,
            retry_on: Arc::new(|_| true),
        }
    }

    /// Restrict retries to errors whose kind appears in `kinds`.
    pub fn retry_on_kinds(mut self, kinds: Vec<String>) -> Self {
        self.retry_on = Arc::new(move |err| kinds.iter().any(|kind| kind == err.kind()));
        self
    }

    /// Retry only errors matching `predicate`.
    pub fn retry_if<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&GatewayError) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Arc::new(predicate);
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub async fn execute<T, Fut, Op>(
        &self,
        sleeper: &dyn Sleeper,
        mut op: Op,
    ) -> Result<T, GatewayError>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.max_attempts || !(self.retry_on)(&err) {
                        return Err(err);
                    }
                    let wait = self.wait.wait_for(attempt);
                    tracing::debug!(attempt, ?wait, kind = err.kind(), "retrying");
                    sleeper.sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn upstream_err() -> GatewayError {
        GatewayError::Upstream("connection reset".into())
    }

    #[tokio::test]
    async fn succeeds_without_retrying() {
        let policy = RetryPolicy::new(3, WaitSchedule::Fixed(Duration::from_millis(10)));
        let calls = AtomicUsize::new(0);

        let result = policy
            .execute(&InstantSleeper, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(5) }
            })
            .await;

        assert_eq!(result.unwrap(), 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequence_schedule_times_the_waits() {
        // wait=[0.1, 0.2]: two failures then success takes ~0.3s of sleep.
        let sleeper = TrackingSleeper::new();
        let policy = RetryPolicy::new(
            3,
            WaitSchedule::Sequence(vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
            ]),
        );
        let calls = AtomicUsize::new(0);

        let result = policy
            .execute(&sleeper, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(upstream_err()) } else { Ok("ok") } }
            })
            .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            sleeper.waits(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(sleeper.total(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn sequence_reuses_its_last_wait() {
        let schedule = WaitSchedule::Sequence(vec![
            Duration::from_millis(100),
            Duration::from_millis(200),
        ]);
        assert_eq!(schedule.wait_for(1), Duration::from_millis(100));
        assert_eq!(schedule.wait_for(2), Duration::from_millis(200));
        assert_eq!(schedule.wait_for(5), Duration::from_millis(200));
    }

    #[tokio::test]
    async fn exhaustion_returns_the_final_error() {
        let policy = RetryPolicy::new(3, WaitSchedule::Fixed(Duration::from_millis(1)));
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = policy
            .execute(&InstantSleeper, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(GatewayError::Upstream(format!("attempt {n}"))) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            GatewayError::Upstream(msg) => assert_eq!(msg, "attempt 2"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_kinds_propagate_immediately() {
        let policy = RetryPolicy::new(5, WaitSchedule::Fixed(Duration::from_millis(1)))
            .retry_on_kinds(vec!["upstream_error".to_string()]);
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = policy
            .execute(&InstantSleeper, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(GatewayError::Forbidden("denied".into())) }
            })
            .await;

        assert!(matches!(result.unwrap_err(), GatewayError::Forbidden(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exponential_doubles_and_caps() {
        let schedule = WaitSchedule::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_millis(350),
            jitter: Jitter::None,
        };
        assert_eq!(schedule.wait_for(1), Duration::from_millis(100));
        assert_eq!(schedule.wait_for(2), Duration::from_millis(200));
        assert_eq!(schedule.wait_for(3), Duration::from_millis(350));
        assert_eq!(schedule.wait_for(30), Duration::from_millis(350));
    }

    #[test]
    fn full_jitter_stays_within_bounds() {
        let schedule = WaitSchedule::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            jitter: Jitter::Full,
        };
        for attempt in 1..=4 {
            let wait = schedule.wait_for(attempt);
            assert!(wait <= Duration::from_secs(1));
        }
    }

    #[test]
    fn empty_sequence_means_no_wait() {
        assert_eq!(WaitSchedule::Sequence(vec![]).wait_for(1), Duration::ZERO);
    }

    #[test]
    fn custom_schedule_sees_the_attempt_number() {
        let schedule = WaitSchedule::from_fn(|attempt| Duration::from_millis(10 * attempt as u64));
        assert_eq!(schedule.wait_for(1), Duration::from_millis(10));
        assert_eq!(schedule.wait_for(4), Duration::from_millis(40));
    }
}
