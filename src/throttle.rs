//! Request throttling with four interchangeable admission algorithms.
//!
//! Every algorithm answers the same question through [`Throttler::acquire`]:
//! admit one unit now, or report how long until one becomes admissible.
//! Admission state lives in the shared store and each decision is a single
//! atomic script, so concurrent callers across processes see a total order.

use crate::error::GatewayError;
use crate::sleeper::Sleeper;
use crate::store::{AtomicScript, Keyspace, KvStore, ScriptReply, StoreError};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Admission algorithm selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleAlgorithm {
    /// Hard reset at window boundaries; bursts allowed at each boundary.
    FixedWindow,
    /// Carried count decays across window boundaries.
    SlidingWindow,
    /// Continuous refill; allows bursts up to `quota`.
    TokenBucket,
    /// Continuous drain with a queueing delay; rejects when the bucket
    /// holds `bucket_size` pending units.
    LeakyBucket,
}

/// Parameters for one throttle key: `quota` admissions per `duration`
/// seconds, plus the leaky bucket's capacity.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleSettings {
    pub algorithm: ThrottleAlgorithm,
    pub quota: u64,
    pub duration: u64,
    pub bucket_size: Option<u64>,
}

impl ThrottleSettings {
    pub(crate) fn script(&self) -> AtomicScript {
        match self.algorithm {
            ThrottleAlgorithm::FixedWindow => AtomicScript::FixedWindow {
                quota: self.quota,
                duration: self.duration,
            },
            ThrottleAlgorithm::SlidingWindow => AtomicScript::SlidingWindow {
                quota: self.quota,
                duration: self.duration,
            },
            ThrottleAlgorithm::TokenBucket => AtomicScript::TokenBucket {
                quota: self.quota,
                duration: self.duration,
            },
            ThrottleAlgorithm::LeakyBucket => AtomicScript::LeakyBucket {
                quota: self.quota,
                duration: self.duration,
                bucket_size: self.bucket_size.unwrap_or(self.quota),
            },
        }
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    /// One unit admitted; the bucket already moved.
    Granted,
    /// Not admissible for roughly `wait`. Window and token algorithms left
    /// the bucket untouched; the leaky bucket has already enqueued.
    Throttled { wait: Duration },
}

impl Decision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Shared-state throttler for request guards and wrapped calls.
#[derive(Clone)]
pub struct Throttler {
    store: Arc<dyn KvStore>,
    keyspace: Keyspace,
    sleeper: Arc<dyn Sleeper>,
}

impl Throttler {
    pub fn new(store: Arc<dyn KvStore>, keyspace: Keyspace, sleeper: Arc<dyn Sleeper>) -> Self {
        Self { store, keyspace, sleeper }
    }

    /// Try to admit one unit under `key`.
    ///
    /// Fails with [`GatewayError::BucketFull`] when a leaky bucket is at
    /// capacity.
    pub async fn acquire(&self, key: &str, spec: &ThrottleSettings) -> Result<Decision, GatewayError> {
        let store_key = self.keyspace.throttle(key);
        match self.store.atomic(&store_key, &spec.script()).await? {
            ScriptReply::Admitted => Ok(Decision::Granted),
            ScriptReply::Throttled { wait } => Ok(Decision::Throttled {
                wait: Duration::from_secs_f64(wait.max(0.0)),
            }),
            ScriptReply::Saturated => Err(GatewayError::BucketFull),
            _ => Err(StoreError::UnexpectedReply(store_key).into()),
        }
    }

    /// Run `op` once admission is granted.
    ///
    /// On a throttled first attempt this sleeps out the reported wait and
    /// retries once; a second rejection fails with
    /// [`GatewayError::QuotaExceeded`].
    pub async fn run<T, Fut, Op>(
        &self,
        key: &str,
        spec: &ThrottleSettings,
        op: Op,
    ) -> Result<T, GatewayError>
    where
        Op: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        match self.acquire(key, spec).await? {
            Decision::Granted => op().await,
            Decision::Throttled { wait } => {
                self.sleeper.sleep(wait).await;
                match self.acquire(key, spec).await? {
                    Decision::Granted => op().await,
                    Decision::Throttled { wait } => Err(GatewayError::QuotaExceeded { wait }),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::sleeper::InstantSleeper;
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    /// Sleeper that moves a manual clock instead of waiting.
    #[derive(Debug, Clone)]
    struct AdvancingSleeper(ManualClock);

    #[async_trait]
    impl Sleeper for AdvancingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.0.advance(duration.as_secs_f64());
        }
    }

    fn throttler_at(start: f64) -> (Throttler, ManualClock) {
        let clock = ManualClock::starting_at(start);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let throttler = Throttler::new(
            Arc::new(store),
            Keyspace::new("test"),
            Arc::new(AdvancingSleeper(clock.clone())),
        );
        (throttler, clock)
    }

    fn spec(algorithm: ThrottleAlgorithm, quota: u64, duration: u64) -> ThrottleSettings {
        ThrottleSettings { algorithm, quota, duration, bucket_size: None }
    }

    #[tokio::test]
    async fn fixed_window_timeline() {
        // quota=3 per 5s: t=0,1,2 admitted, t=3 waits ~2s, t=5 resets.
        let (throttler, clock) = throttler_at(0.0);
        let spec = spec(ThrottleAlgorithm::FixedWindow, 3, 5);

        for t in [0.0, 1.0, 2.0] {
            clock.set(t);
            assert!(throttler.acquire("k", &spec).await.unwrap().is_granted(), "t={t}");
        }

        clock.set(3.0);
        assert_eq!(
            throttler.acquire("k", &spec).await.unwrap(),
            Decision::Throttled { wait: Duration::from_secs(2) }
        );

        clock.set(5.0);
        assert!(throttler.acquire("k", &spec).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn token_bucket_timeline() {
        // quota=2 per 2s: burst of two at t=0, third waits ~1s.
        let (throttler, clock) = throttler_at(0.0);
        let spec = spec(ThrottleAlgorithm::TokenBucket, 2, 2);

        assert!(throttler.acquire("k", &spec).await.unwrap().is_granted());
        assert!(throttler.acquire("k", &spec).await.unwrap().is_granted());

        match throttler.acquire("k", &spec).await.unwrap() {
            Decision::Throttled { wait } => {
                assert!((wait.as_secs_f64() - 1.0).abs() < 1e-9);
            }
            other => panic!("expected throttled, got {other:?}"),
        }

        clock.set(1.0);
        assert!(throttler.acquire("k", &spec).await.unwrap().is_granted());
    }

    #[tokio::test]
    async fn leaky_bucket_saturation_is_an_error() {
        let (throttler, _clock) = throttler_at(0.0);
        let spec = ThrottleSettings {
            algorithm: ThrottleAlgorithm::LeakyBucket,
            quota: 1,
            duration: 1,
            bucket_size: Some(2),
        };

        assert!(throttler.acquire("k", &spec).await.unwrap().is_granted());
        assert!(matches!(
            throttler.acquire("k", &spec).await.unwrap(),
            Decision::Throttled { .. }
        ));
        assert!(matches!(
            throttler.acquire("k", &spec).await.unwrap_err(),
            GatewayError::BucketFull
        ));
    }

    #[tokio::test]
    async fn sliding_window_admissions_stay_bounded() {
        // Never more than 2*quota admissions inside one duration.
        let (throttler, clock) = throttler_at(0.0);
        let spec = spec(ThrottleAlgorithm::SlidingWindow, 4, 10);

        let mut admitted = 0;
        for tick in 0..40 {
            clock.set(tick as f64 * 0.5);
            if throttler.acquire("k", &spec).await.unwrap().is_granted() {
                admitted += 1;
            }
        }
        // 20 seconds of traffic at 2 rps against quota 4 per 10s.
        assert!(admitted <= 2 * 4 + 4, "admitted {admitted}");
        assert!(admitted >= 4);
    }

    #[tokio::test]
    async fn run_sleeps_out_the_wait_and_retries_once() {
        let (throttler, clock) = throttler_at(0.0);
        let spec = spec(ThrottleAlgorithm::FixedWindow, 1, 5);

        assert!(throttler.acquire("k", &spec).await.unwrap().is_granted());

        // The guard sleeps until the window turns over, then succeeds.
        let value = throttler.run("k", &spec, || async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert!(clock.now() >= 5.0);
    }

    #[tokio::test]
    async fn run_gives_up_after_the_second_rejection() {
        let clock = ManualClock::starting_at(0.0);
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        // InstantSleeper: time never advances, so the retry is rejected too.
        let throttler = Throttler::new(
            Arc::new(store),
            Keyspace::new("test"),
            Arc::new(InstantSleeper),
        );
        let spec = spec(ThrottleAlgorithm::FixedWindow, 1, 5);

        assert!(throttler.acquire("k", &spec).await.unwrap().is_granted());
        let err = throttler
            .run("k", &spec, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::QuotaExceeded { .. }));
    }
}
