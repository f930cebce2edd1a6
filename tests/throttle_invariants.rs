//! Admission-rate invariants for the four throttle algorithms, driven by a
//! manual clock so every run is deterministic.

use premier::{
    Clock, Decision, GatewayError, InstantSleeper, Keyspace, KvStore, ManualClock, MemoryStore,
    ThrottleAlgorithm, ThrottleSettings, Throttler,
};
use std::sync::Arc;

fn throttler(clock: &ManualClock) -> Throttler {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::with_clock(clock));
    Throttler::new(store, Keyspace::new("invariants"), Arc::new(InstantSleeper))
}

fn spec(algorithm: ThrottleAlgorithm, quota: u64, duration: u64) -> ThrottleSettings {
    ThrottleSettings { algorithm, quota, duration, bucket_size: None }
}

/// Drive `attempts` spaced `step` seconds apart; returns the times at
/// which a unit was admitted.
async fn drive(
    throttler: &Throttler,
    clock: &ManualClock,
    spec: &ThrottleSettings,
    attempts: usize,
    step: f64,
) -> Vec<f64> {
    let mut admitted = Vec::new();
    for i in 0..attempts {
        clock.set(i as f64 * step);
        if let Ok(Decision::Granted) = throttler.acquire("key", spec).await {
            admitted.push(clock.now());
        }
    }
    admitted
}

#[tokio::test]
async fn fixed_window_never_exceeds_quota_per_window() {
    let clock = ManualClock::starting_at(0.0);
    let throttler = throttler(&clock);
    let spec = spec(ThrottleAlgorithm::FixedWindow, 3, 5);

    // 2 attempts per second for 30 seconds.
    let admitted = drive(&throttler, &clock, &spec, 61, 0.5).await;

    // Demand always exceeds quota, so windows stay anchored at multiples
    // of the duration and each must admit exactly the quota.
    for window in 0..6 {
        let (start, end) = (window as f64 * 5.0, (window + 1) as f64 * 5.0);
        let in_window = admitted.iter().filter(|t| **t >= start && **t < end).count();
        assert_eq!(in_window, 3, "window {window} admitted {in_window}");
    }
}

#[tokio::test]
async fn sliding_window_stays_under_twice_quota_in_any_interval() {
    let clock = ManualClock::starting_at(0.0);
    let throttler = throttler(&clock);
    let spec = spec(ThrottleAlgorithm::SlidingWindow, 4, 10);

    // 4 attempts per second for 40 seconds.
    let admitted = drive(&throttler, &clock, &spec, 161, 0.25).await;
    assert!(!admitted.is_empty());

    // Slide a duration-length interval across every admission.
    for (i, start) in admitted.iter().enumerate() {
        let in_interval = admitted[i..]
            .iter()
            .take_while(|t| **t < start + 10.0)
            .count();
        assert!(
            in_interval <= 8,
            "interval starting at {start} admitted {in_interval}"
        );
    }
}

#[tokio::test]
async fn token_bucket_rate_plus_burst_bounds_admissions() {
    let clock = ManualClock::starting_at(0.0);
    let throttler = throttler(&clock);
    let spec = spec(ThrottleAlgorithm::TokenBucket, 5, 10);

    // 5 attempts per second for 100 seconds.
    let admitted = drive(&throttler, &clock, &spec, 501, 0.2).await;

    // Sustained rate is quota/duration with a one-quota burst allowance.
    let upper = 5 * 100 / 10 + 5;
    assert!(admitted.len() <= upper, "admitted {}", admitted.len());
    assert!(admitted.len() >= 50, "admitted {}", admitted.len());
}

#[tokio::test]
async fn leaky_bucket_rejects_exactly_at_capacity() {
    let clock = ManualClock::starting_at(0.0);
    let throttler = throttler(&clock);
    let spec = ThrottleSettings {
        algorithm: ThrottleAlgorithm::LeakyBucket,
        quota: 2,
        duration: 1,
        bucket_size: Some(3),
    };

    // Three units fit; their queueing delays grow with the level.
    let first = throttler.acquire("key", &spec).await.unwrap();
    assert_eq!(first, Decision::Granted);
    let second = throttler.acquire("key", &spec).await.unwrap();
    let third = throttler.acquire("key", &spec).await.unwrap();
    let delay_of = |decision: Decision| match decision {
        Decision::Granted => 0.0,
        Decision::Throttled { wait } => wait.as_secs_f64(),
    };
    assert!(delay_of(second) > 0.0);
    assert!(delay_of(third) > delay_of(second));

    // The fourth finds the bucket at capacity.
    assert!(matches!(
        throttler.acquire("key", &spec).await.unwrap_err(),
        GatewayError::BucketFull
    ));

    // After draining, units are accepted again.
    clock.advance(2.0);
    assert!(matches!(
        throttler.acquire("key", &spec).await.unwrap(),
        Decision::Granted | Decision::Throttled { .. }
    ));
}

#[tokio::test]
async fn leaky_bucket_throughput_is_rate_plus_capacity() {
    let clock = ManualClock::starting_at(0.0);
    let throttler = throttler(&clock);
    let spec = ThrottleSettings {
        algorithm: ThrottleAlgorithm::LeakyBucket,
        quota: 2,
        duration: 1,
        bucket_size: Some(3),
    };

    // 10 attempts per second for 20 seconds; count enqueued units.
    let mut enqueued = 0;
    for i in 0..201 {
        clock.set(i as f64 * 0.1);
        match throttler.acquire("key", &spec).await {
            Ok(_) => enqueued += 1,
            Err(GatewayError::BucketFull) => {}
            Err(err) => panic!("unexpected error {err:?}"),
        }
    }

    // Leak rate bounds sustained throughput; capacity bounds the backlog.
    let upper = 2 * 20 + 3;
    assert!(enqueued <= upper, "enqueued {enqueued}");
    assert!(enqueued >= 40, "enqueued {enqueued}");
}

#[tokio::test]
async fn separate_keys_do_not_share_buckets() {
    let clock = ManualClock::starting_at(0.0);
    let throttler = throttler(&clock);
    let spec = spec(ThrottleAlgorithm::FixedWindow, 1, 60);

    assert_eq!(throttler.acquire("a", &spec).await.unwrap(), Decision::Granted);
    assert_eq!(throttler.acquire("b", &spec).await.unwrap(), Decision::Granted);
    assert!(matches!(
        throttler.acquire("a", &spec).await.unwrap(),
        Decision::Throttled { .. }
    ));
}
