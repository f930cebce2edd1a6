//! Single-flight behavior of the response cache under concurrency.

mod common;

use bytes::Bytes;
use common::{compiled, get, ok_response};
use premier::{upstream_fn, Gateway, MemorySink, Request};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const YAML: &str = r#"
premier:
  keyspace: sf
  paths:
    - pattern: "/api/report"
      features:
        cache: {expire_s: 300}
"#;

#[tokio::test(start_paused = true)]
async fn concurrent_requests_share_one_upstream_call() {
    let clock = premier::ManualClock::starting_at(0.0);
    let (config, store) = compiled(YAML, &clock);
    let produced = Arc::new(AtomicUsize::new(0));
    let upstream = {
        let produced = Arc::clone(&produced);
        upstream_fn(move |_req: Request| {
            let produced = Arc::clone(&produced);
            async move {
                produced.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(ok_response("expensive report"))
            }
        })
    };
    let gateway = Arc::new(
        Gateway::builder(config, store)
            .clock(Arc::new(clock))
            .plugin(Arc::new(upstream))
            .with_sink(MemorySink::new()),
    );

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let gateway = Arc::clone(&gateway);
        tasks.push(tokio::spawn(async move {
            gateway.handle(get("/api/report")).await
        }));
    }

    for task in tasks {
        let response = task.await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), &Bytes::from_static(b"expensive report"));
    }
    assert_eq!(produced.load(Ordering::SeqCst), 1, "producer ran once");

    let records = gateway.sink().request_records();
    let hits = records.iter().filter(|record| record.cache_hit).count();
    assert_eq!(hits, 15, "everyone but the winner was served from cache");
}

#[tokio::test(start_paused = true)]
async fn distinct_keys_produce_independently() {
    let clock = premier::ManualClock::starting_at(0.0);
    let yaml = r#"
premier:
  keyspace: sf2
  paths:
    - pattern: "/api/*"
      features:
        cache: {expire_s: 300}
"#;
    let (config, store) = compiled(yaml, &clock);
    let produced = Arc::new(AtomicUsize::new(0));
    let upstream = {
        let produced = Arc::clone(&produced);
        upstream_fn(move |req: Request| {
            let produced = Arc::clone(&produced);
            async move {
                produced.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(ok_response(req.uri().path()))
            }
        })
    };
    let gateway = Arc::new(
        Gateway::builder(config, store)
            .clock(Arc::new(clock))
            .plugin(Arc::new(upstream))
            .with_sink(MemorySink::new()),
    );

    let mut tasks = Vec::new();
    for path in ["/api/a", "/api/b", "/api/a", "/api/b"] {
        let gateway = Arc::clone(&gateway);
        tasks.push(tokio::spawn(async move {
            (path, gateway.handle(get(path)).await)
        }));
    }
    for task in tasks {
        let (path, response) = task.await.unwrap();
        assert_eq!(response.body(), &Bytes::from(path.to_string()));
    }
    assert_eq!(produced.load(Ordering::SeqCst), 2, "one producer per key");
}
