//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use premier::{
    Clock, ConfigHandle, GatewayConfig, GatewayError, HttpClient, KvStore, ManualClock,
    MemoryStore, Request, Response,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub fn get(path: &str) -> Request {
    http::Request::builder()
        .method(http::Method::GET)
        .uri(path)
        .body(Bytes::new())
        .unwrap()
}

pub fn ok_response(body: &str) -> Response {
    http::Response::new(Bytes::from(body.to_string()))
}

/// Compile `yaml` against a manual clock and return the pieces a gateway
/// needs.
pub fn compiled(yaml: &str, clock: &ManualClock) -> (Arc<ConfigHandle>, Arc<dyn KvStore>) {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let snapshot = GatewayConfig::from_yaml(yaml)
        .expect("yaml parses")
        .compile(Arc::clone(&clock))
        .expect("config compiles");
    let store: Arc<dyn KvStore> = Arc::new(MemoryStore::with_clock(clock));
    (Arc::new(ConfigHandle::new(snapshot)), store)
}

/// Backend-pool client whose per-URL health is scripted by the test.
pub struct ScriptedClient {
    up: Mutex<HashSet<String>>,
    forwards: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn new(up: &[&str]) -> Self {
        Self {
            up: Mutex::new(up.iter().map(|url| url.to_string()).collect()),
            forwards: Mutex::new(Vec::new()),
        }
    }

    pub fn set_up(&self, url: &str, healthy: bool) {
        let mut up = self.up.lock().unwrap();
        if healthy {
            up.insert(url.to_string());
        } else {
            up.remove(url);
        }
    }

    /// URLs that served a forwarded request, in order.
    pub fn forwards(&self) -> Vec<String> {
        self.forwards.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for ScriptedClient {
    async fn forward(&self, base_url: &str, _req: Request) -> Result<Response, GatewayError> {
        if self.up.lock().unwrap().contains(base_url) {
            self.forwards.lock().unwrap().push(base_url.to_string());
            Ok(ok_response(&format!("served by {base_url}")))
        } else {
            Err(GatewayError::Upstream(format!("{base_url} refused connection")))
        }
    }

    async fn probe(&self, base_url: &str) -> bool {
        self.up.lock().unwrap().contains(base_url)
    }
}
