//! Scripted in-process transport for driving the full client in tests.

#![allow(dead_code)]

use api_relay::config::ClientConfig;
use api_relay::resilience::RateLimitHeaders;
use api_relay::transport::{Connection, Connector, TransportError, WireRequest, WireResponse};
use api_relay::{ApiClient, ApiClientBuilder};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

pub const BASE_URL: &str = "http://api.test/api/v10";

/// One scripted reply.
#[derive(Debug, Clone)]
pub enum Step {
    Json(u16, Value),
    RateLimited { retry_after: Duration, global: bool },
    Reset,
    Delayed(Duration, Box<Step>),
}

impl Step {
    pub fn ok() -> Self {
        Step::Json(200, json!({"ok": true}))
    }

    pub fn status(status: u16) -> Self {
        Step::Json(status, json!({"message": format!("scripted {status}")}))
    }

    pub fn after(self, delay: Duration) -> Self {
        Step::Delayed(delay, Box::new(self))
    }
}

#[derive(Debug, Clone)]
pub struct Sent {
    pub path: String,
    pub at: Instant,
    pub request_id: String,
}

#[derive(Default)]
struct Script {
    queued: Mutex<HashMap<String, VecDeque<Step>>>,
    fallback: Mutex<HashMap<String, Step>>,
    default_delay: Mutex<Duration>,
    sent: Mutex<Vec<Sent>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    connects: AtomicUsize,
}

impl Script {
    fn next_step(&self, path: &str) -> Step {
        if let Some(step) = self
            .queued
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(|q| q.pop_front())
        {
            return step;
        }
        let fallback = self.fallback.lock().unwrap().get(path).cloned();
        let step = fallback.unwrap_or_else(Step::ok);
        let delay = *self.default_delay.lock().unwrap();
        if delay.is_zero() {
            step
        } else {
            step.after(delay)
        }
    }
}

/// Connector whose connections answer from a per-path script.
///
/// Paths without a scripted step answer `200 {"ok": true}` after the default delay.
#[derive(Clone, Default)]
pub struct ScriptedConnector {
    script: Arc<Script>,
}

impl ScriptedConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(self, delay: Duration) -> Self {
        *self.script.default_delay.lock().unwrap() = delay;
        self
    }

    /// Queue one reply for `path`; queued replies are used in order before the fallback.
    pub fn push(&self, path: &str, step: Step) {
        self.script
            .queued
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(step);
    }

    /// Reply used for `path` once its queue is empty.
    pub fn always(&self, path: &str, step: Step) {
        self.script
            .fallback
            .lock()
            .unwrap()
            .insert(path.to_string(), step);
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.script.sent.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.script.sent.lock().unwrap().len()
    }

    pub fn calls_for(&self, path: &str) -> usize {
        self.sent().iter().filter(|s| s.path == path).count()
    }

    pub fn max_in_flight(&self) -> usize {
        self.script.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.script.in_flight.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.script.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, _host: &str) -> Result<Box<dyn Connection>, TransportError> {
        self.script.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            script: self.script.clone(),
        }))
    }
}

struct ScriptedConnection {
    script: Arc<Script>,
}

struct InFlightGuard<'a>(&'a Script);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for ScriptedConnection {
    async fn send(&self, request: &WireRequest) -> Result<WireResponse, TransportError> {
        let path = request.url.path().to_string();
        let script = &self.script;
        script.sent.lock().unwrap().push(Sent {
            path: path.clone(),
            at: Instant::now(),
            request_id: request.request_id.clone(),
        });
        let now = script.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        script.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlightGuard(script);

        let mut step = script.next_step(&path);
        loop {
            match step {
                Step::Delayed(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    step = *inner;
                }
                Step::Json(status, body) => return Ok(WireResponse::new(status, body)),
                Step::RateLimited {
                    retry_after,
                    global,
                } => {
                    let body = json!({
                        "message": "You are being rate limited.",
                        "retry_after": retry_after.as_secs_f64(),
                        "global": global,
                    });
                    let headers = RateLimitHeaders {
                        retry_after: Some(retry_after),
                        global,
                        ..Default::default()
                    };
                    return Ok(WireResponse::new(429, body).with_rate_limit(headers));
                }
                Step::Reset => return Err(TransportError::Reset("scripted reset".into())),
            }
        }
    }
}

/// Test defaults: fast retries without jitter, short intervals.
pub fn test_config() -> ClientConfig {
    let mut cfg = ClientConfig::new(BASE_URL);
    cfg.retry.base_delay = Duration::from_millis(10);
    cfg.retry.max_delay = Duration::from_millis(100);
    cfg.retry.jitter = false;
    cfg.request_queue.processing_interval = Duration::from_millis(10);
    cfg.request_queue.drain_timeout = Duration::from_millis(2000);
    cfg.connection_pool.request_timeout = Duration::from_secs(10);
    cfg.metrics.metrics_interval = Duration::from_millis(50);
    cfg
}

pub fn client_with(connector: &ScriptedConnector, cfg: ClientConfig) -> ApiClient {
    ApiClientBuilder::new()
        .config(cfg)
        .connector(Arc::new(connector.clone()))
        .build()
        .expect("client builds")
}

pub fn path(endpoint: &str) -> String {
    format!("/api/v10{endpoint}")
}
