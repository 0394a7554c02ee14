//! Typed client notifications.
//!
//! Every notification goes to the broadcast channel behind
//! [`crate::client::ApiClient::subscribe`] and to each registered [`EventSink`].
//! Emission never blocks and never fails: lagging subscribers lose the oldest
//! events, and a client with no subscribers drops them.

use crate::metrics::MetricsSnapshot;
use crate::resilience::CircuitSnapshot;
use serde::Serialize;
use std::sync::{Arc, RwLock};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    CircuitBreakerOpen(CircuitSnapshot),
    CircuitBreakerClosed(CircuitSnapshot),
    QueueFull { queue_size: usize },
    MetricsUpdated(MetricsSnapshot),
    RequestRetried { route: String, attempt: u32, delay_ms: u64 },
    RateLimited { route: String, wait_ms: u64, global: bool },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::CircuitBreakerOpen(_) => "circuitBreakerOpen",
            ClientEvent::CircuitBreakerClosed(_) => "circuitBreakerClosed",
            ClientEvent::QueueFull { .. } => "queueFull",
            ClientEvent::MetricsUpdated(_) => "metricsUpdated",
            ClientEvent::RequestRetried { .. } => "requestRetried",
            ClientEvent::RateLimited { .. } => "rateLimited",
        }
    }
}

/// Destination for client notifications.
pub trait EventSink: Send + Sync {
    fn report(&self, event: &ClientEvent);
}

/// In-memory sink for testing.
pub struct InMemoryEventSink {
    events: RwLock<Vec<ClientEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: RwLock::new(Vec::new()),
            max_events: max,
        }
    }

    pub fn get_events(&self) -> Vec<ClientEvent> {
        self.events.read().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn get_events_by_name(&self, name: &str) -> Vec<ClientEvent> {
        self.get_events()
            .into_iter()
            .filter(|e| e.name() == name)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.write() {
            events.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSink for InMemoryEventSink {
    fn report(&self, event: &ClientEvent) {
        if let Ok(mut events) = self.events.write() {
            events.push(event.clone());
            if events.len() > self.max_events {
                events.remove(0);
            }
        }
    }
}

/// Logs every notification through `tracing`.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn report(&self, event: &ClientEvent) {
        match event {
            ClientEvent::CircuitBreakerOpen(s) => {
                warn!(event = event.name(), key = %s.key, failures = s.failure_count, "notification")
            }
            ClientEvent::CircuitBreakerClosed(s) => {
                info!(event = event.name(), key = %s.key, "notification")
            }
            ClientEvent::QueueFull { queue_size } => {
                warn!(event = event.name(), queue_size, "notification")
            }
            ClientEvent::MetricsUpdated(m) => {
                info!(
                    event = event.name(),
                    total = m.total_requests,
                    error_rate = m.error_rate,
                    throughput = m.throughput_per_sec,
                    "notification"
                )
            }
            ClientEvent::RequestRetried { route, attempt, delay_ms } => {
                info!(event = event.name(), route = %route, attempt, delay_ms, "notification")
            }
            ClientEvent::RateLimited { route, wait_ms, global } => {
                warn!(event = event.name(), route = %route, wait_ms, global, "notification")
            }
        }
    }
}

/// Fan-out point shared by every component that raises notifications.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
    sinks: Arc<Vec<Arc<dyn EventSink>>>,
}

impl EventBus {
    pub fn new(capacity: usize, sinks: Vec<Arc<dyn EventSink>>) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            sinks: Arc::new(sinks),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        for sink in self.sinks.iter() {
            sink.report(&event);
        }
        // No receivers is not an error.
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256, Vec::new())
    }
}
