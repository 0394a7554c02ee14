//! Batch Processing Example
//!
//! Submits a batch of requests through the full client and prints the
//! per-item outcomes. Without `API_RELAY_BASE_URL` the demo answers from an
//! in-process connector so it runs offline.
//!
//! Usage:
//!   cargo run --example batch_processing
//!   API_RELAY_BASE_URL=https://discord.com/api/v10 API_RELAY_TOKEN="Bot ..." \
//!     cargo run --example batch_processing

use api_relay::events::TracingEventSink;
use api_relay::logging::init_tracing;
use api_relay::transport::{Connection, Connector, TransportError, WireRequest, WireResponse};
use api_relay::{ApiClient, BatchItem, BatchRequest, ClientConfig, Method, Priority};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Answers every request locally; paths containing `missing` get a 404.
struct LocalConnector;

struct LocalConnection;

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, _host: &str) -> Result<Box<dyn Connection>, TransportError> {
        Ok(Box::new(LocalConnection))
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn send(&self, request: &WireRequest) -> Result<WireResponse, TransportError> {
        tokio::time::sleep(Duration::from_millis(40)).await;
        let path = request.url.path();
        if path.contains("missing") {
            return Ok(WireResponse::new(404, json!({"message": "Unknown Channel", "code": 10003})));
        }
        Ok(WireResponse::new(
            200,
            json!({"path": path, "method": request.method.as_str()}),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("api_relay=info");

    println!("=== api-relay Batch Processing Demo ===\n");

    let client = match std::env::var("API_RELAY_BASE_URL") {
        Ok(_) => ApiClient::builder()
            .with_env_overrides()
            .event_sink(Arc::new(TracingEventSink))
            .build()?,
        Err(_) => {
            let mut config = ClientConfig::new("http://localhost/api/v10");
            config.request_queue.batch_size = 3;
            ApiClient::builder()
                .config(config)
                .connector(Arc::new(LocalConnector))
                .event_sink(Arc::new(TracingEventSink))
                .build()?
        }
    };

    let batch = BatchRequest::new(vec![
        BatchItem::new(Method::Get, "/users/@me"),
        BatchItem::new(Method::Get, "/channels/41771983423143937"),
        BatchItem::new(Method::Get, "/channels/missing"),
        BatchItem::new(Method::Post, "/channels/41771983423143937/messages")
            .with_body(json!({"content": "hello from api-relay"})),
        BatchItem::new(Method::Get, "/guilds/197038439483310086/roles"),
    ])
    .with_priority(Priority::High);

    let response = client.batch_request(batch).await;

    println!(
        "Batch finished: {}/{} succeeded ({:.0}%)\n",
        response.successful_requests,
        response.total_requests,
        response.success_rate() * 100.0
    );
    for result in &response.results {
        match &result.error {
            None => println!("  [{}] {:?} {}", result.index, result.status, result.data.clone().unwrap_or_default()),
            Some(e) => println!("  [{}] failed: {e}", result.index),
        }
    }

    let metrics = client.get_metrics();
    println!(
        "\nMetrics: total {}, failed {}, p95 {}ms",
        metrics.total_requests, metrics.failed_requests, metrics.p95_response_time_ms
    );

    client.shutdown().await;
    Ok(())
}
