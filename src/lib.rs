//! # api-relay
//!
//! Resilient client core for strictly rate-limited REST APIs (chat-platform
//! backends and the like).
//!
//! ## Overview
//!
//! Every request is submitted to a bounded priority queue and resolved exactly
//! once through a [`scheduler::ResultHandle`]. A pool of dispatch workers carries
//! each request through the gates in a fixed order:
//!
//! 1. circuit breaker (per route or host): fail fast, no rate-limit budget spent
//! 2. rate limiter (per route + global buckets fed by response headers)
//! 3. connection pool (per-host and global bounds, keep-alive reuse)
//! 4. transport, then the retry policy on failure, re-entering the gates
//!
//! A passive metrics monitor observes all of it and publishes snapshots.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use api_relay::{ApiClient, ClientConfig, Priority, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> api_relay::Result<()> {
//!     let mut config = ClientConfig::new("https://discord.com/api/v10");
//!     config.auth_token = Some("Bot your-token".into());
//!     let client = ApiClient::new(config)?;
//!
//!     let msg = client
//!         .post(
//!             "/channels/123456789012345678/messages",
//!             Some(serde_json::json!({ "content": "hello" })),
//!             RequestOptions::new().with_priority(Priority::High),
//!         )
//!         .await?;
//!     println!("{} after {} attempt(s)", msg.status, msg.attempts);
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`client`] | `ApiClient` facade and builder |
//! | [`scheduler`] | Priority queue, dispatch loop, result handles |
//! | [`resilience`] | Circuit breaker, rate limiter, retry policy |
//! | [`pool`] | Per-host connection pool |
//! | [`transport`] | Connector seam and the reqwest transport |
//! | [`metrics`] | Counters, snapshots, health reports |
//! | [`events`] | Typed notifications and sinks |
//! | [`config`] | Configuration sections, loaders, validation |
//! | [`types`] | Request/response and batch types |

pub mod client;
pub mod config;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod pool;
pub mod resilience;
pub mod scheduler;
pub mod transport;
pub mod types;

pub use client::{ApiClient, ApiClientBuilder};
pub use config::ClientConfig;
pub use events::{ClientEvent, EventSink};
pub use metrics::{HealthReport, MetricsSnapshot};
pub use scheduler::ResultHandle;
pub use types::{
    ApiResponse, BatchItem, BatchRequest, BatchResponse, Method, Priority, RequestOptions,
    RouteTemplate,
};

pub mod error;
pub use error::{Error, ErrorContext};

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
