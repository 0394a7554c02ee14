//! Transport seam between the dispatch path and the network.
//!
//! The pool hands out [`Connection`]s created by a [`Connector`]. The default
//! connector is [`HttpConnector`] (reqwest); tests plug in scripted connectors.

mod http;

pub use http::{HttpConnection, HttpConnector};

use crate::resilience::rate_limiter::RateLimitHeaders;
use crate::types::Method;
use async_trait::async_trait;
use std::time::Duration;

/// A single request as put on the wire.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub method: Method,
    pub url: url::Url,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
    /// Correlation id sent as `x-request-id`.
    pub request_id: String,
    /// Remaining time budget for this attempt.
    pub timeout: Duration,
}

/// Raw response before classification.
#[derive(Debug, Clone, Default)]
pub struct WireResponse {
    pub status: u16,
    pub body: serde_json::Value,
    pub rate_limit: RateLimitHeaders,
}

impl WireResponse {
    pub fn new(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            body,
            rate_limit: RateLimitHeaders::default(),
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitHeaders) -> Self {
        self.rate_limit = rate_limit;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Connect to {host} failed: {message}")]
    Connect { host: String, message: String },

    #[error("Connection reset: {0}")]
    Reset(String),

    #[error("Transport timed out")]
    Timeout,

    #[error("Transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Http(e) => e.is_timeout(),
            TransportError::Timeout => true,
            _ => false,
        }
    }
}

/// One logical connection to a host.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn send(&self, request: &WireRequest) -> Result<WireResponse, TransportError>;

    /// Lightweight liveness check used by the pool's health sweep.
    async fn probe(&self) -> bool {
        true
    }

    /// Whether the connection may be parked for reuse after a request.
    fn is_reusable(&self) -> bool {
        true
    }
}

/// Opens connections for the pool.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, host: &str) -> Result<Box<dyn Connection>, TransportError>;
}
