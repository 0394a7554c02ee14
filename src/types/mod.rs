//! Core request/response types shared by the scheduler, the gates and the client facade.

mod batch;
mod route;

pub use batch::{BatchItem, BatchItemResult, BatchRequest, BatchResponse};
pub use route::RouteTemplate;

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Longest per-request timeout honoured; larger values are clamped.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(86_400);

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Post,
    Patch,
    Put,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Patch => "PATCH",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatch priority. Ordering is `Low < Normal < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Highest first.
    pub const DISPATCH_ORDER: [Priority; 4] =
        [Priority::Critical, Priority::High, Priority::Normal, Priority::Low];

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

/// Per-call options accepted by the `get/post/...` operations.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub priority: Priority,
    /// Overrides `connectionPool.requestTimeout`.
    pub timeout: Option<Duration>,
    /// Explicit rate-limit route template; derived from the endpoint when absent.
    pub route: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A request as owned by the scheduler. Immutable once submitted.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    /// Fully resolved target URL.
    pub url: url::Url,
    /// `host[:port]` of `url`, the connection pool key.
    pub host: String,
    pub route: RouteTemplate,
    pub body: Option<serde_json::Value>,
    pub headers: Vec<(String, String)>,
    pub priority: Priority,
    pub timeout: Duration,
    pub submitted_at: Instant,
}

impl RequestDescriptor {
    /// Instant after which the caller's handle resolves with a timeout.
    pub fn deadline(&self) -> Instant {
        self.submitted_at
            .checked_add(self.timeout.min(MAX_REQUEST_TIMEOUT))
            .unwrap_or(self.submitted_at)
    }
}

/// Successful response delivered to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    pub status: u16,
    pub data: serde_json::Value,
    pub route: String,
    /// Number of attempts, including the successful one.
    pub attempts: u32,
    pub duration_ms: u64,
}

impl ApiResponse {
    pub fn success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}
