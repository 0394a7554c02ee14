use super::{Method, Priority};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchItem {
    pub method: Method,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

impl BatchItem {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    pub requests: Vec<BatchItem>,
    #[serde(default)]
    pub priority: Priority,
}

impl BatchRequest {
    pub fn new(requests: Vec<BatchItem>) -> Self {
        Self {
            requests,
            priority: Priority::default(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Outcome of one batch item, in input order.
#[derive(Debug, Clone, Serialize)]
pub struct BatchItemResult {
    pub index: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResponse {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub results: Vec<BatchItemResult>,
}

impl BatchResponse {
    pub fn from_results(results: Vec<BatchItemResult>) -> Self {
        let successful_requests = results.iter().filter(|r| r.success).count();
        Self {
            total_requests: results.len(),
            successful_requests,
            failed_requests: results.len() - successful_requests,
            results,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }
}
