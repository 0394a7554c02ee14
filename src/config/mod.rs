//! Client configuration.
//!
//! All sections are optional; missing fields take the documented defaults. A
//! [`ClientConfig`] is validated once by the builder and never re-interpreted per call.
//!
//! ```rust
//! use api_relay::config::ClientConfig;
//!
//! let cfg = ClientConfig::from_yaml_str(
//!     "baseUrl: https://chat.example.com/api/v10\nretry:\n  maxRetries: 5\n",
//! )
//! .unwrap();
//! assert_eq!(cfg.retry.max_retries, 5);
//! assert_eq!(cfg.connection_pool.max_connections, 50);
//! ```

mod duration_ms;

use crate::{Error, ErrorContext, Result};
use crate::types::MAX_REQUEST_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for [`crate::ApiClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientConfig {
    /// Base URL that relative endpoints are joined to.
    pub base_url: String,
    /// Value for the `Authorization` header (e.g. `Bot <token>`).
    #[serde(skip_serializing)]
    pub auth_token: Option<String>,
    pub user_agent: String,
    pub connection_pool: ConnectionPoolConfig,
    pub request_queue: RequestQueueConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub rate_limit: RateLimitConfig,
    pub metrics: MetricsConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost".to_string(),
            auth_token: None,
            user_agent: format!("api-relay/{}", env!("CARGO_PKG_VERSION")),
            connection_pool: ConnectionPoolConfig::default(),
            request_queue: RequestQueueConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionPoolConfig {
    pub max_connections: usize,
    pub max_connections_per_host: usize,
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    /// Default per-request timeout when a request does not carry its own.
    #[serde(with = "duration_ms")]
    pub request_timeout: Duration,
    pub enable_keep_alive: bool,
    #[serde(with = "duration_ms")]
    pub keep_alive_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub max_idle_time: Duration,
    #[serde(with = "duration_ms")]
    pub health_check_interval: Duration,
}

impl Default for ConnectionPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            max_connections_per_host: 10,
            connection_timeout: Duration::from_millis(5_000),
            request_timeout: Duration::from_millis(30_000),
            enable_keep_alive: true,
            keep_alive_timeout: Duration::from_millis(30_000),
            max_idle_time: Duration::from_millis(90_000),
            health_check_interval: Duration::from_millis(30_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RequestQueueConfig {
    pub max_queue_size: usize,
    #[serde(with = "duration_ms")]
    pub processing_interval: Duration,
    #[serde(with = "duration_ms")]
    pub batch_timeout: Duration,
    pub batch_size: usize,
    /// Number of dispatch workers performing network I/O concurrently.
    pub max_concurrent_requests: usize,
    /// Upper bound on how long `shutdown` waits for in-flight work.
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            processing_interval: Duration::from_millis(100),
            batch_timeout: Duration::from_millis(100),
            batch_size: 10,
            max_concurrent_requests: 10,
            drain_timeout: Duration::from_millis(5_000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            exponential_base: 2.0,
            jitter: true,
            retryable_status_codes: vec![429, 500, 502, 503, 504],
        }
    }
}

/// Whether breaker state is tracked per route template or per host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CircuitScope {
    #[default]
    Route,
    Host,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    pub enable: bool,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "duration_ms")]
    pub reset_timeout: Duration,
    /// Sliding window in which failures are counted while closed.
    #[serde(with = "duration_ms")]
    pub monitoring_period: Duration,
    /// Trial requests admitted per half-open period; defaults to `success_threshold`.
    pub half_open_max_calls: Option<u32>,
    pub scope: CircuitScope,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enable: true,
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_millis(60_000),
            monitoring_period: Duration::from_millis(60_000),
            half_open_max_calls: None,
            scope: CircuitScope::Route,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_monitoring_period(mut self, period: Duration) -> Self {
        self.monitoring_period = period;
        self
    }

    pub fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = Some(calls);
        self
    }

    pub fn trial_calls(&self) -> u32 {
        self.half_open_max_calls.unwrap_or(self.success_threshold)
    }
}

/// Static estimate used for routes that have not reported bucket metadata yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 3_000,
            burst_limit: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MetricsConfig {
    pub enable_metrics: bool,
    #[serde(with = "duration_ms")]
    pub metrics_interval: Duration,
    /// Error rate above which `health_check` reports unhealthy.
    pub unhealthy_error_rate: f64,
    pub response_time_samples: usize,
    #[serde(with = "duration_ms")]
    pub throughput_window: Duration,
    /// When set, `health_check` sends a GET here to measure response time.
    pub health_probe_endpoint: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enable_metrics: true,
            metrics_interval: Duration::from_millis(1_000),
            unhealthy_error_rate: 0.5,
            response_time_samples: 1_000,
            throughput_window: Duration::from_millis(60_000),
            health_probe_endpoint: None,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid YAML configuration: {}", e),
                ErrorContext::new().with_source("config_loader"),
            )
        })
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid JSON configuration: {}", e),
                ErrorContext::new().with_source("config_loader"),
            )
        })
    }

    /// Load from a `.yaml`/`.yml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("cannot read configuration file: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("config_loader"),
            )
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            _ => Self::from_yaml_str(&raw),
        }
    }

    /// Apply `API_RELAY_*` environment overrides.
    ///
    /// - `API_RELAY_BASE_URL`
    /// - `API_RELAY_TOKEN`
    /// - `API_RELAY_MAX_RETRIES`
    /// - `API_RELAY_MAX_CONCURRENT`
    /// - `API_RELAY_RPM`
    pub fn apply_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("API_RELAY_BASE_URL") {
            self.base_url = url;
        }
        if let Ok(token) = std::env::var("API_RELAY_TOKEN") {
            self.auth_token = Some(token);
        }
        if let Some(n) = env_parse::<u32>("API_RELAY_MAX_RETRIES") {
            self.retry.max_retries = n;
        }
        if let Some(n) = env_parse::<usize>("API_RELAY_MAX_CONCURRENT") {
            self.request_queue.max_concurrent_requests = n;
        }
        if let Some(n) = env_parse::<u32>("API_RELAY_RPM") {
            self.rate_limit.requests_per_minute = n;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.base_url).map_err(|e| invalid("base_url", e.to_string()))?;

        let pool = &self.connection_pool;
        if pool.max_connections == 0 {
            return Err(invalid("connection_pool.max_connections", "must be at least 1"));
        }
        if pool.max_connections_per_host == 0 || pool.max_connections_per_host > pool.max_connections {
            return Err(invalid(
                "connection_pool.max_connections_per_host",
                format!("must be within 1..={}", pool.max_connections),
            ));
        }
        if pool.connection_timeout.is_zero() || pool.request_timeout.is_zero() {
            return Err(invalid("connection_pool", "timeouts must be non-zero"));
        }
        if pool.request_timeout > MAX_REQUEST_TIMEOUT {
            return Err(invalid(
                "connection_pool.request_timeout",
                format!("must not exceed {}ms", MAX_REQUEST_TIMEOUT.as_millis()),
            ));
        }
        if pool.health_check_interval.is_zero() {
            return Err(invalid("connection_pool.health_check_interval", "must be non-zero"));
        }

        let queue = &self.request_queue;
        if queue.max_queue_size == 0 {
            return Err(invalid("request_queue.max_queue_size", "must be at least 1"));
        }
        if queue.max_concurrent_requests == 0 {
            return Err(invalid("request_queue.max_concurrent_requests", "must be at least 1"));
        }
        if queue.batch_size == 0 {
            return Err(invalid("request_queue.batch_size", "must be at least 1"));
        }
        if queue.processing_interval.is_zero() {
            return Err(invalid("request_queue.processing_interval", "must be non-zero"));
        }

        let retry = &self.retry;
        if !retry.exponential_base.is_finite() || retry.exponential_base < 1.0 {
            return Err(invalid("retry.exponential_base", "must be a finite value >= 1"));
        }
        if retry.max_delay < retry.base_delay {
            return Err(invalid("retry.max_delay", "must not be smaller than base_delay"));
        }

        let cb = &self.circuit_breaker;
        if cb.enable {
            if cb.failure_threshold == 0 || cb.success_threshold == 0 {
                return Err(invalid("circuit_breaker", "thresholds must be at least 1"));
            }
            if cb.trial_calls() < cb.success_threshold {
                return Err(invalid(
                    "circuit_breaker.half_open_max_calls",
                    "must not be smaller than success_threshold",
                ));
            }
        }

        if self.rate_limit.burst_limit == 0 {
            return Err(invalid("rate_limit.burst_limit", "must be at least 1"));
        }

        let m = &self.metrics;
        if m.enable_metrics && m.metrics_interval.is_zero() {
            return Err(invalid("metrics.metrics_interval", "must be non-zero"));
        }
        if !(0.0..=1.0).contains(&m.unhealthy_error_rate) {
            return Err(invalid("metrics.unhealthy_error_rate", "must be within 0..=1"));
        }
        if m.response_time_samples == 0 {
            return Err(invalid("metrics.response_time_samples", "must be at least 1"));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

fn invalid(field: &str, details: impl Into<String>) -> Error {
    Error::configuration_with_context(
        "invalid configuration value",
        ErrorContext::new()
            .with_field_path(field)
            .with_details(details)
            .with_source("config_validator"),
    )
}
