use crate::client::builder::ApiClientBuilder;
use crate::config::ClientConfig;
use crate::events::{ClientEvent, EventBus};
use crate::metrics::{DetailedStatus, HealthReport, MetricsSnapshot};
use crate::scheduler::{DispatchContext, QueueStats, ResultHandle, Scheduler};
use crate::types::{ApiResponse, Method, RequestDescriptor, RequestOptions, RouteTemplate};
use crate::{Error, ErrorContext, Result};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resilient client for a rate-limited REST API.
///
/// Every call goes through the scheduler; nothing here talks to the network
/// directly. Construct with [`ApiClient::builder`] inside a Tokio runtime and
/// share by reference (or `Arc`); there is no global instance.
pub struct ApiClient {
    pub(crate) config: Arc<ClientConfig>,
    pub(crate) scheduler: Scheduler,
    pub(crate) ctx: Arc<DispatchContext>,
    pub(crate) background: CancellationToken,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) shut_down: AtomicBool,
}

impl ApiClient {
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::new()
    }

    /// Build a client from `config` with the default HTTP transport.
    pub fn new(config: ClientConfig) -> Result<Self> {
        ApiClientBuilder::new().config(config).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Resolve an endpoint (relative to `base_url`, or absolute) into a descriptor.
    pub fn descriptor(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<RequestDescriptor> {
        let url = self.resolve(endpoint)?;
        let host = match (url.host_str(), url.port()) {
            (Some(h), Some(p)) => format!("{h}:{p}"),
            (Some(h), None) => h.to_string(),
            (None, _) => {
                return Err(Error::configuration_with_context(
                    "endpoint has no host",
                    ErrorContext::new()
                        .with_field_path("endpoint")
                        .with_details(endpoint.to_string()),
                ))
            }
        };
        let route = options
            .route
            .map(RouteTemplate::new)
            .unwrap_or_else(|| RouteTemplate::from_endpoint(endpoint));
        Ok(RequestDescriptor {
            method,
            url,
            host,
            route,
            body,
            headers: options.headers,
            priority: options.priority,
            timeout: options
                .timeout
                .unwrap_or(self.config.connection_pool.request_timeout),
            submitted_at: Instant::now(),
        })
    }

    fn resolve(&self, endpoint: &str) -> Result<url::Url> {
        let raw = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_string()
        } else {
            format!(
                "{}/{}",
                self.config.base_url.trim_end_matches('/'),
                endpoint.trim_start_matches('/')
            )
        };
        url::Url::parse(&raw).map_err(|e| {
            Error::configuration_with_context(
                format!("invalid endpoint: {e}"),
                ErrorContext::new()
                    .with_field_path("endpoint")
                    .with_details(raw.clone()),
            )
        })
    }

    /// Enqueue a request and return its pending handle without waiting.
    pub fn submit(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<ResultHandle> {
        let descriptor = self.descriptor(method, endpoint, body, options)?;
        Ok(self.scheduler.submit(descriptor))
    }

    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        self.submit(method, endpoint, body, options)?.wait().await
    }

    pub async fn get(&self, endpoint: &str, options: RequestOptions) -> Result<ApiResponse> {
        self.request(Method::Get, endpoint, None, options).await
    }

    pub async fn post(
        &self,
        endpoint: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        self.request(Method::Post, endpoint, body, options).await
    }

    pub async fn patch(
        &self,
        endpoint: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        self.request(Method::Patch, endpoint, body, options).await
    }

    pub async fn put(
        &self,
        endpoint: &str,
        body: Option<Value>,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        self.request(Method::Put, endpoint, body, options).await
    }

    pub async fn delete(&self, endpoint: &str, options: RequestOptions) -> Result<ApiResponse> {
        self.request(Method::Delete, endpoint, None, options).await
    }

    /// Receive every notification raised after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.ctx.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    /// Fresh metrics computed from the live counters.
    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.scheduler.stats()
    }

    /// Synthesize health from component state.
    ///
    /// Only makes a network call when `metrics.healthProbeEndpoint` is configured;
    /// the probe then supplies `response_time_ms` and must not fail.
    pub async fn health_check(&self) -> HealthReport {
        let metrics = self.ctx.metrics.snapshot();
        let circuits = self.ctx.breaker.snapshots();

        let mut probe_ok = true;
        let response_time_ms = match self.config.metrics.health_probe_endpoint.as_deref() {
            Some(endpoint) if self.scheduler.is_accepting() => {
                let started = Instant::now();
                let options = RequestOptions::new()
                    .with_priority(crate::types::Priority::High)
                    .with_timeout(self.config.connection_pool.connection_timeout);
                match self.get(endpoint, options).await {
                    Ok(_) | Err(Error::Client { .. }) => {
                        Some(started.elapsed().as_millis() as u64)
                    }
                    Err(e) => {
                        warn!(endpoint, error = %e, "health probe failed");
                        probe_ok = false;
                        None
                    }
                }
            }
            _ => (metrics.average_response_time_ms > 0.0)
                .then(|| metrics.average_response_time_ms.round() as u64),
        };

        let is_healthy = probe_ok
            && self.scheduler.is_accepting()
            && HealthReport::evaluate(
                metrics.recent_error_rate,
                self.ctx.metrics.unhealthy_error_rate(),
                &circuits,
            );

        HealthReport {
            is_healthy,
            response_time_ms,
            error_rate: metrics.recent_error_rate,
            circuit_breaker_state: circuits,
            connection_pool_stats: self.ctx.pool.stats(),
            queue_stats: self.scheduler.stats(),
        }
    }

    pub async fn get_detailed_status(&self) -> DetailedStatus {
        let metrics = self.ctx.metrics.snapshot();
        let circuits = self.ctx.breaker.snapshots();
        let health = HealthReport {
            is_healthy: self.scheduler.is_accepting()
                && HealthReport::evaluate(
                    metrics.recent_error_rate,
                    self.ctx.metrics.unhealthy_error_rate(),
                    &circuits,
                ),
            response_time_ms: (metrics.average_response_time_ms > 0.0)
                .then(|| metrics.average_response_time_ms.round() as u64),
            error_rate: metrics.recent_error_rate,
            circuit_breaker_state: circuits,
            connection_pool_stats: self.ctx.pool.stats(),
            queue_stats: self.scheduler.stats(),
        };
        DetailedStatus {
            accepting: self.scheduler.is_accepting(),
            health,
            metrics,
            rate_limits: self.ctx.limiter.snapshot().await,
        }
    }

    /// Graceful shutdown bounded by `requestQueue.drainTimeout`.
    pub async fn shutdown(&self) {
        self.shutdown_with_timeout(self.config.request_queue.drain_timeout)
            .await
    }

    /// Stop accepting new submissions, drain for up to `drain_timeout`, then
    /// stop background tasks and release every pooled connection.
    pub async fn shutdown_with_timeout(&self, drain_timeout: Duration) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.scheduler.shutdown(drain_timeout).await;

        self.background.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .map(|mut t| t.drain(..).collect())
            .unwrap_or_default();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task ended abnormally");
            }
        }

        self.ctx.pool.close();
        self.ctx.metrics.publish();
        info!("api client shut down");
    }
}

impl Drop for ApiClient {
    fn drop(&mut self) {
        self.background.cancel();
    }
}
