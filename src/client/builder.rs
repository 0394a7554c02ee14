use crate::client::core::ApiClient;
use crate::config::ClientConfig;
use crate::events::{EventBus, EventSink};
use crate::metrics::MetricsCollector;
use crate::pool::ConnectionPool;
use crate::resilience::{CircuitBreaker, RateLimiter, RetryPolicy};
use crate::scheduler::{DispatchContext, Scheduler};
use crate::transport::{Connector, HttpConnector};
use crate::{Error, ErrorContext, Result};
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Builder for [`ApiClient`]: configuration, transport and notification sinks.
pub struct ApiClientBuilder {
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    sinks: Vec<Arc<dyn EventSink>>,
    event_capacity: usize,
    env_overrides: bool,
}

impl ApiClientBuilder {
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            connector: None,
            sinks: Vec::new(),
            event_capacity: 256,
            env_overrides: false,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = base_url.into();
        self
    }

    /// Full `Authorization` header value, e.g. `Bot <token>`.
    pub fn auth_token(mut self, token: impl Into<String>) -> Self {
        self.config.auth_token = Some(token.into());
        self
    }

    /// Replace the reqwest transport (tests, proxies, recording connectors).
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Register an additional notification sink.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Buffer size of the broadcast channel behind `subscribe`.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Apply `API_RELAY_*` environment overrides before validation.
    pub fn with_env_overrides(mut self) -> Self {
        self.env_overrides = true;
        self
    }

    /// Validate the configuration and start the client.
    ///
    /// Must be called from within a Tokio runtime: the dispatch loop, the pool
    /// maintenance task and the metrics publisher are spawned here.
    pub fn build(self) -> Result<ApiClient> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::configuration_with_context(
                "ApiClient must be built inside a Tokio runtime",
                ErrorContext::new().with_source("client_builder"),
            ));
        }

        let config = if self.env_overrides {
            self.config.apply_env_overrides()
        } else {
            self.config
        };
        config.validate()?;

        let connector: Arc<dyn Connector> = match self.connector {
            Some(c) => c,
            None => Arc::new(HttpConnector::new(&config)?),
        };

        let events = EventBus::new(self.event_capacity, self.sinks);
        let metrics = Arc::new(MetricsCollector::new(config.metrics.clone()));
        let ctx = Arc::new(DispatchContext {
            pool: ConnectionPool::new(config.connection_pool.clone(), connector),
            limiter: Arc::new(RateLimiter::new(config.rate_limit.clone())),
            breaker: Arc::new(CircuitBreaker::new(config.circuit_breaker.clone())),
            retry: RetryPolicy::new(config.retry.clone()),
            metrics: metrics.clone(),
            events: events.clone(),
        });

        let scheduler = Scheduler::new(config.request_queue.clone(), ctx.clone());
        scheduler.start();

        let background = CancellationToken::new();
        let mut tasks = vec![ctx.pool.spawn_maintenance(background.clone())];
        if let Some(publisher) = metrics.spawn_publisher(events, background.clone()) {
            tasks.push(publisher);
        }

        info!(
            base_url = %config.base_url,
            max_concurrent = config.request_queue.max_concurrent_requests,
            max_connections = config.connection_pool.max_connections,
            "api client started"
        );

        Ok(ApiClient {
            config: Arc::new(config),
            scheduler,
            ctx,
            background,
            tasks: Mutex::new(tasks),
            shut_down: AtomicBool::new(false),
        })
    }
}

impl Default for ApiClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
