use super::{Connection, Connector, TransportError, WireRequest, WireResponse};
use crate::config::ClientConfig;
use crate::resilience::rate_limiter::RateLimitHeaders;
use crate::types::Method;
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

/// Upper bound on a health-sweep probe exchange.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// reqwest-backed connector.
///
/// Each pooled connection owns its own `reqwest::Client` restricted to a single idle
/// socket, so reuse and eviction in [`crate::pool::ConnectionPool`] map onto real
/// keep-alive connections.
pub struct HttpConnector {
    scheme: String,
    default_headers: HeaderMap,
    user_agent: String,
    connect_timeout: Duration,
    keep_alive: bool,
    keep_alive_timeout: Duration,
}

impl HttpConnector {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        if let Some(token) = &config.auth_token {
            let mut value = HeaderValue::from_str(token).map_err(|_| {
                Error::configuration_with_context(
                    "auth token is not a valid header value",
                    ErrorContext::new()
                        .with_field_path("auth_token")
                        .with_source("http_connector"),
                )
            })?;
            value.set_sensitive(true);
            default_headers.insert(AUTHORIZATION, value);
        }
        let scheme = url::Url::parse(&config.base_url)
            .map(|u| u.scheme().to_string())
            .unwrap_or_else(|_| "https".to_string());
        let pool = &config.connection_pool;
        Ok(Self {
            scheme,
            default_headers,
            user_agent: config.user_agent.clone(),
            connect_timeout: pool.connection_timeout,
            keep_alive: pool.enable_keep_alive,
            keep_alive_timeout: pool.keep_alive_timeout,
        })
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, host: &str) -> std::result::Result<Box<dyn Connection>, TransportError> {
        let mut builder = reqwest::Client::builder()
            .default_headers(self.default_headers.clone())
            .user_agent(self.user_agent.clone())
            .connect_timeout(self.connect_timeout)
            .pool_max_idle_per_host(if self.keep_alive { 1 } else { 0 });
        if self.keep_alive {
            builder = builder
                .pool_idle_timeout(Some(self.keep_alive_timeout))
                .tcp_keepalive(Some(self.keep_alive_timeout));
        }
        let client = builder.build().map_err(|e| TransportError::Connect {
            host: host.to_string(),
            message: e.to_string(),
        })?;
        debug!(host, "opened http connection");
        Ok(Box::new(HttpConnection {
            client,
            probe_url: format!("{}://{}/", self.scheme, host),
            probe_timeout: self.connect_timeout.min(PROBE_TIMEOUT),
            broken: AtomicBool::new(false),
        }))
    }
}

pub struct HttpConnection {
    client: reqwest::Client,
    probe_url: String,
    probe_timeout: Duration,
    broken: AtomicBool,
}

impl HttpConnection {
    fn builder(&self, request: &WireRequest) -> reqwest::RequestBuilder {
        let url = request.url.clone();
        let mut req = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
            Method::Patch => self.client.patch(url),
            Method::Put => self.client.put(url),
            Method::Delete => self.client.delete(url),
        };
        for (k, v) in &request.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }
        req.header("x-request-id", request.request_id.as_str())
            .timeout(request.timeout)
    }
}

#[async_trait]
impl Connection for HttpConnection {
    async fn send(&self, request: &WireRequest) -> std::result::Result<WireResponse, TransportError> {
        let resp = match self.builder(request).send().await {
            Ok(resp) => resp,
            Err(e) => {
                if !e.is_timeout() {
                    self.broken.store(true, Ordering::Relaxed);
                }
                return Err(TransportError::Http(e));
            }
        };

        let status = resp.status().as_u16();
        let mut rate_limit = RateLimitHeaders::from_headers(resp.headers());
        let text = resp.text().await.map_err(|e| {
            self.broken.store(true, Ordering::Relaxed);
            TransportError::Http(e)
        })?;
        let body = if text.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text))
        };
        if status == 429 {
            rate_limit.merge_body(&body);
        }

        Ok(WireResponse {
            status,
            body,
            rate_limit,
        })
    }

    /// `HEAD` the host root over this connection's client; any HTTP status counts as alive.
    async fn probe(&self) -> bool {
        if self.broken.load(Ordering::Relaxed) {
            return false;
        }
        match self
            .client
            .head(self.probe_url.as_str())
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => {
                debug!(url = %self.probe_url, status = resp.status().as_u16(), "probe answered");
                true
            }
            Err(e) => {
                debug!(url = %self.probe_url, error = %e, "probe failed");
                self.broken.store(true, Ordering::Relaxed);
                false
            }
        }
    }

    fn is_reusable(&self) -> bool {
        !self.broken.load(Ordering::Relaxed)
    }
}
