use super::{QueueItem, SchedulerShared};
use crate::events::{ClientEvent, EventBus};
use crate::metrics::MetricsCollector;
use crate::pool::ConnectionPool;
use crate::resilience::{
    CircuitBreaker, CircuitTicket, Outcome, RateLimiter, RetryDecision, RetryPolicy, Transition,
};
use crate::transport::{WireRequest, WireResponse};
use crate::types::{ApiResponse, RequestDescriptor, RouteTemplate};
use crate::{Error, Result};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Everything a worker needs to carry one request through the gates.
pub(crate) struct DispatchContext {
    pub(crate) pool: ConnectionPool,
    pub(crate) limiter: Arc<RateLimiter>,
    pub(crate) breaker: Arc<CircuitBreaker>,
    pub(crate) retry: RetryPolicy,
    pub(crate) metrics: Arc<MetricsCollector>,
    pub(crate) events: EventBus,
}

/// Decrements the in-flight count even when the worker is aborted.
struct InFlight(Arc<SchedulerShared>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.0.idle.notify_waiters();
    }
}

pub(super) async fn run_loop(shared: Arc<SchedulerShared>, token: CancellationToken) {
    let interval = shared.cfg.processing_interval;
    let mut workers = JoinSet::new();
    info!(
        max_concurrent = shared.cfg.max_concurrent_requests,
        max_queue_size = shared.cfg.max_queue_size,
        "dispatch loop started"
    );

    loop {
        shared.expire_overdue(Instant::now());

        while let Ok(permit) = shared.permits.clone().try_acquire_owned() {
            // Counted before the pop so drain checks never see an item in neither place.
            shared.in_flight.fetch_add(1, Ordering::AcqRel);
            let guard = InFlight(shared.clone());
            let Some(item) = shared.pop() else {
                break;
            };
            let ctx = shared.ctx.clone();
            workers.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                run_item(&ctx, item).await;
            });
        }

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            Some(joined) = workers.join_next(), if !workers.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!(error = %e, "dispatch worker panicked");
                    }
                }
            }
            _ = shared.arrivals.notified() => {}
            _ = tokio::time::sleep(interval) => {}
        }
    }

    if !workers.is_empty() {
        debug!(workers = workers.len(), "aborting in-flight workers");
    }
    workers.shutdown().await;
    debug!("dispatch loop stopped");
}

async fn run_item(ctx: &DispatchContext, item: QueueItem) {
    let QueueItem {
        id,
        descriptor,
        responder,
        enqueued_at,
    } = item;
    ctx.metrics.on_dispatch_start(enqueued_at.elapsed());
    let started = Instant::now();
    debug!(id, method = %descriptor.method, route = %descriptor.route, priority = ?descriptor.priority, "dispatch start");

    let deadline = tokio::time::Instant::from_std(descriptor.deadline());
    let result = match tokio::time::timeout_at(deadline, attempts(ctx, &descriptor)).await {
        Ok(result) => result,
        Err(_) => {
            ctx.metrics.on_timeout();
            Err(Error::Timeout {
                timeout_ms: descriptor.timeout.as_millis() as u64,
            })
        }
    };

    match &result {
        Ok(_) => ctx.metrics.on_success(started.elapsed()),
        Err(e) => {
            ctx.metrics.on_failure(started.elapsed());
            debug!(id, route = %descriptor.route, error = %e, "request failed");
        }
    }
    // The caller may have stopped waiting.
    let _ = responder.send(result);
}

async fn attempts(ctx: &DispatchContext, d: &RequestDescriptor) -> Result<ApiResponse> {
    let key = ctx.breaker.key_for(&d.route, &d.host);
    let request_id = uuid::Uuid::new_v4().to_string();
    let mut attempt = 0u32;
    loop {
        let err = match attempt_once(ctx, d, &key, &request_id).await {
            Ok(resp) => {
                return Ok(ApiResponse {
                    status: resp.status,
                    data: resp.body,
                    route: d.route.to_string(),
                    attempts: attempt + 1,
                    duration_ms: d.submitted_at.elapsed().as_millis() as u64,
                })
            }
            Err(e) => e,
        };

        match ctx.retry.decide(&err, attempt) {
            RetryDecision::Fail => {
                if attempt > 0 && ctx.retry.is_retryable(&err) {
                    warn!(route = %d.route, attempts = attempt + 1, error = %err, "retries exhausted");
                }
                return Err(err);
            }
            RetryDecision::Retry { delay } => {
                attempt += 1;
                let delay_ms = delay.as_millis() as u64;
                debug!(route = %d.route, attempt, delay_ms, error = %err, "retrying");
                ctx.metrics.on_retry();
                ctx.events.emit(ClientEvent::RequestRetried {
                    route: d.route.to_string(),
                    attempt,
                    delay_ms,
                });
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// One pass through breaker, rate limiter, pool and transport.
async fn attempt_once(
    ctx: &DispatchContext,
    d: &RequestDescriptor,
    key: &str,
    request_id: &str,
) -> Result<WireResponse> {
    let ticket = match ctx.breaker.allow(key) {
        Ok(ticket) => ticket,
        Err(e) => {
            ctx.metrics.on_circuit_rejection();
            return Err(e);
        }
    };

    let waited = ctx.limiter.acquire(&d.route).await;
    if !waited.is_zero() {
        debug!(route = %d.route, waited_ms = waited.as_millis() as u64, "rate limit wait finished");
    }

    let mut conn = match ctx.pool.acquire(&d.host).await {
        Ok(conn) => conn,
        Err(e) => {
            record(ctx, ticket, Outcome::Failure);
            return Err(e);
        }
    };

    let wire = WireRequest {
        method: d.method,
        url: d.url.clone(),
        body: d.body.clone(),
        headers: d.headers.clone(),
        request_id: request_id.to_string(),
        timeout: d.deadline().saturating_duration_since(Instant::now()),
    };
    let resp = match conn.send(&wire).await {
        Ok(resp) => resp,
        Err(e) => {
            conn.mark_unhealthy();
            drop(conn);
            record(ctx, ticket, Outcome::Failure);
            return Err(Error::Network(e));
        }
    };
    drop(conn);

    let blocked = ctx
        .limiter
        .update(&d.route, &resp.rate_limit, resp.status)
        .await;
    if resp.status == 429 {
        ctx.metrics.on_rate_limited();
        ctx.events.emit(ClientEvent::RateLimited {
            route: d.route.to_string(),
            wait_ms: blocked.map(|w| w.as_millis() as u64).unwrap_or(0),
            global: resp.rate_limit.global,
        });
    }

    let classified = classify(resp, &d.route);
    let outcome = match &classified {
        Ok(_) | Err(Error::Client { .. }) => Outcome::Success,
        Err(Error::RateLimited { .. }) => Outcome::Neutral,
        Err(_) => Outcome::Failure,
    };
    record(ctx, ticket, outcome);
    classified
}

fn record(ctx: &DispatchContext, ticket: CircuitTicket, outcome: Outcome) {
    match ticket.record(outcome) {
        Some(Transition::Opened(snapshot)) => {
            ctx.events.emit(ClientEvent::CircuitBreakerOpen(snapshot))
        }
        Some(Transition::Closed(snapshot)) => {
            ctx.events.emit(ClientEvent::CircuitBreakerClosed(snapshot))
        }
        None => {}
    }
}

/// Map a response status onto the error taxonomy.
pub(crate) fn classify(resp: WireResponse, route: &RouteTemplate) -> Result<WireResponse> {
    let status = resp.status;
    if (200..300).contains(&status) {
        return Ok(resp);
    }
    if status == 429 {
        return Err(Error::RateLimited {
            route: route.to_string(),
            retry_after_ms: resp
                .rate_limit
                .retry_after
                .or(resp.rate_limit.reset_after)
                .map(|d| d.as_millis() as u64),
            global: resp.rate_limit.global,
        });
    }
    let message = error_message(&resp.body, status);
    info!(route = %route, status, message = %message, "request rejected by remote");
    if status >= 500 {
        Err(Error::Server { status, message })
    } else {
        Err(Error::Client { status, message })
    }
}

fn error_message(body: &serde_json::Value, status: u16) -> String {
    body.get("message")
        .and_then(|m| m.as_str())
        .map(str::to_string)
        .or_else(|| body.as_str().map(str::to_string))
        .unwrap_or_else(|| {
            reqwest::StatusCode::from_u16(status)
                .ok()
                .and_then(|s| s.canonical_reason())
                .unwrap_or("unknown error")
                .to_string()
        })
}
