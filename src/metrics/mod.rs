//! Metrics & health monitor.
//!
//! A passive observer: components call the `on_*` hooks, the collector only
//! counts. Snapshots are recomputed from the raw counters and published on a
//! fixed interval; a published snapshot is never mutated.

mod health;

pub use health::{DetailedStatus, HealthReport};

use crate::config::MetricsConfig;
use crate::events::{ClientEvent, EventBus};
use arc_swap::ArcSwap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retried_requests: u64,
    pub rate_limited_requests: u64,
    pub rejected_requests: u64,
    pub circuit_open_rejections: u64,
    pub cancelled_requests: u64,
    pub timed_out_requests: u64,
    pub average_response_time_ms: f64,
    pub p50_response_time_ms: u64,
    pub p95_response_time_ms: u64,
    pub p99_response_time_ms: u64,
    pub average_queue_wait_ms: f64,
    /// Completions per second over the throughput window.
    pub throughput_per_sec: f64,
    /// Lifetime `failed / (successful + failed)`.
    pub error_rate: f64,
    /// Error rate over the most recent response-time samples.
    pub recent_error_rate: f64,
    pub uptime_ms: u64,
    pub timestamp_ms: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    rate_limited: AtomicU64,
    rejected: AtomicU64,
    circuit_rejections: AtomicU64,
    cancelled: AtomicU64,
    timed_out: AtomicU64,
    dispatched: AtomicU64,
    queue_wait_ms: AtomicU64,
}

struct Sample {
    duration_ms: u64,
    ok: bool,
}

pub struct MetricsCollector {
    cfg: MetricsConfig,
    counters: Counters,
    samples: Mutex<VecDeque<Sample>>,
    completions: Mutex<VecDeque<Instant>>,
    published: ArcSwap<MetricsSnapshot>,
    started_at: Instant,
}

impl MetricsCollector {
    pub fn new(cfg: MetricsConfig) -> Self {
        Self {
            cfg,
            counters: Counters::default(),
            samples: Mutex::new(VecDeque::new()),
            completions: Mutex::new(VecDeque::new()),
            published: ArcSwap::from_pointee(MetricsSnapshot::default()),
            started_at: Instant::now(),
        }
    }

    pub fn on_enqueue(&self) {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_dispatch_start(&self, queue_wait: Duration) {
        self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        self.counters
            .queue_wait_ms
            .fetch_add(queue_wait.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn on_success(&self, duration: Duration) {
        self.counters.success.fetch_add(1, Ordering::Relaxed);
        self.record_completion(duration, true);
    }

    pub fn on_failure(&self, duration: Duration) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        self.record_completion(duration, false);
    }

    pub fn on_retry(&self) {
        self.counters.retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_rate_limited(&self) {
        self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_queue_full(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_circuit_rejection(&self) {
        self.counters.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_cancelled(&self) {
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_timeout(&self) {
        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
    }

    fn record_completion(&self, duration: Duration, ok: bool) {
        let cap = self.cfg.response_time_samples.max(1);
        if let Ok(mut samples) = self.samples.lock() {
            samples.push_back(Sample {
                duration_ms: duration.as_millis() as u64,
                ok,
            });
            while samples.len() > cap {
                samples.pop_front();
            }
        }
        let now = Instant::now();
        if let Ok(mut completions) = self.completions.lock() {
            completions.push_back(now);
            prune_window(&mut completions, now, self.cfg.throughput_window);
        }
    }

    /// Compute a fresh snapshot from the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.counters;
        let success = c.success.load(Ordering::Relaxed);
        let failed = c.failed.load(Ordering::Relaxed);
        let dispatched = c.dispatched.load(Ordering::Relaxed);

        let (durations, recent_errors) = self
            .samples
            .lock()
            .map(|s| {
                let durations: Vec<u64> = s.iter().map(|x| x.duration_ms).collect();
                let errors = s.iter().filter(|x| !x.ok).count();
                (durations, errors)
            })
            .unwrap_or_default();

        let now = Instant::now();
        let window = self.cfg.throughput_window;
        let in_window = self
            .completions
            .lock()
            .map(|mut q| {
                prune_window(&mut q, now, window);
                q.len()
            })
            .unwrap_or(0);
        let window_secs = window.as_secs_f64().min(self.started_at.elapsed().as_secs_f64());

        let mut sorted = durations.clone();
        sorted.sort_unstable();

        MetricsSnapshot {
            total_requests: c.total.load(Ordering::Relaxed),
            successful_requests: success,
            failed_requests: failed,
            retried_requests: c.retried.load(Ordering::Relaxed),
            rate_limited_requests: c.rate_limited.load(Ordering::Relaxed),
            rejected_requests: c.rejected.load(Ordering::Relaxed),
            circuit_open_rejections: c.circuit_rejections.load(Ordering::Relaxed),
            cancelled_requests: c.cancelled.load(Ordering::Relaxed),
            timed_out_requests: c.timed_out.load(Ordering::Relaxed),
            average_response_time_ms: mean(&durations),
            p50_response_time_ms: percentile(&sorted, 50.0),
            p95_response_time_ms: percentile(&sorted, 95.0),
            p99_response_time_ms: percentile(&sorted, 99.0),
            average_queue_wait_ms: if dispatched == 0 {
                0.0
            } else {
                c.queue_wait_ms.load(Ordering::Relaxed) as f64 / dispatched as f64
            },
            throughput_per_sec: if window_secs > 0.0 {
                in_window as f64 / window_secs
            } else {
                0.0
            },
            error_rate: ratio(failed, success + failed),
            recent_error_rate: ratio(recent_errors as u64, durations.len() as u64),
            uptime_ms: self.started_at.elapsed().as_millis() as u64,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        }
    }

    /// Recompute and publish; readers of [`Self::latest`] see the new snapshot atomically.
    pub fn publish(&self) -> Arc<MetricsSnapshot> {
        let snap = Arc::new(self.snapshot());
        self.published.store(snap.clone());
        snap
    }

    /// Last published snapshot.
    pub fn latest(&self) -> Arc<MetricsSnapshot> {
        self.published.load_full()
    }

    pub fn unhealthy_error_rate(&self) -> f64 {
        self.cfg.unhealthy_error_rate
    }

    /// Publish every `metricsInterval` and raise `metricsUpdated`, until cancelled.
    pub fn spawn_publisher(
        self: &Arc<Self>,
        bus: EventBus,
        token: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if !self.cfg.enable_metrics {
            return None;
        }
        let this = self.clone();
        let period = self.cfg.metrics_interval.max(Duration::from_millis(1));
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let snap = this.publish();
                        bus.emit(ClientEvent::MetricsUpdated((*snap).clone()));
                    }
                }
            }
            debug!("metrics publisher stopped");
        }))
    }
}

fn prune_window(q: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(front) = q.front() {
        if now.saturating_duration_since(*front) > window {
            q.pop_front();
        } else {
            break;
        }
    }
}

fn ratio(n: u64, d: u64) -> f64 {
    if d == 0 {
        0.0
    } else {
        n as f64 / d as f64
    }
}

fn mean(values: &[u64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<u64>() as f64 / values.len() as f64
    }
}

/// Nearest-rank percentile over an ascending slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
