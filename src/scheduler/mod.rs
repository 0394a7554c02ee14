//! Request scheduler: bounded priority queue, dispatch loop and worker pool.
//!
//! `submit` never blocks. A single dispatch loop wakes on new arrivals, on
//! worker completion, or every `processingInterval`, and starts up to
//! `maxConcurrentRequests` workers in priority-then-FIFO order. Each worker
//! owns one request for its whole lifetime (gates, retries, transport).

mod dispatcher;
mod handle;
mod queue;

pub(crate) use dispatcher::DispatchContext;
pub use handle::ResultHandle;
pub use queue::{Overflow, PriorityQueue};

use crate::config::RequestQueueConfig;
use crate::events::ClientEvent;
use crate::types::{ApiResponse, Priority, RequestDescriptor};
use crate::{Error, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A queued request and the sender that resolves its handle.
pub(crate) struct QueueItem {
    pub(crate) id: u64,
    pub(crate) descriptor: RequestDescriptor,
    pub(crate) responder: oneshot::Sender<Result<ApiResponse>>,
    pub(crate) enqueued_at: Instant,
}

impl QueueItem {
    fn reject(self, err: Error) {
        // The caller may have dropped its handle.
        let _ = self.responder.send(Err(err));
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub queued: usize,
    pub max_queue_size: usize,
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub in_flight: usize,
    pub max_concurrent_requests: usize,
    pub accepting: bool,
}

pub(crate) struct SchedulerShared {
    cfg: RequestQueueConfig,
    queue: Mutex<PriorityQueue<QueueItem>>,
    arrivals: Notify,
    idle: Notify,
    next_id: AtomicU64,
    accepting: AtomicBool,
    in_flight: AtomicUsize,
    permits: Arc<Semaphore>,
    ctx: Arc<DispatchContext>,
}

impl SchedulerShared {
    fn queue(&self) -> MutexGuard<'_, PriorityQueue<QueueItem>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn cancel(&self, id: u64) -> bool {
        let removed = self.queue().remove_first(|item| item.id == id);
        match removed {
            Some(item) => {
                debug!(id, route = %item.descriptor.route, "cancelled queued request");
                self.ctx.metrics.on_cancelled();
                item.reject(Error::Cancelled);
                self.idle.notify_waiters();
                true
            }
            None => false,
        }
    }

    /// Withdraw a still-queued item whose deadline passed.
    pub(crate) fn expire(&self, id: u64) {
        let removed = self.queue().remove_first(|item| item.id == id);
        if let Some(item) = removed {
            self.ctx.metrics.on_timeout();
            let timeout_ms = item.descriptor.timeout.as_millis() as u64;
            item.reject(Error::Timeout { timeout_ms });
            self.idle.notify_waiters();
        }
    }

    fn expire_overdue(&self, now: Instant) {
        let expired = self.queue().drain_where(|item| item.descriptor.deadline() <= now);
        for item in expired {
            debug!(id = item.id, route = %item.descriptor.route, "queued request expired");
            self.ctx.metrics.on_timeout();
            let timeout_ms = item.descriptor.timeout.as_millis() as u64;
            item.reject(Error::Timeout { timeout_ms });
        }
    }

    fn pop(&self) -> Option<QueueItem> {
        self.queue().pop()
    }

    fn is_drained(&self) -> bool {
        self.queue().is_empty() && self.in_flight.load(Ordering::Acquire) == 0
    }
}

/// Owner of the queue and the dispatch loop.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    token: CancellationToken,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(cfg: RequestQueueConfig, ctx: Arc<DispatchContext>) -> Self {
        let permits = Arc::new(Semaphore::new(cfg.max_concurrent_requests.max(1)));
        Self {
            shared: Arc::new(SchedulerShared {
                queue: Mutex::new(PriorityQueue::new(cfg.max_queue_size)),
                cfg,
                arrivals: Notify::new(),
                idle: Notify::new(),
                next_id: AtomicU64::new(1),
                accepting: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
                permits,
                ctx,
            }),
            token: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Start the dispatch loop. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut task = self.task.lock().unwrap_or_else(|p| p.into_inner());
        if task.is_none() {
            *task = Some(tokio::spawn(dispatcher::run_loop(
                self.shared.clone(),
                self.token.clone(),
            )));
        }
    }

    /// Enqueue a request. A rejected request gets a handle that is already resolved.
    pub fn submit(&self, descriptor: RequestDescriptor) -> ResultHandle {
        let shared = &self.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let handle = ResultHandle::new(
            id,
            rx,
            descriptor.deadline(),
            descriptor.timeout,
            Arc::downgrade(shared),
        );

        if !shared.accepting.load(Ordering::Acquire) {
            let _ = tx.send(Err(Error::ShuttingDown));
            return handle;
        }

        shared.ctx.metrics.on_enqueue();
        let priority = descriptor.priority;
        let item = QueueItem {
            id,
            descriptor,
            responder: tx,
            enqueued_at: Instant::now(),
        };

        let (overflow, queued) = {
            let mut q = shared.queue();
            let overflow = q.push(priority, item);
            (overflow, q.len())
        };
        match overflow {
            None => {}
            Some(Overflow::Evicted(evicted)) => {
                warn!(
                    evicted_id = evicted.id,
                    evicted_priority = ?evicted.descriptor.priority,
                    route = %evicted.descriptor.route,
                    "queue full, evicting oldest lowest-priority request"
                );
                self.queue_full(evicted, queued);
            }
            Some(Overflow::Rejected(rejected)) => {
                warn!(priority = ?priority, route = %rejected.descriptor.route, "queue full, rejecting request");
                self.queue_full(rejected, queued);
            }
        }
        shared.arrivals.notify_one();
        handle
    }

    fn queue_full(&self, item: QueueItem, queue_size: usize) {
        let ctx = &self.shared.ctx;
        ctx.metrics.on_queue_full();
        ctx.events.emit(ClientEvent::QueueFull { queue_size });
        item.reject(Error::QueueFull { queue_size });
    }

    pub fn cancel(&self, id: u64) -> bool {
        self.shared.cancel(id)
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> QueueStats {
        let (queued, by) = {
            let q = self.shared.queue();
            (q.len(), q.len_by_priority())
        };
        QueueStats {
            queued,
            max_queue_size: self.shared.cfg.max_queue_size,
            critical: by[Priority::Critical.index()],
            high: by[Priority::High.index()],
            normal: by[Priority::Normal.index()],
            low: by[Priority::Low.index()],
            in_flight: self.shared.in_flight.load(Ordering::Acquire),
            max_concurrent_requests: self.shared.cfg.max_concurrent_requests,
            accepting: self.is_accepting(),
        }
    }

    /// Stop accepting, let queued and in-flight work finish for up to `drain_timeout`,
    /// then resolve whatever is left with [`Error::ShuttingDown`].
    pub async fn shutdown(&self, drain_timeout: Duration) {
        self.shared.accepting.store(false, Ordering::Release);
        info!(drain_timeout_ms = drain_timeout.as_millis() as u64, "scheduler draining");

        let drained = tokio::time::timeout(drain_timeout, async {
            loop {
                let idle = self.shared.idle.notified();
                if self.shared.is_drained() {
                    break;
                }
                idle.await;
            }
        })
        .await
        .is_ok();

        let leftover = self.shared.queue().drain_all();
        if !drained {
            warn!(
                queued = leftover.len(),
                in_flight = self.shared.in_flight.load(Ordering::Acquire),
                "drain timeout elapsed, aborting remaining requests"
            );
        }
        for item in leftover {
            item.reject(Error::ShuttingDown);
        }

        self.token.cancel();
        let task = self.task.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "dispatch loop ended abnormally");
            }
        }
        info!("scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
