//! Pooled connection wrapper and per-host slot.

use super::PoolInner;
use crate::transport::{Connection, TransportError, WireRequest, WireResponse};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// A connection parked in the pool.
pub(crate) struct IdleConnection {
    pub(crate) conn: Box<dyn Connection>,
    pub(crate) last_used: Instant,
    pub(crate) created_at: Instant,
    pub(crate) use_count: u64,
}

impl IdleConnection {
    pub(crate) fn is_expired(&self, max_idle: Duration) -> bool {
        self.last_used.elapsed() >= max_idle
    }
}

/// Per-host record: permits bound `active`, `idle` holds reusable connections.
pub(crate) struct HostSlot {
    pub(crate) host: String,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) idle: Mutex<Vec<IdleConnection>>,
    pub(crate) active: AtomicUsize,
    pub(crate) healthy: AtomicBool,
}

impl HostSlot {
    pub(crate) fn new(host: &str, max_per_host: usize) -> Self {
        Self {
            host: host.to_string(),
            permits: Arc::new(Semaphore::new(max_per_host)),
            idle: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    pub(crate) fn idle_count(&self) -> usize {
        self.idle.lock().map(|v| v.len()).unwrap_or(0)
    }
}

/// A checked-out connection. Returned to the pool on drop.
///
/// Connections marked unhealthy (or any connection when keep-alive is disabled)
/// are closed instead of being parked for reuse.
pub struct PooledConnection {
    pub(crate) conn: Option<Box<dyn Connection>>,
    pub(crate) created_at: Instant,
    pub(crate) use_count: u64,
    pub(crate) healthy: bool,
    pub(crate) slot: Arc<HostSlot>,
    pub(crate) pool: Arc<PoolInner>,
    pub(crate) _host_permit: OwnedSemaphorePermit,
    pub(crate) _global_permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("host", &self.slot.host)
            .field("created_at", &self.created_at)
            .field("use_count", &self.use_count)
            .field("healthy", &self.healthy)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub async fn send(&mut self, request: &WireRequest) -> Result<WireResponse, TransportError> {
        let conn = self
            .conn
            .as_ref()
            .ok_or_else(|| TransportError::Other("connection already released".into()))?;
        self.use_count += 1;
        conn.send(request).await
    }

    /// Close this connection on release instead of reusing it.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub fn host(&self) -> &str {
        &self.slot.host
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.slot.active.fetch_sub(1, Ordering::AcqRel);
        let Some(conn) = self.conn.take() else {
            return;
        };
        let reusable = self.healthy
            && conn.is_reusable()
            && self.pool.cfg.enable_keep_alive
            && !self.pool.closed.load(Ordering::Acquire);
        if !reusable {
            self.pool.stats.closed.fetch_add(1, Ordering::Relaxed);
            debug!(host = %self.slot.host, healthy = self.healthy, "closing released connection");
            return;
        }
        if let Ok(mut idle) = self.slot.idle.lock() {
            idle.push(IdleConnection {
                conn,
                last_used: Instant::now(),
                created_at: self.created_at,
                use_count: self.use_count,
            });
        }
    }
}
