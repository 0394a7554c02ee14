//! Connection pooling with per-host and global bounds.
//!
//! This module provides:
//! - `maxConnections` / `maxConnectionsPerHost` enforcement via semaphores
//! - reuse of idle keep-alive connections
//! - eviction of connections idle beyond `maxIdleTime` (or `keepAliveTimeout`)
//! - a periodic health sweep that closes connections failing their probe
//!
//! Waiting for a connection suspends only the calling dispatch task and is bounded by
//! `connectionTimeout`.

mod connection;

pub use connection::PooledConnection;

use crate::config::ConnectionPoolConfig;
use crate::transport::Connector;
use crate::{Error, Result};
use connection::{HostSlot, IdleConnection};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) created: AtomicU64,
    pub(crate) reused: AtomicU64,
    pub(crate) evicted: AtomicU64,
    pub(crate) closed: AtomicU64,
    pub(crate) failed_connects: AtomicU64,
    pub(crate) acquire_timeouts: AtomicU64,
}

pub(crate) struct PoolInner {
    pub(crate) cfg: ConnectionPoolConfig,
    pub(crate) closed: AtomicBool,
    pub(crate) stats: PoolCounters,
    connector: Arc<dyn Connector>,
    global: Arc<Semaphore>,
    hosts: DashMap<String, Arc<HostSlot>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostStats {
    pub host: String,
    pub active: usize,
    pub idle: usize,
    pub healthy: bool,
}

/// Statistics for the connection pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub max_connections: usize,
    pub max_connections_per_host: usize,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub total_created: u64,
    pub total_reused: u64,
    /// Idle connections dropped for age or a failed probe.
    pub total_evicted: u64,
    /// Released connections that were not kept (unhealthy or keep-alive off).
    pub total_closed: u64,
    pub failed_connects: u64,
    pub acquire_timeouts: u64,
    pub hosts: Vec<HostStats>,
}

#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    pub fn new(cfg: ConnectionPoolConfig, connector: Arc<dyn Connector>) -> Self {
        let global = Arc::new(Semaphore::new(cfg.max_connections));
        Self {
            inner: Arc::new(PoolInner {
                cfg,
                closed: AtomicBool::new(false),
                stats: PoolCounters::default(),
                connector,
                global,
                hosts: DashMap::new(),
            }),
        }
    }

    fn slot(&self, host: &str) -> Arc<HostSlot> {
        if let Some(slot) = self.inner.hosts.get(host) {
            return slot.clone();
        }
        self.inner
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(HostSlot::new(host, self.inner.cfg.max_connections_per_host)))
            .clone()
    }

    fn idle_limit(&self) -> Duration {
        let cfg = &self.inner.cfg;
        if cfg.enable_keep_alive {
            cfg.max_idle_time.min(cfg.keep_alive_timeout)
        } else {
            Duration::ZERO
        }
    }

    /// Acquire a connection to `host`, reusing an idle one when possible.
    ///
    /// Fails with [`Error::PoolTimeout`] when no slot frees up within `connectionTimeout`.
    pub async fn acquire(&self, host: &str) -> Result<PooledConnection> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown);
        }
        let slot = self.slot(host);
        let start = Instant::now();
        let timeout = inner.cfg.connection_timeout;

        // Host permit first, so tasks queued behind a saturated host never hold global capacity.
        let permits = tokio::time::timeout(timeout, async {
            let host_permit = slot.permits.clone().acquire_owned().await?;
            let global_permit = inner.global.clone().acquire_owned().await?;
            Ok::<_, tokio::sync::AcquireError>((host_permit, global_permit))
        })
        .await;

        let (host_permit, global_permit) = match permits {
            Ok(Ok(p)) => p,
            Ok(Err(_)) => return Err(Error::ShuttingDown),
            Err(_) => {
                inner.stats.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(host, waited_ms = timeout.as_millis() as u64, "connection acquire timed out");
                return Err(Error::PoolTimeout {
                    host: host.to_string(),
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
        };

        let idle_limit = self.idle_limit();
        let reused = {
            let mut found = None;
            if let Ok(mut idle) = slot.idle.lock() {
                while let Some(c) = idle.pop() {
                    if c.is_expired(idle_limit) {
                        inner.stats.evicted.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    found = Some(c);
                    break;
                }
            }
            found
        };

        slot.active.fetch_add(1, Ordering::AcqRel);
        if let Some(c) = reused {
            inner.stats.reused.fetch_add(1, Ordering::Relaxed);
            debug!(host, use_count = c.use_count, "reusing connection");
            return Ok(PooledConnection {
                conn: Some(c.conn),
                created_at: c.created_at,
                use_count: c.use_count,
                healthy: true,
                slot,
                pool: inner.clone(),
                _host_permit: host_permit,
                _global_permit: global_permit,
            });
        }

        // From here on the guard owns the active count and permits.
        let mut guard = PooledConnection {
            conn: None,
            created_at: Instant::now(),
            use_count: 0,
            healthy: false,
            slot: slot.clone(),
            pool: inner.clone(),
            _host_permit: host_permit,
            _global_permit: global_permit,
        };
        let remaining = timeout.saturating_sub(start.elapsed());
        match tokio::time::timeout(remaining, inner.connector.connect(host)).await {
            Ok(Ok(conn)) => {
                inner.stats.created.fetch_add(1, Ordering::Relaxed);
                slot.healthy.store(true, Ordering::Release);
                guard.conn = Some(conn);
                guard.healthy = true;
                Ok(guard)
            }
            Ok(Err(e)) => {
                inner.stats.failed_connects.fetch_add(1, Ordering::Relaxed);
                slot.healthy.store(false, Ordering::Release);
                warn!(host, error = %e, "connect failed");
                Err(Error::Network(e))
            }
            Err(_) => {
                inner.stats.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                Err(Error::PoolTimeout {
                    host: host.to_string(),
                    waited_ms: start.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Evict expired idle connections and probe the rest.
    pub async fn health_sweep(&self) {
        let idle_limit = self.idle_limit();
        let slots: Vec<Arc<HostSlot>> = self.inner.hosts.iter().map(|e| e.value().clone()).collect();
        for slot in slots {
            let parked: Vec<IdleConnection> = match slot.idle.lock() {
                Ok(mut idle) => std::mem::take(&mut *idle),
                Err(_) => continue,
            };
            let mut keep = Vec::with_capacity(parked.len());
            let mut failed = 0usize;
            for c in parked {
                if c.is_expired(idle_limit) {
                    self.inner.stats.evicted.fetch_add(1, Ordering::Relaxed);
                } else if c.conn.probe().await {
                    keep.push(c);
                } else {
                    failed += 1;
                    self.inner.stats.evicted.fetch_add(1, Ordering::Relaxed);
                }
            }
            if failed > 0 {
                warn!(host = %slot.host, failed, "evicted unhealthy connections");
            }
            slot.healthy.store(failed == 0, Ordering::Release);
            if let Ok(mut idle) = slot.idle.lock() {
                // Releases during the probe may have parked fresh connections meanwhile.
                let room = self.inner.cfg.max_connections_per_host.saturating_sub(idle.len());
                if keep.len() > room {
                    let excess = keep.len() - room;
                    keep = keep.split_off(excess);
                    self.inner.stats.evicted.fetch_add(excess as u64, Ordering::Relaxed);
                    debug!(host = %slot.host, excess, "trimmed idle connections over the per-host limit");
                }
                // Older connections go to the front so the freshest are reused first.
                idle.splice(0..0, keep);
            }
        }
    }

    /// Run [`Self::health_sweep`] every `healthCheckInterval` until cancelled.
    pub fn spawn_maintenance(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        let every = self.inner.cfg.health_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => pool.health_sweep().await,
                }
            }
        })
    }

    /// Refuse new acquisitions and close every idle connection.
    ///
    /// Checked-out connections are closed when their guards drop.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.global.close();
        let mut dropped = 0usize;
        for entry in self.inner.hosts.iter() {
            if let Ok(mut idle) = entry.value().idle.lock() {
                dropped += idle.len();
                idle.clear();
            }
        }
        info!(dropped, "connection pool closed");
    }

    pub fn stats(&self) -> PoolStats {
        let s = &self.inner.stats;
        let hosts: Vec<HostStats> = self
            .inner
            .hosts
            .iter()
            .map(|e| {
                let slot = e.value();
                HostStats {
                    host: slot.host.clone(),
                    active: slot.active.load(Ordering::Acquire),
                    idle: slot.idle_count(),
                    healthy: slot.healthy.load(Ordering::Acquire),
                }
            })
            .collect();
        PoolStats {
            max_connections: self.inner.cfg.max_connections,
            max_connections_per_host: self.inner.cfg.max_connections_per_host,
            active_connections: hosts.iter().map(|h| h.active).sum(),
            idle_connections: hosts.iter().map(|h| h.idle).sum(),
            total_created: s.created.load(Ordering::Relaxed),
            total_reused: s.reused.load(Ordering::Relaxed),
            total_evicted: s.evicted.load(Ordering::Relaxed),
            total_closed: s.closed.load(Ordering::Relaxed),
            failed_connects: s.failed_connects.load(Ordering::Relaxed),
            acquire_timeouts: s.acquire_timeouts.load(Ordering::Relaxed),
            hosts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connection, TransportError, WireRequest, WireResponse};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct TestConn {
        alive: Arc<AtomicBool>,
        probe_delay: Duration,
    }

    #[async_trait]
    impl Connection for TestConn {
        async fn send(&self, _r: &WireRequest) -> std::result::Result<WireResponse, TransportError> {
            Ok(WireResponse::new(200, serde_json::Value::Null))
        }
        async fn probe(&self) -> bool {
            if !self.probe_delay.is_zero() {
                tokio::time::sleep(self.probe_delay).await;
            }
            self.alive.load(Ordering::SeqCst)
        }
    }

    struct TestConnector {
        opened: AtomicUsize,
        alive: Arc<AtomicBool>,
        fail: bool,
        probe_delay: Duration,
    }

    impl TestConnector {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                opened: AtomicUsize::new(0),
                alive: Arc::new(AtomicBool::new(true)),
                fail: false,
                probe_delay: Duration::ZERO,
            })
        }
    }

    #[async_trait]
    impl Connector for TestConnector {
        async fn connect(&self, host: &str) -> std::result::Result<Box<dyn Connection>, TransportError> {
            if self.fail {
                return Err(TransportError::Connect {
                    host: host.to_string(),
                    message: "refused".into(),
                });
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(TestConn {
                alive: self.alive.clone(),
                probe_delay: self.probe_delay,
            }))
        }
    }

    fn cfg(max: usize, per_host: usize) -> ConnectionPoolConfig {
        ConnectionPoolConfig {
            max_connections: max,
            max_connections_per_host: per_host,
            connection_timeout: Duration::from_millis(50),
            ..ConnectionPoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_released_connection_is_reused() {
        let connector = TestConnector::new();
        let pool = ConnectionPool::new(cfg(4, 2), connector.clone());

        let c = pool.acquire("a.example").await.unwrap();
        drop(c);
        let _c = pool.acquire("a.example").await.unwrap();

        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!(stats.total_created, 1);
        assert_eq!(stats.total_reused, 1);
        assert_eq!(stats.active_connections, 1);
    }

    #[tokio::test]
    async fn test_per_host_limit_times_out() {
        let pool = ConnectionPool::new(cfg(4, 1), TestConnector::new());
        let _held = pool.acquire("a.example").await.unwrap();

        let err = pool.acquire("a.example").await.unwrap_err();
        assert!(matches!(err, Error::PoolTimeout { .. }));
        // Other hosts are unaffected.
        assert!(pool.acquire("b.example").await.is_ok());
        assert_eq!(pool.stats().acquire_timeouts, 1);
    }

    #[tokio::test]
    async fn test_global_limit_across_hosts() {
        let pool = ConnectionPool::new(cfg(2, 2), TestConnector::new());
        let _a = pool.acquire("a.example").await.unwrap();
        let _b = pool.acquire("b.example").await.unwrap();
        assert!(matches!(
            pool.acquire("c.example").await,
            Err(Error::PoolTimeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_waiter_gets_released_slot() {
        let pool = ConnectionPool::new(
            ConnectionPoolConfig {
                connection_timeout: Duration::from_millis(500),
                ..cfg(1, 1)
            },
            TestConnector::new(),
        );
        let held = pool.acquire("a.example").await.unwrap();
        let p = pool.clone();
        let waiter = tokio::spawn(async move { p.acquire("a.example").await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unhealthy_connection_is_not_reused() {
        let connector = TestConnector::new();
        let pool = ConnectionPool::new(cfg(4, 2), connector.clone());
        let mut c = pool.acquire("a.example").await.unwrap();
        c.mark_unhealthy();
        drop(c);
        let _c = pool.acquire("a.example").await.unwrap();
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().total_closed, 1);
    }

    #[tokio::test]
    async fn test_keep_alive_disabled_closes_on_release() {
        let connector = TestConnector::new();
        let pool = ConnectionPool::new(
            ConnectionPoolConfig {
                enable_keep_alive: false,
                ..cfg(4, 2)
            },
            connector.clone(),
        );
        drop(pool.acquire("a.example").await.unwrap());
        assert_eq!(pool.stats().idle_connections, 0);
        drop(pool.acquire("a.example").await.unwrap());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_health_sweep_evicts_expired_and_failed() {
        let connector = TestConnector::new();
        let pool = ConnectionPool::new(
            ConnectionPoolConfig {
                max_idle_time: Duration::from_millis(30),
                ..cfg(4, 2)
            },
            connector.clone(),
        );
        drop(pool.acquire("a.example").await.unwrap());
        assert_eq!(pool.stats().idle_connections, 1);

        tokio::time::sleep(Duration::from_millis(40)).await;
        pool.health_sweep().await;
        assert_eq!(pool.stats().idle_connections, 0);
        assert_eq!(pool.stats().total_evicted, 1);

        drop(pool.acquire("a.example").await.unwrap());
        connector.alive.store(false, Ordering::SeqCst);
        pool.health_sweep().await;
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 0);
        assert!(!stats.hosts[0].healthy);
    }

    #[tokio::test]
    async fn test_health_sweep_respects_per_host_limit() {
        let connector = Arc::new(TestConnector {
            opened: AtomicUsize::new(0),
            alive: Arc::new(AtomicBool::new(true)),
            fail: false,
            probe_delay: Duration::from_millis(100),
        });
        let pool = ConnectionPool::new(cfg(8, 2), connector.clone());
        let a = pool.acquire("a.example").await.unwrap();
        let b = pool.acquire("a.example").await.unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.stats().idle_connections, 2);

        let sweeper = pool.clone();
        let sweep = tokio::spawn(async move { sweeper.health_sweep().await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The sweep holds both idle connections, so these open fresh ones.
        let c = pool.acquire("a.example").await.unwrap();
        let d = pool.acquire("a.example").await.unwrap();
        drop(c);
        drop(d);
        sweep.await.unwrap();

        assert_eq!(connector.opened.load(Ordering::SeqCst), 4);
        let stats = pool.stats();
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(stats.total_evicted, 2);
        assert!(stats.hosts[0].healthy);
    }

    #[tokio::test]
    async fn test_connect_failure_releases_slot() {
        let connector = Arc::new(TestConnector {
            opened: AtomicUsize::new(0),
            alive: Arc::new(AtomicBool::new(true)),
            fail: true,
            probe_delay: Duration::ZERO,
        });
        let pool = ConnectionPool::new(cfg(1, 1), connector);
        assert!(matches!(pool.acquire("a.example").await, Err(Error::Network(_))));
        // The failed attempt must not leak its permit.
        assert!(matches!(pool.acquire("a.example").await, Err(Error::Network(_))));
        assert_eq!(pool.stats().active_connections, 0);
        assert_eq!(pool.stats().failed_connects, 2);
    }

    #[tokio::test]
    async fn test_close_rejects_acquire() {
        let pool = ConnectionPool::new(cfg(4, 2), TestConnector::new());
        drop(pool.acquire("a.example").await.unwrap());
        pool.close();
        assert_eq!(pool.stats().idle_connections, 0);
        assert!(matches!(pool.acquire("a.example").await, Err(Error::ShuttingDown)));
    }
}
