//! Outbound connection pool
//!
//! Connections are keyed by host. Lookups take the read lock; a host seen
//! for the first time is added under the write lock. A background reaper
//! closes connections idle longer than `max_conn_idle`.

use fidias_common::config::TransportConfig;
use fidias_common::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pooled connection
#[derive(Debug)]
pub struct PooledConn {
    pub stream: TcpStream,
    last_used: Instant,
}

#[derive(Debug, Default)]
struct HostConns {
    idle: Mutex<Vec<PooledConn>>,
}

/// Pool of outbound TCP connections
pub struct ConnPool {
    hosts: RwLock<HashMap<String, Arc<HostConns>>>,
    config: TransportConfig,
    closed: AtomicBool,
}

impl ConnPool {
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            hosts: RwLock::new(HashMap::new()),
            config,
            closed: AtomicBool::new(false),
        }
    }

    async fn host(&self, host: &str) -> Arc<HostConns> {
        if let Some(conns) = self.hosts.read().await.get(host) {
            return Arc::clone(conns);
        }
        let mut hosts = self.hosts.write().await;
        Arc::clone(hosts.entry(host.to_string()).or_default())
    }

    /// Take an idle connection to `host` or open a new one
    pub async fn checkout(&self, host: &str) -> Result<PooledConn> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::TransportShutdown);
        }
        let conns = self.host(host).await;
        if let Some(conn) = conns.idle.lock().pop() {
            return Ok(conn);
        }
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(host))
            .await
            .map_err(|_| Error::transport(host, "connect timed out"))?
            .map_err(|e| Error::transport(host, e))?;
        stream.set_nodelay(true).map_err(|e| Error::transport(host, e))?;
        debug!("Opened connection to {}", host);
        Ok(PooledConn {
            stream,
            last_used: Instant::now(),
        })
    }

    /// Return a healthy connection to the pool
    pub async fn checkin(&self, host: &str, mut conn: PooledConn) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        conn.last_used = Instant::now();
        let conns = self.host(host).await;
        let mut idle = conns.idle.lock();
        if idle.len() < self.config.max_idle_per_host {
            idle.push(conn);
        }
    }

    /// Close connections idle longer than the configured age; returns how
    /// many were closed
    pub async fn reap(&self) -> usize {
        let max_idle = Duration::from_millis(self.config.max_conn_idle_ms);
        let hosts = self.hosts.read().await;
        let mut closed = 0;
        for (host, conns) in hosts.iter() {
            let mut idle = conns.idle.lock();
            let before = idle.len();
            idle.retain(|c| c.last_used.elapsed() < max_idle);
            if before != idle.len() {
                debug!("Reaped {} idle connections to {}", before - idle.len(), host);
            }
            closed += before - idle.len();
        }
        closed
    }

    /// Spawn the idle reaper; it stops when `cancel` fires
    pub fn spawn_reaper(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(pool.config.reap_interval_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        pool.reap().await;
                    }
                }
            }
            debug!("Connection reaper stopped");
        })
    }

    /// Close every connection; later checkouts fail with `TransportShutdown`
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut hosts = self.hosts.write().await;
        let count: usize = hosts.values().map(|c| c.idle.lock().len()).sum();
        hosts.clear();
        info!("Connection pool shut down ({} idle connections closed)", count);
    }

    /// Idle connections currently pooled for `host`
    pub async fn idle_count(&self, host: &str) -> usize {
        self.hosts
            .read()
            .await
            .get(host)
            .map_or(0, |c| c.idle.lock().len())
    }
}
