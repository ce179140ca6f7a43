//! Periodic replica sweep
//!
//! At a random interval in `[stabilize_min, stabilize_max]`, once the owned
//! key ranges have been stable for the configured threshold, local keys this
//! node still replicates are queued for a check, up to `rebalance_buffer`
//! keys per sweep. Each sweep resumes after the last key the previous one
//! visited and wraps around the key space.

use crate::fetcher::Fetcher;
use fidias_common::Result;
use fidias_wal::Wal;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct Rebalancer {
    wal: Arc<Wal>,
    fetcher: Arc<Fetcher>,
    cursor: Mutex<Option<Vec<u8>>>,
}

impl Rebalancer {
    #[must_use]
    pub fn new(wal: Arc<Wal>, fetcher: Arc<Fetcher>) -> Self {
        Self {
            wal,
            fetcher,
            cursor: Mutex::new(None),
        }
    }

    fn next_delay(&self) -> Duration {
        let config = self.wal.ring().config();
        let min = config.stabilize_min_ms;
        let max = config.stabilize_max_ms.max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Run one sweep; returns the keys queued for a check
    pub fn sweep(&self) -> Result<Vec<Vec<u8>>> {
        let ring = self.wal.ring();
        if !ring.key_blocks().is_stable(ring.config().stable_threshold()) {
            debug!("Key ranges unstable, sweep skipped");
            return Ok(Vec::new());
        }
        let limit = ring.config().rebalance_buffer.max(1);
        let keys = self.wal.store().keys()?;
        let mut cursor = self.cursor.lock();
        let start = cursor
            .as_ref()
            .map_or(0, |last| keys.partition_point(|k| k <= last));
        let mut queued = Vec::new();
        for key in keys[start..].iter().chain(&keys[..start]) {
            if queued.len() >= limit {
                break;
            }
            if ring.is_replica(key) {
                if !self.fetcher.check(key.clone()) {
                    break;
                }
                queued.push(key.clone());
            }
            *cursor = Some(key.clone());
        }
        if !queued.is_empty() {
            debug!("Sweep queued {} keys", queued.len());
        }
        Ok(queued)
    }

    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let rebalancer = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let delay = rebalancer.next_delay();
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(delay) => {
                        if let Err(e) = rebalancer.sweep() {
                            debug!("Sweep failed: {}", e);
                        }
                    }
                }
            }
            info!("Rebalancer stopped");
        })
    }
}
