//! FSM apply loop
//!
//! Commits push the key onto a bounded queue; a single consumer walks the
//! key's chain from the last applied height to the tail and feeds each
//! entry to the state machine. The applied height per key is what makes
//! applies exactly-once: duplicate commits find nothing left to apply.

use crate::fsm::Fsm;
use dashmap::DashMap;
use fidias_common::{Error, Result, SharedHasher, WireError};
use fidias_store::SharedLogStore;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Debug, Default)]
struct Applied {
    height: u64,
    failed: Option<(u64, WireError)>,
}

/// Per-replica apply loop
pub struct Applier {
    store: SharedLogStore,
    fsm: Arc<dyn Fsm>,
    hasher: SharedHasher,
    applied: DashMap<Vec<u8>, Applied>,
    notify: Notify,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
}

impl Applier {
    #[must_use]
    pub fn new(
        store: SharedLogStore,
        fsm: Arc<dyn Fsm>,
        hasher: SharedHasher,
        queue: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue.max(1));
        Self {
            store,
            fsm,
            hasher,
            applied: DashMap::new(),
            notify: Notify::new(),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    /// Queue `key` for apply
    pub async fn schedule(&self, key: Vec<u8>) -> Result<()> {
        self.tx
            .send(key)
            .await
            .map_err(|_| Error::internal("apply queue closed"))
    }

    /// Highest applied height of `key`
    #[must_use]
    pub fn applied_height(&self, key: &[u8]) -> u64 {
        self.applied.get(key).map_or(0, |a| a.height)
    }

    /// Forget applies above `height` so a rebased tail is applied again
    pub fn rewind(&self, key: &[u8], height: u64) {
        if let Some(mut a) = self.applied.get_mut(key) {
            if a.height > height {
                debug!(
                    "Rewinding apply of {} from {} to {}",
                    String::from_utf8_lossy(key),
                    a.height,
                    height
                );
                a.height = height;
            }
        }
    }

    /// Apply every committed entry of `key` above the applied height;
    /// returns the new applied height
    fn catch_up(&self, key: &[u8]) -> Result<u64> {
        let tail = self.store.index_or_empty(key)?.height;
        let mut height = self.applied_height(key);
        while height < tail {
            let next = height + 1;
            let Some(entry) = self.store.entry_at(key, next)? else {
                break;
            };
            let id = entry.id(self.hasher.as_ref());
            let outcome = self.fsm.apply(&entry, &id);
            let mut state = self.applied.entry(key.to_vec()).or_default();
            state.height = next;
            match outcome {
                Ok(()) => state.failed = None,
                Err(e) => {
                    warn!(
                        "Apply of {}@{} ({}) refused: {}",
                        String::from_utf8_lossy(key),
                        next,
                        id.short(),
                        e
                    );
                    state.failed = Some((next, e.to_wire()));
                }
            }
            height = next;
        }
        Ok(height)
    }

    /// Apply every key already in the store; run before the node serves so
    /// a restarted replica rebuilds its state from the log. Returns the
    /// number of keys replayed.
    pub fn replay(&self) -> Result<usize> {
        let keys = self.store.keys()?;
        for key in &keys {
            if let Err(e) = self.catch_up(key) {
                warn!("Replay of {} failed: {}", String::from_utf8_lossy(key), e);
            }
        }
        self.notify.notify_waiters();
        Ok(keys.len())
    }

    /// Wait until `key` is applied at or beyond `height`.
    ///
    /// Returns `Ok(false)` when `timeout` expires first and the FSM's error
    /// when the entry at `height` was refused.
    pub async fn wait_applied(&self, key: &[u8], height: u64, timeout: Duration) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if let Some(state) = self.applied.get(key) {
                if state.height >= height {
                    return match &state.failed {
                        Some((h, wire)) if *h == height => Err(Error::from_wire(wire.clone())),
                        _ => Ok(true),
                    };
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(false);
            }
        }
    }

    fn run_one(&self, key: &[u8]) {
        if let Err(e) = self.catch_up(key) {
            warn!("Apply of {} failed: {}", String::from_utf8_lossy(key), e);
        }
        self.notify.notify_waiters();
    }

    /// Spawn the apply loop; on cancellation it drains what is queued and exits
    pub fn spawn(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let mut rx = self.rx.lock().take()?;
        let applier = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    key = rx.recv() => match key {
                        Some(key) => applier.run_one(&key),
                        None => break,
                    }
                }
            }
            rx.close();
            while let Some(key) = rx.recv().await {
                applier.run_one(&key);
            }
            info!("Apply loop stopped");
        }))
    }
}
