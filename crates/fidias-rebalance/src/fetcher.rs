//! Pull-based anti-entropy
//!
//! The fetch worker pulls a key's log from the host that announced it;
//! every fetched key is then handed to the check worker, which reconciles
//! it against the key's current replica set.
//!
//! On shutdown the fetch worker drains its queue first and then signals the
//! check worker, which drains whatever the fetches produced.

use fidias_common::{Error, Id, RelocateTuple, Result};
use fidias_proto::RelocatePreamble;
use fidias_wal::Wal;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Queued keylog pull
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    /// Host to pull from
    pub source: String,
    pub key: Vec<u8>,
    /// Tail id announced by the source; `None` always fetches
    pub marker: Option<Id>,
}

/// Fetch and check workers
pub struct Fetcher {
    wal: Arc<Wal>,
    fetch_tx: mpsc::Sender<FetchRequest>,
    check_tx: mpsc::Sender<Vec<u8>>,
    queues: Mutex<Option<(mpsc::Receiver<FetchRequest>, mpsc::Receiver<Vec<u8>>)>>,
}

impl Fetcher {
    #[must_use]
    pub fn new(wal: Arc<Wal>, queue: usize) -> Self {
        let (fetch_tx, fetch_rx) = mpsc::channel(queue.max(1));
        let (check_tx, check_rx) = mpsc::channel(queue.max(1));
        Self {
            wal,
            fetch_tx,
            check_tx,
            queues: Mutex::new(Some((fetch_rx, check_rx))),
        }
    }

    /// Queue a pull; waits while the queue is full
    pub async fn enqueue(&self, req: FetchRequest) -> Result<()> {
        self.fetch_tx
            .send(req)
            .await
            .map_err(|_| Error::internal("fetch queue closed"))
    }

    /// Queue a reconciliation; returns false when the queue is full
    pub fn check(&self, key: Vec<u8>) -> bool {
        match self.check_tx.try_send(key) {
            Ok(()) => true,
            Err(TrySendError::Full(_) | TrySendError::Closed(_)) => false,
        }
    }

    /// Accept a relocate stream: record each marker and pull the keys that
    /// are behind it from the sender
    pub async fn accept_relocate(
        &self,
        preamble: &RelocatePreamble,
        tuples: Vec<RelocateTuple>,
    ) -> Result<usize> {
        let store = self.wal.store();
        let mut queued = 0;
        for tuple in tuples {
            let idx = store.set_marker(&tuple.key, tuple.marker.clone())?;
            if idx.caught_up() {
                continue;
            }
            self.enqueue(FetchRequest {
                source: preamble.source.clone(),
                key: tuple.key,
                marker: Some(tuple.marker),
            })
            .await?;
            queued += 1;
        }
        debug!(
            "Relocate from {} for vnode {}: {} keys to fetch",
            preamble.source,
            preamble.target.short(),
            queued
        );
        Ok(queued)
    }

    async fn fetch(&self, req: FetchRequest) {
        let key = String::from_utf8_lossy(&req.key).into_owned();
        let caught_up = match (self.wal.store().index_or_empty(&req.key), &req.marker) {
            (Ok(idx), Some(marker)) => idx.last == *marker,
            (Ok(_), None) => false,
            (Err(e), _) => {
                warn!("Fetch of {} skipped: {}", key, e);
                return;
            }
        };
        if !caught_up {
            match self.wal.pull_from(&req.key, &req.source).await {
                Ok(n) => debug!("Fetched {} entries of {} from {}", n, key, req.source),
                Err(e) => debug!("Fetch of {} from {} failed: {}", key, req.source, e),
            }
        }
        if self.check_tx.send(req.key).await.is_err() {
            warn!("Check queue closed, dropping {}", key);
        }
    }

    async fn check_key(&self, key: &[u8]) {
        let hosts = self.wal.ring().scour_hosts(key);
        if let Err(e) = self.wal.reconcile(key, &hosts).await {
            debug!("Check of {} failed: {}", String::from_utf8_lossy(key), e);
        }
    }

    /// Spawn both workers
    pub fn spawn(self: &Arc<Self>, cancel: &CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
        let Some((mut fetch_rx, mut check_rx)) = self.queues.lock().take() else {
            return Vec::new();
        };
        let fetched = CancellationToken::new();

        let fetcher = Arc::clone(self);
        let stop = cancel.clone();
        let done = fetched.clone();
        let fetch = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    req = fetch_rx.recv() => match req {
                        Some(req) => fetcher.fetch(req).await,
                        None => break,
                    }
                }
            }
            fetch_rx.close();
            while let Some(req) = fetch_rx.recv().await {
                fetcher.fetch(req).await;
            }
            done.cancel();
            info!("Fetch worker stopped");
        });

        let fetcher = Arc::clone(self);
        let check = tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = fetched.cancelled() => break,
                    key = check_rx.recv() => match key {
                        Some(key) => fetcher.check_key(&key).await,
                        None => break,
                    }
                }
            }
            check_rx.close();
            while let Some(key) = check_rx.recv().await {
                fetcher.check_key(&key).await;
            }
            info!("Check worker stopped");
        });
        vec![fetch, check]
    }
}
