//! Churn-triggered key handover
//!
//! When a vnode arrives between a local vnode and its old predecessor, the
//! keys whose replica hash falls in `(old_pred, new_pred]` now belong to
//! the newcomer. Their `(key, marker, height)` tuples are streamed to it in
//! batches; it records the markers and pulls the logs. The local copy is
//! kept, so reads keep working until the new owner has caught up.

use dashmap::DashMap;
use fidias_client::RpcClient;
use fidias_common::id::between_right_incl;
use fidias_common::{Error, Id, RelocateTuple, Result, Vnode};
use fidias_proto::RelocatePreamble;
use fidias_ring::RingEvent;
use fidias_wal::Wal;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One predecessor change to act on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelocateJob {
    pub local: Vnode,
    pub new_pred: Vnode,
    pub old_pred: Vnode,
}

impl RelocateJob {
    /// Job for a `NewPredecessor` ring event
    #[must_use]
    pub fn from_event(event: &RingEvent) -> Option<Self> {
        match event {
            RingEvent::NewPredecessor {
                local,
                new_pred,
                old_pred,
            } => Some(Self {
                local: local.clone(),
                new_pred: new_pred.clone(),
                old_pred: old_pred.clone(),
            }),
            _ => None,
        }
    }
}

/// Relocation sender
pub struct Relocator {
    wal: Arc<Wal>,
    client: RpcClient,
    batch: usize,
    tx: mpsc::Sender<RelocateJob>,
    rx: Mutex<Option<mpsc::Receiver<RelocateJob>>>,
    streams: DashMap<Id, Arc<tokio::sync::Mutex<()>>>,
}

impl Relocator {
    /// Relocator whose queue capacity and batch size are `buffer`
    #[must_use]
    pub fn new(wal: Arc<Wal>, buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let client = wal.client().clone();
        Self {
            wal,
            client,
            batch: buffer.max(1),
            tx,
            rx: Mutex::new(Some(rx)),
            streams: DashMap::new(),
        }
    }

    /// Queue a job; waits while the queue is full
    pub async fn enqueue(&self, job: RelocateJob) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| Error::internal("relocate queue closed"))
    }

    /// Keys whose replica hash moved to `job.new_pred`
    pub fn select(&self, job: &RelocateJob) -> Result<Vec<RelocateTuple>> {
        let ring = self.wal.ring();
        let store = self.wal.store();
        let mut out = Vec::new();
        for key in store.keys()? {
            let moved = ring
                .replica_hashes(&key)
                .iter()
                .any(|rh| between_right_incl(&job.old_pred.id, &job.new_pred.id, rh));
            if !moved {
                continue;
            }
            let Some(idx) = store.index(&key)? else {
                continue;
            };
            // a key still catching up advertises the marker it was handed
            let marker = if idx.caught_up() {
                idx.last
            } else {
                idx.marker.unwrap_or(idx.last)
            };
            out.push(RelocateTuple {
                key,
                marker,
                height: idx.height,
            });
        }
        Ok(out)
    }

    /// Stream the moved keys of `job` to the new predecessor
    pub async fn relocate(&self, job: &RelocateJob) -> Result<usize> {
        if job.new_pred.host == job.local.host {
            return Ok(0);
        }
        let stream = Arc::clone(self.streams.entry(job.new_pred.id.clone()).or_default().value());
        let _guard = stream.lock().await;

        let tuples = self.select(job)?;
        if tuples.is_empty() {
            return Ok(0);
        }
        let preamble = RelocatePreamble {
            source: job.local.host.clone(),
            target: job.new_pred.id.clone(),
        };
        let total = tuples.len();
        for batch in tuples.chunks(self.batch) {
            self.client
                .relocate(&job.new_pred.host, preamble.clone(), batch.to_vec())
                .await?;
        }
        info!(
            "Relocated {} keys from vnode {} to {} ({})",
            total,
            job.local.id.short(),
            job.new_pred.id.short(),
            job.new_pred.host
        );
        Ok(total)
    }

    /// Spawn the relocate worker; each job runs as its own task
    pub fn spawn(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let mut rx = self.rx.lock().take()?;
        let relocator = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => {
                            let relocator = Arc::clone(&relocator);
                            tokio::spawn(async move {
                                if let Err(e) = relocator.relocate(&job).await {
                                    warn!(
                                        "Relocation to {} failed: {}",
                                        job.new_pred.host, e
                                    );
                                }
                            });
                        }
                        None => break,
                    }
                }
            }
            debug!("Relocate worker stopped");
        }))
    }
}
