//! Per-key reconciliation
//!
//! Every repair path ends here. Mismatches and commit gaps enqueue a
//! [`HealRequest`]; relocation fetches pull from the previous owner and then
//! ask for a heal as well. Reconciliation adopts the longest valid chain
//! among the key's replicas; equal heights are decided by the greater tail
//! id.

use crate::wal::Wal;
use fidias_common::{Error, Id, KeyIndex, Result};
use futures::future::join_all;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Entries requested per fetch
pub const FETCH_PAGE: u32 = 256;

/// Queued reconciliation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealRequest {
    pub key: Vec<u8>,
    /// Hosts to compare against; empty means the key's scour hosts
    pub hosts: Vec<String>,
}

/// What a reconciliation changed locally
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reconciled {
    /// Local chain already the best
    Unchanged,
    /// Entries appended on top of the local tail
    Extended(usize),
    /// Local chain replaced from `from` onward
    Rebased { from: u64, entries: usize },
}

fn wins(remote: &KeyIndex, local: &KeyIndex) -> bool {
    (remote.height, &remote.last) > (local.height, &local.last)
}

impl Wal {
    /// Reconcile `key` against `hosts` (scour hosts when empty)
    pub async fn reconcile(&self, key: &[u8], hosts: &[String]) -> Result<Reconciled> {
        let hosts: Vec<String> = if hosts.is_empty() {
            self.ring.scour_hosts(key)
        } else {
            hosts.to_vec()
        };
        let probes = hosts
            .iter()
            .filter(|h| !self.ring.is_local(h))
            .map(|h| async move { (h, self.client.get_index(h, key).await) });
        let mut best: Option<(&String, KeyIndex)> = None;
        for (host, res) in join_all(probes).await {
            match res {
                Ok(idx) if idx.height > 0 => {
                    if best.as_ref().is_none_or(|(_, b)| wins(&idx, b)) {
                        best = Some((host, idx));
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(
                    "Heal probe of {} on {} failed: {}",
                    String::from_utf8_lossy(key),
                    host,
                    e
                ),
            }
        }
        let Some((host, remote)) = best else {
            return Ok(Reconciled::Unchanged);
        };

        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let local = self.store.index_or_empty(key)?;
        if !wins(&remote, &local) {
            return Ok(Reconciled::Unchanged);
        }
        let outcome = self.adopt(key, host, &local, remote.height).await?;
        self.applier.schedule(key.to_vec()).await?;
        info!(
            "Healed {} from {}: {:?} (height {} -> {})",
            String::from_utf8_lossy(key),
            host,
            outcome,
            local.height,
            self.store.index_or_empty(key)?.height
        );
        Ok(outcome)
    }

    async fn adopt(
        &self,
        key: &[u8],
        host: &str,
        local: &KeyIndex,
        target: u64,
    ) -> Result<Reconciled> {
        match self.follow_remote(key, host, local.last.clone(), target).await {
            Ok(n) if n > 0 => return Ok(Reconciled::Extended(n)),
            Ok(_) => {}
            Err(e) if matches!(e, Error::PreviousHashMismatch(_)) || e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        // Diverged: walk back to the newest common ancestor
        let hasher = self.ring.hasher();
        let mut height = local.height.min(target);
        while height > 0 {
            height -= 1;
            let base = if height == 0 {
                hasher.zero()
            } else {
                match self.store.entry_at(key, height)? {
                    Some(e) => e.id(hasher.as_ref()),
                    None => continue,
                }
            };
            let page = match self.client.fetch_keylog(host, key, &base, FETCH_PAGE).await {
                Ok(page) => page,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let Some(first) = page.first() else {
                continue;
            };
            if !first.follows(&base, height) {
                continue;
            }
            self.store.rebase(key, &page)?;
            self.applier.rewind(key, height);
            let tail = page.last().map_or(base, |e| e.id(hasher.as_ref()));
            let more = self.follow_remote(key, host, tail, target).await?;
            return Ok(Reconciled::Rebased {
                from: height + 1,
                entries: page.len() + more,
            });
        }
        Err(Error::mismatch(key))
    }

    /// Append `host`'s entries after `after` until the local height reaches
    /// `target` or the host has nothing more; returns the count appended
    async fn follow_remote(
        &self,
        key: &[u8],
        host: &str,
        mut after: Id,
        target: u64,
    ) -> Result<usize> {
        let hasher = self.ring.hasher();
        let mut appended = 0;
        loop {
            if self.store.index_or_empty(key)?.height >= target {
                break;
            }
            let page = self.client.fetch_keylog(host, key, &after, FETCH_PAGE).await?;
            let Some(last) = page.last() else {
                break;
            };
            for entry in &page {
                self.store.append(entry)?;
            }
            appended += page.len();
            after = last.id(hasher.as_ref());
        }
        Ok(appended)
    }

    /// Pull `key`'s entries after the local tail from `host`; used by the
    /// relocation fetcher
    pub async fn pull_from(&self, key: &[u8], host: &str) -> Result<usize> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let local = self.store.index_or_empty(key)?;
        let n = self.follow_remote(key, host, local.last, u64::MAX).await?;
        if n > 0 {
            self.applier.schedule(key.to_vec()).await?;
        }
        Ok(n)
    }

    pub(crate) fn spawn_heal_worker(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        let mut rx = self.heal_rx.lock().take()?;
        let wal = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                let req = tokio::select! {
                    () = cancel.cancelled() => break,
                    req = rx.recv() => match req {
                        Some(req) => req,
                        None => break,
                    }
                };
                wal.run_heal(req).await;
            }
            rx.close();
            while let Some(req) = rx.recv().await {
                wal.run_heal(req).await;
            }
            info!("Heal worker stopped");
        }))
    }

    async fn run_heal(&self, req: HealRequest) {
        self.healing.remove(&req.key);
        if let Err(e) = self.reconcile(&req.key, &req.hosts).await {
            warn!("Heal of {} failed: {}", String::from_utf8_lossy(&req.key), e);
        }
    }
}
