//! Block device
//!
//! Places each block on the replicas of its id. A write succeeds once
//! `ceil(n / 2)` of the `n` replica hosts hold the block. Reads try hinted
//! holders before the replica set and reject blocks that do not hash to
//! the requested id.

use crate::store::SharedBlockStore;
use fidias_client::RpcClient;
use fidias_common::{Block, Error, Id, Result};
use fidias_proto::{Request, Response};
use fidias_ring::Ring;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct BlockDevice {
    ring: Arc<Ring>,
    store: SharedBlockStore,
    client: RpcClient,
    replicas: usize,
}

impl BlockDevice {
    #[must_use]
    pub fn new(
        ring: Arc<Ring>,
        store: SharedBlockStore,
        client: RpcClient,
        replicas: usize,
    ) -> Self {
        Self {
            ring,
            store,
            client,
            replicas: replicas.max(1),
        }
    }

    /// Blocks held by this node
    #[must_use]
    pub const fn store(&self) -> &SharedBlockStore {
        &self.store
    }

    fn local(&self) -> &str {
        &self.ring.local().address
    }

    /// Distinct replica hosts of `id`
    pub fn replica_hosts(&self, id: &Id) -> Result<Vec<String>> {
        let mut hosts: Vec<String> = Vec::new();
        for vn in self.ring.lookup_replicated_hash(id, self.replicas)? {
            if !hosts.contains(&vn.host) {
                hosts.push(vn.host);
            }
        }
        Ok(hosts)
    }

    /// Store a block on this node. Already held content is a success.
    pub fn store_local(&self, block: &Block) -> Result<Id> {
        let id = block.id(self.ring.hasher().as_ref());
        match self.store.put(&id, block) {
            Ok(()) | Err(Error::BlockExists(_)) => {}
            Err(e) => return Err(e),
        }
        self.ring.locator().publish(id.clone(), self.local());
        Ok(id)
    }

    async fn set_at(&self, host: &str, block: &Block) -> Result<()> {
        if self.ring.is_local(host) {
            self.store_local(block).map(|_| ())
        } else {
            self.client.set_block(host, block.clone()).await
        }
    }

    /// Write a block to its replicas
    pub async fn set_block(&self, block: &Block) -> Result<Id> {
        let id = block.id(self.ring.hasher().as_ref());
        let hosts = self.replica_hosts(&id)?;
        let need = hosts.len().div_ceil(2).max(1);

        let results = join_all(hosts.iter().map(|h| self.set_at(h, block))).await;
        let mut acked = 0;
        let mut last_err = None;
        for (host, result) in hosts.iter().zip(results) {
            match result {
                Ok(()) => {
                    acked += 1;
                    self.ring.locator().publish(id.clone(), host);
                }
                Err(e) => {
                    warn!("SetBlock {} on {} failed: {}", id.short(), host, e);
                    last_err = Some(e);
                }
            }
        }
        if acked >= need {
            debug!("Block {} stored on {}/{} replicas", id.short(), acked, hosts.len());
            return Ok(id);
        }
        match last_err {
            Some(e) if acked == 0 => Err(e),
            _ => Err(Error::InsufficientPeers {
                have: acked,
                need,
            }),
        }
    }

    async fn get_at(&self, host: &str, id: &Id) -> Result<Block> {
        if self.ring.is_local(host) {
            self.store.get(id)
        } else {
            self.client.get_block(host, id).await
        }
    }

    /// Read a verified block
    pub async fn get_block(&self, id: &Id) -> Result<Block> {
        let mut hosts = self.ring.locator().hints(id);
        hosts.reverse();
        for host in self.replica_hosts(id)? {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        // the local store is free to ask
        if let Some(pos) = hosts.iter().position(|h| self.ring.is_local(h)) {
            let local = hosts.remove(pos);
            hosts.insert(0, local);
        }

        let hasher = self.ring.hasher();
        let mut last_err = None;
        for host in &hosts {
            match self.get_at(host, id).await {
                Ok(block) if block.verify(hasher.as_ref(), id) => return Ok(block),
                Ok(_) => {
                    warn!("Block {} from {} failed verification", id.short(), host);
                    last_err = Some(Error::BlockNotFound(id.to_hex()));
                }
                Err(e) => {
                    debug!("GetBlock {} from {} failed: {}", id.short(), host, e);
                    if last_err.as_ref().is_none_or(|prev: &Error| !prev.is_not_found()) {
                        last_err = Some(e);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::BlockNotFound(id.to_hex())))
    }

    async fn remove_at(&self, host: &str, id: &Id) -> Result<()> {
        if self.ring.is_local(host) {
            self.store.remove(id)
        } else {
            self.client.remove_block(host, id).await
        }
    }

    /// Remove a block from every replica and hinted holder; returns the
    /// number of hosts that dropped it. Failures are logged, not fatal.
    pub async fn remove_block(&self, id: &Id) -> Result<usize> {
        let mut hosts = self.replica_hosts(id)?;
        for host in self.ring.locator().hints(id) {
            if !hosts.contains(&host) {
                hosts.push(host);
            }
        }
        let results = join_all(hosts.iter().map(|h| self.remove_at(h, id))).await;
        self.ring.locator().remove(id);

        let mut removed = 0;
        for (host, result) in hosts.iter().zip(results) {
            match result {
                Ok(()) => removed += 1,
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!("RemoveBlock {} on {} failed: {}", id.short(), host, e),
            }
        }
        Ok(removed)
    }

    /// Record a holder hint published by a peer
    pub fn publish(&self, id: Id, holder: &str) {
        self.ring.locator().publish(id, holder);
    }

    /// Serve a peer's block request against the local store
    pub fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::SetBlock { block } => self.store_local(&block).map(|_| Response::Ok),
            Request::GetBlock { id } => self.store.get(&id).map(Response::Block),
            Request::RemoveBlock { id } => {
                self.store.remove(&id)?;
                self.ring.locator().remove(&id);
                Ok(Response::Ok)
            }
            Request::PublishBlock { id, host } => {
                self.publish(id, &host);
                Ok(Response::Ok)
            }
            other => Err(Error::invalid_argument(format!(
                "{} is not a block request",
                other.method()
            ))),
        }
    }
}
