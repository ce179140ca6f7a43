//! KV service
//!
//! Writes go through the WAL from the node that received them. Reads fan
//! out to the key's affinity group; the first member to answer wins and is
//! moved to the front of the preference list for later reads.
//!
//! `GetKey` and `ListDir` requests from peers are answered from the local
//! state machine only.

use crate::fsm::KvFsm;
use fidias_client::RpcClient;
use fidias_common::{
    Entry, Error, KvPair, Opcode, ProposeOptions, Result, WriteOptions, WriteStats, normalize,
};
use fidias_proto::{Request, Response};
use fidias_wal::{Proposed, Wal};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Hosts kept in the read preference list
const PREFERRED_HOSTS: usize = 16;

fn stats(proposed: &Proposed, participants: usize, started: Instant) -> WriteStats {
    WriteStats {
        participants: u32::try_from(participants).unwrap_or(u32::MAX),
        attempts: proposed.attempts,
        elapsed_us: u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX),
    }
}

pub struct KvService {
    wal: Arc<Wal>,
    fsm: Arc<KvFsm>,
    client: RpcClient,
    preferred: Mutex<Vec<String>>,
}

impl KvService {
    #[must_use]
    pub fn new(wal: Arc<Wal>, fsm: Arc<KvFsm>) -> Self {
        let client = wal.client().clone();
        Self {
            wal,
            fsm,
            client,
            preferred: Mutex::new(Vec::new()),
        }
    }

    /// Local state machine
    #[must_use]
    pub const fn fsm(&self) -> &Arc<KvFsm> {
        &self.fsm
    }

    /// Read preference list, most recent responder first
    #[must_use]
    pub fn preferred(&self) -> Vec<String> {
        self.preferred.lock().clone()
    }

    fn promote(&self, host: &str) {
        let mut preferred = self.preferred.lock();
        preferred.retain(|h| h != host);
        preferred.insert(0, host.to_string());
        preferred.truncate(PREFERRED_HOSTS);
    }

    /// Affinity group of `key`, preferred responders first
    fn group(&self, key: &str) -> Vec<String> {
        let mut hosts: Vec<String> = self
            .wal
            .ring()
            .lookup_group_nodes(&self.fsm.entry_key(key))
            .into_iter()
            .map(|n| n.address)
            .collect();
        let preferred = self.preferred.lock();
        hosts.sort_by_key(|h| preferred.iter().position(|p| p == h).unwrap_or(usize::MAX));
        hosts
    }

    async fn get_at(&self, host: &str, key: &str) -> Result<KvPair> {
        if self.wal.ring().is_local(host) {
            self.fsm.get(key)
        } else {
            self.client.get_key(host, key).await
        }
    }

    async fn list_at(&self, host: &str, prefix: &str) -> Result<Vec<KvPair>> {
        if self.wal.ring().is_local(host) {
            Ok(self.fsm.list(prefix))
        } else {
            self.client.list_dir(host, prefix).await
        }
    }

    /// Read `key` from its group
    pub async fn get(&self, key: &str) -> Result<KvPair> {
        let key = normalize(key);
        let hosts = self.group(&key);
        let mut pending: FuturesUnordered<_> = hosts
            .iter()
            .map(|host| {
                let key = &key;
                async move { (host, self.get_at(host, key).await) }
            })
            .collect();

        let mut last_err = None;
        while let Some((host, result)) = pending.next().await {
            match result {
                Ok(kv) => {
                    self.promote(host);
                    return Ok(kv);
                }
                Err(e) => {
                    debug!("Get of {} from {} failed: {}", key, host, e);
                    // not-found outranks transport noise in the final error
                    if last_err.as_ref().is_none_or(|prev: &Error| !prev.is_not_found()) {
                        last_err = Some(e);
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| Error::KeyNotFound(key.clone())))
    }

    /// List the direct children of `prefix`, merged across the group
    pub async fn list(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let prefix = normalize(prefix);
        let hosts = self.group(&prefix);
        let replies =
            futures::future::join_all(hosts.iter().map(|h| self.list_at(h, &prefix))).await;

        let mut merged: BTreeMap<String, KvPair> = BTreeMap::new();
        let mut answered = false;
        let mut last_err = None;
        for (host, reply) in hosts.iter().zip(replies) {
            let pairs = match reply {
                Ok(pairs) => pairs,
                Err(e) => {
                    debug!("List of {} from {} failed: {}", prefix, host, e);
                    last_err = Some(e);
                    continue;
                }
            };
            answered = true;
            for kv in pairs {
                match merged.get(&kv.key) {
                    Some(seen) if seen.height >= kv.height => {
                        if seen.height != kv.height {
                            debug!(
                                "List of {}: {} has height {} on {}, keeping {}",
                                prefix, kv.key, kv.height, host, seen.height
                            );
                        }
                    }
                    Some(seen) => {
                        debug!(
                            "List of {}: {} has height {} on {}, replacing {}",
                            prefix, kv.key, kv.height, host, seen.height
                        );
                        merged.insert(kv.key.clone(), kv);
                    }
                    None => {
                        merged.insert(kv.key.clone(), kv);
                    }
                }
            }
        }
        match (answered, last_err) {
            (false, Some(e)) => Err(e),
            _ => Ok(merged.into_values().collect()),
        }
    }

    async fn submit(
        &self,
        mut entry: Entry,
        op: Opcode,
        value: &[u8],
        options: ProposeOptions,
        attempts: u32,
        retry_interval: Duration,
    ) -> Result<(KvPair, WriteStats)> {
        let started = Instant::now();
        let count = options.participants.len();
        entry.set_operation(op, value);
        let proposed = self.wal.propose(entry, options, attempts, retry_interval).await?;
        let name = &proposed.entry.key[self.fsm.namespace().len()..];
        let key = String::from_utf8_lossy(name).into_owned();
        let kv = KvPair {
            key,
            value: value.to_vec(),
            flags: 0,
            modification: proposed.ballot.id.clone(),
            height: proposed.ballot.height,
            ltime: proposed.entry.ltime,
            mod_time: proposed.entry.timestamp,
        };
        Ok((kv, stats(&proposed, count, started)))
    }

    async fn write(
        &self,
        key: &str,
        op: Opcode,
        value: &[u8],
        opts: &WriteOptions,
    ) -> Result<(KvPair, WriteStats)> {
        let key = normalize(key);
        if key.is_empty() {
            return Err(Error::invalid_argument("empty key"));
        }
        let (entry, options) = self.wal.new_entry(&self.fsm.entry_key(&key), opts).await?;
        let interval = Duration::from_millis(opts.retry_interval_ms);
        self.submit(entry, op, value, options, opts.retries, interval).await
    }

    /// Compare-and-swap write: `modification` must be the key's current
    /// entry id, or zero for a key that must not exist yet
    async fn cas_write(
        &self,
        kv: &KvPair,
        op: Opcode,
        value: &[u8],
        opts: &WriteOptions,
    ) -> Result<(KvPair, WriteStats)> {
        let key = normalize(&kv.key);
        if key.is_empty() {
            return Err(Error::invalid_argument("empty key"));
        }
        let entry_key = self.fsm.entry_key(&key);
        let (entry, options) = if kv.modification.is_zero() || kv.modification.is_empty() {
            let (entry, options) = self.wal.new_entry(&entry_key, opts).await?;
            if entry.height != 1 {
                return Err(Error::mismatch(&entry_key));
            }
            (entry, options)
        } else {
            let last = self.wal.get_entry(&entry_key, &kv.modification).await?;
            let options = self.wal.propose_options(&entry_key, opts)?;
            (self.wal.new_entry_from(&last), options)
        };
        // a CAS fails fast on divergence
        self.submit(entry, op, value, options, 1, Duration::ZERO).await
    }

    pub async fn set(
        &self,
        key: &str,
        value: &[u8],
        opts: &WriteOptions,
    ) -> Result<(KvPair, WriteStats)> {
        self.write(key, Opcode::KvSet, value, opts).await
    }

    pub async fn cas_set(&self, kv: &KvPair, opts: &WriteOptions) -> Result<(KvPair, WriteStats)> {
        self.cas_write(kv, Opcode::KvSet, &kv.value, opts).await
    }

    pub async fn remove(&self, key: &str, opts: &WriteOptions) -> Result<(KvPair, WriteStats)> {
        self.write(key, Opcode::KvDel, &[], opts).await
    }

    pub async fn cas_remove(
        &self,
        kv: &KvPair,
        opts: &WriteOptions,
    ) -> Result<(KvPair, WriteStats)> {
        self.cas_write(kv, Opcode::KvDel, &[], opts).await
    }

    /// Serve a KV request
    pub async fn handle(&self, request: Request) -> Result<Response> {
        let write =
            |r: Result<(KvPair, WriteStats)>| r.map(|(kv, stats)| Response::KvWrite { kv, stats });
        match request {
            Request::GetKey { key } => Ok(Response::Kv(self.fsm.get(&key)?)),
            Request::ListDir { prefix } => Ok(Response::KvList(self.fsm.list(&prefix))),
            Request::SetKv { kv, options } => write(self.set(&kv.key, &kv.value, &options).await),
            Request::CaSetKv { kv, options } => write(self.cas_set(&kv, &options).await),
            Request::RemoveKv { key, options } => write(self.remove(&key, &options).await),
            Request::CaRemoveKv { kv, options } => write(self.cas_remove(&kv, &options).await),
            other => {
                warn!("KV service got {}", other.method());
                Err(Error::invalid_argument(format!("{} is not a KV request", other.method())))
            }
        }
    }
}
