//! Replicated write-ahead log
//!
//! A proposal is sent to the first participant of the key's replica set,
//! which leads the ballot:
//!
//! 1. validate `(previous, height)` against the local index
//! 2. broadcast the vote; every participant validates against its own index
//! 3. with `min_votes` votes, broadcast the commit; participants append
//!    and schedule the apply
//! 4. with `min_votes` commit acknowledgements the ballot is committed
//!
//! Ballots for one key are serialized at the leader by a per-key lock held
//! until the ballot concludes.

use crate::apply::Applier;
use crate::ballot::{Ballot, BallotState};
use crate::fsm::Fsm;
use crate::heal::HealRequest;
use dashmap::{DashMap, DashSet};
use fidias_client::{RpcClient, SharedTransport};
use fidias_common::config::WalConfig;
use fidias_common::{
    BallotResult, Entry, Error, Id, KeyIndex, LamportClock, Participant, ProposeOptions, Result,
    WriteOptions,
};
use fidias_ring::Ring;
use fidias_store::{Appended, SharedLogStore};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug)]
enum Phase {
    Vote,
    Commit,
}

/// Outcome of [`Wal::propose`]
#[derive(Clone, Debug)]
pub struct Proposed {
    /// The entry as finally committed (rebased on retries)
    pub entry: Entry,
    /// Leader's ballot report
    pub ballot: BallotResult,
    /// Attempts made
    pub attempts: u32,
}

fn key_str(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

fn count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

/// Ballot engine, participant handlers and read paths for one node
pub struct Wal {
    pub(crate) ring: Arc<Ring>,
    pub(crate) store: SharedLogStore,
    pub(crate) client: RpcClient,
    ballot_client: RpcClient,
    pub(crate) applier: Arc<Applier>,
    clock: Arc<LamportClock>,
    config: WalConfig,
    locks: DashMap<Vec<u8>, Arc<tokio::sync::Mutex<()>>>,
    heal_tx: mpsc::Sender<HealRequest>,
    pub(crate) heal_rx: Mutex<Option<mpsc::Receiver<HealRequest>>>,
    pub(crate) healing: DashSet<Vec<u8>>,
}

impl Wal {
    pub fn new(
        config: WalConfig,
        ring: Arc<Ring>,
        store: SharedLogStore,
        transport: SharedTransport,
        fsm: Arc<dyn Fsm>,
        clock: Arc<LamportClock>,
    ) -> Self {
        let hasher = Arc::clone(ring.hasher());
        let applier = Arc::new(Applier::new(Arc::clone(&store), fsm, hasher, config.apply_queue));
        let client = RpcClient::new(
            Arc::clone(&transport),
            config.read_timeout(),
            config.write_timeout(),
        );
        let ballot_client =
            RpcClient::new(transport, config.ballot_timeout(), config.ballot_timeout());
        let (heal_tx, heal_rx) = mpsc::channel(config.heal_queue.max(1));
        Self {
            ring,
            store,
            client,
            ballot_client,
            applier,
            clock,
            config,
            locks: DashMap::new(),
            heal_tx,
            heal_rx: Mutex::new(Some(heal_rx)),
            healing: DashSet::new(),
        }
    }

    #[must_use]
    pub const fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    #[must_use]
    pub const fn store(&self) -> &SharedLogStore {
        &self.store
    }

    #[must_use]
    pub const fn client(&self) -> &RpcClient {
        &self.client
    }

    #[must_use]
    pub const fn applier(&self) -> &Arc<Applier> {
        &self.applier
    }

    #[must_use]
    pub const fn clock(&self) -> &Arc<LamportClock> {
        &self.clock
    }

    #[must_use]
    pub const fn config(&self) -> &WalConfig {
        &self.config
    }

    fn local_host(&self) -> &str {
        &self.ring.local().address
    }

    pub(crate) fn key_lock(&self, key: &[u8]) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.locks.entry(key.to_vec()).or_default().value())
    }

    fn release_lock(&self, key: &[u8]) {
        self.locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Index of `key` as seen by `host`
    pub async fn index_at(&self, host: &str, key: &[u8]) -> Result<KeyIndex> {
        if self.ring.is_local(host) {
            self.store.index_or_empty(key)
        } else {
            self.client.get_index(host, key).await
        }
    }

    // Entry construction

    /// Template for the next entry of `key`, built from the first replica
    /// that answers with its index
    pub async fn new_entry(
        &self,
        key: &[u8],
        opts: &WriteOptions,
    ) -> Result<(Entry, ProposeOptions)> {
        let options = self.propose_options(key, opts)?;
        for host in participant_hosts(&options) {
            match self.index_at(&host, key).await {
                Ok(idx) => {
                    let mut entry = Entry::new(key.to_vec(), idx.last, idx.height + 1);
                    entry.ltime = self.clock.increment();
                    return Ok((entry, options));
                }
                Err(e) => debug!("Index of {} from {} unavailable: {}", key_str(key), host, e),
            }
        }
        Err(Error::ReplicaUnavailable(key_str(key)))
    }

    /// Ballot options for `key` over its current replica set
    pub fn propose_options(&self, key: &[u8], opts: &WriteOptions) -> Result<ProposeOptions> {
        let replicas = self.ring.lookup_replicated(key, self.ring.config().replicas)?;
        Ok(ProposeOptions::new(Participant::from_vnodes(&replicas), opts))
    }

    /// Entry forking from a caller-supplied predecessor
    #[must_use]
    pub fn new_entry_from(&self, last: &Entry) -> Entry {
        let mut entry = Entry::new(
            last.key.clone(),
            last.id(self.ring.hasher().as_ref()),
            last.height + 1,
        );
        entry.ltime = self.clock.increment();
        entry
    }

    // Proposer

    /// Submit `entry` to the ballot leader.
    ///
    /// `retries` counts total attempts. Only `PreviousHashMismatch` is
    /// retried: the entry is rebased onto the leader's tail after
    /// `retry_interval`. Every mismatch enqueues a heal for the key.
    pub async fn propose(
        self: &Arc<Self>,
        mut entry: Entry,
        options: ProposeOptions,
        retries: u32,
        retry_interval: Duration,
    ) -> Result<Proposed> {
        let attempts = retries.max(1);
        let leader = options
            .leader()
            .map(|p| p.host.clone())
            .ok_or_else(|| Error::ReplicaUnavailable(key_str(&entry.key)))?;
        let mut attempt = 1;
        loop {
            let outcome = if self.ring.is_local(&leader) {
                self.lead(entry.clone(), options.clone()).await
            } else {
                self.client.propose_entry(&leader, entry.clone(), options.clone()).await
            };
            match outcome {
                Ok(ballot) => {
                    return Ok(Proposed {
                        entry,
                        ballot,
                        attempts: attempt,
                    });
                }
                Err(Error::PreviousHashMismatch(key)) => {
                    if self.ring.is_replica(&entry.key) {
                        self.heal(entry.key.clone(), participant_hosts(&options));
                    }
                    if attempt >= attempts {
                        return Err(Error::PreviousHashMismatch(key));
                    }
                    debug!(
                        "Proposal for {}@{} mismatched (attempt {}/{}), rebasing",
                        key, entry.height, attempt, attempts
                    );
                    tokio::time::sleep(retry_interval).await;
                    let idx = self.index_at(&leader, &entry.key).await?;
                    entry.previous = idx.last;
                    entry.height = idx.height + 1;
                    entry.ltime = self.clock.increment();
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // Leader

    fn check_participant(&self, options: &ProposeOptions) -> Result<()> {
        if options.contains_host(self.local_host()) {
            Ok(())
        } else {
            Err(Error::HostNotInSet(self.local_host().to_string()))
        }
    }

    /// Whether `entry` may be voted for on top of `idx`: it extends the
    /// tail, or it is the tail
    fn admits(idx: &KeyIndex, entry: &Entry, id: &Id) -> bool {
        entry.follows(&idx.last, idx.height) || (entry.height == idx.height && idx.last == *id)
    }

    /// Lead a ballot for `entry`
    pub async fn lead(
        self: &Arc<Self>,
        entry: Entry,
        options: ProposeOptions,
    ) -> Result<BallotResult> {
        self.check_participant(&options)?;
        if options.participants.len() < self.config.min_votes {
            return Err(Error::InsufficientPeers {
                have: options.participants.len(),
                need: self.config.min_votes,
            });
        }
        self.clock.witness(entry.ltime);
        let lock = self.key_lock(&entry.key);
        let guard = lock.lock_owned().await;

        let idx = self.store.index_or_empty(&entry.key)?;
        let id = entry.id(self.ring.hasher().as_ref());
        if !Self::admits(&idx, &entry, &id) {
            if entry.height > idx.height + 1 {
                self.heal(entry.key.clone(), participant_hosts(&options));
            }
            drop(guard);
            self.release_lock(&entry.key);
            return Err(Error::mismatch(&entry.key));
        }

        let height = entry.height;
        let ballot_id = id.clone();
        let wait = options.wait_ballot;
        let wal = Arc::clone(self);
        let task = tokio::spawn(async move {
            let key = entry.key.clone();
            let result = wal.run_ballot(Ballot::new(entry, id), options).await;
            drop(guard);
            wal.release_lock(&key);
            result
        });
        if !wait {
            return Ok(BallotResult {
                id: ballot_id,
                height,
                ..BallotResult::default()
            });
        }
        task.await
            .map_err(|e| Error::internal(format!("ballot task failed: {e}")))?
    }

    async fn send_phase(
        &self,
        host: String,
        phase: Phase,
        entry: &Entry,
        options: &ProposeOptions,
    ) -> (String, Result<()>) {
        let result = match (self.ring.is_local(&host), phase) {
            (true, Phase::Vote) => self.vote(entry, options),
            (true, Phase::Commit) => self.commit(entry, options).await,
            (false, Phase::Vote) => {
                self.ballot_client
                    .ballot_vote(&host, entry.clone(), options.clone())
                    .await
            }
            (false, Phase::Commit) => {
                self.ballot_client
                    .ballot_commit(&host, entry.clone(), options.clone())
                    .await
            }
        };
        (host, result)
    }

    async fn run_ballot(
        &self,
        mut ballot: Ballot,
        options: ProposeOptions,
    ) -> Result<BallotResult> {
        let need = self.config.min_votes;
        let key = key_str(&ballot.entry.key);
        ballot.open_voting();

        let mut mismatched = false;
        let mut timed_out = false;
        let mut replies: FuturesUnordered<_> = options
            .participants
            .iter()
            .map(|p| self.send_phase(p.host.clone(), Phase::Vote, &ballot.entry, &options))
            .collect();
        let deadline = tokio::time::Instant::now() + self.config.ballot_timeout();
        let mut expired = false;
        let mut voters = Vec::new();
        loop {
            let Ok(next) = tokio::time::timeout_at(deadline, replies.next()).await else {
                expired = true;
                break;
            };
            let Some((host, res)) = next else { break };
            match res {
                Ok(()) => voters.push(host),
                Err(e) => {
                    debug!("Vote for {}@{} from {} refused: {}", key, ballot.entry.height, host, e);
                    match e {
                        Error::PreviousHashMismatch(_) => mismatched = true,
                        Error::Timeout | Error::BallotTimeout(_) => timed_out = true,
                        _ => {}
                    }
                }
            }
        }
        drop(replies);
        for host in &voters {
            ballot.vote(host);
        }
        if !ballot.has_quorum(need) {
            ballot.fail();
            let have = ballot.votes();
            warn!(
                "Ballot for {}@{} failed with {}/{} votes after {:?}",
                key,
                ballot.entry.height,
                have,
                need,
                ballot.elapsed()
            );
            return Err(if mismatched {
                Error::PreviousHashMismatch(key)
            } else if expired {
                Error::Timeout
            } else if timed_out {
                Error::BallotTimeout(key)
            } else {
                Error::InsufficientPeers { have, need }
            });
        }

        let mut replies: FuturesUnordered<_> = options
            .participants
            .iter()
            .map(|p| self.send_phase(p.host.clone(), Phase::Commit, &ballot.entry, &options))
            .collect();
        let mut acked = Vec::new();
        loop {
            let Ok(next) = tokio::time::timeout_at(deadline, replies.next()).await else {
                expired = true;
                break;
            };
            let Some((host, res)) = next else { break };
            match res {
                Ok(()) => acked.push(host),
                Err(e) => debug!(
                    "Commit of {}@{} on {} failed: {}",
                    key, ballot.entry.height, host, e
                ),
            }
        }
        drop(replies);
        for host in &acked {
            ballot.ack(host);
        }
        if ballot.conclude(need) != BallotState::Committed {
            if expired {
                warn!(
                    "Ballot for {}@{} ran past {:?} before committing",
                    key,
                    ballot.entry.height,
                    self.config.ballot_timeout()
                );
                return Err(Error::Timeout);
            }
            warn!(
                "Ballot for {}@{} committed on {}/{} participants",
                key,
                ballot.entry.height,
                ballot.commits(),
                need
            );
            return Err(Error::InsufficientPeers {
                have: ballot.commits(),
                need,
            });
        }
        debug!(
            "Ballot for {}@{} ({}) committed in {:?}",
            key,
            ballot.entry.height,
            ballot.id.short(),
            ballot.elapsed()
        );

        let applied = if options.wait_apply {
            let applied = self
                .applier
                .wait_applied(
                    &ballot.entry.key,
                    ballot.entry.height,
                    Duration::from_millis(options.wait_apply_timeout_ms),
                )
                .await?;
            if !applied {
                warn!(
                    "Ballot for {}@{} committed but was not applied in {}ms",
                    key, ballot.entry.height, options.wait_apply_timeout_ms
                );
                return Err(Error::Timeout);
            }
            applied
        } else {
            false
        };
        let votes = count(ballot.votes());
        let commits = count(ballot.commits());
        Ok(BallotResult {
            id: ballot.id,
            height: ballot.entry.height,
            votes,
            commits,
            applied,
        })
    }

    // Participant

    /// Vote for `entry` if it extends the local chain
    pub fn vote(&self, entry: &Entry, options: &ProposeOptions) -> Result<()> {
        self.check_participant(options)?;
        self.clock.witness(entry.ltime);
        let idx = self.store.index_or_empty(&entry.key)?;
        let id = entry.id(self.ring.hasher().as_ref());
        if Self::admits(&idx, entry, &id) {
            return Ok(());
        }
        if entry.height > idx.height + 1 {
            self.heal(entry.key.clone(), participant_hosts(options));
        }
        Err(Error::mismatch(&entry.key))
    }

    /// Append a committed entry and schedule its apply
    pub async fn commit(&self, entry: &Entry, options: &ProposeOptions) -> Result<()> {
        self.check_participant(options)?;
        self.clock.witness(entry.ltime);
        match self.store.append(entry) {
            Ok(Appended::New) => self.applier.schedule(entry.key.clone()).await,
            Ok(Appended::Duplicate) => Ok(()),
            Err(Error::PreviousHashMismatch(key)) => {
                let idx = self.store.index_or_empty(&entry.key)?;
                if entry.height > idx.height + 1 {
                    self.heal(entry.key.clone(), participant_hosts(options));
                }
                Err(Error::PreviousHashMismatch(key))
            }
            Err(e) => Err(e),
        }
    }

    // Reads

    async fn scour<T, F, Fut>(
        &self,
        key: &[u8],
        local: impl Fn() -> Result<T>,
        remote: F,
    ) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut last_err = Error::key_not_found(key);
        for host in self.ring.scour_hosts(key) {
            let res = if self.ring.is_local(&host) {
                local()
            } else {
                remote(host.clone()).await
            };
            match res {
                Ok(v) => return Ok(v),
                Err(e) => {
                    debug!("Read of {} from {} failed: {}", key_str(key), host, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Entry by id from the first replica successor holding it
    pub async fn get_entry(&self, key: &[u8], id: &Id) -> Result<Entry> {
        self.scour(
            key,
            || self.store.get_entry(key, id),
            |host| async move { self.client.get_entry(&host, key, id).await },
        )
        .await
    }

    /// Tail entry from the first replica successor holding the key
    pub async fn last_entry(&self, key: &[u8]) -> Result<Entry> {
        self.scour(
            key,
            || self.store.last_entry(key),
            |host| async move { self.client.last_entry(&host, key).await },
        )
        .await
    }

    // Heal channel

    /// Enqueue a reconciliation of `key` against `hosts` (the key's scour
    /// hosts when empty). Returns false when one is already pending or the
    /// queue is full.
    pub fn heal(&self, key: Vec<u8>, hosts: Vec<String>) -> bool {
        if !self.healing.insert(key.clone()) {
            return false;
        }
        match self.heal_tx.try_send(HealRequest { key, hosts }) {
            Ok(()) => true,
            Err(TrySendError::Full(req) | TrySendError::Closed(req)) => {
                warn!("Heal queue unavailable, dropping heal of {}", key_str(&req.key));
                self.healing.remove(&req.key);
                false
            }
        }
    }

    /// Spawn the apply loop and the heal worker
    pub fn start(
        self: &Arc<Self>,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        match self.applier.replay() {
            Ok(0) => {}
            Ok(n) => info!("Replayed {} keys from the log", n),
            Err(e) => warn!("Log replay failed: {}", e),
        }
        let mut handles = Vec::new();
        handles.extend(self.applier.spawn(cancel.clone()));
        handles.extend(self.spawn_heal_worker(cancel.clone()));
        info!("WAL started on {}", self.local_host());
        handles
    }
}

fn participant_hosts(options: &ProposeOptions) -> Vec<String> {
    options.participants.iter().map(|p| p.host.clone()).collect()
}
