//! Multi-replica behaviour over the in-process network

use crate::{Fsm, Reconciled, Wal};
use async_trait::async_trait;
use fidias_client::{LocalNetwork, RpcHandler, SharedTransport};
use fidias_common::config::{RingConfig, WalConfig};
use fidias_common::{
    Entry, Error, HashAlgorithm, Id, LamportClock, Node, NodeMeta, Opcode, Participant,
    ProposeOptions, Result, SharedHasher, WriteOptions,
};
use fidias_proto::{Request, Response};
use fidias_ring::Ring;
use fidias_store::{LogStore, MemLogStore};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Values(Mutex<HashMap<Vec<u8>, Vec<u8>>>);

impl Fsm for Values {
    fn apply(&self, entry: &Entry, _id: &Id) -> Result<()> {
        self.0.lock().insert(entry.key.clone(), entry.payload().to_vec());
        Ok(())
    }
}

impl Values {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.0.lock().get(key).cloned()
    }
}

struct LogHandler(Arc<Wal>);

#[async_trait]
impl RpcHandler for LogHandler {
    async fn handle(&self, request: Request) -> Response {
        self.0.handle_log(request).await.into()
    }
}

struct Replica {
    wal: Arc<Wal>,
    store: Arc<MemLogStore>,
    values: Arc<Values>,
    _handler: Arc<dyn RpcHandler>,
}

struct Cluster {
    net: Arc<LocalNetwork>,
    replicas: Vec<Replica>,
    cancel: CancellationToken,
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn hasher() -> SharedHasher {
    HashAlgorithm::Sha256.shared()
}

/// Delays ballot phases before handing them to the wrapped replica
struct SlowBallots {
    inner: Arc<dyn RpcHandler>,
    delay: Duration,
}

#[async_trait]
impl RpcHandler for SlowBallots {
    async fn handle(&self, request: Request) -> Response {
        if matches!(request, Request::BallotVote { .. } | Request::BallotCommit { .. }) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.handle(request).await
    }
}

fn cluster(n: usize) -> Cluster {
    cluster_with(n, WalConfig::default(), true)
}

fn cluster_with(n: usize, config: WalConfig, start: bool) -> Cluster {
    let hasher = hasher();
    let net = LocalNetwork::new();
    let cancel = CancellationToken::new();
    let nodes: Vec<Node> = (1..=n)
        .map(|i| {
            let addr = format!("n{i}:7100");
            Node::new(hasher.as_ref(), format!("n{i}"), addr.clone(), NodeMeta::single(&addr))
        })
        .collect();
    let replicas = nodes
        .iter()
        .map(|local| {
            let ring =
                Arc::new(Ring::new(RingConfig::default(), hasher.clone(), local.clone(), None));
            for node in &nodes {
                ring.join(node.clone());
            }
            let store = Arc::new(MemLogStore::new(hasher.clone()));
            let values = Arc::new(Values::default());
            let transport: SharedTransport = Arc::new(net.transport(&local.address));
            let wal = Arc::new(Wal::new(
                config.clone(),
                ring,
                store.clone(),
                transport,
                values.clone(),
                Arc::new(LamportClock::new()),
            ));
            if start {
                wal.start(&cancel);
            }
            let handler: Arc<dyn RpcHandler> = Arc::new(LogHandler(Arc::clone(&wal)));
            net.register(&local.address, &handler);
            Replica {
                wal,
                store,
                values,
                _handler: handler,
            }
        })
        .collect();
    Cluster { net, replicas, cancel }
}

impl Cluster {
    fn by_host(&self, host: &str) -> &Replica {
        self.replicas
            .iter()
            .find(|r| r.wal.ring().local().address == host)
            .unwrap()
    }

    async fn write(&self, from: usize, key: &[u8], value: &[u8]) -> Result<crate::Proposed> {
        let wal = &self.replicas[from].wal;
        let opts = WriteOptions::default();
        let (mut entry, options) = wal.new_entry(key, &opts).await?;
        entry.set_operation(Opcode::KvSet, value);
        wal.propose(entry, options, opts.retries, Duration::from_millis(opts.retry_interval_ms))
            .await
    }
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

#[tokio::test]
async fn test_commit_replicates_and_applies() {
    let c = cluster(3);
    let proposed = c.write(1, b"kv/a", b"x").await.unwrap();
    assert_eq!(proposed.ballot.height, 1);
    assert_eq!(proposed.ballot.votes, 3);
    assert_eq!(proposed.ballot.commits, 3);
    assert!(proposed.ballot.applied);
    assert_eq!(proposed.attempts, 1);
    for r in &c.replicas {
        let idx = r.store.index_or_empty(b"kv/a").unwrap();
        assert_eq!(idx.height, 1);
        assert_eq!(idx.last, proposed.ballot.id);
    }
    let applied = || c.replicas.iter().all(|r| r.values.get(b"kv/a") == Some(b"x".to_vec()));
    assert!(eventually(applied).await);
}

#[tokio::test]
async fn test_heights_chain_per_key() {
    let c = cluster(3);
    let first = c.write(0, b"kv/k", b"1").await.unwrap();
    let second = c.write(2, b"kv/k", b"2").await.unwrap();
    assert_eq!(second.entry.height, 2);
    assert_eq!(second.entry.previous, first.ballot.id);
    for r in &c.replicas {
        let e = r.store.entry_at(b"kv/k", 2).unwrap().unwrap();
        assert_eq!(e.previous, first.ballot.id);
    }
}

#[tokio::test]
async fn test_concurrent_proposals_serialize_with_retries() {
    let c = cluster(3);
    let wal = Arc::clone(&c.replicas[0].wal);
    let opts = WriteOptions {
        retries: 10,
        ..WriteOptions::default()
    };
    let mut tasks = Vec::new();
    for i in 0..5u8 {
        let (mut entry, options) = wal.new_entry(b"kv/race", &opts).await.unwrap();
        entry.set_operation(Opcode::KvSet, &[i]);
        let wal = Arc::clone(&wal);
        tasks.push(tokio::spawn(async move {
            wal.propose(entry, options, 10, Duration::from_millis(5)).await
        }));
    }
    let mut heights = Vec::new();
    for t in tasks {
        heights.push(t.await.unwrap().unwrap().ballot.height);
    }
    heights.sort_unstable();
    assert_eq!(heights, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_stale_cas_mismatches() {
    let c = cluster(3);
    let wal = &c.replicas[0].wal;
    let first = c.write(0, b"kv/cas", b"a").await.unwrap();
    let (_, options) = wal.new_entry(b"kv/cas", &WriteOptions::default()).await.unwrap();

    let mut winner = wal.new_entry_from(&first.entry);
    winner.set_operation(Opcode::KvSet, b"b");
    let mut loser = wal.new_entry_from(&first.entry);
    loser.set_operation(Opcode::KvSet, b"c");

    wal.propose(winner, options.clone(), 1, Duration::ZERO).await.unwrap();
    let err = wal.propose(loser, options, 1, Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, Error::PreviousHashMismatch(_)));
    let applied = || c.replicas.iter().all(|r| r.values.get(b"kv/cas") == Some(b"b".to_vec()));
    assert!(eventually(applied).await);
}

#[tokio::test]
async fn test_partitioned_replica_heals() {
    let c = cluster(3);
    let (_, options) = c.replicas[0]
        .wal
        .new_entry(b"kv/p", &WriteOptions::default())
        .await
        .unwrap();
    let lagging = options.participants[2].host.clone();
    c.net.partition(&lagging);
    let leader = options.participants[0].host.clone();
    let from = c
        .replicas
        .iter()
        .position(|r| r.wal.ring().local().address == leader)
        .unwrap();
    c.write(from, b"kv/p", b"1").await.unwrap();
    c.write(from, b"kv/p", b"2").await.unwrap();
    let behind = c.by_host(&lagging);
    assert_eq!(behind.store.index_or_empty(b"kv/p").unwrap().height, 0);

    c.net.heal(&lagging);
    let outcome = behind.wal.reconcile(b"kv/p", &[]).await.unwrap();
    assert_eq!(outcome, Reconciled::Extended(2));
    assert!(eventually(|| behind.values.get(b"kv/p") == Some(b"2".to_vec())).await);
    assert_eq!(behind.wal.reconcile(b"kv/p", &[]).await.unwrap(), Reconciled::Unchanged);
}

#[tokio::test]
async fn test_divergent_chain_is_rebased() {
    let c = cluster(3);
    let (_, options) = c.replicas[0]
        .wal
        .new_entry(b"kv/d", &WriteOptions::default())
        .await
        .unwrap();
    let odd = c.by_host(&options.participants[2].host);
    c.net.partition(&odd.wal.ring().local().address);
    let leader = c.by_host(&options.participants[0].host);
    let from = c
        .replicas
        .iter()
        .position(|r| Arc::ptr_eq(&r.wal, &leader.wal))
        .unwrap();
    c.write(from, b"kv/d", b"1").await.unwrap();
    c.write(from, b"kv/d", b"2").await.unwrap();

    // A conflicting single entry on the partitioned replica
    let mut stray = Entry::new(b"kv/d".to_vec(), hasher().zero(), 1);
    stray.set_operation(Opcode::KvSet, b"stray");
    odd.store.append(&stray).unwrap();
    odd.wal.applier().schedule(b"kv/d".to_vec()).await.unwrap();
    assert!(eventually(|| odd.values.get(b"kv/d") == Some(b"stray".to_vec())).await);

    c.net.heal(&odd.wal.ring().local().address);
    let outcome = odd.wal.reconcile(b"kv/d", &[]).await.unwrap();
    assert_eq!(outcome, Reconciled::Rebased { from: 1, entries: 2 });
    let leader_idx = leader.store.index_or_empty(b"kv/d").unwrap();
    assert_eq!(odd.store.index_or_empty(b"kv/d").unwrap().last, leader_idx.last);
    assert!(eventually(|| odd.values.get(b"kv/d") == Some(b"2".to_vec())).await);
}

#[tokio::test]
async fn test_equal_height_tie_prefers_greater_tail() {
    let c = cluster(2);
    let a = &c.replicas[0];
    let b = &c.replicas[1];
    let mut ea = Entry::new(b"kv/t".to_vec(), hasher().zero(), 1);
    ea.set_operation(Opcode::KvSet, b"a");
    let mut eb = Entry::new(b"kv/t".to_vec(), hasher().zero(), 1);
    eb.set_operation(Opcode::KvSet, b"b");
    a.store.append(&ea).unwrap();
    b.store.append(&eb).unwrap();
    let ra = a.wal.reconcile(b"kv/t", &[]).await.unwrap();
    let rb = b.wal.reconcile(b"kv/t", &[]).await.unwrap();
    // Exactly one side adopts the other's chain
    assert_ne!(ra == Reconciled::Unchanged, rb == Reconciled::Unchanged);
    let winner = ea.id(hasher().as_ref()).max(eb.id(hasher().as_ref()));
    assert_eq!(a.store.index_or_empty(b"kv/t").unwrap().last, winner);
    assert_eq!(b.store.index_or_empty(b"kv/t").unwrap().last, winner);
}

#[tokio::test]
async fn test_too_few_reachable_participants() {
    let c = cluster(3);
    let (mut entry, options) = c.replicas[0]
        .wal
        .new_entry(b"kv/q", &WriteOptions::default())
        .await
        .unwrap();
    entry.set_operation(Opcode::KvSet, b"v");
    c.net.partition(&options.participants[1].host);
    c.net.partition(&options.participants[2].host);
    let leader = c.by_host(&options.participants[0].host);
    let err = leader.wal.lead(entry, options).await.unwrap_err();
    assert!(matches!(err, Error::InsufficientPeers { have: 1, need: 2 }));
    assert_eq!(leader.store.index_or_empty(b"kv/q").unwrap().height, 0);
}

#[tokio::test]
async fn test_ballot_past_deadline_times_out() {
    let config = WalConfig {
        ballot_timeout_ms: 300,
        ..WalConfig::default()
    };
    let c = cluster_with(3, config, true);
    let (mut entry, options) = c.replicas[0]
        .wal
        .new_entry(b"kv/slow", &WriteOptions::default())
        .await
        .unwrap();
    entry.set_operation(Opcode::KvSet, b"v");

    // each phase answers inside the per-call deadline, both together do not
    let mut slow = Vec::new();
    for p in &options.participants[1..] {
        let inner: Arc<dyn RpcHandler> = Arc::new(LogHandler(Arc::clone(&c.by_host(&p.host).wal)));
        let handler: Arc<dyn RpcHandler> = Arc::new(SlowBallots {
            inner,
            delay: Duration::from_millis(200),
        });
        c.net.register(&p.host, &handler);
        slow.push(handler);
    }
    let leader = c.by_host(&options.participants[0].host);
    let err = leader.wal.lead(entry, options).await.unwrap_err();
    assert!(matches!(err, Error::Timeout), "{err:?}");
}

#[tokio::test]
async fn test_unapplied_commit_times_out() {
    let config = WalConfig {
        min_votes: 1,
        ..WalConfig::default()
    };
    // the apply loop never runs
    let c = cluster_with(1, config, false);
    let replica = &c.replicas[0];
    let opts = WriteOptions {
        wait_apply_timeout_ms: 50,
        ..WriteOptions::default()
    };
    let (mut entry, options) = replica.wal.new_entry(b"kv/stuck", &opts).await.unwrap();
    entry.set_operation(Opcode::KvSet, b"v");
    let err = replica.wal.lead(entry, options).await.unwrap_err();
    assert!(matches!(err, Error::Timeout), "{err:?}");
    assert_eq!(replica.store.index_or_empty(b"kv/stuck").unwrap().height, 1);
    assert!(replica.values.get(b"kv/stuck").is_none());
}

#[tokio::test]
async fn test_non_participant_is_refused() {
    let c = cluster(3);
    let wal = &c.replicas[0].wal;
    let local = wal.ring().local().address.clone();
    let others: Vec<Participant> = c
        .replicas
        .iter()
        .map(|r| r.wal.ring().local().address.clone())
        .filter(|h| *h != local)
        .enumerate()
        .map(|(i, host)| Participant {
            id: Id::new(vec![u8::try_from(i).unwrap()]),
            host,
            priority: u32::try_from(i).unwrap(),
        })
        .collect();
    let options = ProposeOptions::new(others, &WriteOptions::default());
    let entry = Entry::new(b"kv/x".to_vec(), hasher().zero(), 1);
    assert!(matches!(wal.lead(entry.clone(), options.clone()).await, Err(Error::HostNotInSet(_))));
    assert!(matches!(wal.vote(&entry, &options), Err(Error::HostNotInSet(_))));
}

#[tokio::test]
async fn test_reads_scour_replicas() {
    let c = cluster(3);
    let proposed = c.write(0, b"kv/r", b"v").await.unwrap();
    let reader = &c.replicas[2].wal;
    let last = reader.last_entry(b"kv/r").await.unwrap();
    assert_eq!(last.id(hasher().as_ref()), proposed.ballot.id);
    let by_id = reader.get_entry(b"kv/r", &proposed.ballot.id).await.unwrap();
    assert_eq!(by_id, last);
    assert!(reader.last_entry(b"kv/missing").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_commit_gap_triggers_heal() {
    let c = cluster(3);
    let (_, options) = c.replicas[0]
        .wal
        .new_entry(b"kv/g", &WriteOptions::default())
        .await
        .unwrap();
    let lagging = c.by_host(&options.participants[2].host);
    let lagging_host = lagging.wal.ring().local().address.clone();
    let from = c
        .replicas
        .iter()
        .position(|r| r.wal.ring().local().address == options.participants[0].host)
        .unwrap();

    c.net.partition(&lagging_host);
    c.write(from, b"kv/g", b"1").await.unwrap();
    c.net.heal(&lagging_host);
    // The vote for height 2 reveals the gap and queues a heal on the laggard
    c.write(from, b"kv/g", b"2").await.unwrap();
    assert!(eventually(|| lagging.store.index_or_empty(b"kv/g").unwrap().height >= 1).await);
    lagging.wal.reconcile(b"kv/g", &[]).await.unwrap();
    assert_eq!(lagging.store.index_or_empty(b"kv/g").unwrap().height, 2);
}
