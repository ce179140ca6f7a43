//! Consistent-hash ring
//!
//! Each host contributes `vnodes` points at `H(address || index)`. A vnode
//! owns the arc `(predecessor, vnode]`. Replica `i` of a key hashed to `h`
//! is placed on the owner of `H(h || i)`, walking forward past hosts that
//! already hold a replica.
//!
//! Lookups run against an immutable [`Membership`] snapshot; membership
//! changes build a new snapshot under the write lock and swap it in.

use crate::coords::VivaldiClient;
use crate::events::{MembershipEvent, RingEvent};
use crate::keyblocks::{KeyBlocks, KeyRange};
use crate::locator::BlockLocator;
use fidias_common::config::RingConfig;
use fidias_common::id::between;
use fidias_common::{Coordinate, Error, Hasher, Id, Node, Result, SharedHasher, Vnode};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Visitor verdict for [`Ring::scour_replicated_key`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scour {
    Continue,
    Stop,
}

/// Immutable membership snapshot
#[derive(Clone, Debug, Default)]
pub struct Membership {
    vnodes: Vec<Vnode>,
    nodes: BTreeMap<String, Node>,
    version: u64,
}

impl Membership {
    /// Vnodes sorted by id
    #[must_use]
    pub fn vnodes(&self) -> &[Vnode] {
        &self.vnodes
    }

    /// Members by address
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    /// Member by address
    #[must_use]
    pub fn node(&self, host: &str) -> Option<&Node> {
        self.nodes.get(host)
    }

    /// Number of distinct hosts
    #[must_use]
    pub fn host_count(&self) -> usize {
        self.nodes.len()
    }

    /// Incremented on every change
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    fn successor_pos(&self, id: &Id) -> Option<usize> {
        if self.vnodes.is_empty() {
            return None;
        }
        let pos = self.vnodes.partition_point(|v| v.id < *id);
        Some(if pos == self.vnodes.len() { 0 } else { pos })
    }

    /// Owner of `id`: the first vnode with id >= `id`, wrapping
    #[must_use]
    pub fn successor(&self, id: &Id) -> Option<&Vnode> {
        self.successor_pos(id).map(|p| &self.vnodes[p])
    }

    /// Vnode immediately before `id` on the ring
    #[must_use]
    pub fn predecessor_of(&self, id: &Id) -> Option<&Vnode> {
        if self.vnodes.is_empty() {
            return None;
        }
        let pos = self.vnodes.partition_point(|v| v.id < *id);
        let prev = if pos == 0 { self.vnodes.len() - 1 } else { pos - 1 };
        Some(&self.vnodes[prev])
    }

    fn contains_vnode(&self, id: &Id) -> bool {
        self.vnodes.binary_search_by(|v| v.id.cmp(id)).is_ok()
    }

    /// Up to `n` replicas for a key hash, one per host
    #[must_use]
    pub fn replicas_for_hash(&self, hasher: &dyn Hasher, key_hash: &Id, n: usize) -> Vec<Vnode> {
        let want = n.min(self.nodes.len());
        let mut out = Vec::with_capacity(want);
        if want == 0 {
            return out;
        }
        let mut seen = HashSet::with_capacity(want);
        let len = self.vnodes.len();
        for rh in hasher.replica_hashes(key_hash, n) {
            let Some(start) = self.successor_pos(&rh) else {
                break;
            };
            for step in 0..len {
                let v = &self.vnodes[(start + step) % len];
                if seen.insert(v.host.as_str()) {
                    out.push(v.clone());
                    break;
                }
            }
            if out.len() == want {
                break;
            }
        }
        out
    }

    /// Visit each replica owner followed by its successors, once per host
    pub fn scour<F>(
        &self,
        hasher: &dyn Hasher,
        key_hash: &Id,
        replicas: usize,
        successors: usize,
        mut visit: F,
    )
    where
        F: FnMut(&Vnode) -> Scour,
    {
        let len = self.vnodes.len();
        let mut seen = HashSet::new();
        for rh in hasher.replica_hashes(key_hash, replicas) {
            let Some(start) = self.successor_pos(&rh) else {
                return;
            };
            for step in 0..=successors.min(len.saturating_sub(1)) {
                let v = &self.vnodes[(start + step) % len];
                if seen.insert(v.host.clone()) && visit(v) == Scour::Stop {
                    return;
                }
            }
        }
    }

    fn with_node(&self, hasher: &dyn Hasher, node: Node, vnodes: u16) -> Self {
        let mut next = self.without_host(&node.address);
        for index in 0..vnodes {
            next.vnodes.push(Vnode {
                id: hasher.hash_parts(&[node.address.as_bytes(), &index.to_be_bytes()]),
                host: node.address.clone(),
                index,
            });
        }
        next.vnodes.sort_by(|a, b| a.id.cmp(&b.id));
        next.nodes.insert(node.address.clone(), node);
        next
    }

    fn without_host(&self, host: &str) -> Self {
        let mut next = self.clone();
        next.vnodes.retain(|v| v.host != host);
        next.nodes.remove(host);
        next.version += 1;
        next
    }
}

/// DHT ring client: placement, groups and membership bookkeeping
pub struct Ring {
    hasher: SharedHasher,
    config: RingConfig,
    local: Node,
    members: RwLock<Arc<Membership>>,
    key_blocks: KeyBlocks,
    locator: BlockLocator,
    vivaldi: VivaldiClient,
    coords: RwLock<HashMap<String, Coordinate>>,
    events: Option<mpsc::UnboundedSender<RingEvent>>,
}

impl Ring {
    /// Ring containing only the local node
    pub fn new(
        config: RingConfig,
        hasher: SharedHasher,
        local: Node,
        events: Option<mpsc::UnboundedSender<RingEvent>>,
    ) -> Self {
        let ring = Self {
            hasher,
            config,
            local: local.clone(),
            members: RwLock::new(Arc::new(Membership::default())),
            key_blocks: KeyBlocks::new(),
            locator: BlockLocator::new(),
            vivaldi: VivaldiClient::default(),
            coords: RwLock::new(HashMap::new()),
            events,
        };
        ring.join(local);
        ring
    }

    /// The local node
    #[must_use]
    pub const fn local(&self) -> &Node {
        &self.local
    }

    /// Whether `host` is the local node
    #[must_use]
    pub fn is_local(&self, host: &str) -> bool {
        self.local.address == host
    }

    /// Configured hasher
    #[must_use]
    pub fn hasher(&self) -> &SharedHasher {
        &self.hasher
    }

    /// Ring configuration
    #[must_use]
    pub const fn config(&self) -> &RingConfig {
        &self.config
    }

    /// Current membership snapshot
    #[must_use]
    pub fn snapshot(&self) -> Arc<Membership> {
        Arc::clone(&self.members.read())
    }

    /// Owned key ranges
    #[must_use]
    pub const fn key_blocks(&self) -> &KeyBlocks {
        &self.key_blocks
    }

    /// Block locator hints
    #[must_use]
    pub const fn locator(&self) -> &BlockLocator {
        &self.locator
    }

    /// Hash of a key
    #[must_use]
    pub fn key_hash(&self, key: &[u8]) -> Id {
        self.hasher.hash(key)
    }

    /// Replica hashes of a key at the configured replication factor
    #[must_use]
    pub fn replica_hashes(&self, key: &[u8]) -> Vec<Id> {
        self.hasher
            .replica_hashes(&self.key_hash(key), self.config.replicas)
    }

    /// `n` replicas for `key`, one per host
    pub fn lookup_replicated(&self, key: &[u8], n: usize) -> Result<Vec<Vnode>> {
        self.lookup_replicated_hash(&self.key_hash(key), n)
    }

    /// `n` replicas for a pre-hashed key, one per host
    pub fn lookup_replicated_hash(&self, hash: &Id, n: usize) -> Result<Vec<Vnode>> {
        let snapshot = self.snapshot();
        let out = snapshot.replicas_for_hash(self.hasher.as_ref(), hash, n);
        if out.is_empty() {
            return Err(Error::ReplicaUnavailable(hash.short()));
        }
        Ok(out)
    }

    /// Visit every (replica x successor) candidate for `key` until `visit`
    /// returns [`Scour::Stop`]
    pub fn scour_replicated_key<F>(&self, key: &[u8], replicas: usize, visit: F)
    where
        F: FnMut(&Vnode) -> Scour,
    {
        let snapshot = self.snapshot();
        snapshot.scour(
            self.hasher.as_ref(),
            &self.key_hash(key),
            replicas,
            self.config.successors,
            visit,
        );
    }

    /// Every distinct scour candidate for `key`, in visiting order
    #[must_use]
    pub fn scour_hosts(&self, key: &[u8]) -> Vec<String> {
        let mut hosts = Vec::new();
        self.scour_replicated_key(key, self.config.replicas, |v| {
            hosts.push(v.host.clone());
            Scour::Continue
        });
        hosts
    }

    /// Affinity group for an id: the hosts of its replica set, those
    /// sharing the id's top `group_bits` first, then nearest by coordinate
    #[must_use]
    pub fn lookup(&self, id: &Id) -> Vec<Node> {
        let snapshot = self.snapshot();
        let replicas = snapshot.replicas_for_hash(self.hasher.as_ref(), id, self.config.replicas);
        let bucket = id.bucket(self.config.group_bits);
        let local = self.vivaldi.coordinate();
        let coords = self.coords.read();
        let mut group: Vec<(bool, f64, Node)> = replicas
            .iter()
            .filter_map(|v| snapshot.node(&v.host))
            .map(|n| {
                let far = n.id.bucket(self.config.group_bits) != bucket;
                let dist = if self.is_local(&n.address) {
                    0.0
                } else {
                    coords
                        .get(&n.address)
                        .map_or(f64::MAX, |c| local.distance_to(c))
                };
                (far, dist, n.clone())
            })
            .collect();
        group.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.total_cmp(&b.1)));
        group.into_iter().map(|(_, _, n)| n).collect()
    }

    /// Affinity group of a key
    #[must_use]
    pub fn lookup_group_nodes(&self, key: &[u8]) -> Vec<Node> {
        self.lookup(&self.key_hash(key))
    }

    /// Whether the local host is among `key`'s replicas
    #[must_use]
    pub fn is_replica(&self, key: &[u8]) -> bool {
        self.lookup_replicated(key, self.config.replicas)
            .is_ok_and(|vs| vs.iter().any(|v| self.is_local(&v.host)))
    }

    /// Apply a membership event
    pub fn apply(&self, event: &MembershipEvent) -> Result<()> {
        match event {
            MembershipEvent::Join { .. } => {
                self.join(event.node(self.hasher.as_ref())?);
            }
            MembershipEvent::Update { .. } => {
                self.update(event.node(self.hasher.as_ref())?);
            }
            MembershipEvent::Leave { address } => {
                self.leave(address);
            }
            MembershipEvent::Ping {
                address,
                coordinate,
                rtt_secs,
                ..
            } => {
                if let Some(c) = coordinate {
                    self.record_ping(address, c, *rtt_secs);
                }
            }
        }
        Ok(())
    }

    /// Insert a member; returns false when it was already present
    pub fn join(&self, node: Node) -> bool {
        let mut guard = self.members.write();
        if guard.node(&node.address).is_some_and(|n| *n == node) {
            return false;
        }
        let address = node.address.clone();
        let next = guard.with_node(self.hasher.as_ref(), node.clone(), self.config.vnodes);
        info!(
            "Ring: {} joined ({} hosts, {} vnodes)",
            address,
            next.host_count(),
            next.vnodes().len()
        );
        let old = std::mem::replace(&mut *guard, Arc::new(next));
        self.after_change(&old, &guard);
        drop(guard);
        if !self.is_local(&address) {
            self.emit(RingEvent::HostJoined { node });
        }
        true
    }

    /// Replace a member's metadata
    pub fn update(&self, node: Node) {
        let mut guard = self.members.write();
        if !guard.nodes.contains_key(&node.address) {
            drop(guard);
            self.join(node);
            return;
        }
        let mut next = (**guard).clone();
        next.version += 1;
        debug!("Ring: {} updated metadata", node.address);
        next.nodes.insert(node.address.clone(), node);
        *guard = Arc::new(next);
    }

    /// Remove a member by address; returns false when it was unknown
    pub fn leave(&self, host: &str) -> bool {
        if self.is_local(host) {
            warn!("Ring: ignoring leave for the local node {}", host);
            return false;
        }
        let mut guard = self.members.write();
        if guard.node(host).is_none() {
            return false;
        }
        let next = guard.without_host(host);
        info!(
            "Ring: {} left ({} hosts remain)",
            host,
            next.host_count()
        );
        let old = std::mem::replace(&mut *guard, Arc::new(next));
        self.after_change(&old, &guard);
        drop(guard);
        self.coords.write().remove(host);
        self.locator.forget_host(host);
        self.emit(RingEvent::HostLeft {
            address: host.to_string(),
        });
        true
    }

    /// Fold in a ping sample from `host`
    pub fn record_ping(&self, host: &str, coordinate: &Coordinate, rtt_secs: f64) {
        self.vivaldi.update(coordinate, rtt_secs);
        self.coords.write().insert(host.to_string(), coordinate.clone());
    }

    /// Local network coordinate
    #[must_use]
    pub fn coordinate(&self) -> Coordinate {
        self.vivaldi.coordinate()
    }

    /// Recompute owned ranges and emit predecessor changes
    fn after_change(&self, old: &Membership, new: &Membership) {
        let mut ranges = Vec::new();
        for v in new.vnodes().iter().filter(|v| self.is_local(&v.host)) {
            let Some(new_pred) = new.predecessor_of(&v.id) else {
                continue;
            };
            ranges.push(KeyRange {
                start: new_pred.id.clone(),
                end: v.id.clone(),
            });
            if !old.contains_vnode(&v.id) {
                continue;
            }
            let Some(old_pred) = old.predecessor_of(&v.id) else {
                continue;
            };
            // Only arrivals inside the old arc hand keys over
            if new_pred.id != old_pred.id && between(&old_pred.id, &v.id, &new_pred.id) {
                debug!(
                    "Ring: vnode {} has new predecessor {} on {} (was {})",
                    v.id.short(),
                    new_pred.id.short(),
                    new_pred.host,
                    old_pred.id.short()
                );
                self.emit(RingEvent::NewPredecessor {
                    local: v.clone(),
                    new_pred: new_pred.clone(),
                    old_pred: old_pred.clone(),
                });
            }
        }
        if self.key_blocks.set(ranges) {
            debug!("Ring: owned ranges changed (version {})", new.version());
        }
    }

    fn emit(&self, event: RingEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                debug!("Ring: event receiver dropped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fidias_common::{HashAlgorithm, NodeMeta};

    fn node(addr: &str) -> Node {
        Node::new(&HashAlgorithm::Sha256, addr, addr, NodeMeta::single(addr))
    }

    fn ring_with(hosts: &[&str]) -> Ring {
        let ring = Ring::new(
            RingConfig::default(),
            HashAlgorithm::Sha256.shared(),
            node(hosts[0]),
            None,
        );
        for h in &hosts[1..] {
            ring.join(node(h));
        }
        ring
    }

    #[test]
    fn test_replicas_distinct_hosts() {
        let ring = ring_with(&["a:1", "b:1", "c:1", "d:1"]);
        for i in 0..50u32 {
            let key = format!("key-{i}");
            let vs = ring.lookup_replicated(key.as_bytes(), 3).unwrap();
            assert_eq!(vs.len(), 3);
            let hosts: HashSet<_> = vs.iter().map(|v| v.host.clone()).collect();
            assert_eq!(hosts.len(), 3);
        }
    }

    #[test]
    fn test_replicas_capped_by_hosts() {
        let ring = ring_with(&["a:1", "b:1"]);
        assert_eq!(ring.lookup_replicated(b"k", 3).unwrap().len(), 2);
    }

    #[test]
    fn test_lookup_deterministic_across_rings() {
        let r1 = ring_with(&["a:1", "b:1", "c:1"]);
        let r2 = ring_with(&["c:1", "a:1", "b:1"]);
        for i in 0..20u32 {
            let key = format!("k{i}");
            assert_eq!(
                r1.lookup_replicated(key.as_bytes(), 3).unwrap(),
                r2.lookup_replicated(key.as_bytes(), 3).unwrap()
            );
        }
    }

    #[test]
    fn test_successor_wraps() {
        let ring = ring_with(&["a:1"]);
        let snap = ring.snapshot();
        let max = Id::new(vec![0xff; 32]);
        let first = &snap.vnodes()[0];
        assert!(snap.vnodes().iter().all(|v| v.id < max));
        assert_eq!(snap.successor(&max), Some(first));
        assert_eq!(snap.predecessor_of(&first.id), snap.vnodes().last());
    }

    #[test]
    fn test_scour_visits_each_host_once() {
        let ring = ring_with(&["a:1", "b:1", "c:1", "d:1", "e:1"]);
        let hosts = ring.scour_hosts(b"some-key");
        let unique: HashSet<_> = hosts.iter().collect();
        assert_eq!(unique.len(), hosts.len());
        let replicas = ring.lookup_replicated(b"some-key", 3).unwrap();
        assert_eq!(hosts[0], replicas[0].host);

        let mut visited = 0;
        ring.scour_replicated_key(b"some-key", 3, |_| {
            visited += 1;
            Scour::Stop
        });
        assert_eq!(visited, 1);
    }

    #[test]
    fn test_group_is_replica_hosts() {
        let ring = ring_with(&["a:1", "b:1", "c:1", "d:1"]);
        let id = ring.key_hash(b"grouped");
        let group: HashSet<_> = ring.lookup(&id).into_iter().map(|n| n.address).collect();
        let replicas: HashSet<_> = ring
            .lookup_replicated_hash(&id, 3)
            .unwrap()
            .into_iter()
            .map(|v| v.host)
            .collect();
        assert_eq!(group, replicas);
    }

    #[test]
    fn test_group_prefers_same_bucket() {
        let ring = ring_with(&["a:1", "b:1", "c:1", "d:1", "e:1"]);
        let id = ring.key_hash(b"bucketed");
        let group = ring.lookup(&id);
        let bits = ring.config().group_bits;
        let flags: Vec<bool> = group.iter().map(|n| n.id.bucket(bits) == id.bucket(bits)).collect();
        let mut sorted = flags.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(flags, sorted);
    }

    #[test]
    fn test_join_emits_new_predecessor_and_leave_removes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ring = Ring::new(
            RingConfig::default(),
            HashAlgorithm::Sha256.shared(),
            node("a:1"),
            Some(tx),
        );
        assert!(rx.try_recv().is_err());
        assert!(ring.join(node("b:1")));
        assert!(!ring.join(node("b:1")));
        let mut new_preds = 0;
        let mut joined = 0;
        while let Ok(ev) = rx.try_recv() {
            match ev {
                RingEvent::NewPredecessor { local, new_pred, old_pred } => {
                    assert_eq!(local.host, "a:1");
                    assert_eq!(new_pred.host, "b:1");
                    assert!(between(&old_pred.id, &local.id, &new_pred.id));
                    new_preds += 1;
                }
                RingEvent::HostJoined { node } => {
                    assert_eq!(node.address, "b:1");
                    joined += 1;
                }
                RingEvent::HostLeft { .. } => panic!("unexpected leave"),
            }
        }
        assert!(new_preds > 0);
        assert_eq!(joined, 1);

        assert!(ring.leave("b:1"));
        assert!(!ring.leave("b:1"));
        assert!(!ring.leave("a:1"));
        assert_eq!(ring.snapshot().host_count(), 1);
        assert!(matches!(rx.try_recv(), Ok(RingEvent::HostLeft { .. })));
    }

    #[test]
    fn test_key_blocks_cover_whole_ring_alone() {
        let ring = ring_with(&["a:1"]);
        for i in 0..20u32 {
            assert!(ring.key_blocks().contains(&ring.key_hash(&i.to_be_bytes())));
        }
        ring.join(node("b:1"));
        let id = ring.key_hash(b"x");
        let owner = ring.snapshot().successor(&id).cloned().unwrap();
        assert_eq!(ring.key_blocks().contains(&id), owner.host == "a:1");
    }

    #[test]
    fn test_apply_events() {
        let ring = ring_with(&["a:1"]);
        let joined = node("b:1");
        ring.apply(&MembershipEvent::join(&joined).unwrap()).unwrap();
        assert!(ring.snapshot().node("b:1").is_some());
        let mut coordinate = Coordinate::default();
        coordinate.vec[0] = 0.01;
        ring.apply(&MembershipEvent::Ping {
            address: "b:1".into(),
            ltime: 3,
            coordinate: Some(coordinate),
            rtt_secs: 0.02,
        })
        .unwrap();
        ring.apply(&MembershipEvent::Leave { address: "b:1".into() }).unwrap();
        assert!(ring.snapshot().node("b:1").is_none());
        assert!(ring
            .apply(&MembershipEvent::Join {
                name: "x".into(),
                address: "x:1".into(),
                meta: b"not json".to_vec()
            })
            .is_err());
    }
}
