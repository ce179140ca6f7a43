//! Core data model shared by every Fidias crate

use crate::hasher::Hasher;
use crate::id::Id;
use serde::{Deserialize, Serialize};

/// Directory flag on a [`KvPair`]
pub const FLAG_DIR: u32 = 1;

/// Advertised node metadata (marshaled into membership events)
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    /// Region label
    pub region: String,
    /// Sector label
    pub sector: String,
    /// Zone label
    pub zone: String,
    /// Address serving ballot traffic
    pub ballot_addr: String,
    /// Address serving block traffic
    pub block_addr: String,
    /// Address serving ring traffic
    pub dht_addr: String,
}

impl NodeMeta {
    /// Metadata where every transport is served from one address
    #[must_use]
    pub fn single(address: &str) -> Self {
        Self {
            ballot_addr: address.to_string(),
            block_addr: address.to_string(),
            dht_addr: address.to_string(),
            ..Self::default()
        }
    }

    /// Marshal for a membership event payload
    pub fn marshal(&self) -> crate::Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| crate::Error::Serialization(e.to_string()))
    }

    /// Unmarshal from a membership event payload
    pub fn unmarshal(buf: &[u8]) -> crate::Result<Self> {
        serde_json::from_slice(buf).map_err(|e| crate::Error::Serialization(e.to_string()))
    }
}

/// Cluster member
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Stable id: hash of the address
    pub id: Id,
    /// Human-readable name
    pub name: String,
    /// Primary RPC address (`host:port`)
    pub address: String,
    /// Advertised metadata
    pub meta: NodeMeta,
}

impl Node {
    /// Build a node, deriving its id from the address
    #[must_use]
    pub fn new(
        hasher: &dyn Hasher,
        name: impl Into<String>,
        address: impl Into<String>,
        meta: NodeMeta,
    ) -> Self {
        let address = address.into();
        Self {
            id: hasher.hash(address.as_bytes()),
            name: name.into(),
            address,
            meta,
        }
    }
}

/// Virtual node on the ring
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vnode {
    /// Ring position
    pub id: Id,
    /// Owning host address
    pub host: String,
    /// Index of this vnode on its host
    pub index: u16,
}

/// Ballot participant
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Vnode id the participant was selected through
    pub id: Id,
    /// Host address
    pub host: String,
    /// Position in the replica set (0 is the leader)
    pub priority: u32,
}

impl Participant {
    /// Participants from an ordered replica set
    #[must_use]
    pub fn from_vnodes(vnodes: &[Vnode]) -> Vec<Self> {
        vnodes
            .iter()
            .enumerate()
            .map(|(i, v)| Self {
                id: v.id.clone(),
                host: v.host.clone(),
                priority: u32::try_from(i).unwrap_or(u32::MAX),
            })
            .collect()
    }
}

/// Network coordinate (Vivaldi)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    /// Euclidean component
    pub vec: Vec<f64>,
    /// Height above the plane (access link latency)
    pub height: f64,
    /// Confidence in the estimate (lower is better)
    pub error: f64,
    /// Gravity-free adjustment term
    pub adjustment: f64,
}

/// Dimensionality of network coordinates
pub const COORDINATE_DIMENSIONS: usize = 8;

impl Default for Coordinate {
    fn default() -> Self {
        Self {
            vec: vec![0.0; COORDINATE_DIMENSIONS],
            height: 1.0e-5,
            error: 1.5,
            adjustment: 0.0,
        }
    }
}

impl Coordinate {
    /// Estimated round trip to `other`, in seconds
    #[must_use]
    pub fn distance_to(&self, other: &Self) -> f64 {
        let euclid: f64 = self
            .vec
            .iter()
            .zip(&other.vec)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();
        let d = euclid + self.height + other.height;
        let adjusted = d + self.adjustment + other.adjustment;
        if adjusted > 0.0 { adjusted } else { d }
    }
}

/// Client-facing write options
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    /// Wait for the ballot to commit before returning
    pub wait_ballot: bool,
    /// Wait for the FSM to apply the entry
    pub wait_apply: bool,
    /// Apply deadline (ms)
    pub wait_apply_timeout_ms: u64,
    /// Total proposal attempts on previous-hash mismatch
    pub retries: u32,
    /// Backoff between attempts (ms)
    pub retry_interval_ms: u64,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            wait_ballot: true,
            wait_apply: true,
            wait_apply_timeout_ms: 2000,
            retries: 1,
            retry_interval_ms: 35,
        }
    }
}

/// Options carried with a proposal to the ballot leader
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposeOptions {
    /// Ordered participant set (index 0 leads)
    pub participants: Vec<Participant>,
    /// Wait for commit
    pub wait_ballot: bool,
    /// Wait for apply on the leader
    pub wait_apply: bool,
    /// Apply deadline (ms)
    pub wait_apply_timeout_ms: u64,
}

impl ProposeOptions {
    /// Proposal options from a participant set and client write options
    #[must_use]
    pub fn new(participants: Vec<Participant>, opts: &WriteOptions) -> Self {
        Self {
            participants,
            wait_ballot: opts.wait_ballot,
            wait_apply: opts.wait_apply,
            wait_apply_timeout_ms: opts.wait_apply_timeout_ms,
        }
    }

    /// Ballot leader (first participant)
    #[must_use]
    pub fn leader(&self) -> Option<&Participant> {
        self.participants.first()
    }

    /// Whether `host` is one of the participants
    #[must_use]
    pub fn contains_host(&self, host: &str) -> bool {
        self.participants.iter().any(|p| p.host == host)
    }
}

/// Outcome of a ballot as reported by its leader
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallotResult {
    /// Committed entry id
    pub id: Id,
    /// Committed height
    pub height: u64,
    /// Participants that voted
    pub votes: u32,
    /// Participants that acknowledged the commit
    pub commits: u32,
    /// Whether the leader applied the entry before replying
    pub applied: bool,
}

/// One key handed over during relocation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocateTuple {
    /// Namespaced key
    pub key: Vec<u8>,
    /// Sender's tail id for the key
    pub marker: Id,
    /// Sender's height for the key
    pub height: u64,
}

/// Key-value pair as exposed by the KV service
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvPair {
    /// Key (without namespace)
    pub key: String,
    /// Value bytes (empty for directories)
    pub value: Vec<u8>,
    /// [`FLAG_DIR`] for directories
    pub flags: u32,
    /// Id of the entry that produced this state
    pub modification: Id,
    /// Height of that entry
    pub height: u64,
    /// Lamport time of that entry
    pub ltime: u64,
    /// Wall time of that entry (unix nanos)
    pub mod_time: u64,
}

impl KvPair {
    /// Whether this pair is a directory
    #[must_use]
    pub const fn is_dir(&self) -> bool {
        self.flags & FLAG_DIR != 0
    }
}

/// Write statistics returned with a KV mutation
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteStats {
    /// Participants in the ballot
    pub participants: u32,
    /// Proposal attempts made
    pub attempts: u32,
    /// Elapsed time (microseconds)
    pub elapsed_us: u64,
}
