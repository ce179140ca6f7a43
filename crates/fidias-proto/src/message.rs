//! Request and response messages
//!
//! Bodies are bincode-encoded. Variant order is part of the wire format:
//! append new variants at the end.

use fidias_common::{
    BallotResult, Block, Coordinate, Entry, Error, Id, KeyIndex, KvPair, Node, ProposeOptions,
    RelocateTuple, Result, WireError, WriteOptions, WriteStats,
};
use serde::{Deserialize, Serialize};

/// First message of a relocate stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelocatePreamble {
    /// Sending host
    pub source: String,
    /// Vnode id of the new owner
    pub target: Id,
}

/// RPC request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    // KV surface
    GetKey { key: String },
    ListDir { prefix: String },
    SetKv { kv: KvPair, options: WriteOptions },
    CaSetKv { kv: KvPair, options: WriteOptions },
    RemoveKv { key: String, options: WriteOptions },
    CaRemoveKv { kv: KvPair, options: WriteOptions },

    // Log surface
    GetEntry { key: Vec<u8>, id: Id },
    LastEntry { key: Vec<u8> },
    GetIndex { key: Vec<u8> },
    FetchKeylog { key: Vec<u8>, after: Id, limit: u32 },
    ProposeEntry { entry: Entry, options: ProposeOptions },
    BallotVote { entry: Entry, options: ProposeOptions },
    BallotCommit { entry: Entry, options: ProposeOptions },
    TransferKeylog { source: String, key: Vec<u8> },
    Relocate { preamble: RelocatePreamble, tuples: Vec<RelocateTuple> },

    // Block surface
    SetBlock { block: Block },
    GetBlock { id: Id },
    RemoveBlock { id: Id },
    PublishBlock { id: Id, host: String },

    // Membership
    PingNode { from: String, ltime: u64, coordinate: Coordinate },
    Join { node: Node },
    Leave { host: String },

    // Versioned files
    GetFile { name: String },
}

impl Request {
    /// Method name for logs and metrics
    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::GetKey { .. } => "GetKey",
            Self::ListDir { .. } => "ListDir",
            Self::SetKv { .. } => "SetKV",
            Self::CaSetKv { .. } => "CASetKV",
            Self::RemoveKv { .. } => "RemoveKV",
            Self::CaRemoveKv { .. } => "CARemoveKV",
            Self::GetEntry { .. } => "GetEntry",
            Self::LastEntry { .. } => "LastEntry",
            Self::GetIndex { .. } => "GetIndex",
            Self::FetchKeylog { .. } => "FetchKeylog",
            Self::ProposeEntry { .. } => "ProposeEntry",
            Self::BallotVote { .. } => "BallotVote",
            Self::BallotCommit { .. } => "BallotCommit",
            Self::TransferKeylog { .. } => "TransferKeylog",
            Self::Relocate { .. } => "Relocate",
            Self::SetBlock { .. } => "SetBlock",
            Self::GetBlock { .. } => "GetBlock",
            Self::RemoveBlock { .. } => "RemoveBlock",
            Self::PublishBlock { .. } => "PublishBlock",
            Self::PingNode { .. } => "PingNode",
            Self::Join { .. } => "Join",
            Self::Leave { .. } => "Leave",
            Self::GetFile { .. } => "GetFile",
        }
    }

    /// Whether the request mutates replicated state
    #[must_use]
    pub const fn is_write(&self) -> bool {
        matches!(
            self,
            Self::SetKv { .. }
                | Self::CaSetKv { .. }
                | Self::RemoveKv { .. }
                | Self::CaRemoveKv { .. }
                | Self::ProposeEntry { .. }
                | Self::BallotVote { .. }
                | Self::BallotCommit { .. }
                | Self::Relocate { .. }
                | Self::SetBlock { .. }
                | Self::RemoveBlock { .. }
        )
    }
}

/// RPC response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Kv(KvPair),
    KvList(Vec<KvPair>),
    KvWrite { kv: KvPair, stats: WriteStats },
    Entry(Entry),
    Entries(Vec<Entry>),
    Index(KeyIndex),
    Ballot(BallotResult),
    Block(Block),
    Pong { ltime: u64, coordinate: Coordinate },
    Members(Vec<Node>),
    File(Vec<u8>),
    Error(WireError),
}

impl Response {
    /// Response carrying an error
    #[must_use]
    pub fn error(err: &Error) -> Self {
        Self::Error(err.to_wire())
    }

    /// Turn an error response back into the sentinel error
    pub fn into_result(self) -> Result<Self> {
        match self {
            Self::Error(wire) => Err(Error::from_wire(wire)),
            other => Ok(other),
        }
    }

    /// Variant name, for unexpected-response errors
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ok => "Ok",
            Self::Kv(_) => "Kv",
            Self::KvList(_) => "KvList",
            Self::KvWrite { .. } => "KvWrite",
            Self::Entry(_) => "Entry",
            Self::Entries(_) => "Entries",
            Self::Index(_) => "Index",
            Self::Ballot(_) => "Ballot",
            Self::Block(_) => "Block",
            Self::Pong { .. } => "Pong",
            Self::Members(_) => "Members",
            Self::File(_) => "File",
            Self::Error(_) => "Error",
        }
    }
}

impl From<Result<Self>> for Response {
    fn from(result: Result<Self>) -> Self {
        result.unwrap_or_else(|e| Self::error(&e))
    }
}

/// Encode a message body
pub fn encode_body<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    bincode::serialize(msg).map_err(|e| Error::Serialization(e.to_string()))
}

/// Decode a message body
pub fn decode_body<T: for<'de> Deserialize<'de>>(buf: &[u8]) -> Result<T> {
    bincode::deserialize(buf).map_err(|e| Error::Serialization(e.to_string()))
}
