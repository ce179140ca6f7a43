//! Content-addressed blocks
//!
//! A block's id is `H(type || bytes)`, so a block can be verified by
//! whoever receives it without trusting the sender.

use crate::error::{Error, Result};
use crate::hasher::Hasher;
use crate::id::Id;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Block type byte
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockKind {
    /// Raw file data
    Data = 0,
    /// Child list of a block tree
    Index = 1,
    /// Metadata blob
    Meta = 2,
}

impl TryFrom<u8> for BlockKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Index),
            2 => Ok(Self::Meta),
            _ => Err(Error::invalid_argument(format!("invalid block type: {value}"))),
        }
    }
}

/// Immutable block
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block type
    pub kind: BlockKind,
    /// Contents
    pub data: Bytes,
}

impl Block {
    /// Create a block
    pub fn new(kind: BlockKind, data: impl Into<Bytes>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    /// Content address
    #[must_use]
    pub fn id(&self, hasher: &dyn Hasher) -> Id {
        hasher.hash_parts(&[&[self.kind as u8][..], self.data.as_ref()])
    }

    /// Whether the contents hash to `id`
    #[must_use]
    pub fn verify(&self, hasher: &dyn Hasher, id: &Id) -> bool {
        self.id(hasher) == *id
    }

    /// Serialized form: type byte followed by the contents
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.data.len() + 1);
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Parse the serialized form
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let (&kind, data) = buf
            .split_first()
            .ok_or_else(|| Error::invalid_argument("empty block"))?;
        Ok(Self {
            kind: BlockKind::try_from(kind)?,
            data: Bytes::copy_from_slice(data),
        })
    }
}
