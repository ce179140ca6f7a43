//! Log entries and the per-key index
//!
//! An entry's id is the hash of its canonical encoding:
//!
//! ```text
//! +---------+-----+---------+---------+-----+---------+---------+-----
//! | version | tag | len u32 |  bytes  | tag | len u32 |  bytes  | ...
//! +---------+-----+---------+---------+-----+---------+---------+-----
//! ```
//!
//! Fields appear in tag order: key (1), previous (2), height (3),
//! lamport time (4), wall time (5), payload (6). Integers are big-endian.

use crate::error::{Error, Result};
use crate::hasher::Hasher;
use crate::id::Id;
use serde::{Deserialize, Serialize};

/// Canonical encoding version
pub const ENTRY_VERSION: u8 = 1;

const TAG_KEY: u8 = 1;
const TAG_PREVIOUS: u8 = 2;
const TAG_HEIGHT: u8 = 3;
const TAG_LTIME: u8 = 4;
const TAG_TIMESTAMP: u8 = 5;
const TAG_DATA: u8 = 6;

/// Payload opcodes (first payload byte)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Opcode {
    KvSet = 1,
    KvDel = 2,
    FsSet = 3,
    FsDel = 4,
}

impl Opcode {
    /// Parse an opcode byte
    #[must_use]
    pub const fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::KvSet),
            2 => Some(Self::KvDel),
            3 => Some(Self::FsSet),
            4 => Some(Self::FsDel),
            _ => None,
        }
    }
}

/// Immutable per-key log record
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Namespaced key
    pub key: Vec<u8>,
    /// Id of the entry at `height - 1`, or the zero marker
    pub previous: Id,
    /// Position in the key's chain, starting at 1
    pub height: u64,
    /// Lamport time at creation
    pub ltime: u64,
    /// Wall-clock time at creation (unix nanos)
    pub timestamp: u64,
    /// Opcode byte followed by the operation payload
    pub data: Vec<u8>,
}

impl Entry {
    /// Template for the next entry after `(previous, height - 1)`
    #[must_use]
    pub fn new(key: Vec<u8>, previous: Id, height: u64) -> Self {
        Self {
            key,
            previous,
            height,
            ltime: 0,
            timestamp: crate::now_nanos(),
            data: Vec::new(),
        }
    }

    /// Set the opcode and payload
    pub fn set_operation(&mut self, op: Opcode, payload: &[u8]) {
        self.data.clear();
        self.data.reserve(payload.len() + 1);
        self.data.push(op as u8);
        self.data.extend_from_slice(payload);
    }

    /// Opcode of the payload, if any
    #[must_use]
    pub fn opcode(&self) -> Option<Opcode> {
        self.data.first().copied().and_then(Opcode::from_u8)
    }

    /// Payload after the opcode byte
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.data.get(1..).unwrap_or_default()
    }

    /// Entry id: hash of the canonical encoding
    #[must_use]
    pub fn id(&self, hasher: &dyn Hasher) -> Id {
        hasher.hash(&self.encode())
    }

    /// Whether this entry directly follows `(last, height)`
    #[must_use]
    pub fn follows(&self, last: &Id, height: u64) -> bool {
        self.height == height + 1
            && (self.previous == *last
                || (height == 0 && self.previous.is_zero() && last.is_zero()))
    }

    /// Canonical encoding
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(
            1 + 6 * 5 + self.key.len() + self.previous.len() + 24 + self.data.len(),
        );
        buf.push(ENTRY_VERSION);
        put_field(&mut buf, TAG_KEY, &self.key);
        put_field(&mut buf, TAG_PREVIOUS, self.previous.as_bytes());
        put_field(&mut buf, TAG_HEIGHT, &self.height.to_be_bytes());
        put_field(&mut buf, TAG_LTIME, &self.ltime.to_be_bytes());
        put_field(&mut buf, TAG_TIMESTAMP, &self.timestamp.to_be_bytes());
        put_field(&mut buf, TAG_DATA, &self.data);
        buf
    }

    /// Decode a canonical encoding
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (&version, mut rest) = buf
            .split_first()
            .ok_or_else(|| Error::InvalidEntry("empty buffer".into()))?;
        if version != ENTRY_VERSION {
            return Err(Error::InvalidEntry(format!("unsupported entry version {version}")));
        }
        let key = take_field(&mut rest, TAG_KEY)?.to_vec();
        let previous = Id::from_slice(take_field(&mut rest, TAG_PREVIOUS)?);
        let height = take_u64(&mut rest, TAG_HEIGHT)?;
        let ltime = take_u64(&mut rest, TAG_LTIME)?;
        let timestamp = take_u64(&mut rest, TAG_TIMESTAMP)?;
        let data = take_field(&mut rest, TAG_DATA)?.to_vec();
        if !rest.is_empty() {
            return Err(Error::InvalidEntry("trailing bytes".into()));
        }
        Ok(Self {
            key,
            previous,
            height,
            ltime,
            timestamp,
            data,
        })
    }
}

fn put_field(buf: &mut Vec<u8>, tag: u8, value: &[u8]) {
    buf.push(tag);
    let len = u32::try_from(value.len()).unwrap_or(u32::MAX);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value);
}

fn take_field<'a>(buf: &mut &'a [u8], tag: u8) -> Result<&'a [u8]> {
    if buf.len() < 5 {
        return Err(Error::InvalidEntry(format!("truncated before field {tag}")));
    }
    if buf[0] != tag {
        return Err(Error::InvalidEntry(format!(
            "expected field {tag}, found {}",
            buf[0]
        )));
    }
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    let rest = &buf[5..];
    if rest.len() < len {
        return Err(Error::InvalidEntry(format!("field {tag} truncated")));
    }
    let (value, tail) = rest.split_at(len);
    *buf = tail;
    Ok(value)
}

fn take_u64(buf: &mut &[u8], tag: u8) -> Result<u64> {
    let raw = take_field(buf, tag)?;
    let arr: [u8; 8] = raw
        .try_into()
        .map_err(|_| Error::InvalidEntry(format!("field {tag} is not a u64")))?;
    Ok(u64::from_be_bytes(arr))
}

/// Per-key index: tail of the local chain plus the relocation marker
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyIndex {
    /// Id of the last appended entry (zero marker when empty)
    pub last: Id,
    /// Height of the last appended entry (0 when empty)
    pub height: u64,
    /// Tail id advertised by the previous owner during relocation
    pub marker: Option<Id>,
}

impl KeyIndex {
    /// Index of a key with no entries
    #[must_use]
    pub fn empty(width: usize) -> Self {
        Self {
            last: Id::zero(width),
            height: 0,
            marker: None,
        }
    }

    /// Whether the local chain has caught up with the marker
    #[must_use]
    pub fn caught_up(&self) -> bool {
        self.marker.as_ref().is_none_or(|m| *m == self.last)
    }

    /// Compact encoding: `height u64 | last len u8 | last | marker len u8 | marker`
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let marker = self.marker.as_ref().map(Id::as_bytes).unwrap_or_default();
        let mut buf = Vec::with_capacity(10 + self.last.len() + marker.len());
        buf.extend_from_slice(&self.height.to_be_bytes());
        buf.push(u8::try_from(self.last.len()).unwrap_or(u8::MAX));
        buf.extend_from_slice(self.last.as_bytes());
        buf.push(u8::try_from(marker.len()).unwrap_or(u8::MAX));
        buf.extend_from_slice(marker);
        buf
    }

    /// Decode the compact encoding
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let bad = || Error::InvalidEntry("malformed key index".into());
        let height =
            u64::from_be_bytes(buf.get(..8).ok_or_else(bad)?.try_into().map_err(|_| bad())?);
        let last_len = *buf.get(8).ok_or_else(bad)? as usize;
        let last = buf.get(9..9 + last_len).ok_or_else(bad)?;
        let marker_len = *buf.get(9 + last_len).ok_or_else(bad)? as usize;
        let start = 10 + last_len;
        let marker = buf.get(start..start + marker_len).ok_or_else(bad)?;
        Ok(Self {
            last: Id::from_slice(last),
            height,
            marker: (marker_len > 0).then(|| Id::from_slice(marker)),
        })
    }
}
