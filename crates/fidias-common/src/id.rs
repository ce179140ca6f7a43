//! Fixed-width content identifiers and ring arithmetic
//!
//! Every identifier in Fidias (node, vnode, entry, block) is the output of
//! the configured hash function. Identifiers of the same width compare as
//! big-endian unsigned integers, which is what the ring walks on.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Content identifier (hash output)
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, From, Into)]
pub struct Id(Vec<u8>);

impl Id {
    /// Wrap raw hash bytes
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Copy an identifier out of a slice
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    /// The zero marker of the given width
    #[must_use]
    pub fn zero(width: usize) -> Self {
        Self(vec![0; width])
    }

    /// Whether every byte is zero (an empty id counts as zero)
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Width in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the id has no bytes at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Full lowercase hex
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parse from hex
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        hex::decode(s).map(Self)
    }

    /// First four bytes as hex, for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..self.0.len().min(4)])
    }

    /// The top `bits` bits of the id as an integer (the affinity bucket)
    #[must_use]
    pub fn bucket(&self, bits: u32) -> u64 {
        if bits == 0 {
            return 0;
        }
        let bits = bits.min(64);
        let mut prefix = [0u8; 8];
        let n = self.0.len().min(8);
        prefix[..n].copy_from_slice(&self.0[..n]);
        u64::from_be_bytes(prefix) >> (64 - bits)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.short())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Whether `x` lies in the half-open ring arc `(start, end]`.
///
/// When `start == end` the arc covers the whole ring.
#[must_use]
pub fn between_right_incl(start: &Id, end: &Id, x: &Id) -> bool {
    match start.cmp(end) {
        std::cmp::Ordering::Less => start < x && x <= end,
        std::cmp::Ordering::Equal => true,
        std::cmp::Ordering::Greater => x > start || x <= end,
    }
}

/// Whether `x` lies strictly inside the ring arc `(start, end)`.
#[must_use]
pub fn between(start: &Id, end: &Id, x: &Id) -> bool {
    match start.cmp(end) {
        std::cmp::Ordering::Less => start < x && x < end,
        std::cmp::Ordering::Equal => x != start,
        std::cmp::Ordering::Greater => x > start || x < end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> Id {
        Id::new(vec![b])
    }

    #[test]
    fn test_zero_marker() {
        let z = Id::zero(32);
        assert!(z.is_zero());
        assert_eq!(z.len(), 32);
        assert!(!Id::new(vec![0, 1]).is_zero());
    }

    #[test]
    fn test_between_plain_arc() {
        assert!(between_right_incl(&id(10), &id(20), &id(15)));
        assert!(between_right_incl(&id(10), &id(20), &id(20)));
        assert!(!between_right_incl(&id(10), &id(20), &id(10)));
        assert!(!between_right_incl(&id(10), &id(20), &id(25)));
    }

    #[test]
    fn test_between_wrapping_arc() {
        assert!(between_right_incl(&id(200), &id(20), &id(250)));
        assert!(between_right_incl(&id(200), &id(20), &id(5)));
        assert!(!between_right_incl(&id(200), &id(20), &id(100)));
        assert!(between(&id(200), &id(20), &id(0)));
        assert!(!between(&id(200), &id(20), &id(20)));
    }

    #[test]
    fn test_between_full_ring() {
        assert!(between_right_incl(&id(7), &id(7), &id(1)));
        assert!(between(&id(7), &id(7), &id(1)));
        assert!(!between(&id(7), &id(7), &id(7)));
    }

    #[test]
    fn test_arc_partition() {
        // Every point lies in exactly one of (a, b] and (b, a]
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..500 {
            let a = Id::new((0..4).map(|_| rng.gen_range(0..=255u8)).collect());
            let b = Id::new((0..4).map(|_| rng.gen_range(0..=255u8)).collect());
            let x = Id::new((0..4).map(|_| rng.gen_range(0..=255u8)).collect());
            if a == b {
                continue;
            }
            assert_ne!(between_right_incl(&a, &b, &x), between_right_incl(&b, &a, &x));
        }
    }

    #[test]
    fn test_bucket() {
        let x = Id::new(vec![0b1010_0000, 0xff]);
        assert_eq!(x.bucket(0), 0);
        assert_eq!(x.bucket(1), 1);
        assert_eq!(x.bucket(3), 0b101);
        assert_eq!(x.bucket(4), 0b1010);
    }

    #[test]
    fn test_hex_roundtrip() {
        let x = Id::new(vec![0xde, 0xad, 0xbe, 0xef, 0x01]);
        assert_eq!(x.to_hex(), "deadbeef01");
        assert_eq!(x.short(), "deadbeef");
        assert_eq!(Id::from_hex("deadbeef01").unwrap(), x);
    }
}
