//! Pluggable hash function
//!
//! SHA-256 is the default; SHA-1 is accepted for compatibility with older
//! clusters. All nodes of a cluster must agree on the algorithm.

use crate::id::Id;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Hash function contract used for ids, replica derivation and block addressing
pub trait Hasher: Send + Sync + fmt::Debug {
    /// Algorithm name as it appears in configuration
    fn name(&self) -> &'static str;

    /// Output width in bytes
    fn size(&self) -> usize;

    /// Hash a sequence of byte slices as if they were concatenated
    fn hash_parts(&self, parts: &[&[u8]]) -> Id;

    /// Hash a single buffer
    fn hash(&self, data: &[u8]) -> Id {
        self.hash_parts(&[data])
    }

    /// Zero marker of this hasher's width
    fn zero(&self) -> Id {
        Id::zero(self.size())
    }

    /// Canonical replica derivation: replica `i` is `H(h || i)`.
    fn replica_hashes(&self, key_hash: &Id, replicas: usize) -> Vec<Id> {
        (0..replicas)
            .map(|i| {
                let idx = [u8::try_from(i).unwrap_or(u8::MAX)];
                self.hash_parts(&[key_hash.as_bytes(), &idx])
            })
            .collect()
    }
}

/// Shared handle to the configured hasher
pub type SharedHasher = Arc<dyn Hasher>;

/// Built-in hash algorithms
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// SHA-256 (32 bytes)
    #[default]
    Sha256,
    /// SHA-1 (20 bytes)
    Sha1,
}

impl HashAlgorithm {
    /// Box this algorithm as a shared hasher
    #[must_use]
    pub fn shared(self) -> SharedHasher {
        Arc::new(self)
    }
}

impl Hasher for HashAlgorithm {
    fn name(&self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha1 => "sha1",
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::Sha256 => 32,
            Self::Sha1 => 20,
        }
    }

    fn hash_parts(&self, parts: &[&[u8]]) -> Id {
        match self {
            Self::Sha256 => {
                let mut h = Sha256::new();
                for p in parts {
                    h.update(p);
                }
                Id::new(h.finalize().to_vec())
            }
            Self::Sha1 => {
                let mut h = Sha1::new();
                for p in parts {
                    h.update(p);
                }
                Id::new(h.finalize().to_vec())
            }
        }
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256" | "sha-256" => Ok(Self::Sha256),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            other => Err(format!("unsupported hash function: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(HashAlgorithm::Sha256.hash(b"abc").len(), 32);
        assert_eq!(HashAlgorithm::Sha1.hash(b"abc").len(), 20);
        assert!(HashAlgorithm::Sha256.zero().is_zero());
    }

    #[test]
    fn test_known_digest() {
        let h = HashAlgorithm::Sha256.hash(b"abc");
        assert_eq!(
            h.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_hash_parts_matches_concat() {
        let hasher = HashAlgorithm::Sha256;
        assert_eq!(hasher.hash_parts(&[b"ab", b"c"]), hasher.hash(b"abc"));
    }

    #[test]
    fn test_replica_hashes_deterministic_and_distinct() {
        let hasher = HashAlgorithm::Sha256;
        let key = hasher.hash(b"some/key");
        let a = hasher.replica_hashes(&key, 3);
        let b = hasher.replica_hashes(&key, 3);
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        assert_ne!(a[0], a[1]);
        assert_ne!(a[1], a[2]);
    }

    #[test]
    fn test_parse() {
        assert_eq!("SHA256".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha256));
        assert_eq!("sha1".parse::<HashAlgorithm>(), Ok(HashAlgorithm::Sha1));
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }
}
