//! Fidias Common - Shared types and utilities
//!
//! This crate provides the identifiers, data model, error taxonomy and
//! configuration shared by every Fidias component.

pub mod block;
pub mod checksum;
pub mod clock;
pub mod config;
pub mod entry;
pub mod error;
pub mod hasher;
pub mod id;
pub mod types;

pub use block::{Block, BlockKind};
pub use clock::LamportClock;
pub use config::Config;
pub use entry::{Entry, KeyIndex, Opcode};
pub use error::{Error, ErrorCode, Result, WireError};
pub use hasher::{HashAlgorithm, Hasher, SharedHasher};
pub use id::Id;
pub use types::*;

/// Current wall-clock time in nanoseconds since the Unix epoch
#[must_use]
pub fn now_nanos() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

/// Strip surrounding slashes and collapse empty segments of a key or file
/// name
#[must_use]
pub fn normalize(path: &str) -> String {
    path.split('/').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a//b/c/"), "a/b/c");
        assert_eq!(normalize("a"), "a");
        assert_eq!(normalize("/"), "");
        assert_eq!(normalize("//"), "");
    }
}
