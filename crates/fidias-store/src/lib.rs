//! Fidias Store - per-key entry logs
//!
//! Each key owns an append-only chain of entries linked by previous-id, plus
//! an index holding the chain tail, its height and the relocation marker.
//! Two backends implement the same [`LogStore`] contract:
//!
//! - [`MemLogStore`]: striped in-memory map, used for tests and the
//!   `memory` storage backend
//! - [`DiskLogStore`]: redb databases under `<data-dir>/log/entry` and
//!   `<data-dir>/log/index`
//!
//! Appends are serialized per key; an entry and the index update that makes
//! it reachable are applied together.

pub mod disk;
pub mod error;
pub mod mem;
pub mod stable;
mod tables;

pub use disk::DiskLogStore;
pub use error::{StoreError, StoreResult};
pub use mem::MemLogStore;
pub use stable::{StableState, StableStore};

use fidias_common::{Entry, Error, Id, KeyIndex, Result};
use std::sync::Arc;

/// Result of an append
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Appended {
    /// The entry extended the chain
    New,
    /// The entry was already the chain element at its height
    Duplicate,
}

/// Per-key entry log contract
pub trait LogStore: Send + Sync {
    /// Width of ids in this store (hash output size)
    fn width(&self) -> usize;

    /// Entry by id
    fn get_entry(&self, key: &[u8], id: &Id) -> Result<Entry>;

    /// Entry on the current chain at `height` (1-based)
    fn entry_at(&self, key: &[u8], height: u64) -> Result<Option<Entry>>;

    /// Index of a key, `None` when the key was never seen
    fn index(&self, key: &[u8]) -> Result<Option<KeyIndex>>;

    /// Append the next entry of a key's chain.
    ///
    /// Fails with `PreviousHashMismatch` unless the entry follows the
    /// current tail. Appending the entry already at its height is a no-op.
    fn append(&self, entry: &Entry) -> Result<Appended>;

    /// Replace the chain from `entries[0].height` onward.
    ///
    /// `entries` must be contiguous and `entries[0]` must follow the local
    /// entry at the height below it.
    fn rebase(&self, key: &[u8], entries: &[Entry]) -> Result<()>;

    /// Record the tail id advertised by a relocating owner
    fn set_marker(&self, key: &[u8], marker: Id) -> Result<KeyIndex>;

    /// Every key with an index
    fn keys(&self) -> Result<Vec<Vec<u8>>>;

    /// Last entry of a key's chain
    fn last_entry(&self, key: &[u8]) -> Result<Entry> {
        match self.index(key)? {
            Some(idx) if idx.height > 0 => self.get_entry(key, &idx.last),
            _ => Err(Error::key_not_found(key)),
        }
    }

    /// Index of a key, or the empty index
    fn index_or_empty(&self, key: &[u8]) -> Result<KeyIndex> {
        Ok(self
            .index(key)?
            .unwrap_or_else(|| KeyIndex::empty(self.width())))
    }

    /// Up to `limit` chain entries after `after` (exclusive); the zero id
    /// starts from height 1
    fn entries_after(&self, key: &[u8], after: &Id, limit: usize) -> Result<Vec<Entry>> {
        let start = if after.is_zero() {
            1
        } else {
            self.get_entry(key, after)?.height + 1
        };
        let idx = self.index_or_empty(key)?;
        let mut out = Vec::new();
        let mut height = start;
        while height <= idx.height && out.len() < limit {
            match self.entry_at(key, height)? {
                Some(e) => out.push(e),
                None => break,
            }
            height += 1;
        }
        Ok(out)
    }
}

/// Shared handle to a log store
pub type SharedLogStore = Arc<dyn LogStore>;

/// Check whether `entry` may extend `(idx, current)`
pub(crate) fn check_append(
    key: &[u8],
    idx: &KeyIndex,
    entry: &Entry,
    at_height: Option<&Id>,
    entry_id: &Id,
) -> Result<Appended> {
    if at_height == Some(entry_id) {
        return Ok(Appended::Duplicate);
    }
    if entry.follows(&idx.last, idx.height) {
        Ok(Appended::New)
    } else {
        Err(Error::mismatch(key))
    }
}

/// Validate a replacement chain against the local entry below it
pub(crate) fn check_rebase(
    store: &dyn LogStore,
    key: &[u8],
    entries: &[Entry],
    hasher: &dyn fidias_common::Hasher,
) -> Result<()> {
    let Some(first) = entries.first() else {
        return Ok(());
    };
    if first.height == 0 {
        return Err(Error::InvalidEntry("height 0".into()));
    }
    let base = if first.height == 1 {
        Id::zero(store.width())
    } else {
        store
            .entry_at(key, first.height - 1)?
            .map(|e| e.id(hasher))
            .ok_or_else(|| Error::mismatch(key))?
    };
    if !first.follows(&base, first.height - 1) {
        return Err(Error::mismatch(key));
    }
    for pair in entries.windows(2) {
        if !pair[1].follows(&pair[0].id(hasher), pair[0].height) {
            return Err(Error::InvalidEntry("replacement chain is not contiguous".into()));
        }
    }
    if entries.iter().any(|e| e.key != key) {
        return Err(Error::InvalidEntry("replacement chain mixes keys".into()));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Behaviour every backend must share

    use super::*;
    use fidias_common::{HashAlgorithm, Hasher, Opcode};

    pub fn chain(key: &[u8], n: u64, salt: u8) -> Vec<Entry> {
        let hasher = HashAlgorithm::Sha256;
        let mut prev = Id::zero(32);
        let mut out = Vec::new();
        for h in 1..=n {
            let mut e = Entry::new(key.to_vec(), prev.clone(), h);
            e.timestamp = h;
            e.set_operation(Opcode::KvSet, &[salt, u8::try_from(h).unwrap()]);
            prev = e.id(&hasher);
            out.push(e);
        }
        out
    }

    pub fn append_and_read(store: &dyn LogStore) {
        let hasher = HashAlgorithm::Sha256;
        assert!(store.index(b"k").unwrap().is_none());
        assert!(matches!(store.last_entry(b"k"), Err(Error::KeyNotFound(_))));
        let entries = chain(b"k", 3, 0);
        for e in &entries {
            assert_eq!(store.append(e).unwrap(), Appended::New);
        }
        let idx = store.index(b"k").unwrap().unwrap();
        assert_eq!(idx.height, 3);
        assert_eq!(idx.last, entries[2].id(&hasher));
        assert_eq!(store.last_entry(b"k").unwrap(), entries[2]);
        assert_eq!(
            store.get_entry(b"k", &entries[1].id(&hasher)).unwrap(),
            entries[1]
        );
        assert!(matches!(
            store.get_entry(b"k", &hasher.hash(b"nope")),
            Err(Error::EntryNotFound { .. })
        ));
        assert_eq!(store.keys().unwrap(), vec![b"k".to_vec()]);
    }

    pub fn duplicates_and_mismatches(store: &dyn LogStore) {
        let entries = chain(b"d", 2, 0);
        store.append(&entries[0]).unwrap();
        assert_eq!(store.append(&entries[0]).unwrap(), Appended::Duplicate);
        // skipping a height is a gap
        let gap = chain(b"d", 3, 0);
        assert!(matches!(
            store.append(&gap[2]),
            Err(Error::PreviousHashMismatch(_))
        ));
        // a sibling at height 1 conflicts
        let fork = chain(b"d", 1, 9);
        assert!(matches!(
            store.append(&fork[0]),
            Err(Error::PreviousHashMismatch(_))
        ));
        store.append(&entries[1]).unwrap();
        assert_eq!(store.index(b"d").unwrap().unwrap().height, 2);
    }

    pub fn walk_after(store: &dyn LogStore) {
        let hasher = HashAlgorithm::Sha256;
        let entries = chain(b"w", 5, 0);
        for e in &entries {
            store.append(e).unwrap();
        }
        let all = store.entries_after(b"w", &Id::zero(32), 100).unwrap();
        assert_eq!(all, entries);
        let tail = store
            .entries_after(b"w", &entries[2].id(&hasher), 100)
            .unwrap();
        assert_eq!(tail, entries[3..].to_vec());
        let limited = store.entries_after(b"w", &Id::zero(32), 2).unwrap();
        assert_eq!(limited.len(), 2);
        assert!(store
            .entries_after(b"w", &entries[4].id(&hasher), 10)
            .unwrap()
            .is_empty());
    }

    pub fn rebase_replaces_tail(store: &dyn LogStore) {
        let hasher = HashAlgorithm::Sha256;
        let ours = chain(b"r", 3, 0);
        for e in &ours {
            store.append(e).unwrap();
        }
        // a competing chain sharing height 1
        let mut theirs = vec![ours[0].clone()];
        let mut prev = ours[0].id(&hasher);
        for h in 2..=4 {
            let mut e = Entry::new(b"r".to_vec(), prev.clone(), h);
            e.set_operation(Opcode::KvSet, &[7, u8::try_from(h).unwrap()]);
            prev = e.id(&hasher);
            theirs.push(e);
        }
        store.rebase(b"r", &theirs[1..]).unwrap();
        let idx = store.index(b"r").unwrap().unwrap();
        assert_eq!(idx.height, 4);
        assert_eq!(idx.last, theirs[3].id(&hasher));
        assert_eq!(store.entry_at(b"r", 2).unwrap().unwrap(), theirs[1]);
        // a chain that doesn't attach is refused
        let orphan = chain(b"r", 6, 3);
        assert!(store.rebase(b"r", &orphan[4..]).is_err());
    }

    pub fn markers(store: &dyn LogStore) {
        let marker = Id::new(vec![5; 32]);
        let idx = store.set_marker(b"m", marker.clone()).unwrap();
        assert_eq!(idx.height, 0);
        assert_eq!(idx.marker, Some(marker));
        assert!(!idx.caught_up());
        let entries = chain(b"m", 1, 0);
        store.append(&entries[0]).unwrap();
        assert!(store.index(b"m").unwrap().unwrap().marker.is_some());
    }
}
