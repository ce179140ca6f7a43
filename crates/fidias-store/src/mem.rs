//! In-memory log store
//!
//! Keys live in a sharded map; each shard lock doubles as the per-key append
//! lock, so an entry and its index change become visible together.

use crate::{Appended, LogStore, check_append, check_rebase};
use dashmap::DashMap;
use fidias_common::{Entry, Error, Id, KeyIndex, Result, SharedHasher};
use std::collections::HashMap;

#[derive(Debug, Default)]
struct KeyLog {
    entries: HashMap<Id, Entry>,
    /// Chain ids by height - 1
    chain: Vec<Id>,
    marker: Option<Id>,
}

impl KeyLog {
    fn index(&self, width: usize) -> KeyIndex {
        KeyIndex {
            last: self.chain.last().cloned().unwrap_or_else(|| Id::zero(width)),
            height: self.chain.len() as u64,
            marker: self.marker.clone(),
        }
    }
}

/// Volatile [`LogStore`]
pub struct MemLogStore {
    hasher: SharedHasher,
    keys: DashMap<Vec<u8>, KeyLog>,
}

impl MemLogStore {
    /// Create an empty store
    #[must_use]
    pub fn new(hasher: SharedHasher) -> Self {
        Self {
            hasher,
            keys: DashMap::new(),
        }
    }
}

impl LogStore for MemLogStore {
    fn width(&self) -> usize {
        self.hasher.size()
    }

    fn get_entry(&self, key: &[u8], id: &Id) -> Result<Entry> {
        self.keys
            .get(key)
            .and_then(|log| log.entries.get(id).cloned())
            .ok_or_else(|| Error::EntryNotFound {
                key: String::from_utf8_lossy(key).into_owned(),
                id: id.to_hex(),
            })
    }

    fn entry_at(&self, key: &[u8], height: u64) -> Result<Option<Entry>> {
        let Some(log) = self.keys.get(key) else {
            return Ok(None);
        };
        let Some(pos) = height.checked_sub(1).and_then(|p| usize::try_from(p).ok()) else {
            return Ok(None);
        };
        Ok(log
            .chain
            .get(pos)
            .and_then(|id| log.entries.get(id))
            .cloned())
    }

    fn index(&self, key: &[u8]) -> Result<Option<KeyIndex>> {
        Ok(self.keys.get(key).map(|log| log.index(self.width())))
    }

    fn append(&self, entry: &Entry) -> Result<Appended> {
        let width = self.width();
        let id = entry.id(self.hasher.as_ref());
        let mut log = self.keys.entry(entry.key.clone()).or_default();
        let idx = log.index(width);
        let at_height = usize::try_from(entry.height)
            .ok()
            .and_then(|h| h.checked_sub(1))
            .and_then(|p| log.chain.get(p));
        let outcome = check_append(&entry.key, &idx, entry, at_height, &id)?;
        if outcome == Appended::New {
            log.entries.insert(id.clone(), entry.clone());
            log.chain.push(id);
        }
        Ok(outcome)
    }

    fn rebase(&self, key: &[u8], entries: &[Entry]) -> Result<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        check_rebase(self, key, entries, self.hasher.as_ref())?;
        let keep = usize::try_from(first.height - 1).unwrap_or(usize::MAX);
        let mut log = self.keys.entry(key.to_vec()).or_default();
        let attaches = match keep.checked_sub(1) {
            None => true,
            Some(below) => log.chain.get(below) == Some(&first.previous),
        };
        if !attaches {
            return Err(Error::mismatch(key));
        }
        log.chain.truncate(keep);
        for e in entries {
            let id = e.id(self.hasher.as_ref());
            log.entries.insert(id.clone(), e.clone());
            log.chain.push(id);
        }
        Ok(())
    }

    fn set_marker(&self, key: &[u8], marker: Id) -> Result<KeyIndex> {
        let mut log = self.keys.entry(key.to_vec()).or_default();
        log.marker = Some(marker);
        Ok(log.index(self.width()))
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        let mut keys: Vec<_> = self.keys.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }
}
