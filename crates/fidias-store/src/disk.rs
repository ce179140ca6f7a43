//! Disk-backed log store using redb.
//!
//! Entries go to `<data-dir>/log/entry`, the index and chain tables to
//! `<data-dir>/log/index`. An entry is written before the index transaction
//! that makes it reachable, so a crash in between leaves an unreachable
//! entry and never a dangling index.

use crate::error::StoreResult;
use crate::tables::{self, CHAIN, ENTRIES, INDEX};
use crate::{Appended, LogStore, StoreError, check_append, check_rebase};
use fidias_common::checksum;
use fidias_common::{Entry, Error, Id, KeyIndex, Result, SharedHasher};
use parking_lot::Mutex;
use redb::{Database, ReadableTable};
use std::path::Path;
use tracing::info;

const STRIPES: usize = 64;

/// Persistent [`LogStore`] backed by redb
pub struct DiskLogStore {
    hasher: SharedHasher,
    entries: Database,
    index: Database,
    stripes: Vec<Mutex<()>>,
}

impl DiskLogStore {
    /// Open (or create) the log databases under `data_dir`
    pub fn open(data_dir: impl AsRef<Path>, hasher: SharedHasher) -> StoreResult<Self> {
        let log_dir = data_dir.as_ref().join("log");
        let entry_dir = log_dir.join("entry");
        let index_dir = log_dir.join("index");
        std::fs::create_dir_all(&entry_dir)?;
        std::fs::create_dir_all(&index_dir)?;

        let entries = Database::create(entry_dir.join("entries.redb"))?;
        let index = Database::create(index_dir.join("index.redb"))?;

        // Create all tables eagerly so later read txns don't fail
        let txn = entries.begin_write()?;
        {
            let _t = txn.open_table(ENTRIES)?;
        }
        txn.commit()?;
        let txn = index.begin_write()?;
        {
            let _t = txn.open_table(INDEX)?;
            let _t = txn.open_table(CHAIN)?;
        }
        txn.commit()?;

        info!("Opened log store at {}", log_dir.display());
        Ok(Self {
            hasher,
            entries,
            index,
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        })
    }

    fn stripe(&self, key: &[u8]) -> &Mutex<()> {
        &self.stripes[checksum::stripe(key, STRIPES)]
    }

    fn read_entry(&self, key: &[u8], id: &Id) -> StoreResult<Option<Entry>> {
        let txn = self.entries.begin_read()?;
        let table = txn.open_table(ENTRIES)?;
        let k = tables::composite(key, id.as_bytes());
        match table.get(k.as_slice())? {
            Some(v) => Entry::decode(v.value())
                .map(Some)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Ok(None),
        }
    }

    fn write_entry(&self, key: &[u8], id: &Id, entry: &Entry) -> StoreResult<()> {
        let txn = self.entries.begin_write()?;
        {
            let mut table = txn.open_table(ENTRIES)?;
            let k = tables::composite(key, id.as_bytes());
            table.insert(k.as_slice(), entry.encode().as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn read_index(&self, key: &[u8]) -> StoreResult<Option<KeyIndex>> {
        let txn = self.index.begin_read()?;
        let table = txn.open_table(INDEX)?;
        match table.get(key)? {
            Some(v) => KeyIndex::decode(v.value())
                .map(Some)
                .map_err(|e| StoreError::Corrupt(e.to_string())),
            None => Ok(None),
        }
    }

    fn chain_id(&self, key: &[u8], height: u64) -> StoreResult<Option<Id>> {
        if height == 0 {
            return Ok(None);
        }
        let txn = self.index.begin_read()?;
        let table = txn.open_table(CHAIN)?;
        let k = tables::chain_key(key, height);
        Ok(table.get(k.as_slice())?.map(|v| Id::from_slice(v.value())))
    }

    /// Write the index and chain links in one transaction, dropping links
    /// above `idx.height` up to `old_height`
    fn commit_index(
        &self,
        key: &[u8],
        idx: &KeyIndex,
        links: &[(u64, Id)],
        old_height: u64,
    ) -> StoreResult<()> {
        let txn = self.index.begin_write()?;
        {
            let mut chain = txn.open_table(CHAIN)?;
            for (height, id) in links {
                let k = tables::chain_key(key, *height);
                chain.insert(k.as_slice(), id.as_bytes())?;
            }
            for height in idx.height + 1..=old_height {
                let k = tables::chain_key(key, height);
                chain.remove(k.as_slice())?;
            }
            let mut index = txn.open_table(INDEX)?;
            index.insert(key, idx.encode().as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    fn list_keys(&self) -> StoreResult<Vec<Vec<u8>>> {
        let txn = self.index.begin_read()?;
        let table = txn.open_table(INDEX)?;
        let mut keys = Vec::new();
        for item in table.iter()? {
            let (k, _) = item?;
            keys.push(k.value().to_vec());
        }
        Ok(keys)
    }
}

impl LogStore for DiskLogStore {
    fn width(&self) -> usize {
        self.hasher.size()
    }

    fn get_entry(&self, key: &[u8], id: &Id) -> Result<Entry> {
        self.read_entry(key, id)?.ok_or_else(|| Error::EntryNotFound {
            key: String::from_utf8_lossy(key).into_owned(),
            id: id.to_hex(),
        })
    }

    fn entry_at(&self, key: &[u8], height: u64) -> Result<Option<Entry>> {
        match self.chain_id(key, height)? {
            Some(id) => Ok(self.read_entry(key, &id)?),
            None => Ok(None),
        }
    }

    fn index(&self, key: &[u8]) -> Result<Option<KeyIndex>> {
        Ok(self.read_index(key)?)
    }

    fn append(&self, entry: &Entry) -> Result<Appended> {
        let id = entry.id(self.hasher.as_ref());
        let _guard = self.stripe(&entry.key).lock();
        let idx = self.index_or_empty(&entry.key)?;
        let at_height = self.chain_id(&entry.key, entry.height)?;
        let outcome = check_append(&entry.key, &idx, entry, at_height.as_ref(), &id)?;
        if outcome == Appended::New {
            self.write_entry(&entry.key, &id, entry)?;
            let next = KeyIndex {
                last: id.clone(),
                height: entry.height,
                marker: idx.marker,
            };
            self.commit_index(&entry.key, &next, &[(entry.height, id)], idx.height)?;
        }
        Ok(outcome)
    }

    fn rebase(&self, key: &[u8], entries: &[Entry]) -> Result<()> {
        let Some(last) = entries.last() else {
            return Ok(());
        };
        let _guard = self.stripe(key).lock();
        check_rebase(self, key, entries, self.hasher.as_ref())?;
        let idx = self.index_or_empty(key)?;
        let mut links = Vec::with_capacity(entries.len());
        for e in entries {
            let id = e.id(self.hasher.as_ref());
            self.write_entry(key, &id, e)?;
            links.push((e.height, id));
        }
        let next = KeyIndex {
            last: last.id(self.hasher.as_ref()),
            height: last.height,
            marker: idx.marker,
        };
        self.commit_index(key, &next, &links, idx.height)?;
        Ok(())
    }

    fn set_marker(&self, key: &[u8], marker: Id) -> Result<KeyIndex> {
        let _guard = self.stripe(key).lock();
        let mut idx = self.index_or_empty(key)?;
        idx.marker = Some(marker);
        self.commit_index(key, &idx, &[], idx.height)?;
        Ok(idx)
    }

    fn keys(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self.list_keys()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conformance;
    use fidias_common::HashAlgorithm;

    fn open(dir: &Path) -> DiskLogStore {
        DiskLogStore::open(dir, HashAlgorithm::Sha256.shared()).unwrap()
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        conformance::append_and_read(&open(dir.path()));
    }

    #[test]
    fn test_duplicates_and_mismatches() {
        let dir = tempfile::tempdir().unwrap();
        conformance::duplicates_and_mismatches(&open(dir.path()));
    }

    #[test]
    fn test_walk_after() {
        let dir = tempfile::tempdir().unwrap();
        conformance::walk_after(&open(dir.path()));
    }

    #[test]
    fn test_rebase() {
        let dir = tempfile::tempdir().unwrap();
        conformance::rebase_replaces_tail(&open(dir.path()));
    }

    #[test]
    fn test_markers() {
        let dir = tempfile::tempdir().unwrap();
        conformance::markers(&open(dir.path()));
    }

    #[test]
    fn test_layout_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let entries = conformance::chain(b"p", 2, 0);
        {
            let store = open(dir.path());
            for e in &entries {
                store.append(e).unwrap();
            }
        }
        assert!(dir.path().join("log/entry").is_dir());
        assert!(dir.path().join("log/index").is_dir());
        let store = open(dir.path());
        let idx = store.index(b"p").unwrap().unwrap();
        assert_eq!(idx.height, 2);
        assert_eq!(idx.last, entries[1].id(&HashAlgorithm::Sha256));
        assert_eq!(store.last_entry(b"p").unwrap(), entries[1]);
    }
}
