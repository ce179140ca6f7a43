//! KV state machine
//!
//! Applies `KvSet`/`KvDel` entries of one namespace to an in-memory map.
//! A set of `a/b/c` also materializes the directories `a` and `a/b`,
//! stamped with the entry that created them.

use fidias_common::{Entry, Error, FLAG_DIR, Id, KvPair, Opcode, Result, normalize};
use fidias_wal::Fsm;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

/// Every proper directory prefix of a normalized key, shortest first
fn parents(key: &str) -> impl Iterator<Item = &str> {
    key.match_indices('/').map(move |(i, _)| &key[..i])
}

fn stamp(key: String, value: Vec<u8>, flags: u32, entry: &Entry, id: &Id) -> KvPair {
    KvPair {
        key,
        value,
        flags,
        modification: id.clone(),
        height: entry.height,
        ltime: entry.ltime,
        mod_time: entry.timestamp,
    }
}

pub struct KvFsm {
    namespace: Vec<u8>,
    pairs: RwLock<BTreeMap<String, KvPair>>,
}

impl KvFsm {
    #[must_use]
    pub fn new(namespace: impl Into<Vec<u8>>) -> Self {
        Self {
            namespace: namespace.into(),
            pairs: RwLock::new(BTreeMap::new()),
        }
    }

    /// Namespace prefix of every entry key this machine applies
    #[must_use]
    pub fn namespace(&self) -> &[u8] {
        &self.namespace
    }

    /// Log key of a KV key
    #[must_use]
    pub fn entry_key(&self, key: &str) -> Vec<u8> {
        let mut out = self.namespace.clone();
        out.extend_from_slice(normalize(key).as_bytes());
        out
    }

    fn kv_key(&self, entry: &Entry) -> Result<String> {
        let rest = entry.key.strip_prefix(self.namespace.as_slice()).ok_or_else(|| {
            Error::InvalidEntry(format!(
                "{} is outside the KV namespace",
                String::from_utf8_lossy(&entry.key)
            ))
        })?;
        let key = std::str::from_utf8(rest)
            .map_err(|_| Error::InvalidEntry("KV key is not UTF-8".into()))?;
        Ok(normalize(key))
    }

    pub fn get(&self, key: &str) -> Result<KvPair> {
        self.pairs
            .read()
            .get(&normalize(key))
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(key.to_string()))
    }

    /// Direct children of a directory; the empty prefix lists the root
    #[must_use]
    pub fn list(&self, prefix: &str) -> Vec<KvPair> {
        let dir = normalize(prefix);
        let start = if dir.is_empty() { String::new() } else { format!("{dir}/") };
        self.pairs
            .read()
            .range(start.clone()..)
            .take_while(|(k, _)| k.starts_with(&start))
            .filter(|(k, _)| !k[start.len()..].contains('/'))
            .map(|(_, v)| v.clone())
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.read().is_empty()
    }

    fn set(&self, key: String, entry: &Entry, id: &Id) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidEntry("empty KV key".into()));
        }
        let mut pairs = self.pairs.write();
        if pairs.get(&key).is_some_and(KvPair::is_dir) {
            return Err(Error::TypeChange(key));
        }
        if let Some(file) = parents(&key).find(|p| pairs.get(*p).is_some_and(|kv| !kv.is_dir())) {
            return Err(Error::TypeChange(file.to_string()));
        }
        for dir in parents(&key) {
            let kv = stamp(dir.to_string(), Vec::new(), FLAG_DIR, entry, id);
            pairs.insert(dir.to_string(), kv);
        }
        let value = entry.payload().to_vec();
        pairs.insert(key.clone(), stamp(key, value, 0, entry, id));
        Ok(())
    }

    fn delete(&self, key: &str) {
        if self.pairs.write().remove(key).is_none() {
            debug!("Delete of absent key {}", key);
        }
    }
}

impl Fsm for KvFsm {
    fn apply(&self, entry: &Entry, id: &Id) -> Result<()> {
        let key = self.kv_key(entry)?;
        match entry.opcode() {
            Some(Opcode::KvSet) => self.set(key, entry, id),
            Some(Opcode::KvDel) => {
                self.delete(&key);
                Ok(())
            }
            _ => Err(Error::InvalidEntry(format!(
                "opcode not handled by the KV machine for {key}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fidias_common::{HashAlgorithm, Hasher};

    fn entry(fsm: &KvFsm, key: &str, op: Opcode, value: &[u8], height: u64) -> (Entry, Id) {
        let hasher = HashAlgorithm::Sha256;
        let mut e = Entry::new(fsm.entry_key(key), hasher.zero(), height);
        e.set_operation(op, value);
        let id = e.id(&hasher);
        (e, id)
    }

    fn set(fsm: &KvFsm, key: &str, value: &[u8]) -> Result<Id> {
        let (e, id) = entry(fsm, key, Opcode::KvSet, value, 1);
        fsm.apply(&e, &id).map(|()| id)
    }

    #[test]
    fn test_slashes_name_the_same_key() {
        let fsm = KvFsm::new("kv/");
        set(&fsm, "/a//b/", b"v").unwrap();
        assert_eq!(fsm.get("a/b").unwrap().value, b"v");
        assert_eq!(fsm.entry_key("/a//b/"), fsm.entry_key("a/b"));
    }

    #[test]
    fn test_set_materializes_directories() {
        let fsm = KvFsm::new("kv/");
        let id = set(&fsm, "a/b/c", b"x").unwrap();
        let file = fsm.get("a/b/c").unwrap();
        assert_eq!(file.value, b"x");
        assert!(!file.is_dir());
        for dir in ["a", "a/b"] {
            let kv = fsm.get(dir).unwrap();
            assert!(kv.is_dir());
            assert_eq!(kv.modification, id);
            assert_eq!(kv.height, 1);
        }
        assert_eq!(fsm.len(), 3);
    }

    #[test]
    fn test_type_change_refused() {
        let fsm = KvFsm::new("kv/");
        set(&fsm, "a/b", b"file").unwrap();
        // a/b is a file, so it cannot become a directory
        assert!(matches!(set(&fsm, "a/b/c", b"x"), Err(Error::TypeChange(k)) if k == "a/b"));
        // a is a directory, so it cannot become a file
        assert!(matches!(set(&fsm, "a", b"x"), Err(Error::TypeChange(k)) if k == "a"));
        assert_eq!(fsm.get("a/b").unwrap().value, b"file");
        assert!(fsm.get("a/b/c").is_err());
    }

    #[test]
    fn test_delete() {
        let fsm = KvFsm::new("kv/");
        set(&fsm, "d/k", b"v").unwrap();
        let (e, id) = entry(&fsm, "d/k", Opcode::KvDel, b"", 2);
        fsm.apply(&e, &id).unwrap();
        assert!(fsm.get("d/k").unwrap_err().is_not_found());
        assert!(fsm.get("d").unwrap().is_dir());
        // deleting again is harmless
        fsm.apply(&e, &id).unwrap();
    }

    #[test]
    fn test_list_direct_children() {
        let fsm = KvFsm::new("kv/");
        set(&fsm, "a/b/c", b"1").unwrap();
        set(&fsm, "a/x", b"2").unwrap();
        set(&fsm, "ab", b"3").unwrap();
        let names: Vec<String> = fsm.list("a").into_iter().map(|kv| kv.key).collect();
        assert_eq!(names, vec!["a/b", "a/x"]);
        let root: Vec<String> = fsm.list("/").into_iter().map(|kv| kv.key).collect();
        assert_eq!(root, vec!["a", "ab"]);
    }

    #[test]
    fn test_foreign_namespace_refused() {
        let fsm = KvFsm::new("kv/");
        let hasher = HashAlgorithm::Sha256;
        let mut e = Entry::new(b"fs/file".to_vec(), hasher.zero(), 1);
        e.set_operation(Opcode::KvSet, b"v");
        assert!(matches!(fsm.apply(&e, &e.id(&hasher)), Err(Error::InvalidEntry(_))));
        let (fs, id) = entry(&fsm, "k", Opcode::FsSet, b"v", 1);
        assert!(matches!(fsm.apply(&fs, &id), Err(Error::InvalidEntry(_))));
    }
}
