//! Stable store: configuration-pinned metadata that survives restarts
//!
//! Holds the last known membership so a restarted node can rejoin without
//! a seed list. Written atomically (temp file + rename).

use crate::error::StoreResult;
use fidias_common::Node;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const STABLE_FILE: &str = "stable.json";

/// Persisted node metadata
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableState {
    /// Name of the local node
    pub node_name: String,
    /// Hash algorithm the cluster runs with
    pub hash: String,
    /// Last known members (including the local node)
    pub members: Vec<Node>,
    /// Unix nanos of the last save
    pub saved_at: u64,
}

/// File-backed stable store at `<data-dir>/stable.json`
#[derive(Debug, Clone)]
pub struct StableStore {
    path: PathBuf,
}

impl StableStore {
    /// Stable store inside `data_dir`
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir.as_ref().join(STABLE_FILE),
        }
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved state, `None` on first start
    pub fn load(&self) -> StoreResult<Option<StableState>> {
        match std::fs::read(&self.path) {
            Ok(buf) => Ok(Some(serde_json::from_slice(&buf)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Replace the saved state
    pub fn save(&self, state: &StableState) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(state)?)?;
        std::fs::rename(&tmp, &self.path)?;
        debug!(
            "Saved stable state with {} members to {}",
            state.members.len(),
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fidias_common::{HashAlgorithm, NodeMeta};

    #[test]
    fn test_missing_file_is_first_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = StableStore::new(dir.path());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = StableStore::new(dir.path());
        let hasher = HashAlgorithm::Sha256;
        let state = StableState {
            node_name: "n1".into(),
            hash: "sha256".into(),
            members: vec![Node::new(
                &hasher,
                "n1",
                "127.0.0.1:7000",
                NodeMeta::single("127.0.0.1:7000"),
            )],
            saved_at: 1,
        };
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
        assert!(!dir.path().join("stable.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("stable.json"), b"{not json").unwrap();
        assert!(StableStore::new(dir.path()).load().is_err());
    }
}
