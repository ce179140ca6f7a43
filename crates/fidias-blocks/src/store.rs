//! Local block stores

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fidias_common::{Block, Error, Id, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Storage contract for blocks held by this node
pub trait BlockStore: Send + Sync {
    /// Store a block under `id`; `BlockExists` when it is already held
    fn put(&self, id: &Id, block: &Block) -> Result<()>;

    /// Block by id; `BlockNotFound` when absent
    fn get(&self, id: &Id) -> Result<Block>;

    /// Remove a block; `BlockNotFound` when absent
    fn remove(&self, id: &Id) -> Result<()>;

    fn contains(&self, id: &Id) -> Result<bool>;

    /// Number of blocks held
    fn len(&self) -> Result<usize>;
}

pub type SharedBlockStore = Arc<dyn BlockStore>;

/// In-memory store
#[derive(Default)]
pub struct MemBlockStore {
    blocks: DashMap<Id, Block>,
}

impl MemBlockStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BlockStore for MemBlockStore {
    fn put(&self, id: &Id, block: &Block) -> Result<()> {
        match self.blocks.entry(id.clone()) {
            Entry::Occupied(_) => Err(Error::BlockExists(id.to_hex())),
            Entry::Vacant(v) => {
                v.insert(block.clone());
                Ok(())
            }
        }
    }

    fn get(&self, id: &Id) -> Result<Block> {
        self.blocks
            .get(id)
            .map(|b| b.clone())
            .ok_or_else(|| Error::BlockNotFound(id.to_hex()))
    }

    fn remove(&self, id: &Id) -> Result<()> {
        self.blocks
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::BlockNotFound(id.to_hex()))
    }

    fn contains(&self, id: &Id) -> Result<bool> {
        Ok(self.blocks.contains_key(id))
    }

    fn len(&self) -> Result<usize> {
        Ok(self.blocks.len())
    }
}

/// One file per block under `<data-dir>/blocks/<hex-id>`
pub struct FileBlockStore {
    dir: PathBuf,
}

impl FileBlockStore {
    /// Open (creating) the block directory under `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        let dir = data_dir.join("blocks");
        fs::create_dir_all(&dir)?;
        debug!("Block store at {}", dir.display());
        Ok(Self { dir })
    }

    fn path(&self, id: &Id) -> PathBuf {
        self.dir.join(id.to_hex())
    }
}

fn not_found(id: &Id, err: std::io::Error) -> Error {
    if err.kind() == ErrorKind::NotFound {
        Error::BlockNotFound(id.to_hex())
    } else {
        Error::Io(err)
    }
}

impl BlockStore for FileBlockStore {
    fn put(&self, id: &Id, block: &Block) -> Result<()> {
        let path = self.path(id);
        if path.exists() {
            return Err(Error::BlockExists(id.to_hex()));
        }
        // write-then-rename so readers never see a partial block
        let tmp = self.dir.join(format!(".{}.tmp", id.to_hex()));
        fs::write(&tmp, block.to_bytes())?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, id: &Id) -> Result<Block> {
        let buf = fs::read(self.path(id)).map_err(|e| not_found(id, e))?;
        Block::from_bytes(&buf)
    }

    fn remove(&self, id: &Id) -> Result<()> {
        fs::remove_file(self.path(id)).map_err(|e| not_found(id, e))
    }

    fn contains(&self, id: &Id) -> Result<bool> {
        Ok(self.path(id).exists())
    }

    fn len(&self) -> Result<usize> {
        let mut n = 0;
        for entry in fs::read_dir(&self.dir)? {
            if !entry?.file_name().to_string_lossy().starts_with('.') {
                n += 1;
            }
        }
        Ok(n)
    }
}
