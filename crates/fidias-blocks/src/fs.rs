//! File layer: named, versioned block trees over the replicated log
//!
//! Each path is one log key in the FS namespace. Its entries carry the
//! marshaled [`VersionedFile`]; the `active` alias is the visible version.
//! Edits are compare-and-set against the entry the file was opened from.

use crate::device::BlockDevice;
use crate::file::{ACTIVE, VersionedFile};
use crate::index::IndexBlock;
use crate::shard::{Assembler, FileInfo, Sharder};
use fidias_client::RpcClient;
use fidias_common::config::BlockConfig;
use fidias_common::{Entry, Error, Id, Opcode, Result, WriteOptions, normalize};
use fidias_proto::{Request, Response};
use fidias_wal::{Fsm, Wal};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Applied state of one file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileRecord {
    pub file: VersionedFile,
    /// Entry that produced this state
    pub modification: Id,
    pub height: u64,
}

/// State machine for `FsSet`/`FsDel` entries of one namespace
pub struct FsFsm {
    namespace: Vec<u8>,
    files: RwLock<BTreeMap<String, FileRecord>>,
}

impl FsFsm {
    #[must_use]
    pub fn new(namespace: impl Into<Vec<u8>>) -> Self {
        Self {
            namespace: namespace.into(),
            files: RwLock::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn entry_key(&self, name: &str) -> Vec<u8> {
        let mut out = self.namespace.clone();
        out.extend_from_slice(normalize(name).as_bytes());
        out
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<FileRecord> {
        self.files.read().get(&normalize(name)).cloned()
    }

    /// Applied file names
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }

    fn name_of(&self, entry: &Entry) -> Result<String> {
        let rest = entry
            .key
            .strip_prefix(self.namespace.as_slice())
            .ok_or_else(|| Error::InvalidEntry("entry outside the FS namespace".into()))?;
        std::str::from_utf8(rest)
            .map(normalize)
            .map_err(|_| Error::InvalidEntry("file name is not UTF-8".into()))
    }
}

impl Fsm for FsFsm {
    fn apply(&self, entry: &Entry, id: &Id) -> Result<()> {
        let name = self.name_of(entry)?;
        match entry.opcode() {
            Some(Opcode::FsSet) => {
                let file = VersionedFile::unmarshal(entry.payload())?;
                let record = FileRecord {
                    file,
                    modification: id.clone(),
                    height: entry.height,
                };
                self.files.write().insert(name, record);
                Ok(())
            }
            Some(Opcode::FsDel) => {
                self.files.write().remove(&name);
                Ok(())
            }
            _ => Err(Error::InvalidEntry(format!(
                "opcode not handled by the FS machine for {name}"
            ))),
        }
    }
}

/// Writable file handle
#[derive(Debug)]
pub struct FileWriter {
    file: VersionedFile,
    /// Entry the handle was opened from; `None` for a new file
    base: Option<Entry>,
}

impl FileWriter {
    #[must_use]
    pub const fn file(&self) -> &VersionedFile {
        &self.file
    }
}

/// Readable file handle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileReader {
    pub name: String,
    pub root: Id,
    pub size: u64,
    pub blocks: u64,
}

/// File metadata
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub name: String,
    pub versions: BTreeMap<String, Id>,
    /// Size of the active version
    pub size: u64,
    /// Data blocks of the active version
    pub blocks: u64,
    pub modification: Id,
    pub height: u64,
}

pub struct FileSystem {
    wal: Arc<Wal>,
    fsm: Arc<FsFsm>,
    device: Arc<BlockDevice>,
    client: RpcClient,
    config: BlockConfig,
    options: WriteOptions,
}

impl FileSystem {
    #[must_use]
    pub fn new(
        wal: Arc<Wal>,
        fsm: Arc<FsFsm>,
        device: Arc<BlockDevice>,
        config: BlockConfig,
        options: WriteOptions,
    ) -> Self {
        let client = wal.client().clone();
        Self {
            wal,
            fsm,
            device,
            client,
            config,
            options,
        }
    }

    #[must_use]
    pub const fn fsm(&self) -> &Arc<FsFsm> {
        &self.fsm
    }

    #[must_use]
    pub const fn device(&self) -> &Arc<BlockDevice> {
        &self.device
    }

    /// Last entry of a file's log, `None` when the key was never written
    async fn last(&self, name: &str) -> Result<Option<Entry>> {
        match self.wal.last_entry(&self.fsm.entry_key(name)).await {
            Ok(entry) => Ok(Some(entry)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Start a new file; fails with `Exists` when the path is live
    pub async fn create(&self, name: &str) -> Result<FileWriter> {
        let name = normalize(name);
        if name.is_empty() {
            return Err(Error::invalid_argument("empty file name"));
        }
        let base = match self.last(&name).await? {
            Some(entry) if entry.opcode() == Some(Opcode::FsSet) => {
                return Err(Error::Exists(name));
            }
            other => other,
        };
        Ok(FileWriter {
            file: VersionedFile::new(name),
            base,
        })
    }

    /// Open the current version for a new revision
    pub async fn open_for_edit(&self, name: &str) -> Result<FileWriter> {
        let name = normalize(name);
        match self.last(&name).await? {
            Some(entry) if entry.opcode() == Some(Opcode::FsSet) => Ok(FileWriter {
                file: VersionedFile::unmarshal(entry.payload())?,
                base: Some(entry),
            }),
            _ => Err(Error::KeyNotFound(name)),
        }
    }

    /// Shard `reader` into blocks and make it the writer's active version
    pub async fn write<R: AsyncRead + Unpin>(
        &self,
        writer: &mut FileWriter,
        reader: &mut R,
    ) -> Result<FileInfo> {
        let sharder = Sharder::new(&self.device, self.config.block_size, self.config.fan_out)?;
        let info = sharder.write_stream(reader).await?;
        writer.file.set_active(info.root.clone());
        Ok(info)
    }

    /// Commit the writer's version map
    pub async fn close(&self, writer: FileWriter) -> Result<FileStat> {
        if writer.file.active().is_none() {
            return Err(Error::invalid_argument(format!(
                "{} has no active version",
                writer.file.name
            )));
        }
        let key = self.fsm.entry_key(&writer.file.name);
        let creating = writer
            .base
            .as_ref()
            .is_none_or(|b| b.opcode() != Some(Opcode::FsSet));
        let (mut entry, options) = match &writer.base {
            Some(base) => (
                self.wal.new_entry_from(base),
                self.wal.propose_options(&key, &self.options)?,
            ),
            None => {
                let (entry, options) = self.wal.new_entry(&key, &self.options).await?;
                if entry.height != 1 {
                    return Err(Error::Exists(writer.file.name));
                }
                (entry, options)
            }
        };
        entry.set_operation(Opcode::FsSet, &writer.file.marshal()?);
        let proposed = match self.wal.propose(entry, options, 1, Duration::ZERO).await {
            Err(Error::PreviousHashMismatch(_)) if creating => {
                return Err(Error::Exists(writer.file.name));
            }
            other => other?,
        };
        info!(
            "File {} committed at height {}",
            writer.file.name, proposed.ballot.height
        );
        let (size, blocks) = self.active_size(&writer.file).await?;
        Ok(FileStat {
            name: writer.file.name.clone(),
            versions: writer.file.versions,
            size,
            blocks,
            modification: proposed.ballot.id,
            height: proposed.ballot.height,
        })
    }

    async fn active_size(&self, file: &VersionedFile) -> Result<(u64, u64)> {
        match file.active() {
            Some(root) => {
                let index: IndexBlock = Assembler::new(&self.device).stat(root).await?;
                Ok((index.file_size, index.block_count))
            }
            None => Ok((0, 0)),
        }
    }

    /// Version map from local state, then from the replicas
    async fn fetch(&self, name: &str) -> Result<VersionedFile> {
        if let Some(record) = self.fsm.get(name) {
            return Ok(record.file);
        }
        let mut last_err = Error::KeyNotFound(name.to_string());
        for host in self.wal.ring().scour_hosts(&self.fsm.entry_key(name)) {
            if self.wal.ring().is_local(&host) {
                continue;
            }
            match self.client.get_file(&host, name).await {
                Ok(buf) => return VersionedFile::unmarshal(&buf),
                Err(e) => {
                    debug!("GetFile {} from {} failed: {}", name, host, e);
                    if !last_err.is_not_found() || !e.is_not_found() {
                        last_err = e;
                    }
                }
            }
        }
        Err(last_err)
    }

    /// Open the active version for reading
    pub async fn open(&self, name: &str) -> Result<FileReader> {
        self.open_version(name, ACTIVE).await
    }

    /// Open an aliased version for reading
    pub async fn open_version(&self, name: &str, alias: &str) -> Result<FileReader> {
        let name = normalize(name);
        let file = self.fetch(&name).await?;
        let root = file
            .versions
            .get(alias)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(format!("{name}@{alias}")))?;
        let index = Assembler::new(&self.device).stat(&root).await?;
        Ok(FileReader {
            name,
            root,
            size: index.file_size,
            blocks: index.block_count,
        })
    }

    /// Stream a file's contents
    pub async fn read_to<W: AsyncWrite + Unpin>(
        &self,
        reader: &FileReader,
        writer: &mut W,
    ) -> Result<u64> {
        Assembler::new(&self.device).read_to(&reader.root, writer).await
    }

    pub async fn read_all(&self, reader: &FileReader) -> Result<Vec<u8>> {
        Assembler::new(&self.device).read_all(&reader.root).await
    }

    /// Point `alias` at the active version
    pub async fn pin(&self, name: &str, alias: &str) -> Result<FileStat> {
        let mut writer = self.open_for_edit(name).await?;
        writer.file.pin(alias)?;
        self.close(writer).await
    }

    /// Metadata from the tail of the file's log
    pub async fn stat(&self, name: &str) -> Result<FileStat> {
        let name = normalize(name);
        let record = match self.last(&name).await? {
            Some(entry) if entry.opcode() == Some(Opcode::FsSet) => FileRecord {
                file: VersionedFile::unmarshal(entry.payload())?,
                modification: entry.id(self.wal.ring().hasher().as_ref()),
                height: entry.height,
            },
            _ => return Err(Error::KeyNotFound(name)),
        };
        let (size, blocks) = self.active_size(&record.file).await?;
        Ok(FileStat {
            name,
            versions: record.file.versions,
            size,
            blocks,
            modification: record.modification,
            height: record.height,
        })
    }

    /// Delete a file. Its blocks stay; other files may share them.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let name = normalize(name);
        let last = match self.last(&name).await? {
            Some(entry) if entry.opcode() == Some(Opcode::FsSet) => entry,
            _ => return Err(Error::KeyNotFound(name)),
        };
        let key = self.fsm.entry_key(&name);
        let mut entry = self.wal.new_entry_from(&last);
        entry.set_operation(Opcode::FsDel, &[]);
        let options = self.wal.propose_options(&key, &self.options)?;
        self.wal.propose(entry, options, 1, Duration::ZERO).await?;
        info!("File {} removed", name);
        Ok(())
    }

    /// Serve a file request from local state
    pub fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::GetFile { name } => {
                let record = self.fsm.get(&name).ok_or(Error::KeyNotFound(name))?;
                Ok(Response::File(record.file.marshal()?))
            }
            other => Err(Error::invalid_argument(format!(
                "{} is not a file request",
                other.method()
            ))),
        }
    }
}
