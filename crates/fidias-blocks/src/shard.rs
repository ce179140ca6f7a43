//! Stream sharding and reassembly
//!
//! A stream is cut into fixed-size data blocks. Their ids fill index
//! blocks of up to `fan_out` children; a full index is flushed into the
//! level above. The single index left at the top is the file id.
//!
//! ```text
//!              root index
//!             /          \
//!        index            index
//!       /  |  \          /    \
//!    data data data   data    data
//! ```

use crate::device::BlockDevice;
use crate::index::IndexBlock;
use fidias_common::{Block, BlockKind, Error, Id, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Written file summary
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// Root index block id
    pub root: Id,
    pub size: u64,
    /// Data blocks in the file
    pub blocks: u64,
}

/// Child reference waiting in a partially filled index
struct Pending {
    id: Id,
    size: u64,
    blocks: u64,
}

pub struct Sharder<'a> {
    device: &'a BlockDevice,
    block_size: usize,
    fan_out: usize,
    levels: Vec<Vec<Pending>>,
}

impl<'a> Sharder<'a> {
    pub fn new(device: &'a BlockDevice, block_size: usize, fan_out: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(Error::invalid_argument("block size must be positive"));
        }
        if fan_out < 2 {
            return Err(Error::invalid_argument("index fan-out must be at least 2"));
        }
        Ok(Self {
            device,
            block_size,
            fan_out,
            levels: vec![Vec::new()],
        })
    }

    async fn flush(&mut self, level: usize) -> Result<()> {
        let children = std::mem::take(&mut self.levels[level]);
        let mut index = IndexBlock::new(u32::try_from(self.fan_out).unwrap_or(u32::MAX));
        for child in children {
            index.file_size += child.size;
            index.block_count += child.blocks;
            index.children.push(child.id);
        }
        let id = self.device.set_block(&index.to_block()?).await?;
        if self.levels.len() == level + 1 {
            self.levels.push(Vec::new());
        }
        self.push(
            level + 1,
            Pending {
                id,
                size: index.file_size,
                blocks: index.block_count,
            },
        );
        Ok(())
    }

    fn push(&mut self, level: usize, child: Pending) {
        self.levels[level].push(child);
    }

    /// Flush every full level, bottom up
    async fn cascade(&mut self) -> Result<()> {
        let mut level = 0;
        while level < self.levels.len() {
            if self.levels[level].len() >= self.fan_out {
                self.flush(level).await?;
            }
            level += 1;
        }
        Ok(())
    }

    /// Store one data block
    pub async fn write_block(&mut self, data: &[u8]) -> Result<()> {
        let id = self
            .device
            .set_block(&Block::new(BlockKind::Data, data.to_vec()))
            .await?;
        self.push(
            0,
            Pending {
                id,
                size: data.len() as u64,
                blocks: 1,
            },
        );
        self.cascade().await
    }

    /// Flush the partial levels and return the root
    pub async fn finish(mut self) -> Result<FileInfo> {
        let mut level = 0;
        loop {
            let top = level + 1 == self.levels.len();
            if top && level > 0 && self.levels[level].len() == 1 {
                let root = &self.levels[level][0];
                return Ok(FileInfo {
                    root: root.id.clone(),
                    size: root.size,
                    blocks: root.blocks,
                });
            }
            if !self.levels[level].is_empty() || top {
                self.flush(level).await?;
            }
            level += 1;
        }
    }

    /// Shard a whole stream
    pub async fn write_stream<R: AsyncRead + Unpin>(mut self, reader: &mut R) -> Result<FileInfo> {
        let mut buf = vec![0u8; self.block_size];
        loop {
            let mut filled = 0;
            while filled < buf.len() {
                let n = reader.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled > 0 {
                self.write_block(&buf[..filled]).await?;
            }
            if filled < buf.len() {
                break;
            }
        }
        let info = self.finish().await?;
        debug!(
            "Sharded {} bytes into {} blocks, root {}",
            info.size,
            info.blocks,
            info.root.short()
        );
        Ok(info)
    }
}

/// Reads block trees back
pub struct Assembler<'a> {
    device: &'a BlockDevice,
}

impl<'a> Assembler<'a> {
    #[must_use]
    pub const fn new(device: &'a BlockDevice) -> Self {
        Self { device }
    }

    /// Root index header
    pub async fn stat(&self, root: &Id) -> Result<IndexBlock> {
        IndexBlock::from_block(&self.device.get_block(root).await?)
    }

    /// Stream the file's data in order; returns the bytes written
    pub async fn read_to<W: AsyncWrite + Unpin>(&self, root: &Id, writer: &mut W) -> Result<u64> {
        let mut stack = vec![root.clone()];
        let mut written = 0u64;
        while let Some(id) = stack.pop() {
            let block = self.device.get_block(&id).await?;
            match block.kind {
                BlockKind::Data => {
                    writer.write_all(&block.data).await?;
                    written += block.data.len() as u64;
                }
                BlockKind::Index => {
                    let index = IndexBlock::from_block(&block)?;
                    stack.extend(index.children.into_iter().rev());
                }
                BlockKind::Meta => {
                    return Err(Error::invalid_argument(format!(
                        "meta block {} inside a file tree",
                        id.short()
                    )));
                }
            }
        }
        writer.flush().await?;
        Ok(written)
    }

    /// Whole file in memory
    pub async fn read_all(&self, root: &Id) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.read_to(root, &mut out).await?;
        Ok(out)
    }
}
