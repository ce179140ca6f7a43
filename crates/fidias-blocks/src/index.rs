//! Index blocks
//!
//! An index block lists the ids of its children (data or index blocks) in
//! stream order, after a fixed header:
//!
//! ```text
//! file_size u64 | block_count u64 | fan_out u32 | width u8 | children u32 | ids...
//! ```
//!
//! `file_size` and `block_count` cover every data block beneath the index.

use fidias_common::{Block, BlockKind, Error, Id, Result};

const HEADER_LEN: usize = 8 + 8 + 4 + 1 + 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexBlock {
    /// Bytes of data beneath this index
    pub file_size: u64,
    /// Data blocks beneath this index
    pub block_count: u64,
    /// Maximum children per index of the tree
    pub fan_out: u32,
    pub children: Vec<Id>,
}

impl IndexBlock {
    #[must_use]
    pub const fn new(fan_out: u32) -> Self {
        Self {
            file_size: 0,
            block_count: 0,
            fan_out,
            children: Vec::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let width = self.children.first().map_or(0, Id::len);
        if self.children.iter().any(|c| c.len() != width) {
            return Err(Error::invalid_argument("index children of mixed width"));
        }
        let width_byte =
            u8::try_from(width).map_err(|_| Error::invalid_argument("id too wide for index"))?;
        let count = u32::try_from(self.children.len())
            .map_err(|_| Error::invalid_argument("too many index children"))?;

        let mut buf = Vec::with_capacity(HEADER_LEN + width * self.children.len());
        buf.extend_from_slice(&self.file_size.to_be_bytes());
        buf.extend_from_slice(&self.block_count.to_be_bytes());
        buf.extend_from_slice(&self.fan_out.to_be_bytes());
        buf.push(width_byte);
        buf.extend_from_slice(&count.to_be_bytes());
        for child in &self.children {
            buf.extend_from_slice(child.as_bytes());
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        let bad = || Error::invalid_argument("malformed index block");
        if buf.len() < HEADER_LEN {
            return Err(bad());
        }
        let (head, ids) = buf.split_at(HEADER_LEN);
        let file_size = u64::from_be_bytes(head[0..8].try_into().map_err(|_| bad())?);
        let block_count = u64::from_be_bytes(head[8..16].try_into().map_err(|_| bad())?);
        let fan_out = u32::from_be_bytes(head[16..20].try_into().map_err(|_| bad())?);
        let width = head[20] as usize;
        let count = u32::from_be_bytes(head[21..25].try_into().map_err(|_| bad())?) as usize;
        if ids.len() != width * count || (count > 0 && width == 0) {
            return Err(bad());
        }
        let children = if count == 0 {
            Vec::new()
        } else {
            ids.chunks_exact(width).map(Id::from_slice).collect()
        };
        Ok(Self {
            file_size,
            block_count,
            fan_out,
            children,
        })
    }

    pub fn to_block(&self) -> Result<Block> {
        Ok(Block::new(BlockKind::Index, self.encode()?))
    }

    pub fn from_block(block: &Block) -> Result<Self> {
        if block.kind != BlockKind::Index {
            return Err(Error::invalid_argument("not an index block"));
        }
        Self::decode(&block.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let index = IndexBlock {
            file_size: 90,
            block_count: 12,
            fan_out: 256,
            children: vec![Id::new(vec![1; 32]), Id::new(vec![2; 32])],
        };
        let block = index.to_block().unwrap();
        assert_eq!(block.kind, BlockKind::Index);
        assert_eq!(IndexBlock::from_block(&block).unwrap(), index);
    }

    #[test]
    fn test_empty_index() {
        let index = IndexBlock::new(4);
        assert_eq!(IndexBlock::decode(&index.encode().unwrap()).unwrap(), index);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(IndexBlock::decode(&[0; 10]).is_err());
        let mut buf = IndexBlock {
            children: vec![Id::new(vec![1; 4])],
            ..IndexBlock::new(2)
        }
        .encode()
        .unwrap();
        buf.pop();
        assert!(IndexBlock::decode(&buf).is_err());
        let mixed = IndexBlock {
            children: vec![Id::new(vec![1; 4]), Id::new(vec![1; 5])],
            ..IndexBlock::new(2)
        };
        assert!(mixed.encode().is_err());
        assert!(IndexBlock::from_block(&Block::new(BlockKind::Data, vec![0; 40])).is_err());
    }
}
