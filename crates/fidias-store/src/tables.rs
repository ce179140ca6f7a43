//! Redb table definitions for the log databases.

use redb::TableDefinition;

// <data-dir>/log/entry
// Key: key-len u32 | key | entry id, Value: canonical entry encoding
pub const ENTRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entries");

// <data-dir>/log/index
// Key: raw key, Value: KeyIndex encoding
pub const INDEX: TableDefinition<&[u8], &[u8]> = TableDefinition::new("index");
// Key: key-len u32 | key | height u64, Value: entry id
pub const CHAIN: TableDefinition<&[u8], &[u8]> = TableDefinition::new("chain");

/// Composite key `len | key | suffix`
pub fn composite(key: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + key.len() + suffix.len());
    let len = u32::try_from(key.len()).unwrap_or(u32::MAX);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(suffix);
    buf
}

/// Chain table key for `(key, height)`
pub fn chain_key(key: &[u8], height: u64) -> Vec<u8> {
    composite(key, &height.to_be_bytes())
}
