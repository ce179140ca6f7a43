//! Fidias blocks - content-addressed storage and versioned files
//!
//! - `BlockStore`: local block persistence (memory or one file per block)
//! - `BlockDevice`: replicated SetBlock/GetBlock/RemoveBlock with holder hints
//! - `Sharder`/`Assembler`: streams to and from index block trees
//! - `FileSystem`: named files with aliased versions over the replicated log

pub mod device;
pub mod file;
pub mod fs;
pub mod index;
pub mod shard;
pub mod store;

pub use device::BlockDevice;
pub use file::{ACTIVE, VersionedFile};
pub use fs::{FileReader, FileRecord, FileStat, FileSystem, FileWriter, FsFsm};
pub use index::IndexBlock;
pub use shard::{Assembler, FileInfo, Sharder};
pub use store::{BlockStore, FileBlockStore, MemBlockStore, SharedBlockStore};

#[cfg(test)]
mod tests;
