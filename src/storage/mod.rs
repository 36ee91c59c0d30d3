//! Storage layer implementation
//!
//! Write-ahead log plus the LSM-Tree (memtable, SSTables, compaction)

pub mod checksum;
pub mod lsm;
pub mod wal;

pub use checksum::{Checksum, ChecksumError};
pub use lsm::{LsmTree, MemTable, SSTable};
pub use wal::WriteAheadLog;
