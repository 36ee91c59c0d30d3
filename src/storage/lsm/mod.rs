//! LSM-Tree Storage Engine
//!
//! ## Architecture
//! - **MemTable**: In-memory skip list (write buffer)
//! - **SSTable**: Data + Index + Summary + Filter + TOC, with a merkle tree in Metadata
//! - **Compaction**: pairwise merge into the next level
//!
//! ## Read path
//! bloom filter -> summary -> index -> data record

mod bloom;
mod compaction;
pub mod element;
mod index;
mod memtable;
mod merkle;
mod skiplist;
mod sstable;
mod summary;

pub use bloom::BloomFilter;
pub use compaction::{CompactionStats, LsmTree};
pub use element::{next_timestamp, Element};
pub use index::{find_in_index, write_index};
pub use memtable::{MemLookup, MemTable};
pub use merkle::MerkleTree;
pub use skiplist::SkipList;
pub use sstable::{Lookup, SSTable, TableBuilder, TableFiles};
pub use summary::Summary;
