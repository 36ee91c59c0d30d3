//! lsmkv Storage Engine
//!
//! Embedded key-value store built on a log-structured merge tree.
//!
//! ## 架构
//! - 持久层: segmented write-ahead log (`wal<N>.log`)
//! - 内存层: skip-list memtable, flushed into level-1 SSTables
//! - 磁盘层: SSTables with bloom filter, sparse index, summary and merkle tree
//! - 合并: leveled pairwise compaction, newest timestamp wins
//! - 缓存: LRU value cache in front of SSTable reads
//!
//! ## Example
//! ```ignore
//! use lsmkv::{Engine, EngineConfig};
//!
//! let engine = Engine::open("data", EngineConfig::default())?;
//! engine.put("k", b"v")?;
//! assert_eq!(engine.get("k")?, Some(b"v".to_vec()));
//! engine.delete("k")?;
//! engine.close()?;
//! ```

pub mod cache;
pub mod config;
pub mod database;
pub mod rate_limiter;
pub mod storage;

mod error;

pub use cache::{CacheStats, ValueCache};
pub use config::{DurabilityLevel, EngineConfig};
pub use database::{Engine, EngineStats};
pub use error::{Result, StorageError};
pub use rate_limiter::RateLimiter;
