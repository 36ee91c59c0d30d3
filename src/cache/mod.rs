//! Cache module - LRU cache in front of SSTable reads

pub mod value_cache;

pub use value_cache::{CacheStats, ValueCache};
