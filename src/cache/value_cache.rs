//! Value Cache - fixed-capacity LRU in front of SSTable reads
//!
//! **Recency**: every `put` and every hit moves the key to the front;
//! eviction always removes the least recently used entry.
//!
//! **Thread safety**: one mutex around the `lru::LruCache` (a hit reorders
//! the list, so even reads need exclusive access).

use ahash::RandomState;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Cache statistics
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Total cache hits
    pub hits: u64,
    /// Total cache misses
    pub misses: u64,
    /// Entries evicted to make room
    pub evictions: u64,
    /// Current cache size
    pub size: usize,
    /// Maximum cache size
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Inner {
    lru: LruCache<String, Vec<u8>, RandomState>,
    stats: CacheStats,
}

pub struct ValueCache {
    inner: Mutex<Inner>,
}

impl ValueCache {
    /// # Arguments
    /// * `capacity` - Maximum entries (clamped to at least 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(Inner {
                lru: LruCache::with_hasher(capacity, RandomState::new()),
                stats: CacheStats {
                    capacity: capacity.get(),
                    ..CacheStats::default()
                },
            }),
        }
    }

    /// Insert or refresh `key`, making it the most recently used entry.
    pub fn put(&self, key: &str, value: Vec<u8>) {
        let mut inner = self.inner.lock();
        if let Some(slot) = inner.lru.get_mut(key) {
            *slot = value;
            return;
        }
        if let Some((evicted, _)) = inner.lru.push(key.to_string(), value) {
            if evicted != key {
                inner.stats.evictions += 1;
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let hit = inner.lru.get(key).cloned();
        if hit.is_some() {
            inner.stats.hits += 1;
        } else {
            inner.stats.misses += 1;
        }
        hit
    }

    /// Remove `key`. Returns whether it was cached.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.lock().lru.pop(key).is_some()
    }

    /// Membership test that leaves recency untouched.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().lru.contains(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<String> {
        self.inner.lock().lru.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            size: inner.lru.len(),
            ..inner.stats.clone()
        }
    }

    pub fn clear(&self) {
        self.inner.lock().lru.clear();
    }
}
