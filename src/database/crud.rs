//! CRUD Operations Module
//!
//! Read path: memtable -> cache -> tables (level 1 first, newest first).
//! Write path: WAL -> memtable -> cache -> flush/compaction if the memtable
//! crossed its threshold.

use super::core::{Engine, EngineState};
use crate::storage::lsm::{Element, Lookup, MemLookup};
use crate::Result;

/// Key prefixes of the auxiliary structures stored as plain values.
const HLL_PREFIX: &str = "hll-";
const CMS_PREFIX: &str = "cms-";

fn delete_candidates(key: &str) -> [String; 3] {
    [
        key.to_string(),
        format!("{}{}", HLL_PREFIX, key),
        format!("{}{}", CMS_PREFIX, key),
    ]
}

impl Engine {
    // ==================== Writes ====================

    /// Store `value` under `key`.
    ///
    /// # Example
    /// ```ignore
    /// engine.put("user:1", b"alice")?;
    /// ```
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.put_with_tombstone(key, value.to_vec(), false)
    }

    /// Write a new element. A tombstoned put is a logical delete.
    pub fn put_with_tombstone(&self, key: &str, value: Vec<u8>, tombstone: bool) -> Result<()> {
        self.check_halted()?;
        let mut state = self.state.lock();
        let result = self.apply_put(&mut state, Element::new(key, value, tombstone));
        self.halt_on_error(result)
    }

    fn apply_put(&self, state: &mut EngineState, element: Element) -> Result<()> {
        // 1. WAL first (durability)
        state.wal.put_element(&element)?;

        // 2. Memtable, 3. cache
        let key = element.key.clone();
        let cached = (!element.tombstone).then(|| element.value.clone());
        state.memtable.insert(element);
        match cached {
            Some(value) => self.cache.put(&key, value),
            None => {
                self.cache.delete(&key);
            }
        }

        // 4. Flush + compaction once the memtable is full
        self.maybe_flush(state)
    }

    /// Replace the value under `key`, in place if the memtable holds it.
    pub fn edit(&self, key: &str, value: &[u8]) -> Result<()> {
        self.check_halted()?;
        let mut state = self.state.lock();
        let result = self.apply_edit(&mut state, Element::new(key, value.to_vec(), false));
        self.halt_on_error(result)
    }

    fn apply_edit(&self, state: &mut EngineState, element: Element) -> Result<()> {
        state.wal.put_element(&element)?;
        let key = element.key.clone();
        let value = element.value.clone();
        state.memtable.modify(element);
        self.cache.put(&key, value);
        self.maybe_flush(state)
    }

    /// Delete `key` (or its `hll-` / `cms-` namespaced variant, whichever is
    /// found first). Returns false when nothing was found.
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.check_halted()?;
        let mut state = self.state.lock();
        let result = self.apply_delete(&mut state, key);
        self.halt_on_error(result)
    }

    fn apply_delete(&self, state: &mut EngineState, key: &str) -> Result<bool> {
        let candidates = delete_candidates(key);

        // Live in the memtable: log a tombstone, then flip the node in place.
        for candidate in &candidates {
            if let MemLookup::Live(value) = state.memtable.lookup(candidate) {
                state.wal.put_element(&Element::new(candidate.as_str(), value, true))?;
                state.memtable.erase(candidate);
                self.cache.delete(candidate);
                return Ok(true);
            }
        }

        // Otherwise resolve the current value and shadow it with a tombstone.
        for candidate in &candidates {
            if let Some(value) = self.get_locked(state, candidate)? {
                self.apply_put(state, Element::new(candidate.as_str(), value, true))?;
                self.cache.delete(candidate);
                return Ok(true);
            }
        }
        Ok(false)
    }

    // ==================== Reads ====================

    /// Value stored under `key`, or `None` if absent or deleted.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.check_halted()?;
        let state = self.state.lock();
        self.get_locked(&state, key)
    }

    pub(crate) fn get_locked(&self, state: &EngineState, key: &str) -> Result<Option<Vec<u8>>> {
        match state.memtable.lookup(key) {
            MemLookup::Deleted => return Ok(None),
            MemLookup::Live(value) => {
                self.cache.put(key, value.clone());
                return Ok(Some(value));
            }
            MemLookup::Absent => {}
        }

        if let Some(value) = self.cache.get(key) {
            return Ok(Some(value));
        }

        match state.lsm.search(key)? {
            Lookup::Found(element) => {
                self.cache.put(key, element.value.clone());
                Ok(Some(element.value))
            }
            Lookup::Deleted | Lookup::Absent => Ok(None),
        }
    }

    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{DurabilityLevel, EngineConfig};
    use crate::database::Engine;
    use crate::StorageError;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn small_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.memtable.max_size = 2;
        config.memtable.threshold = 100.0;
        config.lsm.max_level = 3;
        config.lsm.max_tables_per_level = 2;
        config.cache.max_entries = 2;
        config
    }

    fn table_files(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(root.join("sstable"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn wal_files(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(root.join("wal"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_put_get() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put("a", b"1").unwrap();
        engine.put("b", b"").unwrap();
        assert_eq!(engine.get("a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(engine.get("b").unwrap(), Some(Vec::new()));
        assert_eq!(engine.get("c").unwrap(), None);
    }

    #[test]
    fn test_delete_in_memtable() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put("k", b"v").unwrap();
        assert!(engine.delete("k").unwrap());
        assert_eq!(engine.get("k").unwrap(), None);
        assert!(!engine.delete("k").unwrap());
        assert!(!engine.delete("never").unwrap());
    }

    #[test]
    fn test_delete_after_flush_shadows_table() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), small_config()).unwrap();
        engine.put("a", b"1").unwrap();
        engine.put("b", b"2").unwrap();
        // flushed to level 1
        assert_eq!(engine.stats().unwrap().memtable_size, 0);

        assert!(engine.delete("a").unwrap());
        assert_eq!(engine.get("a").unwrap(), None);

        // push the tombstone to disk as well
        engine.put("c", b"3").unwrap();
        assert_eq!(engine.get("a").unwrap(), None);
        assert_eq!(engine.get("b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_delete_namespaced_keys() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put("hll-visitors", b"sketch").unwrap();
        assert!(engine.delete("visitors").unwrap());
        assert_eq!(engine.get("hll-visitors").unwrap(), None);

        engine.put("cms-words", b"counts").unwrap();
        engine.flush().unwrap();
        assert!(engine.delete("words").unwrap());
        assert_eq!(engine.get("cms-words").unwrap(), None);
    }

    #[test]
    fn test_edit() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put("k", b"old").unwrap();
        engine.edit("k", b"new").unwrap();
        assert_eq!(engine.get("k").unwrap(), Some(b"new".to_vec()));
        assert_eq!(engine.stats().unwrap().memtable_size, 1);

        // absent key falls back to insert
        engine.edit("fresh", b"x").unwrap();
        assert_eq!(engine.get("fresh").unwrap(), Some(b"x".to_vec()));
    }

    #[test]
    fn test_flush_and_compaction_cascade() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), small_config()).unwrap();

        engine.put("k1", b"v1").unwrap();
        engine.put("k2", b"v2").unwrap();
        let after_first = table_files(dir.path());
        assert!(after_first.iter().all(|n| n.contains("-lev1-")));
        assert_eq!(after_first.len(), 6);
        // the flush captured every logged write
        assert!(wal_files(dir.path()).is_empty());

        engine.put("k3", b"v3").unwrap();
        engine.put("k4", b"v4").unwrap();
        // two level-1 tables merged into one level-2 table
        let stats = engine.stats().unwrap();
        assert_eq!(stats.tables_per_level, vec![0, 1, 0]);
        assert_eq!(stats.compaction.num_compactions, 1);
        let files = table_files(dir.path());
        assert_eq!(files.len(), 6);
        assert!(files.iter().all(|n| n.contains("-lev2-")));

        for (k, v) in [("k1", "v1"), ("k2", "v2"), ("k3", "v3"), ("k4", "v4")] {
            assert_eq!(engine.get(k).unwrap(), Some(v.as_bytes().to_vec()));
        }
        assert!(engine.verify_tables().unwrap().is_empty());
    }

    #[test]
    fn test_overwrites_trigger_flush_and_prune_wal() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put("hot", b"1").unwrap();
        engine.put("hot", b"2").unwrap();
        assert_eq!(engine.stats().unwrap().flushes, 0);
        assert!(!wal_files(dir.path()).is_empty());

        // third write of the same key reaches 3 of 5 = 60%
        engine.put("hot", b"3").unwrap();
        let stats = engine.stats().unwrap();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.memtable_size, 0);
        assert_eq!(stats.tables_per_level, vec![1, 0, 0]);
        assert!(wal_files(dir.path()).is_empty());

        // the next write opens the fresh segment and nothing else
        engine.put("hot", b"4").unwrap();
        let segment = engine.stats().unwrap().wal_segment;
        assert_eq!(wal_files(dir.path()), vec![format!("wal{}.log", segment)]);

        engine.cache.clear();
        assert_eq!(engine.get("hot").unwrap(), Some(b"4".to_vec()));
    }

    #[test]
    fn test_many_overwrites_keep_wal_bounded() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        for i in 0..200 {
            engine.put("hot", format!("v{}", i).as_bytes()).unwrap();
        }
        let stats = engine.stats().unwrap();
        assert!(stats.flushes >= 60, "only {} flushes", stats.flushes);
        // a 2-write memtable spans a handful of 50-byte segments at most
        assert!(wal_files(dir.path()).len() <= 4);
        assert_eq!(engine.get("hot").unwrap(), Some(b"v199".to_vec()));
    }

    #[test]
    fn test_newer_value_wins_across_levels() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), small_config()).unwrap();
        for round in 0..6 {
            engine.put("shared", format!("v{}", round).as_bytes()).unwrap();
            engine.put(&format!("filler{}", round), b"x").unwrap();
        }
        // bypass the cache so the tables answer
        engine.cache.clear();
        assert_eq!(engine.get("shared").unwrap(), Some(b"v5".to_vec()));
    }

    #[test]
    fn test_recovery_from_wal() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
            engine.put("a", b"1").unwrap();
            engine.put("b", b"2").unwrap();
            engine.delete("a").unwrap();
            engine.close().unwrap();
        }
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        // replay re-inserts put a, put b and the logged tombstone: 3 of 5 is
        // the 60% threshold, so open flushes them
        let stats = engine.stats().unwrap();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.memtable_size, 0);
        assert_eq!(engine.get("a").unwrap(), None);
        assert_eq!(engine.get("b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn test_recovery_after_flush() {
        let dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(dir.path(), small_config()).unwrap();
            engine.put("a", b"1").unwrap();
            engine.put("b", b"2").unwrap();
            engine.put("c", b"3").unwrap();
        }
        let engine = Engine::open(dir.path(), small_config()).unwrap();
        // a and b come from the table, c from the replayed WAL
        assert_eq!(engine.stats().unwrap().memtable_size, 1);
        for (k, v) in [("a", "1"), ("b", "2"), ("c", "3")] {
            assert_eq!(engine.get(k).unwrap(), Some(v.as_bytes().to_vec()));
        }
    }

    #[test]
    fn test_buffered_durability_survives_close() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.wal.durability = DurabilityLevel::Buffered;
        config.wal.segment_capacity = 4096;
        {
            let engine = Engine::open(dir.path(), config.clone()).unwrap();
            engine.put("k", b"v").unwrap();
            engine.close().unwrap();
        }
        let engine = Engine::open(dir.path(), config).unwrap();
        assert_eq!(engine.get("k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_cache_backfill_and_eviction() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), small_config()).unwrap();
        engine.put("A", b"a").unwrap();
        engine.put("B", b"b").unwrap();
        engine.put("C", b"c").unwrap();
        // capacity 2: A was evicted by C
        assert!(!engine.cache.contains("A"));
        assert!(engine.cache.contains("B"));
        assert!(engine.cache.contains("C"));

        // A still comes back from its table and is cached again
        assert_eq!(engine.get("A").unwrap(), Some(b"a".to_vec()));
        assert!(engine.cache.contains("A"));
    }

    #[test]
    fn test_halted_engine_refuses_work() {
        let dir = TempDir::new().unwrap();
        let engine = Engine::open(dir.path(), EngineConfig::default()).unwrap();
        engine.put("k", b"v").unwrap();

        // make WAL appends fail
        fs::remove_dir_all(dir.path().join("wal")).unwrap();
        assert!(engine.put("x", b"y").is_err());
        assert!(engine.is_halted());
        assert!(matches!(engine.get("k"), Err(StorageError::Halted(_))));
        assert!(matches!(engine.put("z", b"1"), Err(StorageError::Halted(_))));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.memtable.max_size = 0;
        assert!(matches!(
            Engine::open(dir.path(), config),
            Err(StorageError::InvalidConfig(_))
        ));
    }
}
