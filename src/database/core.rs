//! Database Core - Engine structure and lifecycle
//!
//! This module contains:
//! - Engine struct definition
//! - open() with incomplete-table cleanup and WAL recovery
//! - flush pipeline (memtable -> level-1 table -> WAL prune -> compaction)
//! - close() / stats() / verify_tables()
//!
//! ## Directory layout
//! ```text
//! <root>/wal/wal<N>.log
//! <root>/sstable/usertable-data-ic-<gen>-lev<level>-*.{db,gob,txt}
//! ```

use crate::cache::{CacheStats, ValueCache};
use crate::config::EngineConfig;
use crate::storage::lsm::{CompactionStats, LsmTree, MemTable, TableFiles};
use crate::storage::WriteAheadLog;
use crate::{Result, StorageError};
use parking_lot::{Mutex, RwLock};
use std::fs;
use std::path::{Path, PathBuf};

/// Engine statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Elements inserted into the active memtable, overwrites included
    pub memtable_size: usize,
    /// Complete tables per level; index 0 is level 1
    pub tables_per_level: Vec<usize>,
    pub cache: CacheStats,
    pub compaction: CompactionStats,
    /// Memtable flushes since open
    pub flushes: u64,
    /// Working WAL segment index
    pub wal_segment: u64,
}

/// Everything a write touches. Guarded by one mutex so that a WAL append and
/// its memtable insert are never observed half-done, and no writer sees a
/// memtable mid-flush.
pub(crate) struct EngineState {
    pub(crate) wal: WriteAheadLog,
    pub(crate) memtable: MemTable,
    pub(crate) lsm: LsmTree,
    pub(crate) flushes: u64,
}

/// Embedded LSM key-value engine
pub struct Engine {
    pub(crate) path: PathBuf,
    pub(crate) config: EngineConfig,
    pub(crate) state: Mutex<EngineState>,
    pub(crate) cache: ValueCache,
    /// Set after a durability failure; every later call is refused
    pub(crate) halted: RwLock<Option<String>>,
}

impl Engine {
    /// Open (or create) an engine rooted at `path`.
    pub fn open<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let path = path.as_ref().to_path_buf();
        let wal_dir = path.join("wal");
        let table_dir = path.join("sstable");
        fs::create_dir_all(&wal_dir)?;
        fs::create_dir_all(&table_dir)?;

        let mut lsm = LsmTree::new(&table_dir, &config.lsm);
        let removed = lsm.remove_incomplete_tables()?;
        // finish a cascade that a crash may have cut short
        lsm.perform_compaction(1)?;

        let wal = WriteAheadLog::open(&wal_dir, &config.wal)?;
        let mut memtable = MemTable::new(&config.memtable);
        let recovered = wal.replay()?;
        let recovered_count = recovered.len();
        for element in recovered {
            memtable.insert(element);
        }
        tracing::info!(
            path = %path.display(),
            recovered = recovered_count,
            incomplete_tables_removed = removed,
            wal_segment = wal.current_index(),
            "Engine opened"
        );

        let engine = Self {
            path,
            cache: ValueCache::new(config.cache.max_entries),
            config,
            state: Mutex::new(EngineState {
                wal,
                memtable,
                lsm,
                flushes: 0,
            }),
            halted: RwLock::new(None),
        };

        {
            let mut state = engine.state.lock();
            if state.memtable.should_flush() {
                engine.flush_memtable(&mut state)?;
            }
        }
        Ok(engine)
    }

    /// Open with default configuration.
    pub fn open_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(path, EngineConfig::default())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_halted(&self) -> bool {
        self.halted.read().is_some()
    }

    pub(crate) fn check_halted(&self) -> Result<()> {
        match self.halted.read().as_ref() {
            Some(reason) => Err(StorageError::Halted(reason.clone())),
            None => Ok(()),
        }
    }

    /// Latch the engine into the halted state if a write step failed.
    pub(crate) fn halt_on_error<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            tracing::error!(error = %e, "Write path failed, halting engine");
            let mut halted = self.halted.write();
            if halted.is_none() {
                *halted = Some(e.to_string());
            }
        }
        result
    }

    /// Flush the memtable to a new level-1 table, drop the WAL segments it
    /// covered, compact, and start an empty memtable.
    pub(crate) fn flush_memtable(&self, state: &mut EngineState) -> Result<()> {
        let generation = state.lsm.next_generation(1)?;
        state
            .memtable
            .flush(state.lsm.dir(), generation, state.lsm.false_positive_rate())?;
        state.wal.remove_old_segments()?;
        state.lsm.perform_compaction(1)?;
        state.memtable = MemTable::new(&self.config.memtable);
        state.flushes += 1;
        Ok(())
    }

    pub(crate) fn maybe_flush(&self, state: &mut EngineState) -> Result<()> {
        if state.memtable.should_flush() {
            self.flush_memtable(state)?;
        }
        Ok(())
    }

    /// Force a flush of whatever the memtable holds.
    pub fn flush(&self) -> Result<()> {
        self.check_halted()?;
        let mut state = self.state.lock();
        if state.memtable.is_empty() {
            return Ok(());
        }
        let result = self.flush_memtable(&mut state);
        self.halt_on_error(result)
    }

    /// Persist the working WAL segment and release the engine.
    pub fn close(self) -> Result<()> {
        let mut state = self.state.lock();
        state.wal.persist_current_segment()?;
        tracing::info!(path = %self.path.display(), "Engine closed");
        Ok(())
    }

    pub fn stats(&self) -> Result<EngineStats> {
        let state = self.state.lock();
        Ok(EngineStats {
            memtable_size: state.memtable.current_size(),
            tables_per_level: state.lsm.level_counts()?,
            cache: self.cache.stats(),
            compaction: state.lsm.stats().clone(),
            flushes: state.flushes,
            wal_segment: state.wal.current_index(),
        })
    }

    /// Check every table's merkle root. Returns the tables that fail.
    pub fn verify_tables(&self) -> Result<Vec<TableFiles>> {
        let state = self.state.lock();
        let mut corrupted = Vec::new();
        for level in 1..=state.lsm.max_level() {
            for table in state.lsm.tables_at(level)? {
                if !table.verify_integrity()? {
                    tracing::warn!(
                        generation = table.generation(),
                        level = level,
                        "Merkle root mismatch"
                    );
                    corrupted.push(table.files().clone());
                }
            }
        }
        Ok(corrupted)
    }
}
