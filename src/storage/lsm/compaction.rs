//! Leveled pairwise compaction
//!
//! ## Algorithm
//! - Levels 1..=max_level; a flush always lands in level 1
//! - Trigger: a level holds `max_tables_per_level` complete tables
//! - Merge: tables are paired in generation order (0-1, 2-3, ...) and each
//!   pair becomes one table in the next level; an odd table stays put
//! - Cascade: the next level is checked right after
//! - The last level never compacts
//!
//! ## Merge rules
//! - Equal keys: the newer timestamp wins; a tie goes to the newer table
//! - Tombstoned winners are dropped, so deletes do not reach the next level
//! - Inputs are deleted only after the output's TOC is on disk

use super::element::Element;
use super::sstable::{Lookup, SSTable, TableBuilder, TableFiles};
use crate::config::LsmConfig;
use crate::Result;
use ahash::AHashMap;
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Clone, Debug, Default)]
pub struct CompactionStats {
    /// Merges performed
    pub num_compactions: u64,
    /// Records read from merge inputs
    pub records_read: u64,
    /// Records written to merge outputs
    pub records_written: u64,
    /// Tombstones discarded during merges
    pub tombstones_dropped: u64,
}

pub struct LsmTree {
    dir: PathBuf,
    max_level: usize,
    max_tables_per_level: usize,
    false_positive_rate: f64,
    stats: CompactionStats,
}

impl LsmTree {
    pub fn new(dir: &Path, config: &LsmConfig) -> Self {
        Self {
            dir: dir.to_path_buf(),
            max_level: config.max_level,
            max_tables_per_level: config.max_tables_per_level,
            false_positive_rate: config.bloom_false_positive_rate,
            stats: CompactionStats::default(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_level(&self) -> usize {
        self.max_level
    }

    pub fn false_positive_rate(&self) -> f64 {
        self.false_positive_rate
    }

    pub fn stats(&self) -> &CompactionStats {
        &self.stats
    }

    /// Complete tables at `level`, oldest generation first.
    pub fn tables_at(&self, level: usize) -> Result<Vec<SSTable>> {
        let mut tables = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match TableFiles::parse_name(name) {
                Some((_, l, "TOC.txt")) if l == level => {
                    tables.push(SSTable::open(&entry.path())?);
                }
                _ => {}
            }
        }
        tables.sort_by_key(|t| t.generation());
        Ok(tables)
    }

    /// Generation for the next table written at `level`.
    pub fn next_generation(&self, level: usize) -> Result<u64> {
        let mut max = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some((generation, l, _)) = name.to_str().and_then(TableFiles::parse_name) {
                if l == level {
                    max = max.max(generation);
                }
            }
        }
        Ok(max + 1)
    }

    /// Table count per level, index 0 is level 1.
    pub fn level_counts(&self) -> Result<Vec<usize>> {
        (1..=self.max_level)
            .map(|level| self.tables_at(level).map(|t| t.len()))
            .collect()
    }

    pub fn is_compaction_needed(&self, level: usize) -> Result<bool> {
        if level >= self.max_level {
            return Ok(false);
        }
        Ok(self.tables_at(level)?.len() >= self.max_tables_per_level)
    }

    /// Compact `level` if it is full, then cascade into the next level.
    pub fn perform_compaction(&mut self, level: usize) -> Result<()> {
        if !self.is_compaction_needed(level)? {
            return Ok(());
        }
        let tables = self.tables_at(level)?;
        let mut generation = self.next_generation(level + 1)?;
        for pair in tables.chunks(2) {
            if let [older, newer] = pair {
                self.merge_tables(older, newer, level + 1, generation)?;
                generation += 1;
            }
        }
        self.perform_compaction(level + 1)
    }

    /// Merge two tables into a new table at `level`, then delete the inputs.
    pub fn merge_tables(
        &mut self,
        older: &SSTable,
        newer: &SSTable,
        level: usize,
        generation: u64,
    ) -> Result<SSTable> {
        let expected = (older.len() + newer.len()) as usize;
        let mut builder = TableBuilder::create(
            &self.dir,
            generation,
            level,
            expected,
            self.false_positive_rate,
        )?;

        let mut left = older.iter()?;
        let mut right = newer.iter()?;
        let mut l = left.next().transpose()?;
        let mut r = right.next().transpose()?;
        let mut read = 0u64;
        let mut dropped = 0u64;

        loop {
            let winner: Element = match (l.take(), r.take()) {
                (None, None) => break,
                (Some(a), None) => {
                    read += 1;
                    l = left.next().transpose()?;
                    a
                }
                (None, Some(b)) => {
                    read += 1;
                    r = right.next().transpose()?;
                    b
                }
                (Some(a), Some(b)) => match a.key.cmp(&b.key) {
                    Ordering::Less => {
                        read += 1;
                        r = Some(b);
                        l = left.next().transpose()?;
                        a
                    }
                    Ordering::Greater => {
                        read += 1;
                        l = Some(a);
                        r = right.next().transpose()?;
                        b
                    }
                    Ordering::Equal => {
                        read += 2;
                        l = left.next().transpose()?;
                        r = right.next().transpose()?;
                        if a.timestamp > b.timestamp {
                            a
                        } else {
                            b
                        }
                    }
                },
            };

            if winner.tombstone {
                dropped += 1;
                continue;
            }
            if let Err(e) = winner.verify_checksum() {
                tracing::warn!(
                    key = %winner.key,
                    error = %e,
                    generation = generation,
                    level = level,
                    "Checksum mismatch during merge, record dropped"
                );
                continue;
            }
            builder.add(&winner)?;
        }

        drop(left);
        drop(right);
        let written = builder.len();
        let merged = builder.finish()?;
        older.remove_files()?;
        newer.remove_files()?;

        self.stats.num_compactions += 1;
        self.stats.records_read += read;
        self.stats.records_written += written;
        self.stats.tombstones_dropped += dropped;
        tracing::info!(
            older = older.generation(),
            newer = newer.generation(),
            from_level = older.level(),
            output = generation,
            level = level,
            records = written,
            "Merged tables"
        );
        Ok(merged)
    }

    /// Search levels 1..=max_level, newest generation first within a level.
    /// Stops at the first table that knows the key, live or deleted.
    pub fn search(&self, key: &str) -> Result<Lookup> {
        for level in 1..=self.max_level {
            for table in self.tables_at(level)?.iter().rev() {
                match table.lookup(key)? {
                    Lookup::Absent => continue,
                    hit => return Ok(hit),
                }
            }
        }
        Ok(Lookup::Absent)
    }

    /// Delete files of tables that never got a TOC. Returns how many tables
    /// were removed.
    pub fn remove_incomplete_tables(&self) -> Result<usize> {
        let mut groups: AHashMap<(u64, usize), (Vec<PathBuf>, bool)> = AHashMap::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some((generation, level, suffix)) = TableFiles::parse_name(name) {
                let group = groups.entry((generation, level)).or_default();
                group.0.push(entry.path());
                group.1 |= suffix == "TOC.txt";
            }
        }

        let mut removed = 0;
        for ((generation, level), (paths, complete)) in groups {
            if complete {
                continue;
            }
            tracing::warn!(
                generation = generation,
                level = level,
                files = paths.len(),
                "Removing incomplete table"
            );
            for path in paths {
                fs::remove_file(path)?;
            }
            removed += 1;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(max_level: usize, per_level: usize) -> LsmConfig {
        LsmConfig {
            max_level,
            max_tables_per_level: per_level,
            bloom_false_positive_rate: 0.01,
        }
    }

    fn write_table(dir: &Path, generation: u64, level: usize, elements: &[Element]) -> SSTable {
        let mut builder =
            TableBuilder::create(dir, generation, level, elements.len(), 0.01).unwrap();
        for e in elements {
            builder.add(e).unwrap();
        }
        builder.finish().unwrap()
    }

    fn el(key: &str, value: &str, tombstone: bool, ts: u64) -> Element {
        Element::with_timestamp(key, value.as_bytes().to_vec(), tombstone, ts)
    }

    fn contents(table: &SSTable) -> Vec<(String, Vec<u8>)> {
        table
            .iter()
            .unwrap()
            .map(|e| {
                let e = e.unwrap();
                (e.key, e.value)
            })
            .collect()
    }

    #[test]
    fn test_merge_newer_live_wins() {
        let dir = TempDir::new().unwrap();
        let mut tree = LsmTree::new(dir.path(), &config(3, 2));
        let older = write_table(
            dir.path(),
            1,
            1,
            &[el("a", "old", false, 10), el("b", "b", false, 11)],
        );
        let newer = write_table(dir.path(), 2, 1, &[el("a", "new", false, 20)]);

        let merged = tree.merge_tables(&older, &newer, 2, 1).unwrap();
        assert_eq!(
            contents(&merged),
            vec![("a".to_string(), b"new".to_vec()), ("b".to_string(), b"b".to_vec())]
        );
        assert_eq!(merged.query_record("a").unwrap().unwrap().timestamp, 20);
    }

    #[test]
    fn test_merge_newer_tombstone_removes_key() {
        let dir = TempDir::new().unwrap();
        let mut tree = LsmTree::new(dir.path(), &config(3, 2));
        let older = write_table(dir.path(), 1, 1, &[el("a", "v", false, 10)]);
        let newer = write_table(
            dir.path(),
            2,
            1,
            &[el("a", "v", true, 20), el("c", "c", false, 21)],
        );

        let merged = tree.merge_tables(&older, &newer, 2, 1).unwrap();
        assert_eq!(contents(&merged), vec![("c".to_string(), b"c".to_vec())]);
        assert_eq!(tree.stats().tombstones_dropped, 1);
    }

    #[test]
    fn test_merge_older_tombstone_loses_to_newer_live() {
        let dir = TempDir::new().unwrap();
        let mut tree = LsmTree::new(dir.path(), &config(3, 2));
        // the first table may hold the newer record
        let first = write_table(dir.path(), 1, 1, &[el("a", "live", false, 30)]);
        let second = write_table(dir.path(), 2, 1, &[el("a", "", true, 20)]);

        let merged = tree.merge_tables(&first, &second, 2, 1).unwrap();
        assert_eq!(contents(&merged), vec![("a".to_string(), b"live".to_vec())]);
    }

    #[test]
    fn test_merge_interleaves_and_deletes_inputs() {
        let dir = TempDir::new().unwrap();
        let mut tree = LsmTree::new(dir.path(), &config(3, 2));
        let older = write_table(
            dir.path(),
            1,
            1,
            &[el("a", "1", false, 1), el("c", "3", false, 3), el("e", "5", false, 5)],
        );
        let newer = write_table(
            dir.path(),
            2,
            1,
            &[el("b", "2", false, 2), el("d", "4", false, 4), el("f", "6", false, 6)],
        );
        let older_files = older.files().all();
        let newer_files = newer.files().all();

        let merged = tree.merge_tables(&older, &newer, 2, 1).unwrap();
        let keys: Vec<String> = contents(&merged).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "b", "c", "d", "e", "f"]);
        assert!(merged.verify_integrity().unwrap());
        for path in older_files.iter().chain(newer_files.iter()) {
            assert!(!path.exists());
        }
    }

    #[test]
    fn test_merge_drops_damaged_record() {
        let dir = TempDir::new().unwrap();
        let mut tree = LsmTree::new(dir.path(), &config(3, 2));
        let older = write_table(
            dir.path(),
            1,
            1,
            &[el("a", "1", false, 1), el("z", "zz", false, 2)],
        );
        let newer = write_table(dir.path(), 2, 1, &[el("m", "m", false, 3)]);

        // flip the last value byte, which belongs to "z"
        let path = older.files().data();
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, bytes).unwrap();

        let merged = tree.merge_tables(&older, &newer, 2, 1).unwrap();
        let keys: Vec<String> = contents(&merged).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "m"]);
        assert_eq!(tree.stats().records_written, 2);
    }

    #[test]
    fn test_cascade() {
        let dir = TempDir::new().unwrap();
        let mut tree = LsmTree::new(dir.path(), &config(3, 2));

        write_table(dir.path(), 1, 1, &[el("a", "1", false, 1)]);
        write_table(dir.path(), 2, 1, &[el("b", "2", false, 2)]);
        tree.perform_compaction(1).unwrap();
        assert_eq!(tree.level_counts().unwrap(), vec![0, 1, 0]);

        write_table(dir.path(), 3, 1, &[el("c", "3", false, 3)]);
        write_table(dir.path(), 4, 1, &[el("d", "4", false, 4)]);
        tree.perform_compaction(1).unwrap();
        // level 2 filled up and cascaded into level 3
        assert_eq!(tree.level_counts().unwrap(), vec![0, 0, 1]);
        assert_eq!(tree.stats().num_compactions, 3);

        for key in ["a", "b", "c", "d"] {
            assert!(matches!(tree.search(key).unwrap(), Lookup::Found(_)));
        }
    }

    #[test]
    fn test_last_level_never_compacts() {
        let dir = TempDir::new().unwrap();
        let mut tree = LsmTree::new(dir.path(), &config(2, 2));
        write_table(dir.path(), 1, 2, &[el("a", "1", false, 1)]);
        write_table(dir.path(), 2, 2, &[el("b", "2", false, 2)]);
        assert!(!tree.is_compaction_needed(2).unwrap());
        tree.perform_compaction(2).unwrap();
        assert_eq!(tree.level_counts().unwrap(), vec![0, 2]);
    }

    #[test]
    fn test_odd_table_stays() {
        let dir = TempDir::new().unwrap();
        let mut tree = LsmTree::new(dir.path(), &config(3, 3));
        for g in 1..=3 {
            write_table(dir.path(), g, 1, &[el(&format!("k{}", g), "v", false, g)]);
        }
        tree.perform_compaction(1).unwrap();
        let level1 = tree.tables_at(1).unwrap();
        assert_eq!(level1.len(), 1);
        assert_eq!(level1[0].generation(), 3);
        assert_eq!(tree.tables_at(2).unwrap().len(), 1);
    }

    #[test]
    fn test_generation_order_is_numeric() {
        let dir = TempDir::new().unwrap();
        let tree = LsmTree::new(dir.path(), &config(3, 20));
        for g in [10u64, 2, 1] {
            write_table(dir.path(), g, 1, &[el("k", "v", false, g)]);
        }
        let gens: Vec<u64> = tree.tables_at(1).unwrap().iter().map(|t| t.generation()).collect();
        assert_eq!(gens, vec![1, 2, 10]);
        assert_eq!(tree.next_generation(1).unwrap(), 11);
        assert_eq!(tree.next_generation(2).unwrap(), 1);
    }

    #[test]
    fn test_search_prefers_newest_and_respects_tombstones() {
        let dir = TempDir::new().unwrap();
        let tree = LsmTree::new(dir.path(), &config(3, 10));
        write_table(dir.path(), 1, 2, &[el("k", "oldest", false, 1), el("x", "x", false, 1)]);
        write_table(dir.path(), 1, 1, &[el("k", "old", false, 2)]);
        write_table(dir.path(), 2, 1, &[el("k", "new", false, 3), el("x", "", true, 4)]);

        match tree.search("k").unwrap() {
            Lookup::Found(e) => assert_eq!(e.value, b"new"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tree.search("x").unwrap(), Lookup::Deleted);
        assert_eq!(tree.search("nope").unwrap(), Lookup::Absent);
    }

    #[test]
    fn test_remove_incomplete_tables() {
        let dir = TempDir::new().unwrap();
        let tree = LsmTree::new(dir.path(), &config(3, 2));
        let complete = write_table(dir.path(), 1, 1, &[el("a", "1", false, 1)]);
        let broken = write_table(dir.path(), 2, 1, &[el("b", "2", false, 2)]);
        fs::remove_file(broken.files().toc()).unwrap();

        assert_eq!(tree.remove_incomplete_tables().unwrap(), 1);
        assert!(!broken.files().data().exists());
        assert!(complete.files().data().exists());
        assert_eq!(tree.tables_at(1).unwrap().len(), 1);
    }
}
