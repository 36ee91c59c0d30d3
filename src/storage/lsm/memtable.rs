//! MemTable: in-memory write buffer backed by the skip list
//!
//! `size` counts inserted elements, overwrites included, and drives the
//! flush threshold. A write to a key that is already present replaces the
//! node's contents in place, so every key appears once in a flushed table.

use super::element::Element;
use super::skiplist::SkipList;
use super::sstable::{SSTable, TableBuilder};
use crate::config::MemTableConfig;
use crate::Result;
use std::path::Path;

/// Outcome of a memtable lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemLookup {
    Absent,
    /// Present with its tombstone set
    Deleted,
    Live(Vec<u8>),
}

pub struct MemTable {
    list: SkipList,
    size: usize,
    max_size: usize,
    threshold: f64,
}

impl MemTable {
    pub fn new(config: &MemTableConfig) -> Self {
        Self::from_list(SkipList::new(config.max_height), config)
    }

    /// Deterministic skip list levels, for tests.
    pub fn with_seed(config: &MemTableConfig, seed: u64) -> Self {
        Self::from_list(SkipList::with_seed(config.max_height, seed), config)
    }

    fn from_list(list: SkipList, config: &MemTableConfig) -> Self {
        Self {
            list,
            size: 0,
            max_size: config.max_size.max(1),
            threshold: config.threshold,
        }
    }

    /// Insert or overwrite. Keeps the element's own timestamp, which lets WAL
    /// replay restore the logged write order. Every call counts toward the
    /// flush threshold.
    pub fn insert(&mut self, element: Element) {
        self.upsert(element);
        self.size += 1;
    }

    /// Edit: replace the value of an existing node without counting it,
    /// falling back to a counted insert.
    pub fn modify(&mut self, element: Element) {
        if !self.upsert(element) {
            self.size += 1;
        }
    }

    /// Returns true if an existing node was updated in place.
    fn upsert(&mut self, element: Element) -> bool {
        if self.list.retrieve(&element.key).is_some() {
            let Element {
                key,
                value,
                tombstone,
                timestamp,
                ..
            } = element;
            return self.list.update(&key, value, tombstone, timestamp);
        }
        self.list.insert(element);
        false
    }

    pub fn retrieve(&self, key: &str) -> Option<&Element> {
        self.list.retrieve(key)
    }

    pub fn lookup(&self, key: &str) -> MemLookup {
        match self.list.retrieve(key) {
            None => MemLookup::Absent,
            Some(e) if e.tombstone => MemLookup::Deleted,
            Some(e) => MemLookup::Live(e.value.clone()),
        }
    }

    /// Soft delete in place. False when the key is absent or already deleted.
    pub fn erase(&mut self, key: &str) -> bool {
        match self.list.retrieve(key) {
            Some(e) if !e.tombstone => self.list.delete(key).is_some(),
            _ => false,
        }
    }

    pub fn should_flush(&self) -> bool {
        self.size as f64 / self.max_size as f64 * 100.0 >= self.threshold
    }

    pub fn current_size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = &Element> {
        self.list.iter()
    }

    /// Write every element, tombstones included, to a new level-1 table.
    pub fn flush(&self, dir: &Path, generation: u64, false_positive_rate: f64) -> Result<SSTable> {
        let elements = self.list.len();
        let mut builder =
            TableBuilder::create(dir, generation, 1, elements, false_positive_rate)?;
        for element in self.list.iter() {
            builder.add(element)?;
        }
        let table = builder.finish()?;
        tracing::info!(
            generation = generation,
            elements = elements,
            "Flushed memtable to level 1"
        );
        Ok(table)
    }
}
