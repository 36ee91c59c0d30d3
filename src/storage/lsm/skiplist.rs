//! Arena-backed skip list keyed by string
//!
//! Nodes live in a `Vec` and link to each other by index. Index 0 is the
//! head sentinel, present at every level. Nothing is ever unlinked: deletes
//! flip the node's tombstone flag in place.
//!
//! ## Ordering
//! Insertion advances while `next.key <= key`, so a second insert of an
//! existing key lands *after* the first. Searches return the first equal
//! node met during the descent.

use super::element::{next_timestamp, Element};
use crate::storage::checksum::Checksum;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

type NodeId = usize;

const HEAD: NodeId = 0;

#[derive(Debug)]
struct Node {
    element: Element,
    /// `next[i]` is the successor at level `i`
    next: Vec<Option<NodeId>>,
}

pub struct SkipList {
    nodes: Vec<Node>,
    max_height: usize,
    /// Highest level index in use
    current_level: usize,
    rng: StdRng,
}

impl SkipList {
    pub fn new(max_height: usize) -> Self {
        Self::with_rng(max_height, StdRng::from_entropy())
    }

    /// Deterministic level choice, for tests.
    pub fn with_seed(max_height: usize, seed: u64) -> Self {
        Self::with_rng(max_height, StdRng::seed_from_u64(seed))
    }

    fn with_rng(max_height: usize, rng: StdRng) -> Self {
        let max_height = max_height.max(1);
        let head = Node {
            element: Element::with_timestamp(String::new(), Vec::new(), false, 0),
            next: vec![None; max_height],
        };
        Self {
            nodes: vec![head],
            max_height,
            current_level: 0,
            rng,
        }
    }

    /// Fair coin flips; the result is a level index in `0..max_height`.
    fn random_level(&mut self) -> usize {
        let mut level = 0;
        while level + 1 < self.max_height && self.rng.gen_bool(0.5) {
            level += 1;
        }
        level
    }

    fn key_of(&self, id: NodeId) -> &str {
        &self.nodes[id].element.key
    }

    /// Descend to the first node whose key equals `key`.
    fn find(&self, key: &str) -> Option<NodeId> {
        let mut x = HEAD;
        for level in (0..=self.current_level).rev() {
            while let Some(n) = self.nodes[x].next[level] {
                let k = self.key_of(n);
                if k == key {
                    return Some(n);
                }
                if k < key {
                    x = n;
                } else {
                    break;
                }
            }
        }
        None
    }

    pub fn insert(&mut self, element: Element) {
        let level = self.random_level();
        if level > self.current_level {
            self.current_level = level;
        }

        let mut update = vec![HEAD; self.max_height];
        let mut x = HEAD;
        for l in (0..=self.current_level).rev() {
            while let Some(n) = self.nodes[x].next[l] {
                if self.key_of(n) <= element.key.as_str() {
                    x = n;
                } else {
                    break;
                }
            }
            update[l] = x;
        }

        let id = self.nodes.len();
        let mut next = vec![None; level + 1];
        for (l, slot) in next.iter_mut().enumerate() {
            *slot = self.nodes[update[l]].next[l];
        }
        self.nodes.push(Node { element, next });
        for (l, pred) in update.iter().enumerate().take(level + 1) {
            self.nodes[*pred].next[l] = Some(id);
        }
    }

    pub fn retrieve(&self, key: &str) -> Option<&Element> {
        self.find(key).map(|id| &self.nodes[id].element)
    }

    /// Soft delete: set the tombstone and refresh the timestamp in place.
    /// Returns the updated element, or `None` if the key is absent.
    pub fn delete(&mut self, key: &str) -> Option<&Element> {
        let id = self.find(key)?;
        let element = &mut self.nodes[id].element;
        element.tombstone = true;
        element.timestamp = next_timestamp();
        Some(&self.nodes[id].element)
    }

    /// Replace the value of an existing node in place.
    pub fn update(&mut self, key: &str, value: Vec<u8>, tombstone: bool, timestamp: u64) -> bool {
        match self.find(key) {
            Some(id) => {
                let element = &mut self.nodes[id].element;
                element.checksum = Checksum::crc32(&value);
                element.value = value;
                element.tombstone = tombstone;
                element.timestamp = timestamp;
                true
            }
            None => false,
        }
    }

    /// Node count, excluding the head.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Level-0 traversal, ascending key order.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            list: self,
            cursor: self.nodes[HEAD].next[0],
        }
    }
}

pub struct Iter<'a> {
    list: &'a SkipList,
    cursor: Option<NodeId>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Element;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.cursor?;
        let node = &self.list.nodes[id];
        self.cursor = node.next[0];
        Some(&node.element)
    }
}
