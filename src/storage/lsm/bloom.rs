//! Bloom filter gating SSTable lookups
//!
//! ## Sizing
//! - bits: `m = ceil(-n * ln(p) / ln(2)^2)`
//! - hash functions: `k = round(m / n * ln(2))`
//!
//! Each hash function is the keyed hash with its own random seed. The seeds
//! are stored with the bits, so a filter read back from `Filter.gob` answers
//! exactly as the one that was written.

use crate::storage::checksum::Checksum;
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomFilter {
    /// Bit array
    bits: Vec<u8>,
    /// Number of bits (m)
    num_bits: u64,
    /// One seed per hash function (k = seeds.len())
    seeds: Vec<u32>,
}

impl BloomFilter {
    /// Size a filter for `expected_elements` at `false_positive_rate`.
    pub fn new(expected_elements: usize, false_positive_rate: f64) -> Self {
        let n = expected_elements.max(1) as f64;
        let ln2 = std::f64::consts::LN_2;
        let m = (-n * false_positive_rate.ln() / (ln2 * ln2)).ceil().max(1.0);
        let k = ((m / n) * ln2).round().max(1.0) as usize;

        let seeds = (0..k).map(|_| rand::random::<u32>()).collect();
        let num_bits = m as u64;
        Self {
            bits: vec![0u8; (num_bits as usize).div_ceil(8)],
            num_bits,
            seeds,
        }
    }

    pub fn num_hashes(&self) -> usize {
        self.seeds.len()
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    fn position(&self, seed: u32, key: &[u8]) -> usize {
        (Checksum::keyed_hash32(seed, key) as u64 % self.num_bits) as usize
    }

    pub fn insert(&mut self, key: &[u8]) {
        for i in 0..self.seeds.len() {
            let pos = self.position(self.seeds[i], key);
            self.bits[pos / 8] |= 1 << (pos % 8);
        }
    }

    /// False means the key was never inserted. True may be a false positive.
    pub fn may_contain(&self, key: &[u8]) -> bool {
        self.seeds.iter().all(|&seed| {
            let pos = self.position(seed, key);
            self.bits[pos / 8] & (1 << (pos % 8)) != 0
        })
    }

    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, self)?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let filter: BloomFilter = bincode::deserialize_from(BufReader::new(file))?;
        if filter.num_bits == 0
            || filter.bits.len() as u64 * 8 < filter.num_bits
            || filter.seeds.is_empty()
        {
            return Err(StorageError::CorruptedFile(path.to_path_buf()));
        }
        Ok(filter)
    }
}
