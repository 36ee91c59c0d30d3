//! Summary file: a sparse layer over the Index
//!
//! ```text
//! [count: u64]                       entries that follow (first + last + samples)
//! [key_len: u64][first_key]
//! [key_len: u64][last_key]
//! [key_len: u64][key][index_offset: u64]   x (count - 2), ascending key order
//! ```
//! Interior keys are sampled with probability 1/2. A lookup rejects keys
//! outside `[first_key, last_key]` and otherwise starts the index scan at the
//! last sample `<= key`, or at the first index entry if there is none.

use super::element::read_u64_le;
use super::index::FIRST_ENTRY_OFFSET;
use crate::{Result, StorageError};
use rand::Rng;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Summary {
    pub first_key: String,
    pub last_key: String,
    /// (key, offset into the Index file)
    pub samples: Vec<(String, u64)>,
}

impl Summary {
    /// Sample `keys` (sorted, with their index offsets) into a summary.
    /// `None` for an empty table.
    pub fn build<R: Rng>(keys: &[(String, u64)], rng: &mut R) -> Option<Self> {
        let (first, _) = keys.first()?;
        let (last, _) = keys.last()?;
        let samples = if keys.len() > 2 {
            keys[1..keys.len() - 1]
                .iter()
                .filter(|_| rng.gen_bool(0.5))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };
        Some(Self {
            first_key: first.clone(),
            last_key: last.clone(),
            samples,
        })
    }

    /// Index offset to start scanning from, or `None` if `key` is out of range.
    pub fn find(&self, key: &str) -> Option<u64> {
        if key < self.first_key.as_str() || key > self.last_key.as_str() {
            return None;
        }
        let mut offset = FIRST_ENTRY_OFFSET;
        for (sample, index_offset) in &self.samples {
            if sample.as_str() > key {
                break;
            }
            offset = *index_offset;
        }
        Some(offset)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.samples.len() as u64 + 2).to_le_bytes());
        for key in [&self.first_key, &self.last_key] {
            buf.extend_from_slice(&(key.len() as u64).to_le_bytes());
            buf.extend_from_slice(key.as_bytes());
        }
        for (key, offset) in &self.samples {
            buf.extend_from_slice(&(key.len() as u64).to_le_bytes());
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(&offset.to_le_bytes());
        }
        buf
    }

    /// Parse a summary file. `Ok(None)` for the empty-table form.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        let count = read_u64_le(buf, 0)?;
        if count == 0 {
            return Ok(None);
        }
        if count < 2 {
            return Err(StorageError::InvalidData(format!(
                "summary count {} is missing first/last keys",
                count
            )));
        }
        let mut at = 8;
        let first_key = read_key(buf, &mut at)?;
        let last_key = read_key(buf, &mut at)?;
        let mut samples = Vec::with_capacity((count - 2) as usize);
        for _ in 2..count {
            let key = read_key(buf, &mut at)?;
            let offset = read_u64_le(buf, at)?;
            at += 8;
            samples.push((key, offset));
        }
        Ok(Some(Self {
            first_key,
            last_key,
            samples,
        }))
    }
}

fn read_key(buf: &[u8], at: &mut usize) -> Result<String> {
    let len = read_u64_le(buf, *at)? as usize;
    let start = *at + 8;
    let bytes = start
        .checked_add(len)
        .and_then(|end| buf.get(start..end))
        .ok_or_else(|| StorageError::InvalidData(format!("summary key at {} overruns file", at)))?;
    *at = start + len;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| StorageError::InvalidData("summary key is not UTF-8".into()))
}

/// Write the summary for `keys`; an empty table gets a bare zero count.
pub fn write_summary<R: Rng>(path: &Path, keys: &[(String, u64)], rng: &mut R) -> Result<()> {
    let bytes = match Summary::build(keys, rng) {
        Some(summary) => summary.encode(),
        None => 0u64.to_le_bytes().to_vec(),
    };
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&bytes)?;
    writer.flush()?;
    writer.get_ref().sync_data()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn keys(n: usize) -> Vec<(String, u64)> {
        (0..n)
            .map(|i| (format!("key{:03}", i), 8 + i as u64 * 30))
            .collect()
    }

    #[test]
    fn test_range_rejection() {
        let mut rng = StdRng::seed_from_u64(1);
        let summary = Summary::build(&keys(10), &mut rng).unwrap();
        assert_eq!(summary.first_key, "key000");
        assert_eq!(summary.last_key, "key009");
        assert_eq!(summary.find("a"), None);
        assert_eq!(summary.find("key010"), None);
        assert_eq!(summary.find("key000"), Some(FIRST_ENTRY_OFFSET));
    }

    #[test]
    fn test_find_returns_last_sample_not_after_key() {
        let summary = Summary {
            first_key: "a".into(),
            last_key: "z".into(),
            samples: vec![("d".into(), 100), ("m".into(), 200), ("t".into(), 300)],
        };
        assert_eq!(summary.find("b"), Some(FIRST_ENTRY_OFFSET));
        assert_eq!(summary.find("d"), Some(100));
        assert_eq!(summary.find("n"), Some(200));
        assert_eq!(summary.find("z"), Some(300));
    }

    #[test]
    fn test_sampling_is_roughly_half() {
        let mut rng = StdRng::seed_from_u64(7);
        // four digits so the fixture stays in ascending order past 999
        let wide: Vec<(String, u64)> = (0..1002)
            .map(|i| (format!("key{:04}", i), 8 + i as u64 * 30))
            .collect();
        let summary = Summary::build(&wide, &mut rng).unwrap();
        let n = summary.samples.len();
        assert!(n > 350 && n < 650, "sampled {} of 1000 interior keys", n);
        assert!(summary.samples.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_encode_decode() {
        let summary = Summary {
            first_key: "a".into(),
            last_key: "z".into(),
            samples: vec![("d".into(), 100), ("m".into(), 200)],
        };
        let bytes = summary.encode();
        assert_eq!(read_u64_le(&bytes, 0).unwrap(), 4);
        assert_eq!(Summary::decode(&bytes).unwrap(), Some(summary));
        assert_eq!(Summary::decode(&0u64.to_le_bytes()).unwrap(), None);
        assert!(Summary::decode(&bytes[..bytes.len() - 4]).is_err());
    }
}
