//! Merkle tree over a table's values
//!
//! Leaves are SHA-1 digests of each value in Data-file order. A parent is
//! SHA-1 of `left || right`; an unpaired node is paired with an all-zero
//! digest. The metadata file lists every node breadth-first, root first, one
//! lowercase hex digest per line. Reads never consult it.

use crate::storage::checksum::{to_hex, Checksum, Digest20, DIGEST_LEN};
use crate::{Result, StorageError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const ZERO_HASH: Digest20 = [0u8; DIGEST_LEN];

#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// `levels[0]` holds the leaves, the last level holds the root
    levels: Vec<Vec<Digest20>>,
}

impl MerkleTree {
    pub fn from_leaves(leaves: Vec<Digest20>) -> Self {
        let mut levels = vec![if leaves.is_empty() {
            vec![ZERO_HASH]
        } else {
            leaves
        }];
        while let Some(current) = levels.last().filter(|l| l.len() > 1) {
            let parents = current
                .chunks(2)
                .map(|pair| {
                    let right = pair.get(1).unwrap_or(&ZERO_HASH);
                    Checksum::sha1_pair(&pair[0], right)
                })
                .collect();
            levels.push(parents);
        }
        Self { levels }
    }

    pub fn from_values<'a, I>(values: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        Self::from_leaves(values.into_iter().map(Checksum::sha1).collect())
    }

    pub fn root(&self) -> Digest20 {
        self.levels
            .last()
            .and_then(|l| l.first())
            .copied()
            .unwrap_or(ZERO_HASH)
    }

    pub fn write_metadata(&self, path: &Path) -> Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        for level in self.levels.iter().rev() {
            for digest in level {
                writeln!(writer, "{}", to_hex(digest))?;
            }
        }
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }

    /// Root digest as stored on the first line of a metadata file.
    pub fn read_root(path: &Path) -> Result<Digest20> {
        let text = std::fs::read_to_string(path)?;
        let line = text
            .lines()
            .next()
            .ok_or_else(|| StorageError::CorruptedFile(path.to_path_buf()))?;
        parse_hex(line.trim()).ok_or_else(|| StorageError::CorruptedFile(path.to_path_buf()))
    }
}

fn parse_hex(text: &str) -> Option<Digest20> {
    if text.len() != DIGEST_LEN * 2 {
        return None;
    }
    let mut out = [0u8; DIGEST_LEN];
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = u8::from_str_radix(text.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(out)
}
