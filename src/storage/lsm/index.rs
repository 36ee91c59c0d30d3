//! Index file: every key with its byte offset in the Data file
//!
//! ```text
//! [count: u64]
//! [key_len: u64][key][data_offset: u64]   x count, ascending key order
//! ```

use super::element::read_u64_le;
use crate::{Result, StorageError};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Offset of the first entry, right after the count header.
pub const FIRST_ENTRY_OFFSET: u64 = 8;

/// Write the index and return the file offset of each entry, in input order.
pub fn write_index(path: &Path, entries: &[(String, u64)]) -> Result<Vec<u64>> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&(entries.len() as u64).to_le_bytes())?;

    let mut offsets = Vec::with_capacity(entries.len());
    let mut pos = FIRST_ENTRY_OFFSET;
    for (key, data_offset) in entries {
        offsets.push(pos);
        writer.write_all(&(key.len() as u64).to_le_bytes())?;
        writer.write_all(key.as_bytes())?;
        writer.write_all(&data_offset.to_le_bytes())?;
        pos += 16 + key.len() as u64;
    }
    writer.flush()?;
    writer.get_ref().sync_data()?;
    Ok(offsets)
}

/// One parsed entry plus the offset of the next one.
struct IndexEntry<'a> {
    key: &'a [u8],
    data_offset: u64,
    next: usize,
}

fn read_entry(buf: &[u8], at: usize) -> Result<IndexEntry<'_>> {
    let key_len = read_u64_le(buf, at)? as usize;
    let key_start = at + 8;
    let key_end = key_start
        .checked_add(key_len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| {
            StorageError::InvalidData(format!("index key at {} overruns file", at))
        })?;
    let data_offset = read_u64_le(buf, key_end)?;
    Ok(IndexEntry {
        key: &buf[key_start..key_end],
        data_offset,
        next: key_end + 8,
    })
}

/// Linear scan from `start` for `key`, stopping once a larger key shows up.
pub fn find_in_index(buf: &[u8], start: u64, key: &str) -> Result<Option<u64>> {
    let count = read_u64_le(buf, 0)?;
    if count == 0 {
        return Ok(None);
    }
    let target = key.as_bytes();
    let mut at = start as usize;
    if at < FIRST_ENTRY_OFFSET as usize {
        return Err(StorageError::InvalidData(format!("index offset {} inside header", at)));
    }
    while at < buf.len() {
        let entry = read_entry(buf, at)?;
        match entry.key.cmp(target) {
            std::cmp::Ordering::Equal => return Ok(Some(entry.data_offset)),
            std::cmp::Ordering::Greater => return Ok(None),
            std::cmp::Ordering::Less => at = entry.next,
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_scan() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Index.db");
        let entries: Vec<(String, u64)> = ["apple", "banana", "cherry", "date"]
            .iter()
            .enumerate()
            .map(|(i, k)| (k.to_string(), 8 + i as u64 * 100))
            .collect();
        let offsets = write_index(&path, &entries).unwrap();
        assert_eq!(offsets[0], FIRST_ENTRY_OFFSET);
        assert_eq!(offsets[1], 8 + 16 + 5);

        let buf = std::fs::read(&path).unwrap();
        assert_eq!(find_in_index(&buf, FIRST_ENTRY_OFFSET, "cherry").unwrap(), Some(208));
        // starting mid-file from a summary offset
        assert_eq!(find_in_index(&buf, offsets[2], "date").unwrap(), Some(308));
        assert_eq!(find_in_index(&buf, FIRST_ENTRY_OFFSET, "blueberry").unwrap(), None);
        assert_eq!(find_in_index(&buf, FIRST_ENTRY_OFFSET, "zebra").unwrap(), None);
    }

    #[test]
    fn test_empty_index() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Index.db");
        write_index(&path, &[]).unwrap();
        let buf = std::fs::read(&path).unwrap();
        assert_eq!(buf.len(), 8);
        assert_eq!(find_in_index(&buf, FIRST_ENTRY_OFFSET, "k").unwrap(), None);
    }

    #[test]
    fn test_truncated_index_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("Index.db");
        write_index(&path, &[("key".to_string(), 8)]).unwrap();
        let mut buf = std::fs::read(&path).unwrap();
        buf.truncate(buf.len() - 3);
        assert!(find_in_index(&buf, FIRST_ENTRY_OFFSET, "key").is_err());
    }
}
