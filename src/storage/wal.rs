//! Segmented write-ahead log
//!
//! Every write is appended here before it touches the memtable.
//!
//! ## Record layout
//! ```text
//! [crc32: u32][timestamp: 19 ASCII digits][tombstone: u8]
//! [key_len: u64][value_len: u64][key][value]
//! ```
//!
//! ## Segments
//! - Files `wal<N>.log`, N starting at 1
//! - Each segment holds at most `segment_capacity` bytes; a record that does
//!   not fit is split and continues in the next segment
//! - A full segment is persisted before the next one is started
//! - After a memtable flush every segment is obsolete and gets removed
//!
//! ## 持久性
//! - `Synchronous`: each append is written and fsynced before returning
//! - `Buffered`: bytes reach disk on rotation, `persist_current_segment` and drop
//!
//! ## Recovery
//! Records are framed by their length fields. `open` cuts off a record whose
//! declared length runs past the end of the log (a torn write), then reloads
//! the highest segment as the working one. `replay` decodes all surviving
//! segments in order; they only ever contain writes that never made it into a
//! table. A record that is whole but fails to decode is skipped, and the
//! records after it are still replayed. Checksums are not verified here.

use crate::config::{DurabilityLevel, WalConfig};
use crate::storage::lsm::element::{
    decode_timestamp, encode_timestamp, read_u64_le, Element, TIMESTAMP_SIZE,
};
use crate::{Result, StorageError};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

const CRC_SIZE: usize = 4;
const TOMBSTONE_SIZE: usize = 1;
const KEY_SIZE_SIZE: usize = 8;
const VALUE_SIZE_SIZE: usize = 8;
const HEADER_SIZE: usize =
    CRC_SIZE + TIMESTAMP_SIZE + TOMBSTONE_SIZE + KEY_SIZE_SIZE + VALUE_SIZE_SIZE;
/// Offset of the key length field inside the header
const SIZES_OFFSET: usize = CRC_SIZE + TIMESTAMP_SIZE + TOMBSTONE_SIZE;

/// The working segment, held in memory.
#[derive(Debug)]
struct Segment {
    index: u64,
    data: Vec<u8>,
    /// Prefix of `data` already in the segment file
    persisted: usize,
}

impl Segment {
    fn empty(index: u64) -> Self {
        Self {
            index,
            data: Vec::new(),
            persisted: 0,
        }
    }
}

pub struct WriteAheadLog {
    dir: PathBuf,
    capacity: usize,
    durability: DurabilityLevel,
    segment: Segment,
}

impl WriteAheadLog {
    /// Open the log in `dir`, reloading the newest segment if there is one.
    pub fn open<P: AsRef<Path>>(dir: P, config: &WalConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        if config.segment_capacity == 0 {
            return Err(StorageError::InvalidConfig(
                "wal segment capacity must be positive".into(),
            ));
        }

        truncate_torn_tail(&dir)?;
        let segment = match Self::segment_indices_in(&dir)?.last() {
            Some(&index) => {
                let data = fs::read(segment_path(&dir, index))?;
                let persisted = data.len();
                Segment {
                    index,
                    data,
                    persisted,
                }
            }
            None => Segment::empty(1),
        };

        Ok(Self {
            dir,
            capacity: config.segment_capacity,
            durability: config.durability,
            segment,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn current_index(&self) -> u64 {
        self.segment.index
    }

    /// Serialize an element in the log record layout.
    pub fn encode(element: &Element) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + element.key.len() + element.value.len());
        buf.extend_from_slice(&element.checksum.to_le_bytes());
        buf.extend_from_slice(&encode_timestamp(element.timestamp));
        buf.push(element.tombstone as u8);
        buf.extend_from_slice(&(element.key.len() as u64).to_le_bytes());
        buf.extend_from_slice(&(element.value.len() as u64).to_le_bytes());
        buf.extend_from_slice(element.key.as_bytes());
        buf.extend_from_slice(&element.value);
        buf
    }

    /// Append one element, rotating segments as they fill up.
    pub fn put_element(&mut self, element: &Element) -> Result<()> {
        let record = Self::encode(element);
        let mut rest = record.as_slice();
        while !rest.is_empty() {
            if self.segment.data.len() >= self.capacity {
                self.rotate()?;
            }
            let space = self.capacity - self.segment.data.len();
            let n = space.min(rest.len());
            self.segment.data.extend_from_slice(&rest[..n]);
            rest = &rest[n..];
        }
        if self.durability.requires_immediate_sync() {
            self.persist_current_segment()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<()> {
        self.persist_current_segment()?;
        let next = self.segment.index + 1;
        tracing::debug!(from = self.segment.index, to = next, "Rotating WAL segment");
        self.segment = Segment::empty(next);
        Ok(())
    }

    /// Write the unpersisted tail of the working segment and fsync it.
    pub fn persist_current_segment(&mut self) -> Result<()> {
        let path = segment_path(&self.dir, self.segment.index);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if self.segment.persisted < self.segment.data.len() {
            file.write_all(&self.segment.data[self.segment.persisted..])?;
        }
        file.sync_data()?;
        self.segment.persisted = self.segment.data.len();
        Ok(())
    }

    /// Drop every segment up to the working one and start a fresh segment.
    /// Only valid once everything logged so far is in a durable table.
    pub fn remove_old_segments(&mut self) -> Result<()> {
        let mut removed = 0;
        for index in Self::segment_indices_in(&self.dir)? {
            if index <= self.segment.index {
                fs::remove_file(segment_path(&self.dir, index))?;
                removed += 1;
            }
        }
        let next = self.segment.index + 1;
        self.segment = Segment::empty(next);
        tracing::info!(removed = removed, next_segment = next, "Pruned WAL segments");
        Ok(())
    }

    /// Indices of the segment files on disk, ascending.
    pub fn segment_indices(&self) -> Result<Vec<u64>> {
        Self::segment_indices_in(&self.dir)
    }

    fn segment_indices_in(dir: &Path) -> Result<Vec<u64>> {
        let mut indices = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(index) = entry.file_name().to_str().and_then(parse_segment_name) {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    /// Decode every complete record in the surviving segments, in write order.
    pub fn replay(&self) -> Result<Vec<Element>> {
        let mut bytes = Vec::new();
        for index in Self::segment_indices_in(&self.dir)? {
            if index == self.segment.index {
                continue;
            }
            bytes.extend_from_slice(&fs::read(segment_path(&self.dir, index))?);
        }
        bytes.extend_from_slice(&self.segment.data);

        let mut elements = Vec::new();
        let mut skipped = 0usize;
        let mut at = 0;
        while at < bytes.len() {
            let Some(end) = record_end(&bytes, at) else {
                tracing::warn!(
                    offset = at,
                    discarded_bytes = bytes.len() - at,
                    "Ignoring torn record at the end of the WAL"
                );
                break;
            };
            match decode_record(&bytes, at) {
                Ok((element, _)) => elements.push(element),
                Err(e) => {
                    skipped += 1;
                    tracing::warn!(offset = at, error = %e, "Skipping malformed WAL record");
                }
            }
            at = end;
        }
        if skipped > 0 {
            tracing::warn!(
                skipped = skipped,
                replayed = elements.len(),
                "WAL replay skipped malformed records"
            );
        }
        Ok(elements)
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        if self.segment.persisted < self.segment.data.len() {
            if let Err(e) = self.persist_current_segment() {
                tracing::warn!(
                    segment = self.segment.index,
                    error = %e,
                    "Failed to persist WAL segment on drop"
                );
            }
        }
    }
}

/// End offset of the record starting at `at`, judged by its length fields
/// alone. `None` if the header or the body runs past the end of `buf`.
fn record_end(buf: &[u8], at: usize) -> Option<usize> {
    let sizes = at.checked_add(SIZES_OFFSET)?;
    let key_len = read_u64_le(buf, sizes).ok()?;
    let value_len = read_u64_le(buf, sizes + KEY_SIZE_SIZE).ok()?;
    let end = (at + HEADER_SIZE)
        .checked_add(usize::try_from(key_len).ok()?)?
        .checked_add(usize::try_from(value_len).ok()?)?;
    (end <= buf.len()).then_some(end)
}

/// Length of the longest prefix of `bytes` made of whole records.
fn complete_prefix(bytes: &[u8]) -> usize {
    let mut at = 0;
    while at < bytes.len() {
        match record_end(bytes, at) {
            Some(end) => at = end,
            None => break,
        }
    }
    at
}

/// Shrink the newest segments so the log ends on a record boundary.
fn truncate_torn_tail(dir: &Path) -> Result<()> {
    let indices = WriteAheadLog::segment_indices_in(dir)?;
    let mut lens = Vec::with_capacity(indices.len());
    let mut bytes = Vec::new();
    for &index in &indices {
        let segment = fs::read(segment_path(dir, index))?;
        lens.push(segment.len());
        bytes.extend_from_slice(&segment);
    }

    let valid = complete_prefix(&bytes);
    if valid == bytes.len() {
        return Ok(());
    }
    let mut excess = bytes.len() - valid;
    tracing::warn!(
        offset = valid,
        discarded_bytes = excess,
        "Truncating torn record at the end of the WAL"
    );

    for (&index, &len) in indices.iter().zip(lens.iter()).rev() {
        if excess == 0 {
            break;
        }
        let path = segment_path(dir, index);
        if len <= excess {
            fs::remove_file(&path)?;
            excess -= len;
        } else {
            let file = OpenOptions::new().write(true).open(&path)?;
            file.set_len((len - excess) as u64)?;
            file.sync_data()?;
            excess = 0;
        }
    }
    Ok(())
}

fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("wal{}.log", index))
}

fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix("wal")?.strip_suffix(".log")?.parse().ok()
}

fn decode_record(buf: &[u8], at: usize) -> Result<(Element, usize)> {
    let torn = || StorageError::InvalidData(format!("incomplete WAL record at {}", at));
    let header = buf.get(at..at + HEADER_SIZE).ok_or_else(torn)?;

    let mut crc = [0u8; CRC_SIZE];
    crc.copy_from_slice(&header[..CRC_SIZE]);
    let timestamp = decode_timestamp(&header[CRC_SIZE..CRC_SIZE + TIMESTAMP_SIZE])?;
    let tombstone = header[CRC_SIZE + TIMESTAMP_SIZE] != 0;
    let key_len = read_u64_le(header, SIZES_OFFSET)? as usize;
    let value_len = read_u64_le(header, SIZES_OFFSET + KEY_SIZE_SIZE)? as usize;

    let key_start = at + HEADER_SIZE;
    let key_end = key_start.checked_add(key_len).ok_or_else(torn)?;
    let value_end = key_end.checked_add(value_len).ok_or_else(torn)?;
    let key = buf.get(key_start..key_end).ok_or_else(torn)?;
    let value = buf.get(key_end..value_end).ok_or_else(torn)?;
    let key = String::from_utf8(key.to_vec())
        .map_err(|_| StorageError::InvalidData(format!("WAL key at {} is not UTF-8", at)))?;

    Ok((
        Element {
            key,
            value: value.to_vec(),
            tombstone,
            timestamp,
            checksum: u32::from_le_bytes(crc),
        },
        value_end,
    ))
}
