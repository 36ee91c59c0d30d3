//! Element: the record that flows through WAL, memtable and SSTables
//!
//! ## Timestamps
//! Nanoseconds since the Unix epoch, forced strictly increasing within the
//! process, rendered as 19 zero-padded ASCII digits. Byte order of the text
//! form equals numeric order.

use crate::storage::checksum::{Checksum, ChecksumError};
use crate::{Result, StorageError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Width of the text-encoded timestamp.
pub const TIMESTAMP_SIZE: usize = 19;

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Next write timestamp. Never returns the same value twice.
pub fn next_timestamp() -> u64 {
    let wall = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last + 1);
        match LAST_TIMESTAMP.compare_exchange_weak(
            last,
            next,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => return next,
            Err(current) => last = current,
        }
    }
}

pub fn encode_timestamp(ts: u64) -> [u8; TIMESTAMP_SIZE] {
    let text = format!("{:019}", ts);
    let mut out = [b'0'; TIMESTAMP_SIZE];
    // u64::MAX has 20 digits; keep the low 19
    let bytes = text.as_bytes();
    out.copy_from_slice(&bytes[bytes.len() - TIMESTAMP_SIZE..]);
    out
}

pub fn decode_timestamp(bytes: &[u8]) -> Result<u64> {
    if bytes.len() != TIMESTAMP_SIZE {
        return Err(StorageError::InvalidData(format!(
            "timestamp must be {} bytes, got {}",
            TIMESTAMP_SIZE,
            bytes.len()
        )));
    }
    let text = std::str::from_utf8(bytes)
        .map_err(|_| StorageError::InvalidData("timestamp is not ASCII".into()))?;
    text.parse::<u64>()
        .map_err(|_| StorageError::InvalidData(format!("bad timestamp {:?}", text)))
}

/// Immutable once written to a WAL segment or an SSTable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub key: String,
    pub value: Vec<u8>,
    pub tombstone: bool,
    pub timestamp: u64,
    /// CRC32 of `value`
    pub checksum: u32,
}

impl Element {
    /// New element stamped with the current time.
    pub fn new(key: impl Into<String>, value: Vec<u8>, tombstone: bool) -> Self {
        Self::with_timestamp(key, value, tombstone, next_timestamp())
    }

    pub fn with_timestamp(
        key: impl Into<String>,
        value: Vec<u8>,
        tombstone: bool,
        timestamp: u64,
    ) -> Self {
        let checksum = Checksum::crc32(&value);
        Self {
            key: key.into(),
            value,
            tombstone,
            timestamp,
            checksum,
        }
    }

    /// Check the stored CRC32 against the value.
    pub fn verify_checksum(&self) -> std::result::Result<(), ChecksumError> {
        Checksum::verify(&self.value, self.checksum)
    }
}

// ---- LEB128 varints for SSTable data record lengths ----

pub fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Decode a varint from the front of `buf`, returning `(value, bytes_used)`.
/// `None` if `buf` ends mid-varint or the value overflows 64 bits.
pub fn get_uvarint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.iter().enumerate() {
        if i == 10 {
            return None;
        }
        if b < 0x80 {
            if i == 9 && b > 1 {
                return None;
            }
            return Some((value | (b as u64) << shift, i + 1));
        }
        value |= ((b & 0x7f) as u64) << shift;
        shift += 7;
    }
    None
}

pub(crate) fn read_u64_le(buf: &[u8], at: usize) -> Result<u64> {
    let end = at
        .checked_add(8)
        .ok_or_else(|| StorageError::InvalidData("offset overflow".into()))?;
    let bytes = buf.get(at..end).ok_or_else(|| {
        StorageError::InvalidData(format!("truncated u64 at offset {} (len {})", at, buf.len()))
    })?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(bytes);
    Ok(u64::from_le_bytes(arr))
}
