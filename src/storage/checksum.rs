//! Checksum 与哈希工具
//!
//! - **CRC32**: per-record integrity (WAL records, SSTable data records)
//! - **SHA-1**: merkle tree leaves and internal nodes
//! - **Keyed 32-bit hash**: the bloom filter's hash family, one seed per function
//!
//! ## 使用示例
//! ```ignore
//! use lsmkv::storage::checksum::Checksum;
//!
//! let crc = Checksum::crc32(b"value");
//! Checksum::verify(b"value", crc)?;
//! ```

use crc32fast::Hasher;
use sha1::{Digest, Sha1};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher as StdHasher};

/// Length of a SHA-1 digest in bytes.
pub const DIGEST_LEN: usize = 20;

pub type Digest20 = [u8; DIGEST_LEN];

pub struct Checksum;

impl Checksum {
    /// CRC32 (IEEE) of `data`.
    pub fn crc32(data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn verify(data: &[u8], expected: u32) -> Result<(), ChecksumError> {
        let actual = Self::crc32(data);
        if actual != expected {
            return Err(ChecksumError::Mismatch {
                expected,
                actual,
                data_len: data.len(),
            });
        }
        Ok(())
    }

    pub fn sha1(data: &[u8]) -> Digest20 {
        let mut hasher = Sha1::new();
        hasher.update(data);
        digest_bytes(hasher)
    }

    /// SHA-1 over the concatenation `left || right`.
    pub fn sha1_pair(left: &Digest20, right: &Digest20) -> Digest20 {
        let mut hasher = Sha1::new();
        hasher.update(left);
        hasher.update(right);
        digest_bytes(hasher)
    }

    /// One member of the keyed hash family. Different seeds give independent
    /// functions; the same seed always gives the same output.
    pub fn keyed_hash32(seed: u32, data: &[u8]) -> u32 {
        let mut hasher = DefaultHasher::new();
        seed.hash(&mut hasher);
        data.hash(&mut hasher);
        let h = hasher.finish();
        (h ^ (h >> 32)) as u32
    }
}

fn digest_bytes(hasher: Sha1) -> Digest20 {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(&hasher.finalize());
    out
}

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error(
        "Checksum mismatch: expected {expected:#010x}, got {actual:#010x} (data_len={data_len})"
    )]
    Mismatch {
        expected: u32,
        actual: u32,
        data_len: usize,
    },
}

/// Lowercase hex rendering of a digest.
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_known_value() {
        // IEEE CRC32 check value
        assert_eq!(Checksum::crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(Checksum::crc32(b""), 0);
    }

    #[test]
    fn test_verify() {
        let data = b"Hello, lsmkv!";
        let crc = Checksum::crc32(data);
        assert!(Checksum::verify(data, crc).is_ok());
        assert!(Checksum::verify(b"Hello, lsmkv?", crc).is_err());
    }

    #[test]
    fn test_sha1_known_value() {
        assert_eq!(
            to_hex(&Checksum::sha1(b"abc")),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_sha1_pair_is_concatenation() {
        let a = Checksum::sha1(b"a");
        let b = Checksum::sha1(b"b");
        let mut joined = a.to_vec();
        joined.extend_from_slice(&b);
        assert_eq!(Checksum::sha1_pair(&a, &b), Checksum::sha1(&joined));
    }

    #[test]
    fn test_keyed_hash_depends_on_seed() {
        let h1 = Checksum::keyed_hash32(1, b"key");
        let h2 = Checksum::keyed_hash32(2, b"key");
        assert_eq!(h1, Checksum::keyed_hash32(1, b"key"));
        assert_ne!(h1, h2);
    }
}
