//! SSTable: immutable on-disk table
//!
//! ## File set
//! ```text
//! usertable-data-ic-<gen>-lev<level>-Data.db       records, ascending key order
//! usertable-data-ic-<gen>-lev<level>-Index.db      every key -> Data offset
//! usertable-data-ic-<gen>-lev<level>-Summary.db    first/last key + sampled Index offsets
//! usertable-data-ic-<gen>-lev<level>-Filter.gob    bloom filter (bincode)
//! usertable-data-ic-<gen>-lev<level>-Metadata.txt  merkle tree, breadth-first hex
//! usertable-data-ic-<gen>-lev<level>-TOC.txt       names of the four files above
//! ```
//! The TOC is written last. A table without one is incomplete and is never read.
//!
//! ## Data file
//! ```text
//! [count: u64]
//! [crc32: u32][timestamp: 19 ASCII digits][tombstone: u8]
//! [key_len: uvarint][value_len: uvarint][key][value]      x count
//! ```
//!
//! ## Lookup
//! bloom filter -> summary -> index scan -> one Data record, CRC-checked.

use super::bloom::BloomFilter;
use super::element::{
    decode_timestamp, encode_timestamp, get_uvarint, put_uvarint, read_u64_le, Element,
    TIMESTAMP_SIZE,
};
use super::index::{find_in_index, write_index};
use super::merkle::MerkleTree;
use super::summary::{write_summary, Summary};
use crate::storage::checksum::{Checksum, Digest20};
use crate::{Result, StorageError};
use memmap2::Mmap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const TABLE_PREFIX: &str = "usertable-data-ic-";

/// crc + timestamp + tombstone
const RECORD_HEADER_SIZE: usize = 4 + TIMESTAMP_SIZE + 1;

/// Paths of one table's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFiles {
    pub dir: PathBuf,
    pub generation: u64,
    pub level: usize,
}

impl TableFiles {
    pub fn new(dir: &Path, generation: u64, level: usize) -> Self {
        Self {
            dir: dir.to_path_buf(),
            generation,
            level,
        }
    }

    fn name(&self, suffix: &str) -> String {
        format!(
            "{}{}-lev{}-{}",
            TABLE_PREFIX, self.generation, self.level, suffix
        )
    }

    pub fn data(&self) -> PathBuf {
        self.dir.join(self.name("Data.db"))
    }

    pub fn index(&self) -> PathBuf {
        self.dir.join(self.name("Index.db"))
    }

    pub fn summary(&self) -> PathBuf {
        self.dir.join(self.name("Summary.db"))
    }

    pub fn filter(&self) -> PathBuf {
        self.dir.join(self.name("Filter.gob"))
    }

    pub fn toc(&self) -> PathBuf {
        self.dir.join(self.name("TOC.txt"))
    }

    pub fn metadata(&self) -> PathBuf {
        self.dir.join(self.name("Metadata.txt"))
    }

    pub fn all(&self) -> [PathBuf; 6] {
        [
            self.data(),
            self.index(),
            self.summary(),
            self.filter(),
            self.metadata(),
            self.toc(),
        ]
    }

    /// `(generation, level, suffix)` from any table file name.
    pub fn parse_name(file_name: &str) -> Option<(u64, usize, &str)> {
        let rest = file_name.strip_prefix(TABLE_PREFIX)?;
        let (generation, rest) = rest.split_once("-lev")?;
        let (level, suffix) = rest.split_once('-')?;
        Some((generation.parse().ok()?, level.parse().ok()?, suffix))
    }
}

/// Result of a point lookup in one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// Key not in this table (or its record failed the CRC check)
    Absent,
    /// Key present with its tombstone set
    Deleted,
    Found(Element),
}

/// Serialize one Data record.
pub fn encode_record(element: &Element, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&element.checksum.to_le_bytes());
    buf.extend_from_slice(&encode_timestamp(element.timestamp));
    buf.push(element.tombstone as u8);
    put_uvarint(buf, element.key.len() as u64);
    put_uvarint(buf, element.value.len() as u64);
    buf.extend_from_slice(element.key.as_bytes());
    buf.extend_from_slice(&element.value);
}

/// Parse the record at `at`, returning it and the offset just past it.
/// The stored checksum is returned as-is; callers decide whether to verify.
pub fn decode_record(buf: &[u8], at: usize) -> Result<(Element, usize)> {
    let truncated = || StorageError::InvalidData(format!("data record at {} is truncated", at));

    let header = buf.get(at..at + RECORD_HEADER_SIZE).ok_or_else(truncated)?;
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&header[..4]);
    let checksum = u32::from_le_bytes(crc);
    let timestamp = decode_timestamp(&header[4..4 + TIMESTAMP_SIZE])?;
    let tombstone = match header[RECORD_HEADER_SIZE - 1] {
        0 => false,
        1 => true,
        other => {
            return Err(StorageError::InvalidData(format!(
                "bad tombstone byte {} at {}",
                other, at
            )))
        }
    };

    let mut pos = at + RECORD_HEADER_SIZE;
    let (key_len, used) = get_uvarint(buf.get(pos..).ok_or_else(truncated)?).ok_or_else(truncated)?;
    pos += used;
    let (value_len, used) =
        get_uvarint(buf.get(pos..).ok_or_else(truncated)?).ok_or_else(truncated)?;
    pos += used;

    let key_end = pos.checked_add(key_len as usize).ok_or_else(truncated)?;
    let value_end = key_end.checked_add(value_len as usize).ok_or_else(truncated)?;
    let key = buf.get(pos..key_end).ok_or_else(truncated)?;
    let value = buf.get(key_end..value_end).ok_or_else(truncated)?;
    let key = String::from_utf8(key.to_vec())
        .map_err(|_| StorageError::InvalidData(format!("record key at {} is not UTF-8", at)))?;

    Ok((
        Element {
            key,
            value: value.to_vec(),
            tombstone,
            timestamp,
            checksum,
        },
        value_end,
    ))
}

fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path)?;
    // SAFETY: table files are never modified after their TOC is written.
    let mmap = unsafe { Mmap::map(&file)? };
    Ok(mmap)
}

fn sync_dir(dir: &Path) -> Result<()> {
    // Directory fsync makes the new file names durable on Unix.
    #[cfg(unix)]
    File::open(dir)?.sync_all()?;
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

/// Streams sorted elements into a new table's file set.
pub struct TableBuilder {
    files: TableFiles,
    writer: BufWriter<File>,
    offset: u64,
    count: u64,
    index: Vec<(String, u64)>,
    bloom: BloomFilter,
    leaves: Vec<Digest20>,
    buf: Vec<u8>,
}

impl TableBuilder {
    pub fn create(
        dir: &Path,
        generation: u64,
        level: usize,
        expected_elements: usize,
        false_positive_rate: f64,
    ) -> Result<Self> {
        let files = TableFiles::new(dir, generation, level);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(files.data())?;
        let mut writer = BufWriter::new(file);
        // count is patched in finish()
        writer.write_all(&0u64.to_le_bytes())?;

        Ok(Self {
            files,
            writer,
            offset: 8,
            count: 0,
            index: Vec::with_capacity(expected_elements),
            bloom: BloomFilter::new(expected_elements, false_positive_rate),
            leaves: Vec::with_capacity(expected_elements),
            buf: Vec::new(),
        })
    }

    /// Append the next element. Keys must be strictly ascending.
    pub fn add(&mut self, element: &Element) -> Result<()> {
        if let Some((last, _)) = self.index.last() {
            if element.key.as_str() <= last.as_str() {
                return Err(StorageError::InvalidData(format!(
                    "table keys out of order: {:?} after {:?}",
                    element.key, last
                )));
            }
        }

        self.buf.clear();
        encode_record(element, &mut self.buf);
        self.writer.write_all(&self.buf)?;

        self.index.push((element.key.clone(), self.offset));
        self.bloom.insert(element.key.as_bytes());
        self.leaves.push(Checksum::sha1(&element.value));
        self.offset += self.buf.len() as u64;
        self.count += 1;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Patch the header, write the auxiliary files, then the TOC.
    pub fn finish(self) -> Result<SSTable> {
        let TableBuilder {
            files,
            writer,
            count,
            index,
            bloom,
            leaves,
            ..
        } = self;

        let mut file = writer.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&count.to_le_bytes())?;
        file.sync_data()?;
        drop(file);

        let index_offsets = write_index(&files.index(), &index)?;
        let sampled: Vec<(String, u64)> = index
            .into_iter()
            .zip(index_offsets)
            .map(|((key, _), offset)| (key, offset))
            .collect();
        write_summary(&files.summary(), &sampled, &mut rand::thread_rng())?;
        bloom.write_to(&files.filter())?;
        MerkleTree::from_leaves(leaves).write_metadata(&files.metadata())?;

        let toc = [files.data(), files.index(), files.summary(), files.filter()]
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect::<Vec<_>>()
            .join("\n");
        let mut toc_file = File::create(files.toc())?;
        toc_file.write_all(toc.as_bytes())?;
        toc_file.write_all(b"\n")?;
        toc_file.sync_data()?;
        sync_dir(&files.dir)?;

        SSTable::open(&files.toc())
    }
}

/// A complete table on disk.
#[derive(Debug, Clone)]
pub struct SSTable {
    files: TableFiles,
    data_path: PathBuf,
    index_path: PathBuf,
    summary_path: PathBuf,
    filter_path: PathBuf,
    count: u64,
}

impl SSTable {
    /// Recover a table from its TOC file.
    pub fn open(toc_path: &Path) -> Result<Self> {
        let file_name = toc_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::InvalidData(format!("bad toc path {:?}", toc_path)))?;
        let (generation, level, _) = TableFiles::parse_name(file_name)
            .filter(|(_, _, suffix)| *suffix == "TOC.txt")
            .ok_or_else(|| StorageError::InvalidData(format!("not a toc file: {}", file_name)))?;
        let dir = toc_path.parent().unwrap_or_else(|| Path::new("."));

        if !toc_path.exists() {
            return Err(StorageError::FileNotFound(toc_path.to_path_buf()));
        }
        let text = fs::read_to_string(toc_path)?;
        let names: Vec<&str> = text.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        if names.len() != 4 {
            return Err(StorageError::CorruptedFile(toc_path.to_path_buf()));
        }
        let paths: Vec<PathBuf> = names.iter().map(|n| dir.join(n)).collect();
        for path in &paths {
            if !path.exists() {
                return Err(StorageError::FileNotFound(path.clone()));
            }
        }

        let data = map_file(&paths[0])?;
        let count = read_u64_le(&data, 0)?;

        Ok(Self {
            files: TableFiles::new(dir, generation, level),
            data_path: paths[0].clone(),
            index_path: paths[1].clone(),
            summary_path: paths[2].clone(),
            filter_path: paths[3].clone(),
            count,
        })
    }

    pub fn generation(&self) -> u64 {
        self.files.generation
    }

    pub fn level(&self) -> usize {
        self.files.level
    }

    pub fn files(&self) -> &TableFiles {
        &self.files
    }

    /// Number of records in the Data file.
    pub fn len(&self) -> u64 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Tri-state lookup; lets a newer tombstone hide older tables.
    pub fn lookup(&self, key: &str) -> Result<Lookup> {
        let bloom = BloomFilter::read_from(&self.filter_path)?;
        if !bloom.may_contain(key.as_bytes()) {
            return Ok(Lookup::Absent);
        }

        let summary_buf = map_file(&self.summary_path)?;
        let start = match Summary::decode(&summary_buf)?.and_then(|s| s.find(key)) {
            Some(offset) => offset,
            None => return Ok(Lookup::Absent),
        };

        let index_buf = map_file(&self.index_path)?;
        let data_offset = match find_in_index(&index_buf, start, key)? {
            Some(offset) => offset,
            None => return Ok(Lookup::Absent),
        };

        let data = map_file(&self.data_path)?;
        let (element, _) = decode_record(&data, data_offset as usize)?;
        if element.key != key {
            return Err(StorageError::Corruption(format!(
                "index of table {} points {:?} at record {:?}",
                self.files.generation, key, element.key
            )));
        }
        if let Err(e) = element.verify_checksum() {
            tracing::warn!(
                generation = self.files.generation,
                level = self.files.level,
                key = key,
                error = %e,
                "Checksum mismatch on read, treating record as missing"
            );
            return Ok(Lookup::Absent);
        }
        if element.tombstone {
            return Ok(Lookup::Deleted);
        }
        Ok(Lookup::Found(element))
    }

    /// Point lookup; tombstoned or corrupted records count as not found.
    pub fn query_record(&self, key: &str) -> Result<Option<Element>> {
        match self.lookup(key)? {
            Lookup::Found(element) => Ok(Some(element)),
            Lookup::Deleted | Lookup::Absent => Ok(None),
        }
    }

    /// All records in key order, tombstones included.
    pub fn iter(&self) -> Result<TableIter> {
        let data = map_file(&self.data_path)?;
        Ok(TableIter {
            data,
            pos: 8,
            remaining: self.count,
        })
    }

    /// Recompute the merkle root from the Data file and compare it with the
    /// stored one.
    pub fn verify_integrity(&self) -> Result<bool> {
        let stored = MerkleTree::read_root(&self.files.metadata())?;
        let elements = self.iter()?.collect::<Result<Vec<_>>>()?;
        let tree = MerkleTree::from_values(elements.iter().map(|e| e.value.as_slice()));
        Ok(tree.root() == stored)
    }

    /// Delete every file of this table, TOC first.
    pub fn remove_files(&self) -> Result<()> {
        let mut paths = vec![self.files.toc()];
        paths.extend([
            self.data_path.clone(),
            self.index_path.clone(),
            self.summary_path.clone(),
            self.filter_path.clone(),
            self.files.metadata(),
        ]);
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Sequential reader over a table's Data file.
pub struct TableIter {
    data: Mmap,
    pos: usize,
    remaining: u64,
}

impl Iterator for TableIter {
    type Item = Result<Element>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        match decode_record(&self.data, self.pos) {
            Ok((element, next)) => {
                self.pos = next;
                self.remaining -= 1;
                Some(Ok(element))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}
