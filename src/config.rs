//! Engine configuration and durability levels
//!
//! Every component takes its own section in its constructor; there is no
//! global configuration state.
//!
//! ## JSON layout
//! ```text
//! {
//!   "wal_config":          { "wal_segment_capacity": 50 },
//!   "mem_table_config":    { "skip_list_max_height": 5, "max_mem_table_size": 5,
//!                            "mem_table_threshold": 60 },
//!   "cache_config":        { "cache_max_data": 5 },
//!   "lsm_config":          { "lsm_max_level": 3, "lsm_level_size": 2 },
//!   "token_bucket_config": { "token_bucket_max_tokens": 1000, "token_bucket_interval": 100 },
//!   "hll_config":          { "hll_precision": 4 },
//!   "csm_config":          { "csm_precision": 0.1, "csm_accuracy": 0.01 }
//! }
//! ```
//! A missing field or the sentinel `-1` selects the default.

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Sentinel meaning "use the default" in the JSON file.
const UNSET: i64 = -1;

/// 持久性级别（Durability Level）
///
/// - Synchronous: every WAL append is written and fsynced before the call returns
/// - Buffered: segments reach disk on rotation, explicit persist and shutdown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DurabilityLevel {
    #[default]
    Synchronous,
    Buffered,
}

impl DurabilityLevel {
    pub fn requires_immediate_sync(&self) -> bool {
        matches!(self, DurabilityLevel::Synchronous)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Byte capacity of a single segment (default: 50)
    pub segment_capacity: usize,
    pub durability: DurabilityLevel,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_capacity: 50,
            durability: DurabilityLevel::Synchronous,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemTableConfig {
    /// Skip list level cap (default: 5)
    pub max_height: usize,
    /// Element count the threshold is measured against (default: 5)
    pub max_size: usize,
    /// Flush once `size / max_size * 100 >= threshold` (default: 60)
    pub threshold: f64,
}

impl Default for MemTableConfig {
    fn default() -> Self {
        Self {
            max_height: 5,
            max_size: 5,
            threshold: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum cached entries (default: 5)
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsmConfig {
    /// Highest level; tables never compact out of it (default: 3)
    pub max_level: usize,
    /// Tables per level that trigger a compaction (default: 2)
    pub max_tables_per_level: usize,
    /// Target false-positive rate for each table's bloom filter (default: 0.01)
    pub bloom_false_positive_rate: f64,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            max_level: 3,
            max_tables_per_level: 2,
            bloom_false_positive_rate: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Bucket capacity (default: 1000)
    pub max_tokens: u64,
    /// Seconds between refills (default: 100)
    pub interval_secs: u64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            interval_secs: 100,
        }
    }
}

/// Parameters for the HyperLogLog values stored under `hll-` keys.
/// The engine only carries them; the estimator lives with the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HllConfig {
    pub precision: u8,
}

impl Default for HllConfig {
    fn default() -> Self {
        Self { precision: 4 }
    }
}

/// Parameters for the count-min sketches stored under `cms-` keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmsConfig {
    pub epsilon: f64,
    pub delta: f64,
}

impl Default for CmsConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.1,
            delta: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub wal: WalConfig,
    pub memtable: MemTableConfig,
    pub cache: CacheConfig,
    pub lsm: LsmConfig,
    pub token_bucket: TokenBucketConfig,
    pub hll: HllConfig,
    pub cms: CmsConfig,
}

impl EngineConfig {
    /// Larger memtable and cache for bulk loads.
    pub fn for_throughput() -> Self {
        Self {
            wal: WalConfig {
                segment_capacity: 64 * 1024,
                durability: DurabilityLevel::Buffered,
            },
            memtable: MemTableConfig {
                max_height: 16,
                max_size: 10_000,
                threshold: 100.0,
            },
            cache: CacheConfig { max_entries: 10_000 },
            lsm: LsmConfig {
                max_level: 4,
                max_tables_per_level: 4,
                bloom_false_positive_rate: 0.01,
            },
            ..Self::default()
        }
    }

    /// Read the JSON configuration file at `path`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(StorageError::FileNotFound(path.to_path_buf()));
        }
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        let raw: RawConfig = serde_json::from_str(text)?;
        let config = raw.resolve()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.wal.segment_capacity == 0 {
            return Err(invalid("wal segment capacity must be positive"));
        }
        if self.memtable.max_size == 0 {
            return Err(invalid("memtable max size must be positive"));
        }
        if self.memtable.max_height == 0 {
            return Err(invalid("skip list max height must be positive"));
        }
        if !(self.memtable.threshold > 0.0 && self.memtable.threshold <= 100.0) {
            return Err(invalid("memtable threshold must be in (0, 100]"));
        }
        if self.cache.max_entries == 0 {
            return Err(invalid("cache capacity must be positive"));
        }
        if self.lsm.max_level == 0 {
            return Err(invalid("lsm max level must be positive"));
        }
        if self.lsm.max_tables_per_level < 2 {
            return Err(invalid("lsm level size must be at least 2"));
        }
        let fp = self.lsm.bloom_false_positive_rate;
        if !(fp > 0.0 && fp < 1.0) {
            return Err(invalid("bloom false positive rate must be in (0, 1)"));
        }
        if self.token_bucket.max_tokens == 0 {
            return Err(invalid("token bucket needs at least one token"));
        }
        Ok(())
    }
}

fn invalid(msg: &str) -> StorageError {
    StorageError::InvalidConfig(msg.to_string())
}

// On-disk shape of the JSON file. Every field is optional so that a partial
// file still loads; `-1` is treated the same as a missing field.

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawConfig {
    wal_config: RawWal,
    mem_table_config: RawMemTable,
    cache_config: RawCache,
    lsm_config: RawLsm,
    token_bucket_config: RawTokenBucket,
    hll_config: RawHll,
    csm_config: RawCms,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawWal {
    wal_segment_capacity: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawMemTable {
    skip_list_max_height: Option<i64>,
    max_mem_table_size: Option<i64>,
    mem_table_threshold: Option<f64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawCache {
    cache_max_data: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawLsm {
    lsm_max_level: Option<i64>,
    lsm_level_size: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawTokenBucket {
    token_bucket_max_tokens: Option<i64>,
    token_bucket_interval: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawHll {
    hll_precision: Option<i64>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct RawCms {
    csm_precision: Option<f64>,
    csm_accuracy: Option<f64>,
}

fn int_or(field: &str, raw: Option<i64>, default: u64) -> Result<u64> {
    match raw {
        None | Some(UNSET) => Ok(default),
        Some(v) if v < 0 => Err(StorageError::InvalidConfig(format!(
            "{} must not be negative (got {})",
            field, v
        ))),
        Some(v) => Ok(v as u64),
    }
}

fn float_or(field: &str, raw: Option<f64>, default: f64) -> Result<f64> {
    match raw {
        None => Ok(default),
        Some(v) if v == UNSET as f64 => Ok(default),
        Some(v) if v < 0.0 => Err(StorageError::InvalidConfig(format!(
            "{} must not be negative (got {})",
            field, v
        ))),
        Some(v) => Ok(v),
    }
}

impl RawConfig {
    fn resolve(self) -> Result<EngineConfig> {
        let d = EngineConfig::default();
        Ok(EngineConfig {
            wal: WalConfig {
                segment_capacity: int_or(
                    "wal_segment_capacity",
                    self.wal_config.wal_segment_capacity,
                    d.wal.segment_capacity as u64,
                )? as usize,
                durability: d.wal.durability,
            },
            memtable: MemTableConfig {
                max_height: int_or(
                    "skip_list_max_height",
                    self.mem_table_config.skip_list_max_height,
                    d.memtable.max_height as u64,
                )? as usize,
                max_size: int_or(
                    "max_mem_table_size",
                    self.mem_table_config.max_mem_table_size,
                    d.memtable.max_size as u64,
                )? as usize,
                threshold: float_or(
                    "mem_table_threshold",
                    self.mem_table_config.mem_table_threshold,
                    d.memtable.threshold,
                )?,
            },
            cache: CacheConfig {
                max_entries: int_or(
                    "cache_max_data",
                    self.cache_config.cache_max_data,
                    d.cache.max_entries as u64,
                )? as usize,
            },
            lsm: LsmConfig {
                max_level: int_or(
                    "lsm_max_level",
                    self.lsm_config.lsm_max_level,
                    d.lsm.max_level as u64,
                )? as usize,
                max_tables_per_level: int_or(
                    "lsm_level_size",
                    self.lsm_config.lsm_level_size,
                    d.lsm.max_tables_per_level as u64,
                )? as usize,
                bloom_false_positive_rate: d.lsm.bloom_false_positive_rate,
            },
            token_bucket: TokenBucketConfig {
                max_tokens: int_or(
                    "token_bucket_max_tokens",
                    self.token_bucket_config.token_bucket_max_tokens,
                    d.token_bucket.max_tokens,
                )?,
                interval_secs: int_or(
                    "token_bucket_interval",
                    self.token_bucket_config.token_bucket_interval,
                    d.token_bucket.interval_secs,
                )?,
            },
            hll: HllConfig {
                precision: int_or(
                    "hll_precision",
                    self.hll_config.hll_precision,
                    d.hll.precision as u64,
                )?
                .min(u8::MAX as u64) as u8,
            },
            cms: CmsConfig {
                epsilon: float_or("csm_precision", self.csm_config.csm_precision, d.cms.epsilon)?,
                delta: float_or("csm_accuracy", self.csm_config.csm_accuracy, d.cms.delta)?,
            },
        })
    }
}
