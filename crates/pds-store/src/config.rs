use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Rows per insert statement in `put_many`.
pub const DEFAULT_PUT_CHUNK_SIZE: usize = 500;

/// Upper bound on blocks loaded by `cache_rev`.
pub const DEFAULT_PREFETCH_LIMIT: usize = 15;

/// Smallest commit log considered for compaction.
pub const DEFAULT_COMPACT_MIN_BYTES: u64 = 1 << 20;

/// Share of dead log bytes, in percent, that triggers compaction.
pub const DEFAULT_COMPACT_DEAD_PERCENT: u8 = 50;

/// When commit log writes are forced to stable storage.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every committed transaction.
    #[default]
    EveryWrite,
    /// Leave flushing to the OS page cache.
    OsDefault,
}

/// Block store configuration.
///
/// ```toml
/// data_dir = "/var/lib/pds/repos"
/// put_chunk_size = 500
/// prefetch_limit = 15
/// sync_mode = "every_write"
/// compact_min_bytes = 1048576
/// compact_dead_percent = 50
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding per-actor commit logs and blobs. `None` keeps
    /// everything in memory.
    pub data_dir: Option<PathBuf>,
    pub put_chunk_size: usize,
    pub prefetch_limit: usize,
    pub sync_mode: SyncMode,
    /// Logs shorter than this are never compacted.
    pub compact_min_bytes: u64,
    /// Rewrite the log once at least this percentage of it no longer
    /// describes live blocks or roots. `0` disables compaction.
    pub compact_dead_percent: u8,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            put_chunk_size: DEFAULT_PUT_CHUNK_SIZE,
            prefetch_limit: DEFAULT_PREFETCH_LIMIT,
            sync_mode: SyncMode::default(),
            compact_min_bytes: DEFAULT_COMPACT_MIN_BYTES,
            compact_dead_percent: DEFAULT_COMPACT_DEAD_PERCENT,
        }
    }
}

impl StoreConfig {
    /// Default configuration persisting under `dir`.
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn from_toml_str(input: &str) -> StoreResult<Self> {
        let config: Self = toml::from_str(input).map_err(|e| StoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> StoreResult<Self> {
        let input = std::fs::read_to_string(path)?;
        Self::from_toml_str(&input)
    }

    pub fn validate(&self) -> StoreResult<()> {
        if self.put_chunk_size == 0 {
            return Err(StoreError::Config("put_chunk_size must be at least 1".into()));
        }
        if self.prefetch_limit == 0 {
            return Err(StoreError::Config("prefetch_limit must be at least 1".into()));
        }
        if self.compact_dead_percent > 100 {
            return Err(StoreError::Config("compact_dead_percent must be at most 100".into()));
        }
        Ok(())
    }

    /// Whether a log of `log_len` bytes holding `live_len` bytes of live
    /// state should be rewritten.
    pub fn wants_compaction(&self, log_len: u64, live_len: u64) -> bool {
        if self.compact_dead_percent == 0 || log_len < self.compact_min_bytes || log_len == 0 {
            return false;
        }
        let dead = log_len.saturating_sub(live_len);
        dead.saturating_mul(100) >= log_len.saturating_mul(u64::from(self.compact_dead_percent))
    }
}
