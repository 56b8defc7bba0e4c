//! Database configuration
//!
//! Written once to `<db>/db_config.json` at create time and read back on
//! every open, so a database keeps the shard count and limits it was built
//! with regardless of the machine that reopens it.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::storage::compaction::CompactionConfig;
use crate::storage::resource::TuningProfile;

pub const CONFIG_FILE: &str = "db_config.json";

const MAX_SHARDS: u16 = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub shard_count: u16,
    /// Flush a shard's buffer past this many records
    pub write_buffer_node_limit: usize,
    /// ... or past this many estimated bytes
    pub write_buffer_byte_limit: usize,
    pub compaction: CompactionConfig,
    /// Files in one directory before it is split into per-file routing
    pub flat_dir_file_limit: usize,
    /// Records in one shard before its largest directory is split out
    pub shard_split_threshold: usize,
    /// Newest manifest versions kept by GC
    pub manifest_retention: usize,
    pub io_retry_attempts: u32,
    pub io_retry_backoff_ms: u64,
    /// Unreferenced files at startup are fatal instead of collected
    pub strict_orphans: bool,
    /// Recompute every segment body checksum on open
    pub verify_checksums: bool,
    /// Run compaction and GC on a background worker after flushes
    pub background_maintenance: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::from_profile(&TuningProfile::default())
    }
}

impl StoreConfig {
    pub fn from_profile(profile: &TuningProfile) -> Self {
        Self {
            shard_count: profile.shard_count,
            write_buffer_node_limit: profile.write_buffer_node_limit,
            write_buffer_byte_limit: profile.write_buffer_byte_limit,
            compaction: CompactionConfig {
                segment_threshold: profile.segment_threshold,
                threads: profile.compaction_threads,
                ..CompactionConfig::default()
            },
            flat_dir_file_limit: 1_000,
            shard_split_threshold: profile.shard_split_threshold,
            manifest_retention: 3,
            io_retry_attempts: 3,
            io_retry_backoff_ms: 10,
            strict_orphans: false,
            verify_checksums: true,
            background_maintenance: false,
        }
    }

    /// Defaults derived from the machine we run on.
    pub fn auto_tuned() -> Self {
        Self::from_profile(&TuningProfile::auto_tune())
    }

    pub fn with_shard_count(mut self, shard_count: u16) -> Self {
        self.shard_count = shard_count;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.shard_count == 0 || self.shard_count > MAX_SHARDS {
            return Err(GraphError::Config(format!(
                "shard_count must be in 1..={}, got {}",
                MAX_SHARDS, self.shard_count
            )));
        }
        let positive = [
            ("write_buffer_node_limit", self.write_buffer_node_limit),
            ("write_buffer_byte_limit", self.write_buffer_byte_limit),
            ("compaction.segment_threshold", self.compaction.segment_threshold),
            ("compaction.max_segment_records", self.compaction.max_segment_records),
            ("compaction.threads", self.compaction.threads),
            ("flat_dir_file_limit", self.flat_dir_file_limit),
            ("shard_split_threshold", self.shard_split_threshold),
            ("manifest_retention", self.manifest_retention),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(GraphError::Config(format!("{} must be > 0", name)));
            }
        }
        if !(self.compaction.tombstone_ratio > 0.0) {
            return Err(GraphError::Config("compaction.tombstone_ratio must be > 0".into()));
        }
        Ok(())
    }

    /// Read `<db>/db_config.json`. `None` if the file does not exist.
    pub fn load(db_path: &Path) -> Result<Option<Self>> {
        let path = db_path.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(Some(config))
    }

    pub fn save(&self, db_path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(db_path.join(CONFIG_FILE), json)?;
        Ok(())
    }
}
