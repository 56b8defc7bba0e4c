//! Compaction policy and reporting types

use serde::{Deserialize, Serialize};

/// Configuration for compaction trigger policy and output shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// L0 segment count per shard that triggers compaction
    pub segment_threshold: usize,
    /// Tombstones / live records ratio that triggers compaction
    pub tombstone_ratio: f64,
    /// Records per output segment
    pub max_segment_records: usize,
    /// Threads in the compaction pool
    pub threads: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            segment_threshold: 4,
            tombstone_ratio: 0.25,
            max_segment_records: 1_000_000,
            threads: 1,
        }
    }
}

/// Result of a `compact()` call across shards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionResult {
    pub shards_compacted: Vec<u16>,
    /// Shards whose compaction failed after retries
    pub shards_failed: Vec<u16>,
    pub l0_segments_merged: u32,
    pub nodes_merged: u64,
    pub edges_merged: u64,
    pub tombstones_removed: u64,
    pub duration_ms: u64,
    /// Manifest version that published the result, if anything changed
    pub manifest_version: Option<u64>,
}
