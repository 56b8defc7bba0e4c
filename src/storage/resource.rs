//! Resource manager: derives buffer sizes, shard thresholds and compaction
//! concurrency from the machine we run on.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

const MB: usize = 1024 * 1024;
const GB: u64 = 1024 * 1024 * 1024;

/// Average in-memory footprint of a buffered node record.
const BYTES_PER_NODE: usize = 220;

const WRITE_BUFFER_MIN: usize = 10 * MB;
const WRITE_BUFFER_MAX: usize = 100 * MB;
const WRITE_BUFFER_FRACTION: f64 = 0.02;

/// Shard is split once it holds this many buffer-fulls of records.
const SPLIT_FACTOR: usize = 64;

/// Above this pressure the coordinator flushes buffers early.
pub const HIGH_MEMORY_PRESSURE: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct SystemResources {
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub cpu_count: usize,
}

impl SystemResources {
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            cpu_count,
        }
    }

    /// 0.0 = nothing used, 1.0 = nothing available.
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_bytes == 0 {
            return 1.0;
        }
        let ratio = self.available_memory_bytes as f64 / self.total_memory_bytes as f64;
        (1.0 - ratio).clamp(0.0, 1.0)
    }
}

/// Adaptive parameters computed from system resources.
#[derive(Debug, Clone, PartialEq)]
pub struct TuningProfile {
    pub shard_count: u16,
    /// L0 segment count that triggers compaction
    pub segment_threshold: usize,
    pub write_buffer_node_limit: usize,
    pub write_buffer_byte_limit: usize,
    pub compaction_threads: usize,
    /// Record count past which a shard's largest directory is split
    pub shard_split_threshold: usize,
    pub memory_pressure: f64,
}

impl TuningProfile {
    /// - shards: `min(16, next_pow2(cpus))` with at least 2 GB RAM, else 1
    /// - L0 threshold: 2 below 4 GB, 4 below 16 GB, else 8
    /// - buffer bytes: 2% of available memory clamped to 10..100 MB
    /// - compaction threads: 1 below 4 GB, else `clamp(cpus / 2, 1, 4)`
    pub fn from_resources(res: &SystemResources) -> Self {
        let total_gb = res.total_memory_bytes as f64 / GB as f64;

        let shard_count = if res.total_memory_bytes >= 2 * GB {
            res.cpu_count.max(1).next_power_of_two().min(16) as u16
        } else {
            1
        };

        let segment_threshold = if total_gb < 4.0 {
            2
        } else if total_gb < 16.0 {
            4
        } else {
            8
        };

        let raw_bytes = (res.available_memory_bytes as f64 * WRITE_BUFFER_FRACTION) as usize;
        let write_buffer_byte_limit = raw_bytes.clamp(WRITE_BUFFER_MIN, WRITE_BUFFER_MAX);
        let write_buffer_node_limit = write_buffer_byte_limit / BYTES_PER_NODE;

        let compaction_threads = if total_gb < 4.0 {
            1
        } else {
            (res.cpu_count / 2).clamp(1, 4)
        };

        Self {
            shard_count,
            segment_threshold,
            write_buffer_node_limit,
            write_buffer_byte_limit,
            compaction_threads,
            shard_split_threshold: write_buffer_node_limit * SPLIT_FACTOR,
            memory_pressure: res.memory_pressure(),
        }
    }

    /// Probe the system and derive a profile.
    pub fn auto_tune() -> Self {
        let profile = Self::from_resources(&SystemResources::detect());
        tracing::debug!(?profile, "tuning profile detected");
        profile
    }
}

impl Default for TuningProfile {
    /// Fixed profile for tests and unknown environments.
    fn default() -> Self {
        Self {
            shard_count: 4,
            segment_threshold: 4,
            write_buffer_node_limit: 50_000,
            write_buffer_byte_limit: 10 * MB,
            compaction_threads: 1,
            shard_split_threshold: 50_000 * SPLIT_FACTOR,
            memory_pressure: 0.0,
        }
    }
}
