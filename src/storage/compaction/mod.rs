//! LSM compaction: merge a shard's segments into sorted level 1 segments

pub mod coordinator;
pub mod merge;
pub mod types;

pub use coordinator::{compact_shard, should_compact, ShardCompaction};
pub use types::{CompactionConfig, CompactionResult};
