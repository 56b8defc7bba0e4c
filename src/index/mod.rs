//! Secondary indexes
//!
//! - `InvertedIndex`: embedded in compacted (L1) segments, value -> row ids
//! - `GlobalIndex`: node id -> (shard, L1 segment, row), rebuilt on compaction

pub mod global;
pub mod inverted;

pub use global::{GlobalIndex, GlobalIndexEntry};
pub use inverted::InvertedIndex;
