//! Compaction of one shard: trigger policy and the merge-and-write step
//!
//! The coordinator only produces new files. Publishing them (swapping the
//! merged segments out of the manifest, dropping folded tombstones and
//! rebuilding the shard's global index entries) is done by the store under
//! its commit lock, so a flush racing with compaction is never lost.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use super::merge::{merge_edge_segments, merge_node_segments};
use super::types::CompactionConfig;
use crate::error::Result;
use crate::index::GlobalIndexEntry;
use crate::storage::manifest::SegmentDescriptor;
use crate::storage::segment::LEVEL_L1;
use crate::storage::shard::{EdgeSegmentRef, NodeSegmentRef, ShardView};
use crate::storage::writer::SegmentSink;

/// Output of compacting one shard, ready to be published.
pub struct ShardCompaction {
    pub shard: u16,
    /// File ids of the input segments
    pub merged_node_ids: Vec<u64>,
    pub merged_edge_ids: Vec<u64>,
    /// Highest seq among the inputs; output segments carry it
    pub max_merged_seq: u64,
    pub l0_segments_merged: u32,
    pub nodes: Vec<(SegmentDescriptor, Arc<NodeSegmentRef>)>,
    pub edges: Vec<(SegmentDescriptor, Arc<EdgeSegmentRef>)>,
    /// Global index entries for the output node segments
    pub index_entries: Vec<GlobalIndexEntry>,
    pub nodes_merged: u64,
    pub edges_merged: u64,
    pub duration_ms: u64,
}

impl ShardCompaction {
    pub fn merged_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.merged_node_ids.iter().chain(&self.merged_edge_ids).copied()
    }
}

/// Should this shard be compacted?
///
/// Yes when its L0 segment count reached the threshold, or when tombstones
/// make up a large enough share of its records.
pub fn should_compact(view: &ShardView, config: &CompactionConfig) -> bool {
    if view.node_segments().is_empty() && view.edge_segments().is_empty() {
        return false;
    }
    if view.l0_count() >= config.segment_threshold.max(1) {
        return true;
    }
    let tombs = view.tombstones().len();
    if tombs == 0 {
        return false;
    }
    let live = view.record_count().max(1);
    tombs as f64 / live as f64 >= config.tombstone_ratio
}

/// Merge every segment of the shard into sorted level 1 segments.
///
/// `alloc` hands out fresh file ids. Returns `None` for a shard without
/// segments.
pub fn compact_shard(
    view: &ShardView,
    config: &CompactionConfig,
    sink: &SegmentSink,
    alloc: &dyn Fn() -> u64,
) -> Result<Option<ShardCompaction>> {
    let node_inputs = view.node_segments();
    let edge_inputs = view.edge_segments();
    if node_inputs.is_empty() && edge_inputs.is_empty() {
        return Ok(None);
    }

    let start = Instant::now();
    let shard = view.shard();
    let max_merged_seq = node_inputs
        .iter()
        .map(|s| s.segment.seq())
        .chain(edge_inputs.iter().map(|s| s.segment.seq()))
        .max()
        .unwrap_or(0);
    let l0_segments_merged = node_inputs
        .iter()
        .filter(|s| s.segment.level() < LEVEL_L1)
        .count()
        + edge_inputs.iter().filter(|s| s.segment.level() < LEVEL_L1).count();

    debug!(
        shard,
        node_segments = node_inputs.len(),
        edge_segments = edge_inputs.len(),
        max_merged_seq,
        "compacting shard"
    );

    let merged_nodes = merge_node_segments(node_inputs, view.tombstones());
    let merged_edges = merge_edge_segments(edge_inputs, view.tombstones());

    let chunk = config.max_segment_records.max(1);
    let mut nodes = Vec::new();
    let mut index_entries = Vec::with_capacity(merged_nodes.len());
    for part in merged_nodes.chunks(chunk) {
        let id = alloc();
        let written = sink.write_nodes(shard, id, max_merged_seq, LEVEL_L1, part)?;
        index_entries.extend(part.iter().enumerate().map(|(row, n)| GlobalIndexEntry {
            id: n.id,
            shard,
            segment_id: id,
            row: row as u32,
        }));
        nodes.push(written);
    }

    let mut edges = Vec::new();
    for part in merged_edges.chunks(chunk) {
        let id = alloc();
        edges.push(sink.write_edges(shard, id, max_merged_seq, LEVEL_L1, part)?);
    }

    let result = ShardCompaction {
        shard,
        merged_node_ids: node_inputs.iter().map(|s| s.id).collect(),
        merged_edge_ids: edge_inputs.iter().map(|s| s.id).collect(),
        max_merged_seq,
        l0_segments_merged: l0_segments_merged as u32,
        nodes,
        edges,
        index_entries,
        nodes_merged: merged_nodes.len() as u64,
        edges_merged: merged_edges.len() as u64,
        duration_ms: start.elapsed().as_millis() as u64,
    };

    info!(
        shard,
        nodes = result.nodes_merged,
        edges = result.edges_merged,
        outputs = result.nodes.len() + result.edges.len(),
        ms = result.duration_ms,
        "shard compacted"
    );
    Ok(Some(result))
}
