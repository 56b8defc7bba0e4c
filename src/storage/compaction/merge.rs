//! Merge algorithms for compaction
//!
//! Segments come newest first; the first occurrence of a key is its newest
//! version. A record from segment `s` is dropped when a tombstone hides it at
//! `s.seq`. Output is sorted so it can be written as a level 1 segment.

use std::collections::HashSet;
use std::sync::Arc;

use crate::storage::shard::{EdgeSegmentRef, NodeSegmentRef};
use crate::storage::tombstone::TombstoneSet;
use crate::storage::{EdgeKey, EdgeRecord, NodeRecord};

pub fn merge_node_segments(segments: &[Arc<NodeSegmentRef>], tombstones: &TombstoneSet) -> Vec<NodeRecord> {
    let mut seen: HashSet<u128> = HashSet::new();
    let mut out = Vec::new();

    for seg in segments {
        let segment = &seg.segment;
        let seq = segment.seq();
        for row in 0..segment.len() {
            let id = segment.id_at(row);
            if !seen.insert(id) {
                continue;
            }
            if tombstones.hides_node(id, seq) {
                continue;
            }
            out.push(segment.record_at(row));
        }
    }

    out.sort_unstable_by_key(|r| r.id);
    out
}

pub fn merge_edge_segments(segments: &[Arc<EdgeSegmentRef>], tombstones: &TombstoneSet) -> Vec<EdgeRecord> {
    let mut seen: HashSet<EdgeKey> = HashSet::new();
    let mut out = Vec::new();

    for seg in segments {
        let segment = &seg.segment;
        let seq = segment.seq();
        for row in 0..segment.len() {
            let (src, dst) = (segment.src_at(row), segment.dst_at(row));
            let kind = segment.kind_at(row);
            if !seen.insert((src, dst, kind.to_string())) {
                continue;
            }
            if tombstones.hides_edge(src, dst, kind, seq) {
                continue;
            }
            out.push(segment.record_at(row));
        }
    }

    out.sort_unstable_by(|a, b| (a.src, a.dst, &a.kind).cmp(&(b.src, b.dst, &b.kind)));
    out
}
