//! Published, immutable view of one shard
//!
//! A `ShardView` is what readers hold: the shard's segments ordered newest
//! first plus its committed tombstones. Views are swapped wholesale by the
//! coordinator; nothing inside one is ever mutated.
//!
//! Precedence: within a shard the segment with the higher sequence wins. A
//! record read from segment `s` is live iff no tombstone hides it at `s.seq`
//! and no newer segment of the shard holds the same key.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::index::GlobalIndex;
use crate::storage::segment::{EdgeSegment, NodeSegment, LEVEL_L1};
use crate::storage::tombstone::TombstoneSet;
use crate::storage::zone_map::{ZoneMap, FIELD_FILE, FIELD_OWNER};
use crate::storage::{kind_matches, AttrQuery, Direction, EdgeKey, EdgeRecord, NodeRecord};

/// What a query did, for the evaluation layer's performance warnings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Explain {
    /// Neither kind nor name was bound: every shard had to be read
    pub full_scan: bool,
    pub shards_scanned: usize,
    pub shards_skipped: usize,
    pub segments_scanned: usize,
    pub segments_skipped: usize,
    pub index_probes: usize,
    pub buffer_hits: usize,
}

/// A node segment together with its manifest file id.
pub struct NodeSegmentRef {
    pub id: u64,
    pub segment: NodeSegment,
}

pub struct EdgeSegmentRef {
    pub id: u64,
    pub segment: EdgeSegment,
}

pub struct ShardView {
    shard: u16,
    // newest first
    nodes: Vec<Arc<NodeSegmentRef>>,
    edges: Vec<Arc<EdgeSegmentRef>>,
    tombstones: Arc<TombstoneSet>,
    summary: ZoneMap,
}

impl ShardView {
    pub fn empty(shard: u16) -> Self {
        Self::new(shard, Vec::new(), Vec::new(), Arc::new(TombstoneSet::new()))
    }

    pub fn new(
        shard: u16,
        mut nodes: Vec<Arc<NodeSegmentRef>>,
        mut edges: Vec<Arc<EdgeSegmentRef>>,
        tombstones: Arc<TombstoneSet>,
    ) -> Self {
        nodes.sort_by(|a, b| b.segment.seq().cmp(&a.segment.seq()).then(a.id.cmp(&b.id)));
        edges.sort_by(|a, b| b.segment.seq().cmp(&a.segment.seq()).then(a.id.cmp(&b.id)));

        let mut summary = ZoneMap::new();
        for seg in &nodes {
            summary.merge(seg.segment.zone_map());
        }

        Self {
            shard,
            nodes,
            edges,
            tombstones,
            summary,
        }
    }

    pub fn shard(&self) -> u16 {
        self.shard
    }

    pub fn node_segments(&self) -> &[Arc<NodeSegmentRef>] {
        &self.nodes
    }

    pub fn edge_segments(&self) -> &[Arc<EdgeSegmentRef>] {
        &self.edges
    }

    pub fn tombstones(&self) -> &Arc<TombstoneSet> {
        &self.tombstones
    }

    pub fn l0_count(&self) -> usize {
        let n = self.nodes.iter().filter(|s| s.segment.level() < LEVEL_L1).count();
        let e = self.edges.iter().filter(|s| s.segment.level() < LEVEL_L1).count();
        n.max(e)
    }

    pub fn record_count(&self) -> usize {
        self.nodes.iter().map(|s| s.segment.len()).sum::<usize>()
            + self.edges.iter().map(|s| s.segment.len()).sum::<usize>()
    }

    /// Owners (unit keys) seen in this shard's segments. Best effort:
    /// segments whose owner zone overflowed contribute nothing.
    pub fn owners(&self) -> BTreeSet<String> {
        let mut owners = BTreeSet::new();
        let zones = self
            .nodes
            .iter()
            .map(|s| s.segment.zone_map())
            .chain(self.edges.iter().map(|s| s.segment.zone_map()));
        for zone in zones {
            if let Some(values) = zone.values(FIELD_OWNER) {
                owners.extend(values.iter().cloned());
            }
        }
        owners
    }

    /// Shard-level skip using the merged zone maps of its node segments.
    pub fn may_match(&self, query: &AttrQuery) -> bool {
        if self.nodes.is_empty() {
            return false;
        }
        if let Some(ref k) = query.kind {
            if !self.summary.may_contain_kind(k) {
                return false;
            }
        }
        if let Some(ref f) = query.file {
            if !self.summary.may_contain(FIELD_FILE, f) {
                return false;
            }
        }
        if let Some(ref o) = query.owner {
            if !self.summary.may_contain(FIELD_OWNER, o) {
                return false;
            }
        }
        true
    }

    // ============================================================
    // Nodes
    // ============================================================

    /// Newest committed version of a node in this shard with its segment seq.
    /// Compacted segments are resolved through `index` when given.
    pub fn get_node(
        &self,
        id: u128,
        index: Option<&GlobalIndex>,
        explain: &mut Explain,
    ) -> Option<(u64, NodeRecord)> {
        let entries = index.map(|idx| idx.lookup(id));

        for seg in &self.nodes {
            let segment = &seg.segment;
            let row = match entries {
                Some(ref entries) if segment.level() >= LEVEL_L1 => {
                    explain.index_probes += 1;
                    entries
                        .iter()
                        .find(|e| e.shard == self.shard && e.segment_id == seg.id)
                        .map(|e| e.row as usize)
                }
                _ => {
                    if !segment.may_contain(id) {
                        explain.segments_skipped += 1;
                        continue;
                    }
                    explain.segments_scanned += 1;
                    segment.find_row(id)
                }
            };
            if let Some(row) = row {
                if self.tombstones.hides_node(id, segment.seq()) {
                    return None;
                }
                return Some((segment.seq(), segment.record_at(row)));
            }
        }
        None
    }

    pub fn contains_node(&self, id: u128) -> bool {
        self.get_node(id, None, &mut Explain::default()).is_some()
    }

    /// Does any segment newer than position `pos` hold `id`?
    fn shadowed_node(&self, pos: usize, id: u128) -> bool {
        self.nodes[..pos]
            .iter()
            .any(|s| s.segment.seq() > self.nodes[pos].segment.seq() && s.segment.find_row(id).is_some())
    }

    /// Live matches of `query` in the segment at `pos` (newest-first order).
    /// `hidden` answers for keys overridden outside this view (write buffers,
    /// pending deletes).
    pub fn scan_node_segment(
        &self,
        pos: usize,
        query: &AttrQuery,
        hidden: &dyn Fn(u128) -> bool,
        explain: &mut Explain,
    ) -> Vec<NodeRecord> {
        let seg = &self.nodes[pos];
        let segment = &seg.segment;
        if !segment.may_match(query) {
            explain.segments_skipped += 1;
            return Vec::new();
        }
        explain.segments_scanned += 1;

        let (rows, probed) = segment.candidate_rows(query);
        if probed {
            explain.index_probes += 1;
        }

        let seq = segment.seq();
        let mut out = Vec::new();
        for row in rows {
            let row = row as usize;
            if !segment.row_matches(row, query) {
                continue;
            }
            let id = segment.id_at(row);
            if self.tombstones.hides_node(id, seq) || hidden(id) || self.shadowed_node(pos, id) {
                continue;
            }
            out.push(segment.record_at(row));
        }
        out
    }

    /// All live matches in this shard, newest version only.
    pub fn find_nodes(&self, query: &AttrQuery, hidden: &dyn Fn(u128) -> bool, explain: &mut Explain) -> Vec<NodeRecord> {
        (0..self.nodes.len())
            .flat_map(|pos| self.scan_node_segment(pos, query, hidden, explain))
            .collect()
    }

    // ============================================================
    // Edges
    // ============================================================

    pub fn get_edge(&self, key: &EdgeKey) -> Option<(u64, EdgeRecord)> {
        for seg in &self.edges {
            let segment = &seg.segment;
            if let Some(row) = segment.find_row(key) {
                if self.tombstones.hides_edge(key.0, key.1, &key.2, segment.seq()) {
                    return None;
                }
                return Some((segment.seq(), segment.record_at(row)));
            }
        }
        None
    }

    pub fn contains_edge(&self, key: &EdgeKey) -> bool {
        self.get_edge(key).is_some()
    }

    /// Edges touching `id` in the segment at `pos`. `seen` carries keys
    /// already resolved by newer layers; every key met here is added to it,
    /// so walking positions in order yields the newest version only.
    pub fn scan_edge_segment(
        &self,
        pos: usize,
        id: u128,
        direction: Direction,
        kinds: Option<&[&str]>,
        seen: &mut HashSet<EdgeKey>,
        explain: &mut Explain,
    ) -> Vec<EdgeRecord> {
        let segment = &self.edges[pos].segment;
        let gate = match direction {
            Direction::Outgoing => segment.may_contain_src(id),
            Direction::Incoming => segment.may_contain_dst(id),
        };
        if !gate {
            explain.segments_skipped += 1;
            return Vec::new();
        }
        if let Some(ks) = kinds {
            if !ks.iter().any(|k| segment.may_contain_kind(k)) {
                explain.segments_skipped += 1;
                return Vec::new();
            }
        }
        explain.segments_scanned += 1;

        let rows = match direction {
            Direction::Outgoing => segment.rows_for_src(id),
            Direction::Incoming => segment.rows_for_dst(id),
        };

        let seq = segment.seq();
        let mut out = Vec::new();
        for row in rows {
            let kind = segment.kind_at(row);
            if let Some(ks) = kinds {
                if !ks.iter().any(|k| kind_matches(k, kind)) {
                    continue;
                }
            }
            let key = (segment.src_at(row), segment.dst_at(row), kind.to_string());
            if !seen.insert(key) {
                continue;
            }
            if self.tombstones.hides_edge(segment.src_at(row), segment.dst_at(row), kind, seq) {
                continue;
            }
            out.push(segment.record_at(row));
        }
        out
    }

    pub fn edges_of(
        &self,
        id: u128,
        direction: Direction,
        kinds: Option<&[&str]>,
        seen: &mut HashSet<EdgeKey>,
        explain: &mut Explain,
    ) -> Vec<EdgeRecord> {
        (0..self.edges.len())
            .flat_map(|pos| self.scan_edge_segment(pos, id, direction, kinds, seen, explain))
            .collect()
    }

    fn shadowed_edge(&self, pos: usize, key: &EdgeKey) -> bool {
        self.edges[..pos]
            .iter()
            .any(|s| s.segment.seq() > self.edges[pos].segment.seq() && s.segment.find_row(key).is_some())
    }

    // ============================================================
    // Unit ownership (re-analysis)
    // ============================================================

    /// Live nodes whose newest version is owned by `owner`.
    pub fn nodes_owned_by(&self, owner: &str) -> Vec<NodeRecord> {
        let query = AttrQuery::new().owner(owner);
        self.find_nodes(&query, &|_| false, &mut Explain::default())
    }

    /// Live edges whose newest version is owned by `owner`.
    pub fn edges_owned_by(&self, owner: &str) -> Vec<EdgeRecord> {
        let mut out = Vec::new();
        for (pos, seg) in self.edges.iter().enumerate() {
            let segment = &seg.segment;
            let seq = segment.seq();
            for row in segment.rows_for_owner(owner) {
                let (src, dst, kind) = (segment.src_at(row), segment.dst_at(row), segment.kind_at(row));
                if self.tombstones.hides_edge(src, dst, kind, seq) {
                    continue;
                }
                let key = (src, dst, kind.to_string());
                if self.shadowed_edge(pos, &key) {
                    continue;
                }
                out.push(segment.record_at(row));
            }
        }
        out
    }
}
