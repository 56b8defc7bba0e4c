//! Read path: point lookup, attribute search, neighbors
//!
//! Every call resolves one snapshot and sticks to it. Buffered state is
//! copied under the shard read locks together with that snapshot load, so
//! buffer and segments always come from the same instant.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::{MultiShardStore, Snapshot};
use crate::error::{GraphError, Result};
use crate::storage::shard::Explain;
use crate::storage::{AttrQuery, CancelToken, Direction, EdgeKey, EdgeRecord, NodeRecord};

// ============================================================
// NodeIter
// ============================================================

/// Lazy result of `find`. Buffered matches come first, then shards in
/// order, one segment at a time. The cancel token is checked before each
/// segment; a cancelled iterator simply ends (see `is_cancelled`).
pub struct NodeIter {
    snapshot: Arc<Snapshot>,
    query: AttrQuery,
    // per shard: ids owned by the buffer or deleted in it
    hidden: Vec<HashSet<u128>>,
    buffered: std::vec::IntoIter<NodeRecord>,
    current: std::vec::IntoIter<NodeRecord>,
    shard: usize,
    pos: usize,
    entered: bool,
    explain: Explain,
    cancel: Option<CancelToken>,
    cancelled: bool,
}

impl NodeIter {
    /// Counters so far. Complete once the iterator is exhausted.
    pub fn explain(&self) -> &Explain {
        &self.explain
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Manifest version this iterator reads.
    pub fn version(&self) -> u64 {
        self.snapshot.version()
    }

    /// Drain into a vector; a cancelled scan is an error instead of a
    /// silently short result.
    pub fn into_checked(mut self) -> Result<Vec<NodeRecord>> {
        let out: Vec<NodeRecord> = self.by_ref().collect();
        if self.cancelled {
            return Err(GraphError::Cancelled);
        }
        Ok(out)
    }

    fn next_shard(&mut self) {
        self.shard += 1;
        self.pos = 0;
        self.entered = false;
    }
}

impl Iterator for NodeIter {
    type Item = NodeRecord;

    fn next(&mut self) -> Option<NodeRecord> {
        loop {
            if let Some(node) = self.buffered.next() {
                return Some(node);
            }
            if let Some(node) = self.current.next() {
                return Some(node);
            }
            if self.cancelled || self.shard >= self.snapshot.shards.len() {
                return None;
            }

            let view = &self.snapshot.shards[self.shard];
            if !self.entered {
                self.entered = true;
                if !view.may_match(&self.query) {
                    self.explain.shards_skipped += 1;
                    self.next_shard();
                    continue;
                }
                self.explain.shards_scanned += 1;
            }
            if self.pos >= view.node_segments().len() {
                self.next_shard();
                continue;
            }
            if self.cancel.as_ref().map_or(false, |c| c.is_cancelled()) {
                debug!(shard = self.shard, segment = self.pos, "find cancelled");
                self.cancelled = true;
                return None;
            }

            let hidden = &self.hidden[self.shard];
            self.current = view
                .scan_node_segment(self.pos, &self.query, &|id| hidden.contains(&id), &mut self.explain)
                .into_iter();
            self.pos += 1;
        }
    }
}

impl MultiShardStore {
    // ============================================================
    // Point lookup
    // ============================================================

    pub fn get(&self, id: u128) -> Result<Option<NodeRecord>> {
        self.explain_get(id).map(|(node, _)| node)
    }

    /// Newest live version of a node: buffers first, then each shard's
    /// segments newest-first, compacted segments through the global index.
    pub fn explain_get(&self, id: u128) -> Result<(Option<NodeRecord>, Explain)> {
        self.check_poisoned()?;
        let mut explain = Explain::default();

        let (snapshot, deleted_in) = {
            let guards: Vec<_> = self.shards.iter().map(|s| s.read()).collect();
            let mut deleted_in = Vec::new();
            for (shard, state) in guards.iter().enumerate() {
                if let Some(node) = state.buffer.get_node(id) {
                    explain.buffer_hits += 1;
                    return Ok((Some(node.clone()), explain));
                }
                if state.buffer.pending_deletes().contains_node(id) {
                    deleted_in.push(shard);
                }
            }
            (self.snapshot(), deleted_in)
        };

        for (shard, view) in snapshot.shards.iter().enumerate() {
            if deleted_in.contains(&shard) || view.node_segments().is_empty() {
                explain.shards_skipped += 1;
                continue;
            }
            explain.shards_scanned += 1;
            if let Some((_, node)) = view.get_node(id, Some(&snapshot.global_index), &mut explain) {
                return Ok((Some(node), explain));
            }
        }
        Ok((None, explain))
    }

    /// Newest live version of an edge.
    pub fn get_edge(&self, src: u128, dst: u128, kind: &str) -> Result<Option<EdgeRecord>> {
        self.check_poisoned()?;
        let key: EdgeKey = (src, dst, kind.to_string());
        let (snapshot, deleted_in) = {
            let guards: Vec<_> = self.shards.iter().map(|s| s.read()).collect();
            let mut deleted_in = Vec::new();
            for (shard, state) in guards.iter().enumerate() {
                if let Some(edge) = state.buffer.get_edge(src, dst, kind) {
                    return Ok(Some(edge.clone()));
                }
                if state.buffer.pending_deletes().contains_edge(src, dst, kind) {
                    deleted_in.push(shard);
                }
            }
            (self.snapshot(), deleted_in)
        };

        Ok(snapshot
            .shards
            .iter()
            .enumerate()
            .filter(|(shard, _)| !deleted_in.contains(shard))
            .find_map(|(_, view)| view.get_edge(&key).map(|(_, e)| e)))
    }

    // ============================================================
    // Attribute search
    // ============================================================

    pub fn find(&self, query: &AttrQuery) -> Result<NodeIter> {
        self.find_inner(query, None)
    }

    pub fn find_cancellable(&self, query: &AttrQuery, cancel: &CancelToken) -> Result<NodeIter> {
        self.find_inner(query, Some(cancel.clone()))
    }

    /// Run `find` to completion and report what it touched. `full_scan` is
    /// set when neither kind nor name was bound.
    pub fn explain_find(&self, query: &AttrQuery) -> Result<(Vec<NodeRecord>, Explain)> {
        let mut iter = self.find_inner(query, None)?;
        let nodes: Vec<NodeRecord> = iter.by_ref().collect();
        Ok((nodes, iter.explain))
    }

    fn find_inner(&self, query: &AttrQuery, cancel: Option<CancelToken>) -> Result<NodeIter> {
        self.check_poisoned()?;
        self.check_node_kind(query.kind.as_deref())?;

        let mut explain = Explain {
            full_scan: query.is_unbounded(),
            ..Explain::default()
        };
        if explain.full_scan {
            debug!("find without kind or name: full scan");
        }

        let (snapshot, hidden, buffered) = {
            let guards: Vec<_> = self.shards.iter().map(|s| s.read()).collect();
            let mut hidden = Vec::with_capacity(guards.len());
            let mut buffered = Vec::new();
            for state in &guards {
                let mut ids: HashSet<u128> = state.buffer.node_ids().collect();
                ids.extend(state.buffer.pending_deletes().node_ids());
                hidden.push(ids);
                buffered.extend(state.buffer.find_nodes(query));
            }
            (self.snapshot(), hidden, buffered)
        };
        explain.buffer_hits = buffered.len();

        Ok(NodeIter {
            snapshot,
            query: query.clone(),
            hidden,
            buffered: buffered.into_iter(),
            current: Vec::new().into_iter(),
            shard: 0,
            pos: 0,
            entered: false,
            explain,
            cancel,
            cancelled: false,
        })
    }

    // ============================================================
    // Neighbors
    // ============================================================

    /// Edges leaving (`Outgoing`) or entering (`Incoming`) `id`, each with
    /// the node at its other end. `kinds` filters by edge kind; namespace
    /// wildcards like `"http:*"` are allowed.
    pub fn neighbors(
        &self,
        id: u128,
        direction: Direction,
        kinds: Option<&[&str]>,
    ) -> Result<Vec<(EdgeRecord, u128)>> {
        self.neighbors_inner(id, direction, kinds, None).map(|(edges, _)| edges)
    }

    pub fn neighbors_cancellable(
        &self,
        id: u128,
        direction: Direction,
        kinds: Option<&[&str]>,
        cancel: &CancelToken,
    ) -> Result<Vec<(EdgeRecord, u128)>> {
        self.neighbors_inner(id, direction, kinds, Some(cancel)).map(|(edges, _)| edges)
    }

    pub fn explain_neighbors(
        &self,
        id: u128,
        direction: Direction,
        kinds: Option<&[&str]>,
    ) -> Result<(Vec<(EdgeRecord, u128)>, Explain)> {
        self.neighbors_inner(id, direction, kinds, None)
    }

    fn neighbors_inner(
        &self,
        id: u128,
        direction: Direction,
        kinds: Option<&[&str]>,
        cancel: Option<&CancelToken>,
    ) -> Result<(Vec<(EdgeRecord, u128)>, Explain)> {
        self.check_poisoned()?;
        self.check_edge_kinds(kinds)?;
        let outgoing = matches!(direction, Direction::Outgoing);
        let mut explain = Explain::default();
        let mut edges = Vec::new();

        let (snapshot, mut seen) = {
            let guards: Vec<_> = self.shards.iter().map(|s| s.read()).collect();
            let mut seen: Vec<HashSet<EdgeKey>> = Vec::with_capacity(guards.len());
            for state in &guards {
                // ключи из буфера перекрывают сегменты
                let mut keys: HashSet<EdgeKey> = state
                    .buffer
                    .edges_of(id, outgoing, None)
                    .iter()
                    .map(|e| e.key())
                    .collect();
                keys.extend(state.buffer.pending_deletes().edge_keys());
                let buffered = state.buffer.edges_of(id, outgoing, kinds);
                explain.buffer_hits += buffered.len();
                edges.extend(buffered);
                seen.push(keys);
            }
            (self.snapshot(), seen)
        };

        for (shard, view) in snapshot.shards.iter().enumerate() {
            if view.edge_segments().is_empty() {
                explain.shards_skipped += 1;
                continue;
            }
            explain.shards_scanned += 1;
            for pos in 0..view.edge_segments().len() {
                if cancel.map_or(false, |c| c.is_cancelled()) {
                    return Err(GraphError::Cancelled);
                }
                edges.extend(view.scan_edge_segment(pos, id, direction, kinds, &mut seen[shard], &mut explain));
            }
        }

        let out = edges
            .into_iter()
            .map(|e| {
                let other = if outgoing { e.dst } else { e.src };
                (e, other)
            })
            .collect();
        Ok((out, explain))
    }
}
