//! Per-shard write buffer
//!
//! Accumulates upserts and deletes until the shard flushes them into an L0
//! segment. There is no write-ahead log: whatever sits here when the process
//! dies is gone. Callers pick batch granularity with that in mind and flush
//! (or re-analyze, which flushes) at the points they need to be durable.

use std::collections::{HashMap, HashSet};

use crate::storage::tombstone::{TombstoneSet, PENDING_AS_OF};
use crate::storage::{
    kind_matches, AttrQuery, EdgeKey, EdgeRecord, NodeRecord, RejectedRecord, UpsertOutcome,
    UpsertStats,
};

#[derive(Debug, Default)]
pub struct WriteBuffer {
    nodes: HashMap<u128, NodeRecord>,

    // Edge slots; None = deleted while buffered, its index sits in free_slots
    edges: Vec<Option<EdgeRecord>>,
    free_slots: Vec<usize>,
    edge_index: HashMap<EdgeKey, usize>,
    adjacency: HashMap<u128, Vec<usize>>,
    reverse_adjacency: HashMap<u128, Vec<usize>>,
    live_edges: usize,

    // Deletes not yet flushed; they hide the key in every published segment
    pending: TombstoneSet,

    bytes: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    // ============================================================
    // Nodes
    // ============================================================

    /// Insert or replace a node. `on_disk` answers whether a live copy exists
    /// in published segments; it is only asked when the buffer cannot decide.
    pub fn upsert_node(&mut self, node: NodeRecord, on_disk: impl FnOnce(u128) -> bool) -> UpsertOutcome {
        let id = node.id;
        let size = node.estimated_size();
        match self.nodes.insert(id, node) {
            Some(old) => {
                self.bytes = self.bytes + size - old.estimated_size();
                UpsertOutcome::Updated
            }
            None => {
                self.bytes += size;
                if !self.pending.contains_node(id) && on_disk(id) {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Inserted
                }
            }
        }
    }

    /// Batch upsert. Invalid records are rejected individually; a key repeated
    /// inside the batch keeps the last value and is counted once.
    pub fn upsert_nodes(
        &mut self,
        nodes: Vec<NodeRecord>,
        on_disk: impl Fn(u128) -> bool,
    ) -> UpsertStats {
        let mut stats = UpsertStats::default();
        let mut seen: HashSet<u128> = HashSet::with_capacity(nodes.len());

        for (index, node) in nodes.into_iter().enumerate() {
            if let Err(reason) = node.validate() {
                stats.rejected.push(RejectedRecord {
                    index,
                    id: (node.id != 0).then_some(node.id),
                    reason,
                });
                continue;
            }
            if seen.insert(node.id) {
                stats.record(self.upsert_node(node, &on_disk));
            } else {
                // повтор внутри батча: только заменяем значение
                self.upsert_node(node, |_| true);
            }
        }
        stats
    }

    pub fn get_node(&self, id: u128) -> Option<&NodeRecord> {
        self.nodes.get(&id)
    }

    pub fn contains_node(&self, id: u128) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Remove from the buffer and record a pending delete.
    /// Returns true if the buffer held the node.
    pub fn delete_node(&mut self, id: u128) -> bool {
        self.pending.add_node(id, PENDING_AS_OF);
        match self.nodes.remove(&id) {
            Some(old) => {
                self.bytes -= old.estimated_size();
                true
            }
            None => false,
        }
    }

    pub fn find_nodes(&self, query: &AttrQuery) -> Vec<NodeRecord> {
        self.nodes
            .values()
            .filter(|n| query.matches(n))
            .cloned()
            .collect()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = u128> + '_ {
        self.nodes.keys().copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    // ============================================================
    // Edges
    // ============================================================

    pub fn upsert_edge(&mut self, edge: EdgeRecord, on_disk: impl FnOnce(&EdgeKey) -> bool) -> UpsertOutcome {
        let key = edge.key();
        let size = edge.estimated_size();

        if let Some(&slot) = self.edge_index.get(&key) {
            if let Some(old) = self.edges[slot].replace(edge) {
                self.bytes = self.bytes + size - old.estimated_size();
            }
            return UpsertOutcome::Updated;
        }

        let pending = self.pending.contains_edge(key.0, key.1, &key.2)
            || self.pending.contains_node(key.0);
        let existed = !pending && on_disk(&key);

        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.edges[slot] = Some(edge);
                slot
            }
            None => {
                self.edges.push(Some(edge));
                self.edges.len() - 1
            }
        };
        self.adjacency.entry(key.0).or_default().push(slot);
        self.reverse_adjacency.entry(key.1).or_default().push(slot);
        self.edge_index.insert(key, slot);
        self.live_edges += 1;
        self.bytes += size;

        if existed {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        }
    }

    pub fn upsert_edges(
        &mut self,
        edges: Vec<EdgeRecord>,
        on_disk: impl Fn(&EdgeKey) -> bool,
    ) -> UpsertStats {
        let mut stats = UpsertStats::default();
        let mut seen: HashSet<EdgeKey> = HashSet::with_capacity(edges.len());

        for (index, edge) in edges.into_iter().enumerate() {
            if let Err(reason) = edge.validate() {
                stats.rejected.push(RejectedRecord { index, id: None, reason });
                continue;
            }
            if seen.insert(edge.key()) {
                stats.record(self.upsert_edge(edge, &on_disk));
            } else {
                self.upsert_edge(edge, |_| true);
            }
        }
        stats
    }

    pub fn get_edge(&self, src: u128, dst: u128, kind: &str) -> Option<&EdgeRecord> {
        let slots = self.adjacency.get(&src)?;
        slots
            .iter()
            .filter_map(|&s| self.edges[s].as_ref())
            .find(|e| e.dst == dst && e.kind == kind)
    }

    pub fn delete_edge(&mut self, key: EdgeKey) -> bool {
        let removed = match self.edge_index.remove(&key) {
            Some(slot) => match self.edges[slot].take() {
                Some(old) => {
                    self.bytes -= old.estimated_size();
                    self.live_edges -= 1;
                    unlink(&mut self.adjacency, key.0, slot);
                    unlink(&mut self.reverse_adjacency, key.1, slot);
                    self.free_slots.push(slot);
                    true
                }
                None => false,
            },
            None => false,
        };
        self.pending.add_edge(key, PENDING_AS_OF);
        removed
    }

    /// Buffered edges leaving (`outgoing = true`) or entering `id`.
    pub fn edges_of(&self, id: u128, outgoing: bool, kinds: Option<&[&str]>) -> Vec<EdgeRecord> {
        let adjacency = if outgoing { &self.adjacency } else { &self.reverse_adjacency };
        adjacency
            .get(&id)
            .into_iter()
            .flatten()
            .filter_map(|&s| self.edges[s].as_ref())
            .filter(|e| kinds.map_or(true, |ks| ks.iter().any(|k| kind_matches(k, &e.kind))))
            .cloned()
            .collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = &EdgeRecord> {
        self.edges.iter().flatten()
    }

    pub fn edge_keys(&self) -> impl Iterator<Item = &EdgeKey> {
        self.edge_index.keys()
    }

    // ============================================================
    // State
    // ============================================================

    pub fn pending_deletes(&self) -> &TombstoneSet {
        &self.pending
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.live_edges
    }

    pub fn estimated_bytes(&self) -> usize {
        self.bytes
    }

    /// Nothing to flush: no records and no pending deletes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.live_edges == 0 && self.pending.is_empty()
    }

    pub fn is_over_limit(&self, node_limit: usize, byte_limit: usize) -> bool {
        self.nodes.len() + self.live_edges >= node_limit || self.bytes >= byte_limit
    }

    /// Contents to persist, borrowed so readers keep seeing the buffer until
    /// the flush has been published.
    pub fn flush_view(&self) -> (Vec<&NodeRecord>, Vec<&EdgeRecord>, TombstoneSet) {
        (
            self.nodes.values().collect(),
            self.edges.iter().flatten().collect(),
            self.pending.clone(),
        )
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

fn unlink(adjacency: &mut HashMap<u128, Vec<usize>>, id: u128, slot: usize) {
    if let Some(slots) = adjacency.get_mut(&id) {
        slots.retain(|&s| s != slot);
        if slots.is_empty() {
            adjacency.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: u128, name: &str) -> NodeRecord {
        NodeRecord::new(id, "FUNCTION", name, "src/a.js")
    }

    fn never(_: u128) -> bool {
        false
    }

    #[test]
    fn test_upsert_reports_insert_then_update() {
        let mut buf = WriteBuffer::new();
        assert_eq!(buf.upsert_node(node(1, "a"), never), UpsertOutcome::Inserted);
        assert_eq!(buf.upsert_node(node(1, "a"), never), UpsertOutcome::Updated);
        assert_eq!(buf.node_count(), 1);
        assert_eq!(buf.get_node(1).unwrap().name, "a");
    }

    #[test]
    fn test_update_replaces_metadata_wholesale() {
        let mut buf = WriteBuffer::new();
        buf.upsert_node(node(1, "a").with_metadata("{\"line\":1,\"async\":true}"), never);
        buf.upsert_node(node(1, "a").with_metadata("{\"line\":2}"), never);
        assert_eq!(buf.get_node(1).unwrap().metadata.as_deref(), Some("{\"line\":2}"));
    }

    #[test]
    fn test_on_disk_copy_counts_as_update() {
        let mut buf = WriteBuffer::new();
        assert_eq!(buf.upsert_node(node(1, "a"), |_| true), UpsertOutcome::Updated);
    }

    #[test]
    fn test_pending_delete_makes_reinsert_an_insert() {
        let mut buf = WriteBuffer::new();
        buf.delete_node(1);
        assert_eq!(buf.upsert_node(node(1, "a"), |_| true), UpsertOutcome::Inserted);
    }

    #[test]
    fn test_batch_duplicate_counted_once_with_last_value() {
        let mut buf = WriteBuffer::new();
        let stats = buf.upsert_nodes(vec![node(1, "first"), node(2, "b"), node(1, "second")], never);
        assert_eq!(stats.inserted, 2);
        assert_eq!(stats.updated, 0);
        assert_eq!(buf.get_node(1).unwrap().name, "second");
    }

    #[test]
    fn test_batch_rejects_malformed_and_continues() {
        let mut buf = WriteBuffer::new();
        let stats = buf.upsert_nodes(vec![node(0, "bad"), node(5, "ok")], never);
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.rejected.len(), 1);
        assert_eq!(stats.rejected[0].index, 0);
        assert_eq!(stats.rejected[0].id, None);
        assert!(buf.contains_node(5));
    }

    #[test]
    fn test_edges_dedup_by_kind() {
        let mut buf = WriteBuffer::new();
        let e1 = EdgeRecord::new(1, 2, "CALLS");
        let e2 = EdgeRecord::new(1, 2, "IMPORTS");
        assert_eq!(buf.upsert_edge(e1.clone(), |_| false), UpsertOutcome::Inserted);
        assert_eq!(buf.upsert_edge(e2, |_| false), UpsertOutcome::Inserted);
        assert_eq!(buf.upsert_edge(e1.with_metadata("{}"), |_| false), UpsertOutcome::Updated);
        assert_eq!(buf.edge_count(), 2);
        assert_eq!(buf.edges_of(1, true, None).len(), 2);
        assert_eq!(buf.edges_of(1, true, Some(&["CALLS"][..])).len(), 1);
        assert_eq!(buf.edges_of(2, false, None).len(), 2);
        assert_eq!(buf.get_edge(1, 2, "CALLS").unwrap().metadata.as_deref(), Some("{}"));
    }

    #[test]
    fn test_delete_edge_in_buffer() {
        let mut buf = WriteBuffer::new();
        buf.upsert_edge(EdgeRecord::new(1, 2, "CALLS"), |_| false);
        assert!(buf.delete_edge((1, 2, "CALLS".into())));
        assert_eq!(buf.edge_count(), 0);
        assert!(buf.edges_of(1, true, None).is_empty());
        assert!(buf.pending_deletes().contains_edge(1, 2, "CALLS"));
        assert!(!buf.is_empty());
    }

    #[test]
    fn test_delete_reinsert_reuses_edge_slot() {
        let mut buf = WriteBuffer::new();
        buf.upsert_edge(EdgeRecord::new(1, 2, "CALLS"), |_| false);
        buf.upsert_edge(EdgeRecord::new(1, 3, "CALLS"), |_| false);
        for _ in 0..100 {
            buf.delete_edge((1, 2, "CALLS".into()));
            buf.upsert_edge(EdgeRecord::new(1, 2, "CALLS"), |_| false);
        }

        assert_eq!(buf.edges.len(), 2);
        assert_eq!(buf.adjacency[&1].len(), 2);
        assert_eq!(buf.reverse_adjacency[&2].len(), 1);
        assert_eq!(buf.edge_count(), 2);
        assert_eq!(buf.edges_of(1, true, None).len(), 2);

        buf.delete_edge((1, 3, "CALLS".into()));
        assert!(!buf.reverse_adjacency.contains_key(&3));
        assert_eq!(buf.free_slots.len(), 1);
        assert_eq!(buf.edges_of(1, true, None).len(), 1);
    }

    #[test]
    fn test_byte_accounting_and_limits() {
        let mut buf = WriteBuffer::new();
        buf.upsert_node(node(1, "a"), never);
        let one = buf.estimated_bytes();
        assert!(one > 0);
        buf.upsert_node(node(2, "b"), never);
        assert!(buf.is_over_limit(2, usize::MAX));
        assert!(!buf.is_over_limit(3, usize::MAX));
        assert!(buf.is_over_limit(100, one));
        buf.delete_node(2);
        assert_eq!(buf.estimated_bytes(), one);
    }

    #[test]
    fn test_clear() {
        let mut buf = WriteBuffer::new();
        buf.upsert_node(node(1, "a"), never);
        buf.delete_node(9);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.estimated_bytes(), 0);
    }
}
