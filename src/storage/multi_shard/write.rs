//! Write path: routing, buffered upserts, deletes, auto-flush

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use parking_lot::RwLockWriteGuard;
use tracing::{debug, warn};

use super::{FlushReport, MultiShardStore, ShardGuard, ShardState, Snapshot};
use crate::error::{GraphError, Result};
use crate::index::GlobalIndex;
use crate::storage::resource::{SystemResources, HIGH_MEMORY_PRESSURE};
use crate::storage::shard::{Explain, ShardView};
use crate::storage::{Direction, EdgeKey, EdgeRecord, NodeRecord, RejectedRecord, UpsertOutcome, UpsertStats};

/// Records of one batch routed to one shard, with their batch positions.
struct Routed<R> {
    positions: Vec<usize>,
    records: Vec<R>,
}

impl<R> Default for Routed<R> {
    fn default() -> Self {
        Self {
            positions: Vec::new(),
            records: Vec::new(),
        }
    }
}

fn node_on_disk(view: &ShardView, index: &GlobalIndex, id: u128) -> bool {
    view.get_node(id, Some(index), &mut Explain::default()).is_some()
}

impl MultiShardStore {
    // ============================================================
    // Upserts
    // ============================================================

    /// Upsert a batch of nodes produced for `shard_key`.
    ///
    /// Records without an owner are owned by `shard_key`. Each record routes
    /// by its owner. Malformed records and records bound for a failed shard
    /// are rejected individually; the rest of the batch is applied.
    ///
    /// A node whose owner now routes to another shard moves: the old copy is
    /// tombstoned where it lived and the record counts as updated.
    pub fn upsert_batch(&self, shard_key: &str, nodes: Vec<NodeRecord>) -> Result<UpsertStats> {
        self.check_poisoned()?;
        let mut stats = UpsertStats::default();
        let mut splits = Vec::new();

        let mut planner = self.planner.write();
        planner.resolve(shard_key)?;

        // id -> (batch position, shard, record); a repeated id keeps the last
        let mut latest: HashMap<u128, (usize, u16, NodeRecord)> = HashMap::with_capacity(nodes.len());
        for (index, mut node) in nodes.into_iter().enumerate() {
            if node.owner.is_empty() {
                node.owner = shard_key.to_string();
            }
            if let Err(reason) = node.validate() {
                stats.rejected.push(RejectedRecord {
                    index,
                    id: (node.id != 0).then_some(node.id),
                    reason,
                });
                continue;
            }
            let shard = match planner.resolve(&node.owner) {
                Ok(shard) => shard,
                Err(e) => {
                    stats.rejected.push(RejectedRecord {
                        index,
                        id: Some(node.id),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if let Some(dir) = planner.observe(&node.owner) {
                splits.push(dir);
            }
            latest.insert(node.id, (index, shard, node));
        }
        let _planner = RwLockWriteGuard::downgrade(planner);

        let mut ordered: Vec<(usize, u16, NodeRecord)> = latest.into_values().collect();
        ordered.sort_by_key(|(index, _, _)| *index);
        let mut routed: BTreeMap<u16, Routed<NodeRecord>> = BTreeMap::new();
        for (index, shard, node) in ordered {
            let group = routed.entry(shard).or_default();
            group.positions.push(index);
            group.records.push(node);
        }

        self.register_kinds(
            routed.values().flat_map(|g| g.records.iter().map(|n| n.kind.as_str())),
            std::iter::empty(),
        );

        // шарды, где id может жить под прежним owner'ом, тоже блокируем
        let elsewhere = self.copies_elsewhere(&routed);
        let lock_set: BTreeSet<u16> = routed.keys().chain(elsewhere.keys()).copied().collect();
        let mut guards: BTreeMap<u16, ShardGuard<'_>> = lock_set
            .into_iter()
            .map(|s| (s, self.shards[s as usize].write()))
            .collect();
        let snap = self.snapshot();

        let (moved, blocked) = take_moved_copies(&mut guards, &snap, &elsewhere);

        for (shard, group) in routed {
            let Some(state) = guards.get_mut(&shard) else {
                continue;
            };
            if let Some(ref reason) = state.failed {
                reject_group(&mut stats, shard, reason, &group.positions, |i| Some(group.records[i].id));
                continue;
            }
            let mut positions = Vec::with_capacity(group.positions.len());
            let mut records = Vec::with_capacity(group.records.len());
            for (index, node) in group.positions.into_iter().zip(group.records) {
                if let Some(reason) = blocked.get(&node.id) {
                    stats.rejected.push(RejectedRecord {
                        index,
                        id: Some(node.id),
                        reason: reason.clone(),
                    });
                } else if moved.contains(&node.id) {
                    // старая копия удалена в другом шарде: это замена
                    state.buffer.upsert_node(node, |_| true);
                    stats.record(UpsertOutcome::Updated);
                } else {
                    positions.push(index);
                    records.push(node);
                }
            }
            let view = &snap.shards[shard as usize];
            let mut shard_stats = state
                .buffer
                .upsert_nodes(records, |id| node_on_disk(view, &snap.global_index, id));
            for r in &mut shard_stats.rejected {
                r.index = positions[r.index];
            }
            stats.merge(shard_stats);
        }
        if !moved.is_empty() {
            debug!(count = moved.len(), "nodes moved to another shard");
        }
        let guards: Vec<(u16, ShardGuard<'_>)> = guards.into_iter().collect();

        debug_log!(
            "upsert_batch key={} inserted={} updated={} rejected={}",
            shard_key,
            stats.inserted,
            stats.updated,
            stats.rejected.len()
        );

        let report = self.flush_full(guards)?;
        drop(_planner);
        self.after_commit(&report, splits)?;
        stats.rejected.sort_by_key(|r| r.index);
        Ok(stats)
    }

    /// Single-record upsert with the same routing as `upsert_batch`.
    pub fn upsert(&self, shard_key: &str, node: NodeRecord) -> Result<UpsertOutcome> {
        let owner = if node.owner.is_empty() { shard_key } else { node.owner.as_str() };
        if let Ok(shard) = self.planner.read().resolve(owner) {
            Self::ensure_writable(shard, &self.shards[shard as usize].read())?;
        }

        let stats = self.upsert_batch(shard_key, vec![node])?;
        if let Some(r) = stats.rejected.into_iter().next() {
            return Err(GraphError::MalformedRecord {
                index: r.index,
                reason: r.reason,
            });
        }
        Ok(if stats.inserted == 1 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    /// Upsert a batch of edges. Routing and rejection as for nodes; the
    /// dedup key is `(src, dst, kind)`.
    pub fn upsert_edges(&self, shard_key: &str, edges: Vec<EdgeRecord>) -> Result<UpsertStats> {
        self.check_poisoned()?;
        let mut stats = UpsertStats::default();
        let mut splits = Vec::new();

        let mut planner = self.planner.write();
        planner.resolve(shard_key)?;

        let mut routed: BTreeMap<u16, Routed<EdgeRecord>> = BTreeMap::new();
        for (index, mut edge) in edges.into_iter().enumerate() {
            if edge.owner.is_empty() {
                edge.owner = shard_key.to_string();
            }
            if let Err(reason) = edge.validate() {
                stats.rejected.push(RejectedRecord { index, id: None, reason });
                continue;
            }
            let shard = match planner.resolve(&edge.owner) {
                Ok(shard) => shard,
                Err(e) => {
                    stats.rejected.push(RejectedRecord {
                        index,
                        id: None,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            if let Some(dir) = planner.observe(&edge.owner) {
                splits.push(dir);
            }
            let group = routed.entry(shard).or_default();
            group.positions.push(index);
            group.records.push(edge);
        }
        let _planner = RwLockWriteGuard::downgrade(planner);

        self.register_kinds(
            std::iter::empty(),
            routed.values().flat_map(|g| g.records.iter().map(|e| e.kind.as_str())),
        );

        let mut guards: Vec<(u16, ShardGuard<'_>)> = routed
            .keys()
            .map(|&s| (s, self.shards[s as usize].write()))
            .collect();
        let snap = self.snapshot();

        for ((shard, state), (_, group)) in guards.iter_mut().zip(routed) {
            if let Some(ref reason) = state.failed {
                reject_group(&mut stats, *shard, reason, &group.positions, |_| None);
                continue;
            }
            let view = &snap.shards[*shard as usize];
            let mut shard_stats = state.buffer.upsert_edges(group.records, |key| view.contains_edge(key));
            for r in &mut shard_stats.rejected {
                r.index = group.positions[r.index];
            }
            stats.merge(shard_stats);
        }

        let report = self.flush_full(guards)?;
        drop(_planner);
        self.after_commit(&report, splits)?;
        stats.rejected.sort_by_key(|r| r.index);
        Ok(stats)
    }

    pub fn upsert_edge(&self, shard_key: &str, edge: EdgeRecord) -> Result<UpsertOutcome> {
        let stats = self.upsert_edges(shard_key, vec![edge])?;
        if let Some(r) = stats.rejected.into_iter().next() {
            return Err(GraphError::MalformedRecord {
                index: r.index,
                reason: r.reason,
            });
        }
        Ok(if stats.inserted == 1 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::Updated
        })
    }

    // ============================================================
    // Deletes
    // ============================================================

    /// Delete a node and every edge into or out of it.
    /// Returns false if no live node has this id.
    pub fn delete_node(&self, id: u128) -> Result<bool> {
        self.check_poisoned()?;
        let _planner = self.planner.read();
        let mut guards = self.lock_all();
        let snap = self.snapshot();

        // сначала собираем всё, потом пишем: упавший шард не должен
        // оставить удаление применённым наполовину
        let mut holders = Vec::new();
        let mut cascade: Vec<(usize, HashSet<EdgeKey>)> = Vec::new();
        for (pos, (shard, state)) in guards.iter().enumerate() {
            let view = &snap.shards[*shard as usize];
            let live = state.buffer.contains_node(id)
                || (!state.buffer.pending_deletes().contains_node(id)
                    && node_on_disk(view, &snap.global_index, id));
            if live {
                Self::ensure_writable(*shard, state)?;
                holders.push(pos);
            }
        }
        if holders.is_empty() {
            return Ok(false);
        }
        // рёбра могут лежать в любом шарде (маршрутизация по owner)
        for (pos, (shard, state)) in guards.iter().enumerate() {
            let keys = live_edges_touching(state, &snap.shards[*shard as usize], id);
            if !keys.is_empty() {
                Self::ensure_writable(*shard, state)?;
                cascade.push((pos, keys));
            }
        }

        for pos in holders {
            guards[pos].1.buffer.delete_node(id);
        }
        let mut cascaded = 0usize;
        for (pos, keys) in cascade {
            cascaded += keys.len();
            for key in keys {
                guards[pos].1.buffer.delete_edge(key);
            }
        }
        debug!(id = %format!("{:032x}", id), edges = cascaded, "node deleted");

        let report = self.flush_full(guards)?;
        drop(_planner);
        self.after_commit(&report, Vec::new())?;
        Ok(true)
    }

    /// Delete one edge. Returns false if it was not live.
    pub fn delete_edge(&self, src: u128, dst: u128, kind: &str) -> Result<bool> {
        self.check_poisoned()?;
        let key: EdgeKey = (src, dst, kind.to_string());
        let _planner = self.planner.read();
        let mut guards = self.lock_all();
        let snap = self.snapshot();

        let mut found = false;
        for (shard, state) in guards.iter_mut() {
            let view = &snap.shards[*shard as usize];
            let live = state.buffer.get_edge(src, dst, kind).is_some()
                || (!state.buffer.pending_deletes().contains_edge(src, dst, kind) && view.contains_edge(&key));
            if live {
                Self::ensure_writable(*shard, state)?;
                state.buffer.delete_edge(key.clone());
                found = true;
            }
        }

        let report = self.flush_full(guards)?;
        drop(_planner);
        self.after_commit(&report, Vec::new())?;
        Ok(found)
    }

    // ============================================================
    // Helpers
    // ============================================================

    /// Per shard, ids of `routed` that shard may hold although they are
    /// routed elsewhere now. Checked under short read locks, one shard at a
    /// time; the caller re-checks under its write locks.
    fn copies_elsewhere(&self, routed: &BTreeMap<u16, Routed<NodeRecord>>) -> BTreeMap<u16, Vec<u128>> {
        let snap = self.snapshot();
        let mut out = BTreeMap::new();
        for (shard, lock) in self.shards.iter().enumerate() {
            let shard = shard as u16;
            let view = &snap.shards[shard as usize];
            let state = lock.read();
            if state.buffer.node_count() == 0 && view.node_segments().is_empty() {
                continue;
            }
            let ids: Vec<u128> = routed
                .iter()
                .filter(|(target, _)| **target != shard)
                .flat_map(|(_, group)| group.records.iter().map(|n| n.id))
                .filter(|&id| state.buffer.contains_node(id) || node_on_disk(view, &snap.global_index, id))
                .collect();
            if !ids.is_empty() {
                out.insert(shard, ids);
            }
        }
        out
    }

    pub(crate) fn lock_all(&self) -> Vec<(u16, ShardGuard<'_>)> {
        self.shards
            .iter()
            .enumerate()
            .map(|(i, s)| (i as u16, s.write()))
            .collect()
    }

    /// Flush the shards among `guards` whose buffers are over their limits.
    /// Under high memory pressure any buffer past a quarter of its byte
    /// limit is flushed too.
    pub(crate) fn flush_full(&self, guards: Vec<(u16, ShardGuard<'_>)>) -> Result<FlushReport> {
        let node_limit = self.config.write_buffer_node_limit;
        let byte_limit = self.config.write_buffer_byte_limit;
        let mut pressure: Option<bool> = None;

        let mut full: Vec<(u16, ShardGuard<'_>)> = Vec::new();
        for (shard, state) in guards {
            let buffer = &state.buffer;
            let over = buffer.is_over_limit(node_limit, byte_limit)
                || (buffer.estimated_bytes() > byte_limit / 4
                    && *pressure.get_or_insert_with(|| {
                        SystemResources::detect().memory_pressure() >= HIGH_MEMORY_PRESSURE
                    }));
            if over && state.failed.is_none() {
                full.push((shard, state));
            }
        }
        if full.is_empty() {
            return Ok(FlushReport::default());
        }

        debug!(shards = full.len(), "auto-flush");
        let report = self.commit_shards(&mut full, |_| {}, &BTreeMap::new(), false)?;
        for (shard, reason) in &report.failed {
            warn!(shard, reason = %reason, "auto-flush failed, buffered data kept");
        }
        Ok(report)
    }
}

/// Delete the live copies found by `copies_elsewhere`. Returns the ids
/// whose old copy was removed, and the ids that cannot move because their
/// old shard has failed (with the rejection reason). A blocked id is left
/// untouched in every shard.
fn take_moved_copies(
    guards: &mut BTreeMap<u16, ShardGuard<'_>>,
    snap: &Snapshot,
    elsewhere: &BTreeMap<u16, Vec<u128>>,
) -> (HashSet<u128>, HashMap<u128, String>) {
    let mut live: Vec<(u16, u128)> = Vec::new();
    let mut blocked: HashMap<u128, String> = HashMap::new();
    for (&from, ids) in elsewhere {
        let Some(state) = guards.get(&from) else {
            continue;
        };
        let view = &snap.shards[from as usize];
        for &id in ids {
            let present = state.buffer.contains_node(id)
                || (!state.buffer.pending_deletes().contains_node(id)
                    && node_on_disk(view, &snap.global_index, id));
            if !present {
                continue;
            }
            match state.failed {
                Some(ref reason) => {
                    blocked.insert(id, format!("shard {} failed: {}", from, reason));
                }
                None => live.push((from, id)),
            }
        }
    }

    let mut moved = HashSet::new();
    for (from, id) in live {
        if blocked.contains_key(&id) {
            continue;
        }
        if let Some(state) = guards.get_mut(&from) {
            state.buffer.delete_node(id);
            moved.insert(id);
        }
    }
    (moved, blocked)
}

fn reject_group(
    stats: &mut UpsertStats,
    shard: u16,
    reason: &str,
    positions: &[usize],
    id_of: impl Fn(usize) -> Option<u128>,
) {
    for (i, &index) in positions.iter().enumerate() {
        stats.rejected.push(RejectedRecord {
            index,
            id: id_of(i),
            reason: format!("shard {} failed: {}", shard, reason),
        });
    }
}

/// Keys of live edges into or out of `id` held by one shard.
fn live_edges_touching(state: &ShardState, view: &ShardView, id: u128) -> HashSet<EdgeKey> {
    let mut keys = HashSet::new();
    let pending = state.buffer.pending_deletes();
    for outgoing in [true, false] {
        for edge in state.buffer.edges_of(id, outgoing, None) {
            keys.insert(edge.key());
        }
    }
    for direction in [Direction::Outgoing, Direction::Incoming] {
        let mut seen = HashSet::new();
        for edge in view.edges_of(id, direction, None, &mut seen, &mut Explain::default()) {
            if !pending.contains_edge(edge.src, edge.dst, &edge.kind) {
                keys.insert(edge.key());
            }
        }
    }
    keys
}
