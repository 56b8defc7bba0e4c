//! Incremental re-analysis and directory split migration
//!
//! A unit (one source file, or one enricher's output for a file) owns the
//! records written under its key. Re-analyzing it diffs the new record set
//! against what the unit currently owns, tombstones what disappeared,
//! upserts what is new or changed and publishes the result in one manifest
//! version. An identical record set commits nothing.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use parking_lot::RwLockWriteGuard;
use tracing::{debug, info};

use super::{MultiShardStore, ShardGuard, ShardState};
use crate::error::{GraphError, Result};
use crate::storage::shard::{Explain, ShardView};
use crate::storage::{AttrQuery, EdgeKey, EdgeRecord, NodeRecord, RejectedRecord};

/// The complete record set a unit produces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitRecords {
    pub nodes: Vec<NodeRecord>,
    pub edges: Vec<EdgeRecord>,
}

impl UnitRecords {
    pub fn new(nodes: Vec<NodeRecord>, edges: Vec<EdgeRecord>) -> Self {
        Self { nodes, edges }
    }
}

/// What re-analyzing one unit changed.
///
/// `changed_kinds` covers every node and edge kind touched by an addition,
/// removal or payload change; it is the set downstream enrichers key on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delta {
    pub unit_key: String,
    pub added_nodes: Vec<u128>,
    pub removed_nodes: Vec<u128>,
    pub changed_nodes: Vec<u128>,
    pub unchanged_nodes: Vec<u128>,
    pub added_edges: Vec<EdgeKey>,
    pub removed_edges: Vec<EdgeKey>,
    pub changed_edges: Vec<EdgeKey>,
    pub unchanged_edges: Vec<EdgeKey>,
    pub added_kinds: BTreeSet<String>,
    pub removed_kinds: BTreeSet<String>,
    pub changed_kinds: BTreeSet<String>,
    /// Malformed node records, indexed into `UnitRecords::nodes`
    pub rejected_nodes: Vec<RejectedRecord>,
    /// Malformed edge records, indexed into `UnitRecords::edges`
    pub rejected_edges: Vec<RejectedRecord>,
    /// Version that published this delta; `None` for a no-op
    pub manifest_version: Option<u64>,
}

impl Delta {
    /// True when the unit's stored records already matched.
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty()
            && self.removed_nodes.is_empty()
            && self.changed_nodes.is_empty()
            && self.added_edges.is_empty()
            && self.removed_edges.is_empty()
            && self.changed_edges.is_empty()
    }
}

/// Result of `commit_batch`: one delta per unit, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchDelta {
    pub units: Vec<Delta>,
    pub changed_kinds: BTreeSet<String>,
    pub manifest_version: Option<u64>,
}

impl BatchDelta {
    pub fn is_empty(&self) -> bool {
        self.units.iter().all(Delta::is_empty)
    }
}

/// Live records owned by `unit` in one shard, buffer included.
fn owned_records(
    state: &ShardState,
    view: &ShardView,
    unit: &str,
) -> (HashMap<u128, NodeRecord>, HashMap<EdgeKey, EdgeRecord>) {
    let buffer = &state.buffer;
    let pending = buffer.pending_deletes();

    let hidden = |id: u128| buffer.contains_node(id) || pending.contains_node(id);
    let mut nodes: HashMap<u128, NodeRecord> = view
        .find_nodes(&AttrQuery::new().owner(unit), &hidden, &mut Explain::default())
        .into_iter()
        .map(|n| (n.id, n))
        .collect();
    nodes.extend(buffer.nodes().filter(|n| n.owner == unit).map(|n| (n.id, n.clone())));

    let mut edges: HashMap<EdgeKey, EdgeRecord> = view
        .edges_owned_by(unit)
        .into_iter()
        .filter(|e| {
            buffer.get_edge(e.src, e.dst, &e.kind).is_none() && !pending.contains_edge(e.src, e.dst, &e.kind)
        })
        .map(|e| (e.key(), e))
        .collect();
    edges.extend(buffer.edges().filter(|e| e.owner == unit).map(|e| (e.key(), e.clone())));

    (nodes, edges)
}

/// A unit's validated new records, deduplicated (last one wins).
struct Prepared {
    unit_key: String,
    shard: u16,
    nodes: BTreeMap<u128, NodeRecord>,
    edges: BTreeMap<EdgeKey, EdgeRecord>,
    rejected_nodes: Vec<RejectedRecord>,
    rejected_edges: Vec<RejectedRecord>,
}

fn prepare(unit_key: String, shard: u16, records: UnitRecords) -> Prepared {
    let mut prepared = Prepared {
        unit_key,
        shard,
        nodes: BTreeMap::new(),
        edges: BTreeMap::new(),
        rejected_nodes: Vec::new(),
        rejected_edges: Vec::new(),
    };
    for (index, mut node) in records.nodes.into_iter().enumerate() {
        node.owner = prepared.unit_key.clone();
        match node.validate() {
            Ok(()) => {
                prepared.nodes.insert(node.id, node);
            }
            Err(reason) => prepared.rejected_nodes.push(RejectedRecord {
                index,
                id: (node.id != 0).then_some(node.id),
                reason,
            }),
        }
    }
    for (index, mut edge) in records.edges.into_iter().enumerate() {
        edge.owner = prepared.unit_key.clone();
        match edge.validate() {
            Ok(()) => {
                prepared.edges.insert(edge.key(), edge);
            }
            Err(reason) => prepared.rejected_edges.push(RejectedRecord { index, id: None, reason }),
        }
    }
    prepared
}

/// Diff a unit and apply it to its shard's buffer.
fn apply_unit(state: &mut ShardState, view: &ShardView, unit: Prepared) -> Delta {
    let (old_nodes, old_edges) = owned_records(state, view, &unit.unit_key);
    let mut delta = Delta {
        unit_key: unit.unit_key,
        rejected_nodes: unit.rejected_nodes,
        rejected_edges: unit.rejected_edges,
        ..Delta::default()
    };

    let mut upsert_nodes = Vec::new();
    for (id, node) in unit.nodes {
        match old_nodes.get(&id) {
            None => {
                delta.added_nodes.push(id);
                delta.added_kinds.insert(node.kind.clone());
                delta.changed_kinds.insert(node.kind.clone());
                upsert_nodes.push(node);
            }
            Some(old) if *old == node => delta.unchanged_nodes.push(id),
            Some(old) => {
                delta.changed_nodes.push(id);
                delta.changed_kinds.insert(old.kind.clone());
                delta.changed_kinds.insert(node.kind.clone());
                upsert_nodes.push(node);
            }
        }
    }
    let new_ids: BTreeSet<u128> = upsert_nodes
        .iter()
        .map(|n| n.id)
        .chain(delta.unchanged_nodes.iter().copied())
        .collect();
    for (id, old) in &old_nodes {
        if !new_ids.contains(id) {
            delta.removed_nodes.push(*id);
            delta.removed_kinds.insert(old.kind.clone());
            delta.changed_kinds.insert(old.kind.clone());
        }
    }

    let mut upsert_edges = Vec::new();
    let mut kept_edges = BTreeSet::new();
    for (key, edge) in unit.edges {
        kept_edges.insert(key.clone());
        match old_edges.get(&key) {
            None => {
                delta.added_kinds.insert(edge.kind.clone());
                delta.changed_kinds.insert(edge.kind.clone());
                delta.added_edges.push(key);
                upsert_edges.push(edge);
            }
            Some(old) if *old == edge => delta.unchanged_edges.push(key),
            Some(_) => {
                delta.changed_kinds.insert(edge.kind.clone());
                delta.changed_edges.push(key);
                upsert_edges.push(edge);
            }
        }
    }
    for (key, old) in &old_edges {
        if !kept_edges.contains(key) {
            delta.removed_kinds.insert(old.kind.clone());
            delta.changed_kinds.insert(old.kind.clone());
            delta.removed_edges.push(key.clone());
        }
    }

    // удаления без каскада: рёбра юнита диффятся сами по себе
    for &id in &delta.removed_nodes {
        state.buffer.delete_node(id);
    }
    for key in &delta.removed_edges {
        state.buffer.delete_edge(key.clone());
    }
    for node in upsert_nodes {
        state.buffer.upsert_node(node, |_| true);
    }
    for edge in upsert_edges {
        state.buffer.upsert_edge(edge, |_| true);
    }

    delta.removed_nodes.sort_unstable();
    delta.removed_edges.sort();
    delta
}

impl MultiShardStore {
    /// Replace everything `unit_key` owns with `records`.
    pub fn reanalyze_unit(&self, unit_key: &str, records: UnitRecords) -> Result<Delta> {
        let batch = self.commit_batch(vec![(unit_key.to_string(), records)], &BTreeMap::new())?;
        batch
            .units
            .into_iter()
            .next()
            .ok_or_else(|| GraphError::InvalidFormat("commit_batch returned no delta".into()))
    }

    /// Re-analyze several units and publish them in one manifest version
    /// carrying `tags`. Nothing is committed when every unit is unchanged.
    pub fn commit_batch(
        &self,
        units: Vec<(String, UnitRecords)>,
        tags: &BTreeMap<String, String>,
    ) -> Result<BatchDelta> {
        self.check_poisoned()?;
        let mut splits = Vec::new();

        let mut planner = self.planner.write();
        let mut prepared = Vec::with_capacity(units.len());
        for (unit_key, records) in units {
            let shard = planner.resolve(&unit_key)?;
            if let Some(dir) = planner.observe(&unit_key) {
                splits.push(dir);
            }
            prepared.push(prepare(unit_key, shard, records));
        }
        let _planner = RwLockWriteGuard::downgrade(planner);

        self.register_kinds(
            prepared.iter().flat_map(|p| p.nodes.values().map(|n| n.kind.as_str())),
            prepared.iter().flat_map(|p| p.edges.values().map(|e| e.kind.as_str())),
        );

        let touched: BTreeSet<u16> = prepared.iter().map(|p| p.shard).collect();
        let mut guards: Vec<(u16, ShardGuard<'_>)> = touched
            .iter()
            .map(|&s| (s, self.shards[s as usize].write()))
            .collect();
        for (shard, state) in &guards {
            Self::ensure_writable(*shard, state)?;
        }
        let snap = self.snapshot();

        let mut batch = BatchDelta::default();
        for unit in prepared {
            let shard = unit.shard;
            let Some(pos) = guards.iter().position(|(s, _)| *s == shard) else {
                continue;
            };
            let delta = apply_unit(&mut guards[pos].1, &snap.shards[shard as usize], unit);
            debug_log!(
                "reanalyze {} +{} -{} ~{} ={}",
                delta.unit_key,
                delta.added_nodes.len(),
                delta.removed_nodes.len(),
                delta.changed_nodes.len(),
                delta.unchanged_nodes.len()
            );
            batch.changed_kinds.extend(delta.changed_kinds.iter().cloned());
            batch.units.push(delta);
        }

        if batch.is_empty() {
            debug!(units = batch.units.len(), "re-analysis unchanged, nothing committed");
            return Ok(batch);
        }

        let report = self.commit_shards(&mut guards, |_| {}, tags, false)?;
        if let Some((shard, reason)) = report.failed.first() {
            return Err(GraphError::ShardFailed {
                shard: *shard,
                reason: reason.clone(),
            });
        }
        batch.manifest_version = report.manifest_version;
        for delta in &mut batch.units {
            if !delta.is_empty() {
                delta.manifest_version = report.manifest_version;
            }
        }
        drop(guards);
        drop(_planner);

        info!(
            version = ?batch.manifest_version,
            units = batch.units.len(),
            kinds = batch.changed_kinds.len(),
            "re-analysis committed"
        );
        self.after_commit(&report, splits)?;
        Ok(batch)
    }

    // ============================================================
    // Directory split
    // ============================================================

    /// Route `dir`'s files by full-path hash from now on, moving their
    /// records to their new shards in one manifest version.
    /// Returns false if the directory was already split.
    pub fn split_directory(&self, dir: &str) -> Result<bool> {
        self.check_poisoned()?;
        let mut planner = self.planner.write();
        if planner.is_split(dir) {
            return Ok(false);
        }

        let moves: Vec<(String, u16, u16)> = planner
            .keys_in_dir(dir)
            .into_iter()
            .map(|key| {
                let from = planner.compute_shard_id(&key);
                let to = planner.split_route(&key);
                (key, from, to)
            })
            .filter(|(_, from, to)| from != to)
            .collect();

        let mut guards = self.lock_all();
        for &(_, from, to) in &moves {
            Self::ensure_writable(from, &guards[from as usize].1)?;
            Self::ensure_writable(to, &guards[to as usize].1)?;
        }
        let snap = self.snapshot();

        let (mut moved_nodes, mut moved_edges) = (0usize, 0usize);
        for (key, from, to) in &moves {
            let (nodes, edges) = owned_records(&guards[*from as usize].1, &snap.shards[*from as usize], key);
            moved_nodes += nodes.len();
            moved_edges += edges.len();
            for (id, node) in nodes {
                guards[*from as usize].1.buffer.delete_node(id);
                guards[*to as usize].1.buffer.upsert_node(node, |_| false);
            }
            for (key, edge) in edges {
                guards[*from as usize].1.buffer.delete_edge(key);
                guards[*to as usize].1.buffer.upsert_edge(edge, |_| false);
            }
        }

        planner.split_dir(dir);
        let dir_name = dir.to_string();
        let report = self.commit_shards(
            &mut guards,
            |m| {
                m.split_dirs.insert(dir_name);
            },
            &BTreeMap::new(),
            true,
        )?;

        info!(
            dir = %dir,
            files = moves.len(),
            nodes = moved_nodes,
            edges = moved_edges,
            version = ?report.manifest_version,
            "directory split"
        );
        Ok(true)
    }
}
