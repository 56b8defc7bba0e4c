//! Multi-shard coordinator
//!
//! Owns one write buffer per shard, the manifest store and the published
//! read snapshot. Writers route records to shards through the planner and
//! append to that shard's buffer; flushes turn buffers into L0 segments and
//! publish a new manifest version together with a new `Snapshot`.
//!
//! Readers never look at the manifest directly: they take the shard read
//! locks, copy what they need from the buffers, load the current `Snapshot`
//! once and release the locks. Everything they touch afterwards is
//! immutable, so a query sees one manifest version from start to finish.
//!
//! Lock order: planner -> shard states (ascending) -> commit lock.
//! Compaction takes its per-shard lock and then the commit lock only.
//!
//! # Storage Layout
//!
//! ```text
//! <db>/
//! +-- db_config.json
//! +-- CURRENT                     # name of the live manifest
//! +-- manifests/manifest_00000007.json
//! +-- shards/00/seg_00000012_nodes.seg
//! +-- shards/00/seg_00000013_edges.seg
//! +-- shards/00/tomb_00000014.tomb
//! +-- index/global_00000007.idx
//! ```

mod compact;
mod read;
mod reanalyze;
mod write;

pub use read::NodeIter;
pub use reanalyze::{BatchDelta, Delta, UnitRecords};

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::error::{GraphError, Result};
use crate::index::GlobalIndex;
use crate::storage::maintenance::MaintenanceTask;
use crate::storage::manifest::{GcReport, Manifest, ManifestDiff, ManifestStore, SegmentDescriptor, TombstoneDescriptor};
use crate::storage::segment::LEVEL_L0;
use crate::storage::shard::{EdgeSegmentRef, NodeSegmentRef, ShardView};
use crate::storage::shard_planner::ShardPlanner;
use crate::storage::tombstone::TombstoneSet;
use crate::storage::write_buffer::WriteBuffer;
use crate::storage::writer::{retry_io, SegmentSink};
use crate::storage::{is_wildcard, BASE_EDGE_KINDS, BASE_NODE_KINDS};

// ============================================================
// Snapshot
// ============================================================

/// One published, immutable state of the whole store.
pub struct Snapshot {
    manifest: Arc<Manifest>,
    shards: Vec<Arc<ShardView>>,
    global_index: Arc<GlobalIndex>,
}

impl Snapshot {
    pub fn version(&self) -> u64 {
        self.manifest.version
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn shards(&self) -> &[Arc<ShardView>] {
        &self.shards
    }

    pub fn shard(&self, shard: u16) -> Option<&ShardView> {
        self.shards.get(shard as usize).map(|v| v.as_ref())
    }

    pub fn global_index(&self) -> &GlobalIndex {
        &self.global_index
    }
}

// ============================================================
// Reports
// ============================================================

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub flushed: Vec<u16>,
    /// Shards that could not be flushed, with the reason
    pub failed: Vec<(u16, String)>,
    pub manifest_version: Option<u64>,
    pub nodes_written: usize,
    pub edges_written: usize,
    pub tombstones_written: usize,
}

/// Per-shard statistics for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardStats {
    pub shard: u16,
    pub node_segments: usize,
    pub edge_segments: usize,
    pub l0_segments: usize,
    pub records: usize,
    pub tombstones: usize,
    pub buffered_nodes: usize,
    pub buffered_edges: usize,
    pub pending_deletes: usize,
    pub failed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub manifest_version: u64,
    pub shards: Vec<ShardStats>,
    pub segment_count: usize,
    pub total_records: u64,
    pub node_kinds: BTreeSet<String>,
    pub edge_kinds: BTreeSet<String>,
    pub split_dirs: usize,
    pub global_index_entries: usize,
}

/// A retained manifest version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub version: u64,
    pub created_at: u64,
    pub tags: BTreeMap<String, String>,
    pub segment_count: usize,
    pub total_records: u64,
}

// ============================================================
// Internal state
// ============================================================

#[derive(Default)]
pub(crate) struct ShardState {
    pub(crate) buffer: WriteBuffer,
    /// Set once flush I/O failed past its retries; the shard refuses writes
    pub(crate) failed: Option<String>,
}

pub(crate) type ShardGuard<'a> = RwLockWriteGuard<'a, ShardState>;

/// Kinds a filter may name: the base vocabulary plus everything written.
#[derive(Debug, Default)]
struct KindRegistry {
    nodes: HashSet<String>,
    edges: HashSet<String>,
}

impl KindRegistry {
    fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            nodes: manifest.node_kinds.iter().cloned().collect(),
            edges: manifest.edge_kinds.iter().cloned().collect(),
        }
    }

    fn knows_node(&self, kind: &str) -> bool {
        is_wildcard(kind) || BASE_NODE_KINDS.contains(&kind) || self.nodes.contains(kind)
    }

    fn knows_edge(&self, kind: &str) -> bool {
        is_wildcard(kind) || BASE_EDGE_KINDS.contains(&kind) || self.edges.contains(kind)
    }
}

/// A shard's buffer written to files, waiting for the manifest commit.
struct FlushedShard {
    shard: u16,
    nodes: Option<(SegmentDescriptor, Arc<NodeSegmentRef>)>,
    edges: Option<(SegmentDescriptor, Arc<EdgeSegmentRef>)>,
    /// New full tombstone set when the buffer carried deletes
    tombstones: Option<(Option<TombstoneDescriptor>, Arc<TombstoneSet>)>,
    node_count: usize,
    edge_count: usize,
    delete_count: usize,
}

pub struct MultiShardStore {
    config: StoreConfig,
    manifests: ManifestStore,
    sink: SegmentSink,
    snapshot: ArcSwap<Snapshot>,
    shards: Vec<RwLock<ShardState>>,
    compaction_locks: Vec<Mutex<()>>,
    planner: RwLock<ShardPlanner>,
    kinds: RwLock<KindRegistry>,
    commit_lock: Mutex<()>,
    /// Held (read) by anything that writes data files ahead of a commit;
    /// GC takes it exclusively so it never sees those files as orphans.
    file_writes: RwLock<()>,
    poisoned: RwLock<Option<String>>,
    published: Mutex<Vec<Weak<Snapshot>>>,
    maintenance: Mutex<Option<Sender<MaintenanceTask>>>,
}

// ============================================================
// Constructors
// ============================================================

impl MultiShardStore {
    /// Create a new database directory.
    pub fn create(db_path: &Path, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        if db_path.join(crate::storage::manifest::CURRENT_FILE).exists() {
            return Err(GraphError::Config(format!("{:?} already holds a database", db_path)));
        }
        std::fs::create_dir_all(db_path)?;
        config.save(db_path)?;
        let manifests = ManifestStore::create(db_path, config.shard_count)?;
        Ok(Self::assemble(config, manifests, SegmentSink::new(Some(db_path.to_path_buf()))))
    }

    /// Open an existing database: verify the current manifest, deal with
    /// orphaned files and map every live segment.
    pub fn open(db_path: &Path) -> Result<Self> {
        let manifests = ManifestStore::open(db_path)?;
        let current = manifests.current();
        let config = match StoreConfig::load(db_path)? {
            Some(config) => config,
            None => {
                warn!(path = ?db_path, "db_config.json missing, using defaults");
                StoreConfig::default().with_shard_count(current.shard_count)
            }
        };
        if config.shard_count != current.shard_count {
            return Err(GraphError::ManifestInconsistency(format!(
                "config declares {} shards, manifest {}",
                config.shard_count, current.shard_count
            )));
        }

        manifests.verify()?;
        let orphans = manifests.find_orphans(config.manifest_retention, &BTreeSet::new())?;
        if !orphans.is_empty() {
            if config.strict_orphans {
                return Err(GraphError::ManifestInconsistency(format!(
                    "{} unreferenced files, first: {}",
                    orphans.len(),
                    orphans[0]
                )));
            }
            warn!(count = orphans.len(), "removing orphaned files");
            manifests.collect_garbage(config.manifest_retention, &BTreeSet::new())?;
        }

        let sink = SegmentSink::new(Some(db_path.to_path_buf()));
        let mut views = Vec::with_capacity(current.shards.len());
        for (shard, desc) in current.shards.iter().enumerate() {
            let nodes = desc
                .l0_nodes
                .iter()
                .chain(&desc.l1_nodes)
                .map(|d| sink.open_nodes(d))
                .collect::<Result<Vec<_>>>()?;
            let edges = desc
                .l0_edges
                .iter()
                .chain(&desc.l1_edges)
                .map(|d| sink.open_edges(d))
                .collect::<Result<Vec<_>>>()?;
            if config.verify_checksums {
                deep_verify(shard as u16, &nodes, &edges)?;
            }
            let tombstones = match desc.tombstones {
                Some(ref t) => sink.load_tombstones(t)?,
                None => TombstoneSet::new(),
            };
            views.push(Arc::new(ShardView::new(shard as u16, nodes, edges, Arc::new(tombstones))));
        }
        let global_index = match current.global_index {
            Some(ref g) => sink.open_global_index(g)?,
            None => GlobalIndex::empty(),
        };

        let store = Self::assemble(config, manifests, sink);
        {
            let mut planner = store.planner.write();
            for view in &views {
                for owner in view.owners() {
                    planner.observe(&owner);
                }
            }
        }
        store.publish(current, views, Arc::new(global_index));

        info!(
            path = ?db_path,
            version = store.version(),
            segments = store.snapshot().manifest().segment_count(),
            "database opened"
        );
        Ok(store)
    }

    /// In-memory store: same semantics, nothing touches the filesystem.
    pub fn ephemeral(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let manifests = ManifestStore::ephemeral(config.shard_count);
        Ok(Self::assemble(config, manifests, SegmentSink::new(None)))
    }

    fn assemble(config: StoreConfig, manifests: ManifestStore, sink: SegmentSink) -> Self {
        let manifest = manifests.current();
        let shard_count = manifest.shard_count;
        let planner = ShardPlanner::new(shard_count, config.flat_dir_file_limit)
            .with_split_dirs(manifest.split_dirs.iter().cloned());
        let views = (0..shard_count).map(|s| Arc::new(ShardView::empty(s))).collect();
        let snapshot = Arc::new(Snapshot {
            manifest: manifest.clone(),
            shards: views,
            global_index: Arc::new(GlobalIndex::empty()),
        });

        Self {
            kinds: RwLock::new(KindRegistry::from_manifest(&manifest)),
            shards: (0..shard_count).map(|_| RwLock::new(ShardState::default())).collect(),
            compaction_locks: (0..shard_count).map(|_| Mutex::new(())).collect(),
            planner: RwLock::new(planner),
            published: Mutex::new(vec![Arc::downgrade(&snapshot)]),
            snapshot: ArcSwap::new(snapshot),
            commit_lock: Mutex::new(()),
            file_writes: RwLock::new(()),
            poisoned: RwLock::new(None),
            maintenance: Mutex::new(None),
            config,
            manifests,
            sink,
        }
    }
}

// ============================================================
// Snapshot publication & commit
// ============================================================

impl MultiShardStore {
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn shard_count(&self) -> u16 {
        self.shards.len() as u16
    }

    pub fn is_ephemeral(&self) -> bool {
        self.manifests.is_ephemeral()
    }

    /// Current published snapshot. Holding it pins its files against GC.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn version(&self) -> u64 {
        self.snapshot.load().manifest.version
    }

    pub(crate) fn check_poisoned(&self) -> Result<()> {
        match *self.poisoned.read() {
            Some(ref reason) => Err(GraphError::EnginePoisoned(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.read().is_some()
    }

    fn ensure_writable(shard: u16, state: &ShardState) -> Result<()> {
        match state.failed {
            Some(ref reason) => Err(GraphError::ShardFailed {
                shard,
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Swap in a new snapshot. Callers hold the commit lock (or own the
    /// store exclusively during construction).
    fn publish(&self, manifest: Arc<Manifest>, shards: Vec<Arc<ShardView>>, global_index: Arc<GlobalIndex>) {
        let snapshot = Arc::new(Snapshot {
            manifest,
            shards,
            global_index,
        });
        let mut published = self.published.lock();
        published.retain(|w| w.strong_count() > 0);
        published.push(Arc::downgrade(&snapshot));
        drop(published);
        self.snapshot.store(snapshot);
    }

    /// Versions still pinned by a live snapshot.
    fn live_versions(&self) -> BTreeSet<u64> {
        let mut published = self.published.lock();
        published.retain(|w| w.strong_count() > 0);
        published
            .iter()
            .filter_map(|w| w.upgrade())
            .map(|s| s.manifest.version)
            .collect()
    }

    /// Commit `next`, retrying I/O. A commit that still fails poisons the
    /// store: nothing downstream of the manifest can be trusted any more.
    fn commit_manifest(&self, next: Manifest) -> Result<Arc<Manifest>> {
        let result = retry_io(
            self.config.io_retry_attempts,
            self.config.io_retry_backoff_ms,
            "manifest commit",
            || self.manifests.commit(next.clone()),
        );
        result.map_err(|e| {
            let reason = e.to_string();
            error!(version = next.version, error = %reason, "manifest commit failed, store poisoned");
            *self.poisoned.write() = Some(reason.clone());
            GraphError::EnginePoisoned(reason)
        })
    }

    /// Write one shard's buffer: L0 segments plus, when it carries deletes,
    /// the shard's new full tombstone set.
    fn write_shard(&self, shard: u16, buffer: &WriteBuffer, view: &ShardView) -> Result<FlushedShard> {
        let (nodes, edges, mut pending) = buffer.flush_view();
        let seq = self.manifests.allocate_seq();

        let node_out = if nodes.is_empty() {
            None
        } else {
            Some(self.sink.write_nodes(shard, seq, seq, LEVEL_L0, &nodes)?)
        };
        let edge_out = if edges.is_empty() {
            None
        } else {
            let id = self.manifests.allocate_seq();
            Some(self.sink.write_edges(shard, id, seq, LEVEL_L0, &edges)?)
        };

        let delete_count = pending.len();
        let tombstones = if pending.is_empty() {
            None
        } else {
            // удаления прячут всё, что старше этого flush
            pending.stamp(seq);
            let mut merged = (**view.tombstones()).clone();
            merged.merge(&pending);
            let desc = self.sink.write_tombstones(shard, self.manifests.allocate_seq(), &merged)?;
            Some((desc, Arc::new(merged)))
        };

        Ok(FlushedShard {
            shard,
            nodes: node_out,
            edges: edge_out,
            tombstones,
            node_count: nodes.len(),
            edge_count: edges.len(),
            delete_count,
        })
    }

    /// Flush the given locked shards and publish them in one manifest
    /// version. `edit` may change the manifest further; with `force` the
    /// version is committed even if no buffer had anything to flush.
    pub(crate) fn commit_shards(
        &self,
        guards: &mut [(u16, ShardGuard<'_>)],
        edit: impl FnOnce(&mut Manifest),
        tags: &BTreeMap<String, String>,
        force: bool,
    ) -> Result<FlushReport> {
        self.check_poisoned()?;
        let mut report = FlushReport::default();
        let _files = self.file_writes.read();
        let base = self.snapshot();

        let mut flushed = Vec::new();
        for (shard, state) in guards.iter() {
            let shard = *shard;
            if let Some(ref reason) = state.failed {
                report.failed.push((shard, reason.clone()));
                continue;
            }
            if state.buffer.is_empty() {
                continue;
            }
            let view = base.shards[shard as usize].clone();
            let written = retry_io(
                self.config.io_retry_attempts,
                self.config.io_retry_backoff_ms,
                "flush",
                || self.write_shard(shard, &state.buffer, &view),
            );
            match written {
                Ok(f) => flushed.push(f),
                Err(e) => {
                    error!(shard, error = %e, "flush failed, shard marked failed");
                    report.failed.push((shard, e.to_string()));
                }
            }
        }

        // помечаем упавшие шарды
        for (shard, reason) in &report.failed {
            if let Some((_, state)) = guards.iter_mut().find(|(s, _)| s == shard) {
                if state.failed.is_none() {
                    state.failed = Some(reason.clone());
                }
            }
        }

        if flushed.is_empty() && !force {
            return Ok(report);
        }

        let commit = self.commit_lock.lock();
        let snap = self.snapshot();
        let mut next = self.manifests.current().next_version();
        let mut views = snap.shards.clone();

        for f in &flushed {
            let idx = f.shard as usize;
            let desc = &mut next.shards[idx];
            let current = &views[idx];
            let mut nodes = current.node_segments().to_vec();
            let mut edges = current.edge_segments().to_vec();

            if let Some((ref d, ref seg)) = f.nodes {
                next.node_kinds.extend(d.kinds.iter().cloned());
                desc.l0_nodes.push(d.clone());
                nodes.push(seg.clone());
            }
            if let Some((ref d, ref seg)) = f.edges {
                next.edge_kinds.extend(d.kinds.iter().cloned());
                desc.l0_edges.push(d.clone());
                edges.push(seg.clone());
            }
            let tombstones = match f.tombstones {
                Some((ref d, ref set)) => {
                    desc.tombstones = d.clone();
                    set.clone()
                }
                None => current.tombstones().clone(),
            };
            if desc.l0_count() >= self.config.compaction.segment_threshold {
                next.pending_compaction.insert(f.shard);
            }

            views[idx] = Arc::new(ShardView::new(f.shard, nodes, edges, tombstones));
            report.flushed.push(f.shard);
            report.nodes_written += f.node_count;
            report.edges_written += f.edge_count;
            report.tombstones_written += f.delete_count;
        }

        edit(&mut next);
        next.tags = tags.clone();
        let wants_compaction = !next.pending_compaction.is_empty();

        let committed = self.commit_manifest(next)?;
        report.manifest_version = Some(committed.version);
        self.publish(committed, views, snap.global_index.clone());
        drop(commit);

        for (shard, state) in guards.iter_mut() {
            if report.flushed.contains(shard) {
                state.buffer.clear();
            }
        }

        debug!(
            version = ?report.manifest_version,
            shards = ?report.flushed,
            nodes = report.nodes_written,
            edges = report.edges_written,
            deletes = report.tombstones_written,
            "flush committed"
        );
        if wants_compaction {
            self.notify_maintenance(MaintenanceTask::Compact);
        }
        Ok(report)
    }

    /// Flush every shard's buffer in one manifest version.
    pub fn flush(&self) -> Result<FlushReport> {
        self.check_poisoned()?;
        let report = {
            let mut guards: Vec<(u16, ShardGuard<'_>)> = self
                .shards
                .iter()
                .enumerate()
                .map(|(i, s)| (i as u16, s.write()))
                .collect();
            self.commit_shards(&mut guards, |_| {}, &BTreeMap::new(), false)?
        };
        if !report.flushed.is_empty() {
            info!(
                version = ?report.manifest_version,
                shards = report.flushed.len(),
                nodes = report.nodes_written,
                edges = report.edges_written,
                "flushed"
            );
        }
        self.after_commit(&report, Vec::new())?;
        Ok(report)
    }

    /// Follow-up work that must run without any shard lock held: directory
    /// splits (flat directories, oversized shards).
    pub(crate) fn after_commit(&self, report: &FlushReport, mut split: Vec<String>) -> Result<()> {
        if !report.flushed.is_empty() {
            let snap = self.snapshot();
            let planner = self.planner.read();
            for &shard in &report.flushed {
                let records = snap.shards[shard as usize].record_count();
                if records > self.config.shard_split_threshold {
                    if let Some((dir, files)) = planner.largest_unsplit_dir(shard) {
                        debug!(shard, records, dir = %dir, files, "shard over split threshold");
                        split.push(dir);
                    }
                }
            }
        }
        split.sort();
        split.dedup();
        for dir in split {
            self.split_directory(&dir)?;
        }
        Ok(())
    }

    // ============================================================
    // Maintenance hook
    // ============================================================

    /// Route follow-up compaction requests to a background worker.
    pub fn attach_maintenance(&self, tx: Sender<MaintenanceTask>) {
        *self.maintenance.lock() = Some(tx);
    }

    pub fn detach_maintenance(&self) {
        *self.maintenance.lock() = None;
    }

    fn notify_maintenance(&self, task: MaintenanceTask) {
        if let Some(ref tx) = *self.maintenance.lock() {
            // воркер уже остановлен - просто пропускаем
            if let Err(e) = tx.send(task) {
                debug!(task = ?e.into_inner(), "maintenance worker gone, task dropped");
            }
        }
    }

    // ============================================================
    // Garbage collection, snapshots, stats
    // ============================================================

    /// Remove manifest versions past retention and files none of the kept
    /// versions reference. Versions pinned by live snapshots are kept.
    pub fn collect_garbage(&self) -> Result<GcReport> {
        self.check_poisoned()?;
        let _files = self.file_writes.write();
        let protected = self.live_versions();
        self.manifests
            .collect_garbage(self.config.manifest_retention, &protected)
    }

    /// Tag the current version; tagged versions survive GC.
    pub fn tag_snapshot(&self, key: &str, value: &str) -> Result<u64> {
        let _commit = self.commit_lock.lock();
        let version = self.manifests.current().version;
        self.manifests.tag(version, key, value)?;
        Ok(version)
    }

    pub fn find_snapshot(&self, key: &str, value: &str) -> Result<Option<u64>> {
        self.manifests.find_by_tag(key, value)
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.manifests
            .list_versions()?
            .into_iter()
            .map(|v| {
                let m = self.manifests.load_version(v)?;
                Ok(SnapshotInfo {
                    version: m.version,
                    created_at: m.created_at,
                    tags: m.tags.clone(),
                    segment_count: m.segment_count(),
                    total_records: m.total_records(),
                })
            })
            .collect()
    }

    pub fn diff_snapshots(&self, from: u64, to: u64) -> Result<ManifestDiff> {
        self.manifests.diff(from, to)
    }

    pub fn stats(&self) -> StoreStats {
        let snap = self.snapshot();
        let shards = snap
            .shards
            .iter()
            .zip(&self.shards)
            .map(|(view, state)| {
                let state = state.read();
                ShardStats {
                    shard: view.shard(),
                    node_segments: view.node_segments().len(),
                    edge_segments: view.edge_segments().len(),
                    l0_segments: view.l0_count(),
                    records: view.record_count(),
                    tombstones: view.tombstones().len(),
                    buffered_nodes: state.buffer.node_count(),
                    buffered_edges: state.buffer.edge_count(),
                    pending_deletes: state.buffer.pending_deletes().len(),
                    failed: state.failed.clone(),
                }
            })
            .collect();

        StoreStats {
            manifest_version: snap.manifest.version,
            shards,
            segment_count: snap.manifest.segment_count(),
            total_records: snap.manifest.total_records(),
            node_kinds: snap.manifest.node_kinds.clone(),
            edge_kinds: snap.manifest.edge_kinds.clone(),
            split_dirs: snap.manifest.split_dirs.len(),
            global_index_entries: snap.global_index.len(),
        }
    }

    /// Kinds named by a filter must be known: base vocabulary, anything
    /// written so far, or a namespace wildcard.
    pub(crate) fn check_node_kind(&self, kind: Option<&str>) -> Result<()> {
        match kind {
            Some(k) if !self.kinds.read().knows_node(k) => Err(GraphError::UnknownKind(k.to_string())),
            _ => Ok(()),
        }
    }

    pub(crate) fn check_edge_kinds(&self, kinds: Option<&[&str]>) -> Result<()> {
        let registry = self.kinds.read();
        for k in kinds.unwrap_or(&[]) {
            if !registry.knows_edge(k) {
                return Err(GraphError::UnknownKind(k.to_string()));
            }
        }
        Ok(())
    }

    fn register_kinds<'a>(&self, nodes: impl Iterator<Item = &'a str>, edges: impl Iterator<Item = &'a str>) {
        let mut registry = self.kinds.write();
        for k in nodes {
            if !registry.nodes.contains(k) {
                registry.nodes.insert(k.to_string());
            }
        }
        for k in edges {
            if !registry.edges.contains(k) {
                registry.edges.insert(k.to_string());
            }
        }
    }
}

/// Recompute body checksums of freshly opened segments.
fn deep_verify(shard: u16, nodes: &[Arc<NodeSegmentRef>], edges: &[Arc<EdgeSegmentRef>]) -> Result<()> {
    let checks = nodes
        .iter()
        .map(|s| (s.id, s.segment.verify_checksum()))
        .chain(edges.iter().map(|s| (s.id, s.segment.verify_checksum())));
    for (id, check) in checks {
        if let Err(e) = check {
            return Err(GraphError::ManifestInconsistency(format!(
                "shard {} segment {}: {}",
                shard, id, e
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
