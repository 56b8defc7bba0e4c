//! GraphEngine: public facade over the multi-shard store
//!
//! Owns the store and, when `background_maintenance` is on, the worker
//! that compacts and collects garbage after flushes. Everything else is
//! delegation; the engine adds traversal on top of `neighbors`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use super::{traversal, GraphStore};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::storage::compaction::CompactionResult;
use crate::storage::maintenance::MaintenanceWorker;
use crate::storage::manifest::{GcReport, ManifestDiff, CURRENT_FILE};
use crate::storage::multi_shard::{
    BatchDelta, Delta, FlushReport, NodeIter, Snapshot, SnapshotInfo, StoreStats, UnitRecords,
};
use crate::storage::shard::Explain;
use crate::storage::{
    AttrQuery, CancelToken, Direction, EdgeRecord, MultiShardStore, NodeRecord, UpsertOutcome, UpsertStats,
};

/// Main graph engine
pub struct GraphEngine {
    path: Option<PathBuf>,
    store: Arc<MultiShardStore>,
    worker: Option<MaintenanceWorker>,
}

impl GraphEngine {
    /// Create a new empty database at `path`. Fails if one already exists.
    pub fn create<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = MultiShardStore::create(&path, config)?;
        debug_log!("GraphEngine::create() - path: {:?}", path);
        info!(path = %path.display(), "created graph store");
        Self::start(Some(path), store)
    }

    /// Open an existing database. Verifies the manifest against the files
    /// on disk first; any inconsistency is fatal.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = MultiShardStore::open(&path)?;
        debug_log!("GraphEngine::open() - path: {:?}, version: {}", path, store.version());
        info!(path = %path.display(), version = store.version(), "opened graph store");
        Self::start(Some(path), store)
    }

    /// Open `path` if it holds a database, otherwise create one with `config`.
    pub fn open_or_create<P: AsRef<Path>>(path: P, config: StoreConfig) -> Result<Self> {
        if path.as_ref().join(CURRENT_FILE).exists() {
            Self::open(path)
        } else {
            Self::create(path, config)
        }
    }

    /// In-memory database: segments live in memory, nothing survives drop.
    pub fn ephemeral(config: StoreConfig) -> Result<Self> {
        Self::start(None, MultiShardStore::ephemeral(config)?)
    }

    fn start(path: Option<PathBuf>, store: MultiShardStore) -> Result<Self> {
        let store = Arc::new(store);
        let worker = if store.config().background_maintenance {
            Some(MaintenanceWorker::spawn(&store)?)
        } else {
            None
        };
        Ok(Self { path, store, worker })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn store(&self) -> &Arc<MultiShardStore> {
        &self.store
    }

    pub fn config(&self) -> &StoreConfig {
        self.store.config()
    }

    /// Current published snapshot. Holding it pins its manifest version
    /// against GC.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.store.snapshot()
    }

    pub fn version(&self) -> u64 {
        self.store.version()
    }

    // ============================================================
    // Writes
    // ============================================================

    pub fn upsert(&self, shard_key: &str, node: NodeRecord) -> Result<UpsertOutcome> {
        self.store.upsert(shard_key, node)
    }

    pub fn upsert_edge(&self, shard_key: &str, edge: EdgeRecord) -> Result<UpsertOutcome> {
        self.store.upsert_edge(shard_key, edge)
    }

    /// Re-analyze several units and publish them in one manifest version.
    pub fn commit_batch(
        &self,
        units: Vec<(String, UnitRecords)>,
        tags: &BTreeMap<String, String>,
    ) -> Result<BatchDelta> {
        self.store.commit_batch(units, tags)
    }

    // ============================================================
    // Reads
    // ============================================================

    pub fn get_edge(&self, src: u128, dst: u128, kind: &str) -> Result<Option<EdgeRecord>> {
        self.store.get_edge(src, dst, kind)
    }

    /// Lazy iterator over matching nodes, bound to one snapshot.
    pub fn find(&self, query: &AttrQuery) -> Result<NodeIter> {
        self.store.find(query)
    }

    pub fn find_cancellable(&self, query: &AttrQuery, cancel: &CancelToken) -> Result<NodeIter> {
        self.store.find_cancellable(query, cancel)
    }

    pub fn neighbors_cancellable(
        &self,
        id: u128,
        direction: Direction,
        kinds: Option<&[&str]>,
        cancel: &CancelToken,
    ) -> Result<Vec<(EdgeRecord, u128)>> {
        self.store.neighbors_cancellable(id, direction, kinds, cancel)
    }

    pub fn explain_get(&self, id: u128) -> Result<(Option<NodeRecord>, Explain)> {
        self.store.explain_get(id)
    }

    pub fn explain_find(&self, query: &AttrQuery) -> Result<(Vec<NodeRecord>, Explain)> {
        self.store.explain_find(query)
    }

    pub fn explain_neighbors(
        &self,
        id: u128,
        direction: Direction,
        kinds: Option<&[&str]>,
    ) -> Result<(Vec<(EdgeRecord, u128)>, Explain)> {
        self.store.explain_neighbors(id, direction, kinds)
    }

    // ============================================================
    // Traversal
    // ============================================================

    /// BFS that can be abandoned through `cancel` between expansions.
    pub fn bfs_cancellable(
        &self,
        start: &[u128],
        max_depth: usize,
        kinds: Option<&[&str]>,
        cancel: &CancelToken,
    ) -> Result<Vec<u128>> {
        traversal::bfs(start, max_depth, Some(cancel), |id| {
            self.neighbor_ids(id, Direction::Outgoing, kinds, Some(cancel))
        })
    }

    /// Transitive reachability query using BFS
    /// Returns all nodes reachable from start nodes within max_depth
    /// If backward=true, traverses edges in reverse direction (find sources)
    pub fn reachability(
        &self,
        start: &[u128],
        max_depth: usize,
        kinds: Option<&[&str]>,
        backward: bool,
    ) -> Result<Vec<u128>> {
        let direction = if backward { Direction::Incoming } else { Direction::Outgoing };
        traversal::bfs(start, max_depth, None, |id| self.neighbor_ids(id, direction, kinds, None))
    }

    /// Is there a path `from -> ... -> to` of at most `max_depth` edges?
    pub fn is_reachable(&self, from: u128, to: u128, max_depth: usize, kinds: Option<&[&str]>) -> Result<bool> {
        traversal::reachable(&[from], to, max_depth, None, |id| {
            self.neighbor_ids(id, Direction::Outgoing, kinds, None)
        })
    }

    fn neighbor_ids(
        &self,
        id: u128,
        direction: Direction,
        kinds: Option<&[&str]>,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<u128>> {
        let edges = match cancel {
            Some(cancel) => self.store.neighbors_cancellable(id, direction, kinds, cancel)?,
            None => self.store.neighbors(id, direction, kinds)?,
        };
        Ok(edges.into_iter().map(|(_, other)| other).collect())
    }

    // ============================================================
    // Maintenance
    // ============================================================

    /// Compact every shard with segments, ignoring the policy.
    pub fn force_compact(&self) -> Result<CompactionResult> {
        self.store.force_compact()
    }

    pub fn collect_garbage(&self) -> Result<GcReport> {
        self.store.collect_garbage()
    }

    /// Move a directory's records to per-file routing.
    pub fn split_directory(&self, dir: &str) -> Result<bool> {
        self.store.split_directory(dir)
    }

    /// Block until the background worker has drained its queue.
    /// No-op without background maintenance.
    pub fn wait_for_maintenance(&self) -> Result<()> {
        match &self.worker {
            Some(worker) => worker.sync(),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    // ============================================================
    // Snapshots
    // ============================================================

    /// Tag the current manifest version; tagged versions survive GC.
    pub fn tag_snapshot(&self, key: &str, value: &str) -> Result<u64> {
        self.store.tag_snapshot(key, value)
    }

    pub fn find_snapshot(&self, key: &str, value: &str) -> Result<Option<u64>> {
        self.store.find_snapshot(key, value)
    }

    pub fn list_snapshots(&self) -> Result<Vec<SnapshotInfo>> {
        self.store.list_snapshots()
    }

    pub fn diff_snapshots(&self, from: u64, to: u64) -> Result<ManifestDiff> {
        self.store.diff_snapshots(from, to)
    }

    /// Flush everything and stop the worker. Dropping the engine without
    /// `close` loses whatever is still buffered.
    pub fn close(mut self) -> Result<FlushReport> {
        let report = self.store.flush();
        self.stop_worker();
        report
    }

    fn stop_worker(&mut self) {
        self.store.detach_maintenance();
        if let Some(worker) = self.worker.take() {
            drop(worker);
        }
    }
}

impl GraphStore for GraphEngine {
    fn upsert_batch(&self, shard_key: &str, nodes: Vec<NodeRecord>) -> Result<UpsertStats> {
        self.store.upsert_batch(shard_key, nodes)
    }

    fn upsert_edges(&self, shard_key: &str, edges: Vec<EdgeRecord>) -> Result<UpsertStats> {
        self.store.upsert_edges(shard_key, edges)
    }

    fn delete_node(&self, id: u128) -> Result<bool> {
        self.store.delete_node(id)
    }

    fn delete_edge(&self, src: u128, dst: u128, kind: &str) -> Result<bool> {
        self.store.delete_edge(src, dst, kind)
    }

    fn get_node(&self, id: u128) -> Result<Option<NodeRecord>> {
        self.store.get(id)
    }

    fn find_nodes(&self, query: &AttrQuery) -> Result<Vec<NodeRecord>> {
        self.store.find(query)?.into_checked()
    }

    fn neighbors(&self, id: u128, direction: Direction, kinds: Option<&[&str]>) -> Result<Vec<(EdgeRecord, u128)>> {
        self.store.neighbors(id, direction, kinds)
    }

    fn reanalyze_unit(&self, unit_key: &str, records: UnitRecords) -> Result<Delta> {
        self.store.reanalyze_unit(unit_key, records)
    }

    fn flush(&self) -> Result<FlushReport> {
        let report = self.store.flush()?;
        if !report.failed.is_empty() {
            warn!(failed = ?report.failed, "flush left failed shards");
        }
        Ok(report)
    }

    fn compact(&self) -> Result<CompactionResult> {
        self.store.compact()
    }
}

impl Drop for GraphEngine {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::multi_shard::UnitRecords;
    use tempfile::TempDir;

    fn make_test_node(id: u128, kind: &str, name: &str, file: &str) -> NodeRecord {
        NodeRecord::new(id, kind, name, file)
    }

    fn small_config() -> StoreConfig {
        StoreConfig::default().with_shard_count(2)
    }

    #[test]
    fn test_create_and_open() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("graph");

        let engine = GraphEngine::create(&db, small_config()).unwrap();
        engine
            .upsert_batch(
                "src/a.js",
                vec![
                    make_test_node(1, "FUNCTION", "foo", "src/a.js"),
                    make_test_node(2, "FUNCTION", "bar", "src/a.js"),
                ],
            )
            .unwrap();
        let report = engine.close().unwrap();
        assert!(report.failed.is_empty());

        let engine = GraphEngine::open(&db).unwrap();
        assert_eq!(engine.get_node(1).unwrap().unwrap().name, "foo");
        assert_eq!(engine.config().shard_count, 2);
        assert_eq!(engine.path(), Some(db.as_path()));
    }

    #[test]
    fn test_create_twice_fails() {
        let dir = TempDir::new().unwrap();
        let db = dir.path().join("graph");
        drop(GraphEngine::create(&db, small_config()).unwrap());
        assert!(GraphEngine::create(&db, small_config()).is_err());
        assert!(GraphEngine::open_or_create(&db, small_config()).is_ok());
    }

    #[test]
    fn test_reachability_forward_and_backward() {
        let engine = GraphEngine::ephemeral(small_config()).unwrap();
        // 1 -> 2 -> 3, 4 -> 3
        engine
            .upsert_batch(
                "src/a.js",
                (1..=4).map(|i| make_test_node(i, "FUNCTION", &format!("f{}", i), "src/a.js")).collect(),
            )
            .unwrap();
        engine
            .upsert_edges(
                "src/a.js",
                vec![
                    EdgeRecord::new(1, 2, "CALLS"),
                    EdgeRecord::new(2, 3, "CALLS"),
                    EdgeRecord::new(4, 3, "CALLS"),
                ],
            )
            .unwrap();
        engine.flush().unwrap();

        let forward = engine.reachability(&[1], 10, Some(&["CALLS"][..]), false).unwrap();
        assert_eq!(forward, vec![1, 2, 3]);

        let mut backward = engine.reachability(&[3], 10, None, true).unwrap();
        backward.sort();
        assert_eq!(backward, vec![1, 2, 3, 4]);

        assert!(engine.is_reachable(1, 3, 2, None).unwrap());
        assert!(!engine.is_reachable(1, 3, 1, None).unwrap());
        assert!(!engine.is_reachable(3, 1, 5, None).unwrap());
    }

    #[test]
    fn test_bfs_through_trait() {
        let engine = GraphEngine::ephemeral(small_config()).unwrap();
        engine
            .upsert_batch(
                "src/a.js",
                vec![make_test_node(1, "FUNCTION", "a", "src/a.js"), make_test_node(2, "FUNCTION", "b", "src/a.js")],
            )
            .unwrap();
        engine.upsert_edge("src/a.js", EdgeRecord::new(1, 2, "CALLS")).unwrap();

        let store: &dyn GraphStore = &engine;
        assert_eq!(store.bfs(&[1], 3, Some(&["CALLS"][..])).unwrap(), vec![1, 2]);
        assert!(store.bfs(&[1], 3, Some(&["NO_SUCH_EDGE"][..])).is_err());
    }

    #[test]
    fn test_cancelled_bfs() {
        let engine = GraphEngine::ephemeral(small_config()).unwrap();
        engine.upsert("src/a.js", make_test_node(1, "FUNCTION", "a", "src/a.js")).unwrap();
        let token = CancelToken::new();
        token.cancel();
        assert!(engine.bfs_cancellable(&[1], 3, None, &token).is_err());
    }

    #[test]
    fn test_reanalyze_through_engine() {
        let engine = GraphEngine::ephemeral(small_config()).unwrap();
        let unit = |names: &[(u128, &str)]| {
            UnitRecords::new(
                names.iter().map(|(id, n)| make_test_node(*id, "FUNCTION", n, "src/u.js")).collect(),
                vec![],
            )
        };

        let first = engine.reanalyze_unit("src/u.js", unit(&[(1, "x"), (2, "y")])).unwrap();
        assert_eq!(first.added_nodes.len(), 2);

        let second = engine.reanalyze_unit("src/u.js", unit(&[(1, "x"), (3, "z")])).unwrap();
        assert_eq!(second.added_nodes, vec![3]);
        assert_eq!(second.removed_nodes, vec![2]);
        assert!(engine.get_node(2).unwrap().is_none());
        assert_eq!(engine.find_nodes(&AttrQuery::new().owner("src/u.js")).unwrap().len(), 2);
    }

    #[test]
    fn test_background_worker_runs_and_stops() {
        let mut config = StoreConfig::default().with_shard_count(1);
        config.background_maintenance = true;
        config.compaction.segment_threshold = 2;
        let engine = GraphEngine::ephemeral(config).unwrap();

        for i in 1..=3u128 {
            engine.upsert("src/a.js", make_test_node(i, "FUNCTION", "f", "src/a.js")).unwrap();
            engine.flush().unwrap();
        }
        engine.wait_for_maintenance().unwrap();
        assert!(engine.snapshot().manifest().last_compaction.is_some());
        drop(engine);
    }
}
