//! Manifest: the versioned registry of live segments and tombstones
//!
//! Every version is an immutable JSON file `manifests/manifest_{v:08}.json`.
//! The `CURRENT` marker names the live one. A commit writes the new version
//! to a temp file, fsyncs, renames it into place, then swaps `CURRENT` the
//! same way and fsyncs the directory. On restart only the version `CURRENT`
//! points to is trusted.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{GraphError, Result};
use crate::storage::segment::{read_footer_crc, SegmentKind};

pub const CURRENT_FILE: &str = "CURRENT";
pub const MANIFESTS_DIR: &str = "manifests";
pub const SHARDS_DIR: &str = "shards";
pub const INDEX_DIR: &str = "index";

pub fn manifest_file_name(version: u64) -> String {
    format!("manifest_{:08}.json", version)
}

pub fn segment_rel_path(shard: u16, id: u64, kind: SegmentKind) -> String {
    format!("{}/{:02}/seg_{:08}_{}.seg", SHARDS_DIR, shard, id, kind.file_suffix())
}

pub fn tombstone_rel_path(shard: u16, id: u64) -> String {
    format!("{}/{:02}/tomb_{:08}.tomb", SHARDS_DIR, shard, id)
}

pub fn global_index_rel_path(version: u64) -> String {
    format!("{}/global_{:08}.idx", INDEX_DIR, version)
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// u128 keys as hex strings: JSON numbers cannot carry 128 bits portably.
mod u128_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u128, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&format!("{:032x}", v))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<u128, D::Error> {
        let s = String::deserialize(d)?;
        u128::from_str_radix(&s, 16).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// File id, unique across the database
    pub id: u64,
    /// Precedence: higher wins; compaction output keeps the max of its inputs
    pub seq: u64,
    /// Path relative to the database root
    pub file: String,
    pub level: u8,
    pub record_count: u64,
    pub byte_size: u64,
    pub crc32: u32,
    #[serde(with = "u128_hex")]
    pub min_key: u128,
    #[serde(with = "u128_hex")]
    pub max_key: u128,
    pub kinds: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneDescriptor {
    pub id: u64,
    pub file: String,
    pub node_count: u64,
    pub edge_count: u64,
    pub byte_size: u64,
    pub crc32: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub l0_nodes: Vec<SegmentDescriptor>,
    pub l0_edges: Vec<SegmentDescriptor>,
    pub l1_nodes: Vec<SegmentDescriptor>,
    pub l1_edges: Vec<SegmentDescriptor>,
    /// Full tombstone set of the shard, rewritten on change
    pub tombstones: Option<TombstoneDescriptor>,
}

impl ShardDescriptor {
    pub fn segments(&self) -> impl Iterator<Item = &SegmentDescriptor> {
        self.l0_nodes
            .iter()
            .chain(&self.l0_edges)
            .chain(&self.l1_nodes)
            .chain(&self.l1_edges)
    }

    pub fn record_count(&self) -> u64 {
        self.segments().map(|s| s.record_count).sum()
    }

    pub fn l0_count(&self) -> usize {
        self.l0_nodes.len().max(self.l0_edges.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalIndexDescriptor {
    pub version: u64,
    pub file: String,
    pub entry_count: u64,
    pub byte_size: u64,
    pub crc32: u32,
}

/// Compaction metadata stored in manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionInfo {
    pub manifest_version: u64,
    pub timestamp_ms: u64,
    pub shards: Vec<u16>,
    pub l0_segments_merged: u32,
    pub tombstones_removed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u64,
    pub parent: Option<u64>,
    pub created_at: u64,
    pub shard_count: u16,
    /// Next unused sequence / file id
    pub next_seq: u64,
    pub shards: Vec<ShardDescriptor>,
    pub node_kinds: BTreeSet<String>,
    pub edge_kinds: BTreeSet<String>,
    pub split_dirs: BTreeSet<String>,
    pub global_index: Option<GlobalIndexDescriptor>,
    pub global_index_version: u64,
    pub pending_compaction: BTreeSet<u16>,
    pub last_compaction: Option<CompactionInfo>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Manifest {
    pub fn initial(shard_count: u16) -> Self {
        Self {
            version: 1,
            parent: None,
            created_at: now_secs(),
            shard_count,
            next_seq: 1,
            shards: vec![ShardDescriptor::default(); shard_count as usize],
            node_kinds: BTreeSet::new(),
            edge_kinds: BTreeSet::new(),
            split_dirs: BTreeSet::new(),
            global_index: None,
            global_index_version: 0,
            pending_compaction: BTreeSet::new(),
            last_compaction: None,
            tags: BTreeMap::new(),
        }
    }

    /// Copy-on-write successor. Tags belong to a version and are not inherited.
    pub fn next_version(&self) -> Self {
        Self {
            version: self.version + 1,
            parent: Some(self.version),
            created_at: now_secs(),
            tags: BTreeMap::new(),
            ..self.clone()
        }
    }

    /// Every data file this version references (relative paths).
    pub fn referenced_files(&self) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        for shard in &self.shards {
            files.extend(shard.segments().map(|s| s.file.clone()));
            if let Some(ref t) = shard.tombstones {
                files.insert(t.file.clone());
            }
        }
        if let Some(ref g) = self.global_index {
            files.insert(g.file.clone());
        }
        files
    }

    pub fn segment_count(&self) -> usize {
        self.shards.iter().map(|s| s.segments().count()).sum()
    }

    pub fn total_records(&self) -> u64 {
        self.shards.iter().map(|s| s.record_count()).sum()
    }

    fn payload_crc(&self) -> Result<u32> {
        Ok(crc32fast::hash(&serde_json::to_vec(self)?))
    }
}

/// On-disk envelope: payload plus its checksum.
#[derive(Serialize, Deserialize)]
struct ManifestFile {
    crc32: u32,
    manifest: Manifest,
}

/// Difference between two manifest versions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub from: u64,
    pub to: u64,
    pub added_files: Vec<String>,
    pub removed_files: Vec<String>,
    pub changed_shards: Vec<u16>,
    pub added_node_kinds: Vec<String>,
    pub added_edge_kinds: Vec<String>,
}

impl ManifestDiff {
    pub fn is_empty(&self) -> bool {
        self.added_files.is_empty() && self.removed_files.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    pub manifests_removed: usize,
    pub files_removed: usize,
    pub bytes_freed: u64,
}

pub struct ManifestStore {
    /// None = ephemeral (in-memory only)
    root: Option<PathBuf>,
    current: ArcSwap<Manifest>,
    next_seq: AtomicU64,
    // ephemeral stores keep their history here
    history: Mutex<BTreeMap<u64, Arc<Manifest>>>,
}

impl ManifestStore {
    /// Initialize a fresh database directory with version 1.
    pub fn create(root: &Path, shard_count: u16) -> Result<Self> {
        fs::create_dir_all(root.join(MANIFESTS_DIR))?;
        fs::create_dir_all(root.join(INDEX_DIR))?;
        for shard in 0..shard_count {
            fs::create_dir_all(root.join(SHARDS_DIR).join(format!("{:02}", shard)))?;
        }
        let manifest = Manifest::initial(shard_count);
        persist(root, &manifest)?;
        info!(path = ?root, shards = shard_count, "database created");
        Ok(Self::from_parts(Some(root.to_path_buf()), manifest))
    }

    /// Load the version `CURRENT` points to.
    pub fn open(root: &Path) -> Result<Self> {
        let marker = root.join(CURRENT_FILE);
        if !marker.exists() {
            return Err(GraphError::ManifestInconsistency(format!(
                "{:?} has no CURRENT marker",
                root
            )));
        }
        let name = fs::read_to_string(&marker)?;
        let manifest = load_file(&root.join(MANIFESTS_DIR).join(name.trim()))?;
        info!(version = manifest.version, segments = manifest.segment_count(), "manifest loaded");
        Ok(Self::from_parts(Some(root.to_path_buf()), manifest))
    }

    pub fn ephemeral(shard_count: u16) -> Self {
        let store = Self::from_parts(None, Manifest::initial(shard_count));
        let current = store.current();
        store.history.lock().insert(current.version, current);
        store
    }

    fn from_parts(root: Option<PathBuf>, manifest: Manifest) -> Self {
        let next_seq = AtomicU64::new(manifest.next_seq);
        Self {
            root,
            current: ArcSwap::from_pointee(manifest),
            next_seq,
            history: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.root.is_none()
    }

    pub fn current(&self) -> Arc<Manifest> {
        self.current.load_full()
    }

    /// Reserve a sequence number (also used as file id).
    pub fn allocate_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish `next`. Must be the direct successor of the current version.
    /// Callers serialize commits.
    pub fn commit(&self, mut next: Manifest) -> Result<Arc<Manifest>> {
        let current = self.current();
        if next.version != current.version + 1 {
            return Err(GraphError::ManifestInconsistency(format!(
                "commit of version {} on top of {}",
                next.version, current.version
            )));
        }
        next.next_seq = self.next_seq.load(Ordering::SeqCst);

        match self.root {
            Some(ref root) => persist(root, &next)?,
            None => {
                self.history.lock().insert(next.version, Arc::new(next.clone()));
            }
        }

        let next = Arc::new(next);
        self.current.store(next.clone());
        tracing::debug!(version = next.version, "manifest committed");
        Ok(next)
    }

    pub fn load_version(&self, version: u64) -> Result<Arc<Manifest>> {
        let current = self.current();
        if current.version == version {
            return Ok(current);
        }
        match self.root {
            Some(ref root) => Ok(Arc::new(load_file(
                &root.join(MANIFESTS_DIR).join(manifest_file_name(version)),
            )?)),
            None => self
                .history
                .lock()
                .get(&version)
                .cloned()
                .ok_or_else(|| GraphError::ManifestInconsistency(format!("version {} not retained", version))),
        }
    }

    /// Retained versions, ascending.
    pub fn list_versions(&self) -> Result<Vec<u64>> {
        let Some(ref root) = self.root else {
            return Ok(self.history.lock().keys().copied().collect());
        };
        let mut versions = Vec::new();
        for entry in fs::read_dir(root.join(MANIFESTS_DIR))? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(v) = name
                .strip_prefix("manifest_")
                .and_then(|s| s.strip_suffix(".json"))
                .and_then(|s| s.parse::<u64>().ok())
            {
                versions.push(v);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Attach a tag to a retained version. Tagged versions survive GC.
    pub fn tag(&self, version: u64, key: &str, value: &str) -> Result<()> {
        let mut manifest = (*self.load_version(version)?).clone();
        manifest.tags.insert(key.to_string(), value.to_string());

        match self.root {
            Some(ref root) => write_manifest_file(root, &manifest)?,
            None => {
                self.history.lock().insert(version, Arc::new(manifest.clone()));
            }
        }
        if self.current().version == version {
            self.current.store(Arc::new(manifest));
        }
        Ok(())
    }

    /// Newest retained version carrying `key = value`.
    pub fn find_by_tag(&self, key: &str, value: &str) -> Result<Option<u64>> {
        for version in self.list_versions()?.into_iter().rev() {
            let manifest = self.load_version(version)?;
            if manifest.tags.get(key).map(String::as_str) == Some(value) {
                return Ok(Some(version));
            }
        }
        Ok(None)
    }

    pub fn diff(&self, from: u64, to: u64) -> Result<ManifestDiff> {
        let a = self.load_version(from)?;
        let b = self.load_version(to)?;
        let files_a = a.referenced_files();
        let files_b = b.referenced_files();

        let changed_shards = (0..a.shard_count.max(b.shard_count))
            .filter(|&s| a.shards.get(s as usize) != b.shards.get(s as usize))
            .collect();

        Ok(ManifestDiff {
            from,
            to,
            added_files: files_b.difference(&files_a).cloned().collect(),
            removed_files: files_a.difference(&files_b).cloned().collect(),
            changed_shards,
            added_node_kinds: b.node_kinds.difference(&a.node_kinds).cloned().collect(),
            added_edge_kinds: b.edge_kinds.difference(&a.edge_kinds).cloned().collect(),
        })
    }

    /// Check that every file the current version references exists with the
    /// recorded size and checksum.
    pub fn verify(&self) -> Result<()> {
        let Some(ref root) = self.root else {
            return Ok(());
        };
        let manifest = self.current();

        for shard in &manifest.shards {
            for seg in shard.segments() {
                let path = root.join(&seg.file);
                if !path.exists() {
                    return Err(GraphError::ManifestInconsistency(format!(
                        "segment {} referenced by version {} is missing",
                        seg.file, manifest.version
                    )));
                }
                let (len, crc) = read_footer_crc(&path).map_err(|e| {
                    GraphError::ManifestInconsistency(format!("segment {} unreadable: {}", seg.file, e))
                })?;
                if len != seg.byte_size || crc != seg.crc32 {
                    return Err(GraphError::ManifestInconsistency(format!(
                        "segment {} does not match its descriptor (size {} vs {}, crc {:08x} vs {:08x})",
                        seg.file, len, seg.byte_size, crc, seg.crc32
                    )));
                }
            }
            if let Some(ref t) = shard.tombstones {
                verify_header_crc(root, &t.file, t.byte_size, t.crc32)?;
            }
        }
        if let Some(ref g) = manifest.global_index {
            verify_header_crc(root, &g.file, g.byte_size, g.crc32)?;
        }
        Ok(())
    }

    /// Versions that must survive GC: newest `retention`, tagged, `protected`.
    fn kept_versions(&self, retention: usize, protected: &BTreeSet<u64>) -> Result<BTreeSet<u64>> {
        let versions = self.list_versions()?;
        let current = self.current().version;
        let mut keep: BTreeSet<u64> = versions.iter().rev().take(retention.max(1)).copied().collect();
        keep.insert(current);
        keep.extend(protected.iter().copied());
        for &v in &versions {
            if !keep.contains(&v) && !self.load_version(v)?.tags.is_empty() {
                keep.insert(v);
            }
        }
        Ok(keep)
    }

    /// Data files on disk that no kept version references.
    pub fn find_orphans(&self, retention: usize, protected: &BTreeSet<u64>) -> Result<Vec<String>> {
        let Some(ref root) = self.root else {
            return Ok(Vec::new());
        };
        let mut referenced = BTreeSet::new();
        for v in self.kept_versions(retention, protected)? {
            referenced.extend(self.load_version(v)?.referenced_files());
        }

        let mut orphans = Vec::new();
        for rel in list_data_files(root)? {
            if !referenced.contains(&rel) {
                orphans.push(rel);
            }
        }
        Ok(orphans)
    }

    /// Drop manifest versions outside the retention window and every data
    /// file no remaining version references.
    pub fn collect_garbage(&self, retention: usize, protected: &BTreeSet<u64>) -> Result<GcReport> {
        let keep = self.kept_versions(retention, protected)?;
        let mut report = GcReport::default();

        let Some(ref root) = self.root else {
            let mut history = self.history.lock();
            let before = history.len();
            history.retain(|v, _| keep.contains(v));
            report.manifests_removed = before - history.len();
            return Ok(report);
        };

        let orphans = self.find_orphans(retention, protected)?;
        for v in self.list_versions()? {
            if !keep.contains(&v) {
                fs::remove_file(root.join(MANIFESTS_DIR).join(manifest_file_name(v)))?;
                report.manifests_removed += 1;
            }
        }
        for rel in orphans {
            let path = root.join(&rel);
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            match fs::remove_file(&path) {
                Ok(()) => {
                    report.files_removed += 1;
                    report.bytes_freed += size;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if report.files_removed > 0 || report.manifests_removed > 0 {
            info!(
                manifests = report.manifests_removed,
                files = report.files_removed,
                bytes = report.bytes_freed,
                "garbage collected"
            );
        }
        Ok(report)
    }
}

// ============================================================
// File helpers
// ============================================================

fn sync_dir(dir: &Path) -> Result<()> {
    // Directory fsync is not supported everywhere; a failure here is not fatal.
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!(?dir, error = %e, "directory fsync failed");
    }
    Ok(())
}

fn write_atomic(dir: &Path, name: &str, bytes: &[u8]) -> Result<()> {
    let tmp = dir.join(format!("{}.tmp", name));
    crate::storage::writer::write_file_synced(&tmp, bytes)?;
    fs::rename(&tmp, dir.join(name))?;
    sync_dir(dir)
}

fn write_manifest_file(root: &Path, manifest: &Manifest) -> Result<()> {
    let envelope = ManifestFile {
        crc32: manifest.payload_crc()?,
        manifest: manifest.clone(),
    };
    let bytes = serde_json::to_vec_pretty(&envelope)?;
    write_atomic(&root.join(MANIFESTS_DIR), &manifest_file_name(manifest.version), &bytes)
}

/// Write the version file, then repoint `CURRENT`.
fn persist(root: &Path, manifest: &Manifest) -> Result<()> {
    write_manifest_file(root, manifest)?;
    write_atomic(root, CURRENT_FILE, manifest_file_name(manifest.version).as_bytes())
}

fn load_file(path: &Path) -> Result<Manifest> {
    let mut bytes = Vec::new();
    File::open(path)
        .map_err(|e| GraphError::ManifestInconsistency(format!("{:?}: {}", path, e)))?
        .read_to_end(&mut bytes)?;
    let envelope: ManifestFile = serde_json::from_slice(&bytes)
        .map_err(|e| GraphError::ManifestInconsistency(format!("{:?} unparsable: {}", path, e)))?;
    if envelope.manifest.payload_crc()? != envelope.crc32 {
        return Err(GraphError::ManifestInconsistency(format!("{:?} checksum mismatch", path)));
    }
    Ok(envelope.manifest)
}

fn verify_header_crc(root: &Path, rel: &str, byte_size: u64, crc32: u32) -> Result<()> {
    let path = root.join(rel);
    let mut header = [0u8; 8];
    let len = File::open(&path)
        .and_then(|mut f| {
            let len = f.metadata()?.len();
            f.read_exact(&mut header)?;
            Ok(len)
        })
        .map_err(|e| GraphError::ManifestInconsistency(format!("{} missing or unreadable: {}", rel, e)))?;
    let stored = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len != byte_size || stored != crc32 {
        return Err(GraphError::ManifestInconsistency(format!(
            "{} does not match its descriptor",
            rel
        )));
    }
    Ok(())
}

/// Relative paths of every segment, tombstone, index and temp file.
fn list_data_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let shards = root.join(SHARDS_DIR);
    if shards.exists() {
        for shard in fs::read_dir(&shards)? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            let shard_name = shard.file_name().to_string_lossy().to_string();
            for file in fs::read_dir(shard.path())? {
                let name = file?.file_name().to_string_lossy().to_string();
                files.push(format!("{}/{}/{}", SHARDS_DIR, shard_name, name));
            }
        }
    }
    let index = root.join(INDEX_DIR);
    if index.exists() {
        for file in fs::read_dir(&index)? {
            let name = file?.file_name().to_string_lossy().to_string();
            files.push(format!("{}/{}", INDEX_DIR, name));
        }
    }
    let manifests = root.join(MANIFESTS_DIR);
    if manifests.exists() {
        for file in fs::read_dir(&manifests)? {
            let name = file?.file_name().to_string_lossy().to_string();
            if name.ends_with(".tmp") {
                files.push(format!("{}/{}", MANIFESTS_DIR, name));
            }
        }
    }
    Ok(files)
}
