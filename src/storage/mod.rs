//! Columnar LSM storage: records, write buffers, segments, shards, manifest

pub mod bloom;
pub mod compaction;
pub mod maintenance;
pub mod manifest;
pub mod multi_shard;
pub mod resource;
pub mod segment;
pub mod shard;
pub mod shard_planner;
pub mod string_table;
pub mod tombstone;
pub mod write_buffer;
pub mod writer;
pub mod zone_map;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use manifest::{Manifest, ManifestStore};
pub use multi_shard::MultiShardStore;
pub use tombstone::TombstoneSet;
pub use write_buffer::WriteBuffer;

/// Base node kinds. Namespaced kinds (`http:route`, `db:query`) are
/// registered on first write.
pub const BASE_NODE_KINDS: &[&str] = &[
    "UNKNOWN", "PROJECT", "SERVICE", "FILE", "MODULE", "FUNCTION", "CLASS", "METHOD",
    "VARIABLE", "PARAMETER", "CONSTANT", "SCOPE", "CALL", "IMPORT", "EXPORT", "EXTERNAL",
    "SIDE_EFFECT",
];

/// Base edge kinds.
pub const BASE_EDGE_KINDS: &[&str] = &[
    "CONTAINS", "CALLS", "IMPORTS", "IMPORTS_FROM", "EXPORTS", "DEFINES", "USES",
    "ASSIGNED_FROM", "READS_FROM", "WRITES_TO", "PASSES_ARGUMENT", "RETURNS", "EXTENDS",
    "IMPLEMENTS", "DEPENDS_ON", "FLOWS_INTO",
];

/// Prefix of unit keys that hold enrichment output for a source file.
pub const ENRICHMENT_PREFIX: &str = "__enrichment__/";

/// Unit key for the data an enricher derived from `source_file`.
///
/// Re-analyzing this key replaces exactly that enricher's output for the file.
///
/// # Examples
/// ```
/// use cgstore::storage::enrichment_unit_key;
///
/// assert_eq!(
///     enrichment_unit_key("data-flow", "src/utils.js"),
///     "__enrichment__/data-flow/src/utils.js"
/// );
/// ```
pub fn enrichment_unit_key(enricher: &str, source_file: &str) -> String {
    format!("{}{}/{}", ENRICHMENT_PREFIX, enricher, source_file)
}

/// Node record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Deterministic ID (BLAKE3 of the semantic key)
    pub id: u128,

    /// Node kind (e.g., "FUNCTION", "CLASS", "http:route")
    pub kind: String,

    /// Entity name (function name, class name, etc.)
    pub name: String,

    /// Source file path
    pub file: String,

    /// JSON metadata (async, line, column, ...). Replaced wholesale on update.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,

    /// Unit key that produced this record. Empty means "the batch's shard key".
    #[serde(default)]
    pub owner: String,
}

impl NodeRecord {
    pub fn new(id: u128, kind: impl Into<String>, name: impl Into<String>, file: impl Into<String>) -> Self {
        let file = file.into();
        Self {
            id,
            kind: kind.into(),
            name: name.into(),
            owner: file.clone(),
            file,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Approximate heap footprint, used for write buffer accounting.
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.kind.len()
            + self.name.len()
            + self.file.len()
            + self.owner.len()
            + self.metadata.as_ref().map_or(0, |m| m.len())
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if self.id == 0 {
            return Err("node id is missing (0)".into());
        }
        if self.kind.is_empty() {
            return Err(format!("node {} has no kind", self.id));
        }
        Ok(())
    }
}

/// Edge dedup key: (src, dst, kind)
pub type EdgeKey = (u128, u128, String);

/// Edge record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeRecord {
    /// Source node ID
    pub src: u128,

    /// Target node ID
    pub dst: u128,

    /// Edge kind (e.g., "CALLS", "CONTAINS", "http:routes_to")
    pub kind: String,

    /// JSON metadata (argIndex, isSpread, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,

    /// Unit key (source file or enrichment key) that produced this edge
    #[serde(default)]
    pub owner: String,
}

impl EdgeRecord {
    pub fn new(src: u128, dst: u128, kind: impl Into<String>) -> Self {
        Self {
            src,
            dst,
            kind: kind.into(),
            metadata: None,
            owner: String::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn key(&self) -> EdgeKey {
        (self.src, self.dst, self.kind.clone())
    }

    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.kind.len() * 2 // second copy lives in the dedup key
            + self.owner.len()
            + self.metadata.as_ref().map_or(0, |m| m.len())
    }

    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if self.src == 0 || self.dst == 0 {
            return Err(format!("edge endpoint missing: {} -> {}", self.src, self.dst));
        }
        if self.kind.is_empty() {
            return Err(format!("edge {} -> {} has no kind", self.src, self.dst));
        }
        Ok(())
    }
}

/// Result of a single upsert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// A record refused at the write buffer boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedRecord {
    /// Position in the submitted batch
    pub index: usize,
    /// Identity if the record carried one
    pub id: Option<u128>,
    pub reason: String,
}

/// Aggregate outcome of a batch upsert
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
    pub rejected: Vec<RejectedRecord>,
}

impl UpsertStats {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
        }
    }

    pub fn merge(&mut self, other: UpsertStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.rejected.extend(other.rejected);
    }
}

/// Edge direction for neighbor queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Query for filtering nodes by attributes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttrQuery {
    /// Node kind. Supports wildcard: "http:*" for all http kinds
    pub kind: Option<String>,
    pub name: Option<String>,
    pub file: Option<String>,
    /// Unit key that produced the record
    pub owner: Option<String>,
    /// `(key, value)` pairs matched against the metadata JSON, all must hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata_filters: Vec<(String, String)>,
}

impl AttrQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kind(mut self, k: impl Into<String>) -> Self {
        self.kind = Some(k.into());
        self
    }

    pub fn name(mut self, n: impl Into<String>) -> Self {
        self.name = Some(n.into());
        self
    }

    pub fn file(mut self, f: impl Into<String>) -> Self {
        self.file = Some(f.into());
        self
    }

    pub fn owner(mut self, o: impl Into<String>) -> Self {
        self.owner = Some(o.into());
        self
    }

    /// Require metadata field `key` to equal `value`. Strings compare by
    /// content, numbers and booleans by their JSON text (`"42"`, `"true"`).
    pub fn metadata_filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata_filters.push((key.into(), value.into()));
        self
    }

    /// No kind and no name bound: every shard and segment has to be read.
    /// A bare `"*"` kind binds nothing.
    pub fn is_unbounded(&self) -> bool {
        self.kind.as_deref().map_or(true, |k| k == "*") && self.name.is_none()
    }

    pub fn matches(&self, node: &NodeRecord) -> bool {
        if let Some(ref k) = self.kind {
            if !kind_matches(k, &node.kind) {
                return false;
            }
        }
        if let Some(ref n) = self.name {
            if n != &node.name {
                return false;
            }
        }
        if let Some(ref f) = self.file {
            if f != &node.file {
                return false;
            }
        }
        if let Some(ref o) = self.owner {
            if o != &node.owner {
                return false;
            }
        }
        metadata_matches(node.metadata.as_deref(), &self.metadata_filters)
    }
}

/// Check a metadata payload against `(key, value)` filters. Missing or
/// unparsable metadata matches only an empty filter list.
pub fn metadata_matches(metadata: Option<&str>, filters: &[(String, String)]) -> bool {
    if filters.is_empty() {
        return true;
    }
    let Some(raw) = metadata else {
        return false;
    };
    let parsed: serde_json::Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return false,
    };
    filters.iter().all(|(key, value)| match parsed.get(key) {
        Some(serde_json::Value::String(s)) => s == value,
        Some(other) => other.to_string() == *value,
        None => false,
    })
}

/// Match a kind against a filter pattern. `"*"` matches everything,
/// `"ns:*"` matches every kind in the namespace.
pub fn kind_matches(pattern: &str, kind: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) if prefix.ends_with(':') => kind.starts_with(prefix),
        _ => pattern == kind,
    }
}

pub(crate) fn is_wildcard(pattern: &str) -> bool {
    pattern == "*" || pattern.ends_with(":*")
}

/// Cooperative cancellation flag, checked between segments.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
