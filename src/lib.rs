//! cgstore - persistent sharded LSM graph store for code graphs
//!
//! # Architecture
//!
//! - **Shards**: records route by the directory of their source file
//! - **Write buffers**: per-shard upsert buffers, flushed to immutable L0 segments
//! - **Columnar segments**: memmap2, string table, bloom filter, zone map
//! - **Tombstones**: deletes hide keys in older segments until compaction folds them
//! - **Manifest**: atomic version swap, readers pin one version for a whole query
//! - **Compaction**: L0 -> sorted L1 with an inverted index, in parallel per shard
//! - **Deterministic IDs**: BLAKE3(kind|name|scope|path)
//!
//! # Usage example
//!
//! ```no_run
//! use cgstore::{AttrQuery, Direction, EdgeRecord, GraphEngine, GraphStore, NodeRecord, StoreConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = GraphEngine::create("./graph.cgs", StoreConfig::default())?;
//!
//! engine.upsert_batch("src/main.js", vec![
//!     NodeRecord::new(1, "FUNCTION", "main", "src/main.js"),
//!     NodeRecord::new(2, "FUNCTION", "helper", "src/main.js"),
//! ])?;
//! engine.upsert_edges("src/main.js", vec![EdgeRecord::new(1, 2, "CALLS")])?;
//! engine.flush()?;
//!
//! let functions = engine.find_nodes(&AttrQuery::new().kind("FUNCTION"))?;
//! let callees = engine.neighbors(1, Direction::Outgoing, Some(&["CALLS"][..]))?;
//! println!("{} functions, {} callees", functions.len(), callees.len());
//!
//! // BFS обход
//! let reachable = engine.bfs(&[1], 10, None)?;
//! println!("Reached {} nodes", reachable.len());
//! # Ok(())
//! # }
//! ```

#[macro_use]
pub mod logging;

pub mod config;
pub mod error;
pub mod graph;
pub mod index;
pub mod storage;

pub use config::StoreConfig;
pub use error::{GraphError, Result};
pub use graph::{GraphEngine, GraphStore};
pub use storage::compaction::{CompactionConfig, CompactionResult};
pub use storage::multi_shard::{BatchDelta, Delta, FlushReport, NodeIter, Snapshot, UnitRecords};
pub use storage::shard::Explain;
pub use storage::{
    enrichment_unit_key, AttrQuery, CancelToken, Direction, EdgeKey, EdgeRecord, NodeRecord, RejectedRecord,
    UpsertOutcome, UpsertStats,
};

// Re-export основных типов
pub use graph::{compute_edge_key, compute_node_id, string_id_to_u128};
