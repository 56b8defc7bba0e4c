//! Deterministic shard assignment
//!
//! Maps a shard key (a source file path or an enrichment unit key) to a
//! shard id by hashing its parent directory with BLAKE3, so files of one
//! directory share a shard. Directories that grow too large are *split*:
//! their files are then routed by the hash of the full path instead. The
//! split set is persisted in the manifest so routing survives restarts.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use crate::error::{GraphError, Result};

pub struct ShardPlanner {
    shard_count: u16,
    flat_dir_file_limit: usize,
    split_dirs: BTreeSet<String>,
    // directory -> distinct shard keys seen in it
    dir_files: HashMap<String, HashSet<String>>,
}

/// Parent directory of a key; `""` for keys without one.
pub fn directory_of(key: &str) -> &str {
    Path::new(key)
        .parent()
        .and_then(|p| p.to_str())
        .unwrap_or("")
}

fn hash_to_shard(bytes: &[u8], shard_count: u16) -> u16 {
    let hash = blake3::hash(bytes);
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[0..8]);
    (u64::from_le_bytes(head) % shard_count as u64) as u16
}

impl ShardPlanner {
    pub fn new(shard_count: u16, flat_dir_file_limit: usize) -> Self {
        Self {
            shard_count: shard_count.max(1),
            flat_dir_file_limit,
            split_dirs: BTreeSet::new(),
            dir_files: HashMap::new(),
        }
    }

    pub fn with_split_dirs(mut self, dirs: impl IntoIterator<Item = String>) -> Self {
        self.split_dirs.extend(dirs);
        self
    }

    pub fn shard_count(&self) -> u16 {
        self.shard_count
    }

    /// Validate a caller-supplied key and route it.
    pub fn resolve(&self, shard_key: &str) -> Result<u16> {
        if shard_key.trim().is_empty() || shard_key.contains('\0') {
            return Err(GraphError::UnresolvableShardKey(shard_key.to_string()));
        }
        Ok(self.compute_shard_id(shard_key))
    }

    /// Directory hash, or full-path hash for keys in split directories.
    pub fn compute_shard_id(&self, key: &str) -> u16 {
        let dir = directory_of(key);
        if self.split_dirs.contains(dir) {
            hash_to_shard(key.as_bytes(), self.shard_count)
        } else {
            hash_to_shard(dir.as_bytes(), self.shard_count)
        }
    }

    /// Shard a key would land in if its directory were split.
    pub fn split_route(&self, key: &str) -> u16 {
        hash_to_shard(key.as_bytes(), self.shard_count)
    }

    /// Record that `key` holds data. Returns the directory when this key
    /// pushed an unsplit directory over the flat-directory limit.
    pub fn observe(&mut self, key: &str) -> Option<String> {
        let dir = directory_of(key);
        let files = self.dir_files.entry(dir.to_string()).or_default();
        if !files.insert(key.to_string()) {
            return None;
        }
        (files.len() > self.flat_dir_file_limit && !self.split_dirs.contains(dir))
            .then(|| dir.to_string())
    }

    /// Mark a directory split. Returns false if it already was.
    pub fn split_dir(&mut self, dir: &str) -> bool {
        self.split_dirs.insert(dir.to_string())
    }

    pub fn is_split(&self, dir: &str) -> bool {
        self.split_dirs.contains(dir)
    }

    pub fn split_dirs(&self) -> &BTreeSet<String> {
        &self.split_dirs
    }

    /// Keys seen in a directory.
    pub fn keys_in_dir(&self, dir: &str) -> Vec<String> {
        self.dir_files
            .get(dir)
            .map(|f| f.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Largest unsplit directory routed to `shard`, by file count.
    /// A directory with a single file gains nothing from splitting.
    pub fn largest_unsplit_dir(&self, shard: u16) -> Option<(String, usize)> {
        self.dir_files
            .iter()
            .filter(|(dir, files)| {
                files.len() > 1
                    && !self.split_dirs.contains(dir.as_str())
                    && hash_to_shard(dir.as_bytes(), self.shard_count) == shard
            })
            .map(|(dir, files)| (dir.clone(), files.len()))
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
    }

    /// Plan shard assignment for a batch of keys: shard -> keys.
    pub fn plan(&self, keys: &[&str]) -> HashMap<u16, Vec<String>> {
        let mut result: HashMap<u16, Vec<String>> = HashMap::new();
        for key in keys {
            result
                .entry(self.compute_shard_id(key))
                .or_default()
                .push(key.to_string());
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_shard_id_deterministic() {
        let planner = ShardPlanner::new(8, 100);
        let id1 = planner.compute_shard_id("src/utils/helper.js");
        let id2 = planner.compute_shard_id("src/utils/helper.js");
        assert_eq!(id1, id2);
        assert!(id1 < 8);
    }

    #[test]
    fn test_same_directory_same_shard() {
        let planner = ShardPlanner::new(16, 100);
        let a = planner.compute_shard_id("src/utils/a.js");
        let b = planner.compute_shard_id("src/utils/b.js");
        let c = planner.compute_shard_id("src/utils/c.ts");
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn test_different_directories_spread() {
        let planner = ShardPlanner::new(64, 100);
        let shards: HashSet<u16> = ["src/a.js", "lib/b.js", "test/c.js", "vendor/d.js", "build/e.js"]
            .iter()
            .map(|f| planner.compute_shard_id(f))
            .collect();
        assert!(shards.len() >= 2, "got {:?}", shards);
    }

    #[test]
    fn test_single_shard_routes_everything_to_zero() {
        let planner = ShardPlanner::new(1, 100);
        assert_eq!(planner.compute_shard_id("a/b/c.js"), 0);
        assert_eq!(planner.compute_shard_id("file.js"), 0);
    }

    #[test]
    fn test_resolve_rejects_empty_key() {
        let planner = ShardPlanner::new(4, 100);
        assert!(matches!(planner.resolve(""), Err(GraphError::UnresolvableShardKey(_))));
        assert!(matches!(planner.resolve("  "), Err(GraphError::UnresolvableShardKey(_))));
        assert!(planner.resolve("src/a.js").is_ok());
    }

    #[test]
    fn test_flat_directory_triggers_split() {
        let mut planner = ShardPlanner::new(32, 3);
        assert_eq!(planner.observe("gen/a.js"), None);
        assert_eq!(planner.observe("gen/b.js"), None);
        assert_eq!(planner.observe("gen/b.js"), None);
        assert_eq!(planner.observe("gen/c.js"), None);
        assert_eq!(planner.observe("gen/d.js"), Some("gen".to_string()));

        assert!(planner.split_dir("gen"));
        assert!(!planner.split_dir("gen"));
        assert_eq!(planner.observe("gen/e.js"), None);

        // split directory: full-path routing
        let routed: HashSet<u16> = (0..40)
            .map(|i| planner.compute_shard_id(&format!("gen/f{}.js", i)))
            .collect();
        assert!(routed.len() > 1);
        assert_eq!(planner.compute_shard_id("gen/a.js"), planner.split_route("gen/a.js"));
    }

    #[test]
    fn test_largest_unsplit_dir() {
        let mut planner = ShardPlanner::new(1, 1000);
        for f in ["big/a.js", "big/b.js", "big/c.js", "small/a.js", "small/b.js", "solo/x.js"] {
            planner.observe(f);
        }
        assert_eq!(planner.largest_unsplit_dir(0), Some(("big".to_string(), 3)));
        planner.split_dir("big");
        assert_eq!(planner.largest_unsplit_dir(0), Some(("small".to_string(), 2)));
        planner.split_dir("small");
        assert_eq!(planner.largest_unsplit_dir(0), None);
    }

    #[test]
    fn test_plan_groups_files() {
        let planner = ShardPlanner::new(4, 100);
        let plan = planner.plan(&["src/utils/a.js", "src/utils/b.js", "lib/core/c.js"]);
        let group = &plan[&planner.compute_shard_id("src/utils/a.js")];
        assert!(group.contains(&"src/utils/a.js".to_string()));
        assert!(group.contains(&"src/utils/b.js".to_string()));
        let total: usize = plan.values().map(|v| v.len()).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn test_split_dirs_restored() {
        let planner = ShardPlanner::new(8, 100).with_split_dirs(vec!["gen".to_string()]);
        assert!(planner.is_split("gen"));
        assert_eq!(planner.compute_shard_id("gen/a.js"), planner.split_route("gen/a.js"));
    }
}
