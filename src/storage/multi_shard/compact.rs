//! Store-level compaction: pick shards, merge them in parallel, publish

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use parking_lot::MutexGuard;
use rayon::prelude::*;
use tracing::{error, info};

use super::MultiShardStore;
use crate::error::{GraphError, Result};
use crate::index::GlobalIndex;
use crate::storage::compaction::{compact_shard, should_compact, CompactionResult, ShardCompaction};
use crate::storage::manifest::CompactionInfo;
use crate::storage::shard::ShardView;
use crate::storage::writer::retry_io;

impl MultiShardStore {
    /// Compact every shard the policy selects.
    pub fn compact(&self) -> Result<CompactionResult> {
        self.compact_with(false)
    }

    /// Compact every shard that has segments, regardless of policy.
    pub fn force_compact(&self) -> Result<CompactionResult> {
        self.compact_with(true)
    }

    fn compact_with(&self, force: bool) -> Result<CompactionResult> {
        self.check_poisoned()?;
        let start = Instant::now();
        let mut result = CompactionResult::default();

        let snap = self.snapshot();
        let mut locks: Vec<(u16, MutexGuard<'_, ()>)> = Vec::new();
        for view in snap.shards.iter() {
            let shard = view.shard();
            if self.shards[shard as usize].read().failed.is_some() {
                continue;
            }
            let wanted = if force {
                !view.node_segments().is_empty() || !view.edge_segments().is_empty()
            } else {
                should_compact(view, &self.config.compaction)
            };
            if !wanted {
                continue;
            }
            // шард уже компактится в другом потоке
            if let Some(guard) = self.compaction_locks[shard as usize].try_lock() {
                locks.push((shard, guard));
            }
        }
        if locks.is_empty() {
            return Ok(result);
        }

        let files = self.file_writes.read();
        // под блокировками шардов-кандидатов берём свежий снимок
        let snap = self.snapshot();
        let shards: Vec<u16> = locks.iter().map(|(s, _)| *s).collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.compaction.threads.max(1))
            .thread_name(|i| format!("cgstore-compact-{}", i))
            .build()
            .map_err(|e| GraphError::Compaction(e.to_string()))?;

        let alloc = || self.manifests.allocate_seq();
        let outcomes: Vec<(u16, Result<Option<ShardCompaction>>)> = pool.install(|| {
            shards
                .par_iter()
                .map(|&shard| {
                    let view: &ShardView = &snap.shards[shard as usize];
                    let out = retry_io(
                        self.config.io_retry_attempts,
                        self.config.io_retry_backoff_ms,
                        "compaction",
                        || compact_shard(view, &self.config.compaction, &self.sink, &alloc),
                    );
                    (shard, out)
                })
                .collect()
        });

        let mut done = Vec::new();
        for (shard, outcome) in outcomes {
            match outcome {
                Ok(Some(c)) => done.push(c),
                Ok(None) => {}
                Err(e) => {
                    error!(shard, error = %e, "compaction failed, shard marked failed");
                    self.shards[shard as usize].write().failed = Some(e.to_string());
                    result.shards_failed.push(shard);
                }
            }
        }
        if done.is_empty() {
            result.duration_ms = start.elapsed().as_millis() as u64;
            return Ok(result);
        }

        let commit = self.commit_lock.lock();
        let current = self.snapshot();
        let mut next = self.manifests.current().next_version();
        let mut views = current.shards.clone();
        let mut index: Option<GlobalIndex> = None;

        for c in &done {
            let idx = c.shard as usize;
            let merged: HashSet<u64> = c.merged_ids().collect();
            let desc = &mut next.shards[idx];
            desc.l0_nodes.retain(|d| !merged.contains(&d.id));
            desc.l0_edges.retain(|d| !merged.contains(&d.id));
            desc.l1_nodes.retain(|d| !merged.contains(&d.id));
            desc.l1_edges.retain(|d| !merged.contains(&d.id));
            desc.l1_nodes.extend(c.nodes.iter().map(|(d, _)| d.clone()));
            desc.l1_edges.extend(c.edges.iter().map(|(d, _)| d.clone()));

            let view = &views[idx];
            let mut nodes: Vec<_> = view
                .node_segments()
                .iter()
                .filter(|s| !merged.contains(&s.id))
                .cloned()
                .collect();
            nodes.extend(c.nodes.iter().map(|(_, s)| s.clone()));
            let mut edges: Vec<_> = view
                .edge_segments()
                .iter()
                .filter(|s| !merged.contains(&s.id))
                .cloned()
                .collect();
            edges.extend(c.edges.iter().map(|(_, s)| s.clone()));

            // всё, что компакция прочитала, уже применено к её выходу
            let mut tombstones = (**view.tombstones()).clone();
            let removed = tombstones.drop_folded(snap.shards[idx].tombstones());
            let tombstones = if removed > 0 {
                desc.tombstones = self
                    .sink
                    .write_tombstones(c.shard, self.manifests.allocate_seq(), &tombstones)?;
                Arc::new(tombstones)
            } else {
                view.tombstones().clone()
            };
            next.pending_compaction.remove(&c.shard);

            let base = index.as_ref().unwrap_or(&current.global_index);
            index = Some(base.replace_shard(c.shard, c.index_entries.clone()));
            views[idx] = Arc::new(ShardView::new(c.shard, nodes, edges, tombstones));

            result.shards_compacted.push(c.shard);
            result.l0_segments_merged += c.l0_segments_merged;
            result.nodes_merged += c.nodes_merged;
            result.edges_merged += c.edges_merged;
            result.tombstones_removed += removed as u64;
        }

        let index = match index {
            Some(index) => index,
            None => return Ok(result),
        };
        next.global_index = Some(self.sink.write_global_index(next.version, &index)?);
        next.global_index_version = next.version;
        next.last_compaction = Some(CompactionInfo {
            manifest_version: next.version,
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            shards: result.shards_compacted.clone(),
            l0_segments_merged: result.l0_segments_merged,
            tombstones_removed: result.tombstones_removed,
        });

        let committed = self.commit_manifest(next)?;
        result.manifest_version = Some(committed.version);
        self.publish(committed, views, Arc::new(index));
        drop(commit);
        drop(files);
        drop(locks);

        result.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            version = ?result.manifest_version,
            shards = ?result.shards_compacted,
            l0_merged = result.l0_segments_merged,
            tombstones_removed = result.tombstones_removed,
            ms = result.duration_ms,
            "compaction committed"
        );
        Ok(result)
    }
}
