//! Tombstones: logical deletes that hide keys in older segments
//!
//! Every tombstone carries an `as_of` sequence. It hides the key in each
//! segment whose `seq < as_of`; segments written later are unaffected, which
//! is what lets a re-added key come back without clearing anything.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::storage::EdgeKey;

/// `as_of` used for deletes that have not been flushed yet: hides every segment.
pub const PENDING_AS_OF: u64 = u64::MAX;

const TOMB_MAGIC: [u8; 4] = *b"CGST";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TombstoneSet {
    nodes: HashMap<u128, u64>,
    // (src, dst) -> [(kind, as_of)], so lookups need no String allocation
    edges: HashMap<(u128, u128), Vec<(String, u64)>>,
    edge_count: usize,
}

/// On-disk form: sorted, so identical sets produce identical files.
#[derive(Serialize, Deserialize)]
struct TombstoneFile {
    nodes: Vec<(u128, u64)>,
    edges: Vec<(u128, u128, String, u64)>,
}

impl TombstoneSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: u128, as_of: u64) {
        let slot = self.nodes.entry(id).or_insert(as_of);
        *slot = (*slot).max(as_of);
    }

    pub fn add_edge(&mut self, key: EdgeKey, as_of: u64) {
        let (src, dst, kind) = key;
        let kinds = self.edges.entry((src, dst)).or_default();
        match kinds.iter_mut().find(|(k, _)| *k == kind) {
            Some((_, slot)) => *slot = (*slot).max(as_of),
            None => {
                kinds.push((kind, as_of));
                self.edge_count += 1;
            }
        }
    }

    pub fn node_as_of(&self, id: u128) -> Option<u64> {
        self.nodes.get(&id).copied()
    }

    pub fn edge_as_of(&self, src: u128, dst: u128, kind: &str) -> Option<u64> {
        self.edges
            .get(&(src, dst))?
            .iter()
            .find(|(k, _)| k == kind)
            .map(|(_, as_of)| *as_of)
    }

    /// Is node `id` dead in a segment with sequence `seg_seq`?
    #[inline]
    pub fn hides_node(&self, id: u128, seg_seq: u64) -> bool {
        self.node_as_of(id).map_or(false, |as_of| as_of > seg_seq)
    }

    #[inline]
    pub fn hides_edge(&self, src: u128, dst: u128, kind: &str, seg_seq: u64) -> bool {
        self.edge_as_of(src, dst, kind)
            .map_or(false, |as_of| as_of > seg_seq)
    }

    pub fn contains_node(&self, id: u128) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn contains_edge(&self, src: u128, dst: u128, kind: &str) -> bool {
        self.edge_as_of(src, dst, kind).is_some()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    pub fn len(&self) -> usize {
        self.nodes.len() + self.edge_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_ids(&self) -> impl Iterator<Item = u128> + '_ {
        self.nodes.keys().copied()
    }

    pub fn edge_keys(&self) -> impl Iterator<Item = EdgeKey> + '_ {
        self.edges
            .iter()
            .flat_map(|(&(src, dst), kinds)| kinds.iter().map(move |(k, _)| (src, dst, k.clone())))
    }

    /// Give every entry the same `as_of` (pending deletes at flush time).
    pub fn stamp(&mut self, as_of: u64) {
        for v in self.nodes.values_mut() {
            *v = as_of;
        }
        for kinds in self.edges.values_mut() {
            for (_, v) in kinds.iter_mut() {
                *v = as_of;
            }
        }
    }

    /// Union, keeping the larger `as_of` per key.
    pub fn merge(&mut self, other: &TombstoneSet) {
        for (&id, &as_of) in &other.nodes {
            self.add_node(id, as_of);
        }
        for (&(src, dst), kinds) in &other.edges {
            for (kind, as_of) in kinds {
                self.add_edge((src, dst, kind.clone()), *as_of);
            }
        }
    }

    /// Drop the tombstones a compaction folded in. `folded` is the set the
    /// compaction read; an entry re-deleted since then (larger `as_of`) stays.
    /// Returns how many entries were removed.
    pub fn drop_folded(&mut self, folded: &TombstoneSet) -> usize {
        let before = self.len();
        self.nodes
            .retain(|id, as_of| folded.nodes.get(id).map_or(true, |f| *as_of > *f));
        let mut edge_count = 0;
        self.edges.retain(|pair, kinds| {
            let old = folded.edges.get(pair);
            kinds.retain(|(kind, as_of)| {
                old.and_then(|o| o.iter().find(|(k, _)| k == kind))
                    .map_or(true, |(_, f)| *as_of > *f)
            });
            edge_count += kinds.len();
            !kinds.is_empty()
        });
        self.edge_count = edge_count;
        before - self.len()
    }

    /// Serialize: `magic | crc32(payload) | bincode payload`
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut nodes: Vec<(u128, u64)> = self.nodes.iter().map(|(&k, &v)| (k, v)).collect();
        nodes.sort_unstable();
        let mut edges: Vec<(u128, u128, String, u64)> = self
            .edges
            .iter()
            .flat_map(|(&(s, d), kinds)| kinds.iter().map(move |(k, a)| (s, d, k.clone(), *a)))
            .collect();
        edges.sort_unstable();

        let payload = bincode::serialize(&TombstoneFile { nodes, edges })?;
        let mut out = Vec::with_capacity(payload.len() + 8);
        out.extend_from_slice(&TOMB_MAGIC);
        out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 || bytes[0..4] != TOMB_MAGIC {
            return Err(GraphError::InvalidFormat("Tombstone file header corrupt".into()));
        }
        let stored = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let payload = &bytes[8..];
        if crc32fast::hash(payload) != stored {
            return Err(GraphError::InvalidFormat("Tombstone file checksum mismatch".into()));
        }
        let file: TombstoneFile = bincode::deserialize(payload)?;
        let mut set = TombstoneSet::new();
        for (id, as_of) in file.nodes {
            set.add_node(id, as_of);
        }
        for (src, dst, kind, as_of) in file.edges {
            set.add_edge((src, dst, kind), as_of);
        }
        Ok(set)
    }
}
