//! Inverted index for compacted segments: (field, value) -> sorted row ids

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::is_wildcard;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvertedIndex {
    fields: BTreeMap<String, BTreeMap<String, Vec<u32>>>,
}

impl InvertedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows must be added in ascending order per value.
    pub fn add(&mut self, field: &str, value: &str, row: u32) {
        let postings = self
            .fields
            .entry(field.to_string())
            .or_default()
            .entry(value.to_string())
            .or_default();
        if postings.last() != Some(&row) {
            postings.push(row);
        }
    }

    pub fn lookup(&self, field: &str, value: &str) -> &[u32] {
        self.fields
            .get(field)
            .and_then(|values| values.get(value))
            .map_or(&[], |rows| rows.as_slice())
    }

    /// Exact lookup, or a prefix range scan for `ns:*` / `*` patterns.
    /// Result is sorted and deduplicated.
    pub fn lookup_pattern(&self, field: &str, pattern: &str) -> Vec<u32> {
        if !is_wildcard(pattern) {
            return self.lookup(field, pattern).to_vec();
        }
        let Some(values) = self.fields.get(field) else {
            return Vec::new();
        };
        let prefix = pattern.trim_end_matches('*');
        let mut rows: Vec<u32> = values
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(value, _)| value.starts_with(prefix))
            .flat_map(|(_, rows)| rows.iter().copied())
            .collect();
        rows.sort_unstable();
        rows.dedup();
        rows
    }

    pub fn field_len(&self, field: &str) -> usize {
        self.fields.get(field).map_or(0, |v| v.len())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Intersect two sorted row lists.
pub fn intersect_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let (mut i, mut j) = (0, 0);
    let mut out = Vec::with_capacity(a.len().min(b.len()));
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}
