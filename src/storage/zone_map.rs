//! Per-segment summary: distinct values of low-cardinality columns
//!
//! Lets scans skip a whole segment (and a whole shard, once unioned) when the
//! filter value cannot occur in it.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::kind_matches;

pub const FIELD_KIND: &str = "kind";
pub const FIELD_FILE: &str = "file";
pub const FIELD_OWNER: &str = "owner";

/// Past this many distinct values a field stops being tracked.
pub const MAX_ZONE_VALUES_PER_FIELD: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldZone {
    Values(BTreeSet<String>),
    /// Too many distinct values; the field cannot be used for skipping.
    Unbounded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneMap {
    fields: BTreeMap<String, FieldZone>,
}

impl ZoneMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, field: &str, value: &str) {
        let zone = self
            .fields
            .entry(field.to_string())
            .or_insert_with(|| FieldZone::Values(BTreeSet::new()));
        if let FieldZone::Values(values) = zone {
            if values.contains(value) {
                return;
            }
            if values.len() >= MAX_ZONE_VALUES_PER_FIELD {
                *zone = FieldZone::Unbounded;
            } else {
                values.insert(value.to_string());
            }
        }
    }

    /// `false` only when the value definitely does not occur.
    pub fn may_contain(&self, field: &str, value: &str) -> bool {
        match self.fields.get(field) {
            None => false,
            Some(FieldZone::Unbounded) => true,
            Some(FieldZone::Values(values)) => values.contains(value),
        }
    }

    /// Like `may_contain` for the kind field, honouring `ns:*` patterns.
    pub fn may_contain_kind(&self, pattern: &str) -> bool {
        match self.fields.get(FIELD_KIND) {
            None => false,
            Some(FieldZone::Unbounded) => true,
            Some(FieldZone::Values(values)) => values.iter().any(|k| kind_matches(pattern, k)),
        }
    }

    pub fn values(&self, field: &str) -> Option<&BTreeSet<String>> {
        match self.fields.get(field)? {
            FieldZone::Values(values) => Some(values),
            FieldZone::Unbounded => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Union of two maps (shard-level summaries).
    pub fn merge(&mut self, other: &ZoneMap) {
        for (field, zone) in &other.fields {
            match zone {
                FieldZone::Unbounded => {
                    self.fields.insert(field.clone(), FieldZone::Unbounded);
                }
                FieldZone::Values(values) => {
                    for v in values {
                        self.add(field, v);
                    }
                }
            }
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains_added_values() {
        let mut zm = ZoneMap::new();
        zm.add(FIELD_KIND, "FUNCTION");
        zm.add(FIELD_KIND, "CLASS");
        zm.add(FIELD_FILE, "src/a.js");

        assert!(zm.may_contain(FIELD_KIND, "FUNCTION"));
        assert!(!zm.may_contain(FIELD_KIND, "METHOD"));
        assert!(zm.may_contain(FIELD_FILE, "src/a.js"));
        assert!(!zm.may_contain(FIELD_OWNER, "src/a.js"));
    }

    #[test]
    fn test_wildcard_kind() {
        let mut zm = ZoneMap::new();
        zm.add(FIELD_KIND, "http:route");
        assert!(zm.may_contain_kind("http:*"));
        assert!(!zm.may_contain_kind("db:*"));
    }

    #[test]
    fn test_overflow_becomes_unbounded() {
        let mut zm = ZoneMap::new();
        for i in 0..=MAX_ZONE_VALUES_PER_FIELD {
            zm.add(FIELD_FILE, &format!("f{}.js", i));
        }
        assert!(zm.values(FIELD_FILE).is_none());
        assert!(zm.may_contain(FIELD_FILE, "never-added.js"));
    }

    #[test]
    fn test_merge_and_bytes() {
        let mut a = ZoneMap::new();
        a.add(FIELD_KIND, "FUNCTION");
        let mut b = ZoneMap::new();
        b.add(FIELD_KIND, "CLASS");
        a.merge(&b);

        let loaded = ZoneMap::from_bytes(&a.to_bytes().unwrap()).unwrap();
        assert_eq!(loaded, a);
        assert_eq!(loaded.values(FIELD_KIND).map(|v| v.len()), Some(2));
    }
}
