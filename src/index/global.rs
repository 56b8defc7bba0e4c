//! Global id index over compacted node segments
//!
//! Sorted fixed-width entries `id -> (shard, segment, row)`, binary searched
//! straight out of the mapped file. Rebuilt whenever a shard compacts and
//! published in the same manifest commit as the segments it points into.
//!
//! Layout: `magic "CGIX" | crc32(entries) u32 | count u64 | entries...`
//! Entry (32 bytes): `id u128 | segment_id u64 | row u32 | shard u16 | pad u16`

use std::path::Path;

use crate::error::{GraphError, Result};
use crate::storage::segment::SegmentBytes;
use crate::storage::writer::write_file_synced;

const INDEX_MAGIC: [u8; 4] = *b"CGIX";
const INDEX_HEADER: usize = 16;
pub const ENTRY_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct GlobalIndexEntry {
    pub id: u128,
    pub shard: u16,
    pub segment_id: u64,
    pub row: u32,
}

impl GlobalIndexEntry {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.id.to_le_bytes());
        out.extend_from_slice(&self.segment_id.to_le_bytes());
        out.extend_from_slice(&self.row.to_le_bytes());
        out.extend_from_slice(&self.shard.to_le_bytes());
        out.extend_from_slice(&[0u8; 2]);
    }

    fn decode(b: &[u8]) -> Self {
        let mut id = [0u8; 16];
        id.copy_from_slice(&b[0..16]);
        let mut seg = [0u8; 8];
        seg.copy_from_slice(&b[16..24]);
        Self {
            id: u128::from_le_bytes(id),
            segment_id: u64::from_le_bytes(seg),
            row: u32::from_le_bytes([b[24], b[25], b[26], b[27]]),
            shard: u16::from_le_bytes([b[28], b[29]]),
        }
    }
}

pub struct GlobalIndex {
    bytes: SegmentBytes,
    count: usize,
}

impl std::fmt::Debug for GlobalIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalIndex").field("count", &self.count).finish()
    }
}

impl GlobalIndex {
    pub fn empty() -> Self {
        Self::build(Vec::new())
    }

    /// Sort and encode. Duplicate entries collapse.
    pub fn build(mut entries: Vec<GlobalIndexEntry>) -> Self {
        entries.sort_unstable();
        entries.dedup();

        let mut body = Vec::with_capacity(entries.len() * ENTRY_SIZE);
        for e in &entries {
            e.encode(&mut body);
        }
        let mut bytes = Vec::with_capacity(INDEX_HEADER + body.len());
        bytes.extend_from_slice(&INDEX_MAGIC);
        bytes.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        bytes.extend_from_slice(&(entries.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&body);

        Self {
            bytes: SegmentBytes::Owned(bytes.into()),
            count: entries.len(),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Self::from_bytes(SegmentBytes::map_file(path)?)
    }

    pub fn from_bytes(bytes: SegmentBytes) -> Result<Self> {
        if bytes.len() < INDEX_HEADER || bytes[0..4] != INDEX_MAGIC {
            return Err(GraphError::Index("global index header corrupt".into()));
        }
        let stored_crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let mut count = [0u8; 8];
        count.copy_from_slice(&bytes[8..16]);
        let count = u64::from_le_bytes(count) as usize;

        if bytes.len() != INDEX_HEADER + count * ENTRY_SIZE {
            return Err(GraphError::Index(format!(
                "global index holds {} bytes, expected {} entries",
                bytes.len(),
                count
            )));
        }
        if crc32fast::hash(&bytes[INDEX_HEADER..]) != stored_crc {
            return Err(GraphError::Index("global index checksum mismatch".into()));
        }
        Ok(Self { bytes, count })
    }

    pub fn write_file(&self, path: &Path) -> Result<u64> {
        write_file_synced(path, &self.bytes)?;
        Ok(self.bytes.len() as u64)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Stored checksum of the entry area.
    pub fn checksum(&self) -> u32 {
        u32::from_le_bytes([self.bytes[4], self.bytes[5], self.bytes[6], self.bytes[7]])
    }

    pub fn byte_size(&self) -> u64 {
        self.bytes.len() as u64
    }

    #[inline]
    fn entry_at(&self, i: usize) -> GlobalIndexEntry {
        let at = INDEX_HEADER + i * ENTRY_SIZE;
        GlobalIndexEntry::decode(&self.bytes[at..at + ENTRY_SIZE])
    }

    #[inline]
    fn id_at(&self, i: usize) -> u128 {
        let at = INDEX_HEADER + i * ENTRY_SIZE;
        let mut b = [0u8; 16];
        b.copy_from_slice(&self.bytes[at..at + 16]);
        u128::from_le_bytes(b)
    }

    /// All entries for `id` (one per shard holding a compacted copy).
    pub fn lookup(&self, id: u128) -> Vec<GlobalIndexEntry> {
        let (mut lo, mut hi) = (0usize, self.count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.id_at(mid) < id {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        (lo..self.count)
            .take_while(|&i| self.id_at(i) == id)
            .map(|i| self.entry_at(i))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = GlobalIndexEntry> + '_ {
        (0..self.count).map(move |i| self.entry_at(i))
    }

    /// New index with `shard`'s entries replaced by `entries`.
    pub fn replace_shard(&self, shard: u16, entries: Vec<GlobalIndexEntry>) -> Self {
        let mut all: Vec<GlobalIndexEntry> = self.iter().filter(|e| e.shard != shard).collect();
        all.extend(entries);
        Self::build(all)
    }

    /// New index without the entries of the given segments.
    pub fn without_segments(&self, segment_ids: &[u64]) -> Self {
        Self::build(
            self.iter()
                .filter(|e| !segment_ids.contains(&e.segment_id))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(id: u128, shard: u16, segment_id: u64, row: u32) -> GlobalIndexEntry {
        GlobalIndexEntry { id, shard, segment_id, row }
    }

    #[test]
    fn test_lookup_sorted() {
        let idx = GlobalIndex::build(vec![
            entry(30, 0, 5, 2),
            entry(10, 1, 7, 0),
            entry(20, 0, 5, 1),
            entry(20, 2, 9, 4),
        ]);
        assert_eq!(idx.len(), 4);
        assert_eq!(idx.lookup(10), vec![entry(10, 1, 7, 0)]);
        assert_eq!(idx.lookup(20).len(), 2);
        assert!(idx.lookup(15).is_empty());
        assert!(idx.lookup(99).is_empty());
    }

    #[test]
    fn test_replace_shard() {
        let idx = GlobalIndex::build(vec![entry(1, 0, 3, 0), entry(2, 1, 4, 0)]);
        let next = idx.replace_shard(0, vec![entry(5, 0, 8, 0)]);
        assert!(next.lookup(1).is_empty());
        assert_eq!(next.lookup(2).len(), 1);
        assert_eq!(next.lookup(5), vec![entry(5, 0, 8, 0)]);

        let trimmed = next.without_segments(&[4]);
        assert!(trimmed.lookup(2).is_empty());
        assert_eq!(trimmed.len(), 1);
    }

    #[test]
    fn test_file_roundtrip_and_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("global_00000001.idx");
        let idx = GlobalIndex::build((1..100u128).map(|i| entry(i * 7, 0, 1, i as u32)).collect());
        let size = idx.write_file(&path).unwrap();
        assert_eq!(size, std::fs::metadata(&path).unwrap().len());

        let loaded = GlobalIndex::open(&path).unwrap();
        assert_eq!(loaded.len(), 99);
        assert_eq!(loaded.lookup(70), vec![entry(70, 0, 1, 10)]);

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last - 20] ^= 0x55;
        assert!(GlobalIndex::from_bytes(SegmentBytes::Owned(bytes.into())).is_err());
    }

    #[test]
    fn test_empty() {
        let idx = GlobalIndex::empty();
        assert!(idx.is_empty());
        assert!(idx.lookup(1).is_empty());
    }
}
