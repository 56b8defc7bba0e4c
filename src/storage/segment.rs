//! Immutable segment files (memory-mapped readers)
//!
//! Layout:
//! ```text
//! header (32) | columns | string table | bloom(s) | zone map | [inverted index] | footer (48)
//! ```
//! Node columns: `id u128 | kind u32 | name u32 | file u32 | owner u32 | metadata u32`
//! Edge columns: `src u128 | dst u128 | kind u32 | owner u32 | metadata u32`
//!
//! String columns hold string-table ids + 1 (0 = absent).

use std::fs::File;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{GraphError, Result};
use crate::index::inverted::intersect_sorted;
use crate::index::InvertedIndex;
use crate::storage::bloom::BloomFilter;
use crate::storage::string_table::StringTable;
use crate::storage::zone_map::{ZoneMap, FIELD_FILE, FIELD_OWNER};
use crate::storage::{kind_matches, metadata_matches, AttrQuery, EdgeKey, EdgeRecord, NodeRecord};

/// Магическое число для валидации формата
pub const MAGIC: [u8; 4] = *b"CGS1";
pub const FOOTER_MAGIC: [u8; 4] = *b"CGSF";

/// Версия формата
pub const FORMAT_VERSION: u16 = 1;

pub const HEADER_SIZE: usize = 32;
pub const FOOTER_SIZE: usize = 48;

pub const NODE_ROW_FIXED: usize = 16 + 4 * 5;
pub const EDGE_ROW_FIXED: usize = 32 + 4 * 3;

pub const INDEX_FIELD_KIND: &str = "kind";
pub const INDEX_FIELD_NAME: &str = "name";
pub const INDEX_FIELD_FILE: &str = "file";
pub const INDEX_FIELD_OWNER: &str = "owner";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SegmentKind {
    Nodes = 0,
    Edges = 1,
}

impl SegmentKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(SegmentKind::Nodes),
            1 => Some(SegmentKind::Edges),
            _ => None,
        }
    }

    pub fn file_suffix(self) -> &'static str {
        match self {
            SegmentKind::Nodes => "nodes",
            SegmentKind::Edges => "edges",
        }
    }
}

/// Level 0 = flush output (insertion order), level 1 = compaction output (sorted + indexed)
pub const LEVEL_L0: u8 = 0;
pub const LEVEL_L1: u8 = 1;

/// Заголовок сегмента
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub kind: SegmentKind,
    pub level: u8,
    pub record_count: u64,
    pub footer_offset: u64,
    /// Sequence number: tombstones with `as_of > seq` hide records here
    pub seq: u64,
}

impl SegmentHeader {
    pub fn new(kind: SegmentKind, level: u8, record_count: u64, seq: u64) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            kind,
            level,
            record_count,
            footer_offset: 0,
            seq,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic);
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out[6] = self.kind as u8;
        out[7] = self.level;
        out[8..16].copy_from_slice(&self.record_count.to_le_bytes());
        out[16..24].copy_from_slice(&self.footer_offset.to_le_bytes());
        out[24..32].copy_from_slice(&self.seq.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(GraphError::InvalidFormat("Файл слишком мал".into()));
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if magic != MAGIC {
            return Err(GraphError::InvalidFormat(format!(
                "Неверное магическое число: {:?}",
                magic
            )));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != FORMAT_VERSION {
            return Err(GraphError::InvalidFormat(format!(
                "Неподдерживаемая версия формата: {}",
                version
            )));
        }
        let kind = SegmentKind::from_u8(bytes[6])
            .ok_or_else(|| GraphError::InvalidFormat(format!("Unknown segment kind {}", bytes[6])))?;
        Ok(Self {
            magic,
            version,
            kind,
            level: bytes[7],
            record_count: read_u64(bytes, 8),
            footer_offset: read_u64(bytes, 16),
            seq: read_u64(bytes, 24),
        })
    }
}

/// Section offsets, written last.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentFooter {
    pub strings_offset: u64,
    pub bloom_offset: u64,
    /// Edge segments: bloom over `dst`. 0 for node segments.
    pub dst_bloom_offset: u64,
    pub zone_map_offset: u64,
    /// 0 when the segment has no inverted index (L0)
    pub index_offset: u64,
    /// CRC32 of bytes `[HEADER_SIZE, footer_offset)`
    pub body_crc32: u32,
}

impl SegmentFooter {
    pub fn to_bytes(&self) -> [u8; FOOTER_SIZE] {
        let mut out = [0u8; FOOTER_SIZE];
        out[0..8].copy_from_slice(&self.strings_offset.to_le_bytes());
        out[8..16].copy_from_slice(&self.bloom_offset.to_le_bytes());
        out[16..24].copy_from_slice(&self.dst_bloom_offset.to_le_bytes());
        out[24..32].copy_from_slice(&self.zone_map_offset.to_le_bytes());
        out[32..40].copy_from_slice(&self.index_offset.to_le_bytes());
        out[40..44].copy_from_slice(&self.body_crc32.to_le_bytes());
        out[44..48].copy_from_slice(&FOOTER_MAGIC);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FOOTER_SIZE || bytes[44..48] != FOOTER_MAGIC {
            return Err(GraphError::InvalidFormat("Segment footer missing or corrupt".into()));
        }
        Ok(Self {
            strings_offset: read_u64(bytes, 0),
            bloom_offset: read_u64(bytes, 8),
            dst_bloom_offset: read_u64(bytes, 16),
            zone_map_offset: read_u64(bytes, 24),
            index_offset: read_u64(bytes, 32),
            body_crc32: u32::from_le_bytes([bytes[40], bytes[41], bytes[42], bytes[43]]),
        })
    }
}

/// Backing bytes of a segment: a file mapping or an in-memory buffer
/// (ephemeral stores).
pub enum SegmentBytes {
    Mapped(Mmap),
    Owned(Arc<[u8]>),
}

impl SegmentBytes {
    pub fn map_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: segment files are immutable once published; nothing in
        // this process writes to a mapped path.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(SegmentBytes::Mapped(mmap))
    }
}

impl Deref for SegmentBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            SegmentBytes::Mapped(m) => m,
            SegmentBytes::Owned(b) => b,
        }
    }
}

#[inline]
fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(b)
}

#[inline]
fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(b)
}

#[inline]
fn read_u128(bytes: &[u8], at: usize) -> u128 {
    let mut b = [0u8; 16];
    b.copy_from_slice(&bytes[at..at + 16]);
    u128::from_le_bytes(b)
}

/// Sections shared by node and edge segments, parsed once at open.
struct Sections {
    header: SegmentHeader,
    footer: SegmentFooter,
    strings: StringTable,
    bloom: BloomFilter,
    dst_bloom: Option<BloomFilter>,
    zone_map: ZoneMap,
    index: Option<InvertedIndex>,
}

fn section<'a>(bytes: &'a [u8], start: u64, end: u64, what: &str) -> Result<&'a [u8]> {
    if start > end {
        return Err(GraphError::InvalidFormat(format!("{} section out of order", what)));
    }
    bytes
        .get(start as usize..end as usize)
        .ok_or_else(|| GraphError::InvalidFormat(format!("{} section truncated", what)))
}

fn parse_sections(bytes: &[u8], expected: SegmentKind, row_fixed: usize) -> Result<Sections> {
    let header = SegmentHeader::from_bytes(bytes)?;
    if header.kind != expected {
        return Err(GraphError::InvalidFormat(format!(
            "Expected {:?} segment, found {:?}",
            expected, header.kind
        )));
    }
    let footer_start = header.footer_offset as usize;
    if footer_start + FOOTER_SIZE != bytes.len() {
        return Err(GraphError::InvalidFormat(format!(
            "Footer offset {} does not match file size {}",
            footer_start,
            bytes.len()
        )));
    }
    let footer = SegmentFooter::from_bytes(&bytes[footer_start..])?;

    let columns_end = HEADER_SIZE as u64 + header.record_count * row_fixed as u64;
    if footer.strings_offset != columns_end {
        return Err(GraphError::InvalidFormat(format!(
            "Column area ends at {} but string table starts at {}",
            columns_end, footer.strings_offset
        )));
    }

    let strings = StringTable::load_from_slice(section(
        bytes,
        footer.strings_offset,
        footer.bloom_offset,
        "string table",
    )?)?;

    let bloom_end = if footer.dst_bloom_offset != 0 {
        footer.dst_bloom_offset
    } else {
        footer.zone_map_offset
    };
    let bloom = BloomFilter::from_bytes(section(bytes, footer.bloom_offset, bloom_end, "bloom")?)?;
    let dst_bloom = if footer.dst_bloom_offset != 0 {
        Some(BloomFilter::from_bytes(section(
            bytes,
            footer.dst_bloom_offset,
            footer.zone_map_offset,
            "dst bloom",
        )?)?)
    } else {
        None
    };

    let zone_end = if footer.index_offset != 0 {
        footer.index_offset
    } else {
        header.footer_offset
    };
    let zone_map = ZoneMap::from_bytes(section(bytes, footer.zone_map_offset, zone_end, "zone map")?)?;

    let index = if footer.index_offset != 0 {
        Some(InvertedIndex::from_bytes(section(
            bytes,
            footer.index_offset,
            header.footer_offset,
            "inverted index",
        )?)?)
    } else {
        None
    };

    Ok(Sections {
        header,
        footer,
        strings,
        bloom,
        dst_bloom,
        zone_map,
        index,
    })
}

/// Recompute the body checksum (deep verification).
pub fn verify_body_crc(bytes: &[u8]) -> Result<u32> {
    let header = SegmentHeader::from_bytes(bytes)?;
    let end = header.footer_offset as usize;
    let footer = SegmentFooter::from_bytes(
        bytes
            .get(end..)
            .ok_or_else(|| GraphError::InvalidFormat("footer offset past end of file".into()))?,
    )?;
    let actual = crc32fast::hash(&bytes[HEADER_SIZE..end]);
    if actual != footer.body_crc32 {
        return Err(GraphError::InvalidFormat(format!(
            "Body checksum mismatch: stored {:08x}, computed {:08x}",
            footer.body_crc32, actual
        )));
    }
    Ok(actual)
}

/// Read only the footer checksum (cheap verification).
pub fn read_footer_crc(path: &Path) -> Result<(u64, u32)> {
    use std::io::{Read, Seek, SeekFrom};

    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
        return Err(GraphError::InvalidFormat(format!("{:?} is too small", path)));
    }
    file.seek(SeekFrom::Start(len - FOOTER_SIZE as u64))?;
    let mut buf = [0u8; FOOTER_SIZE];
    file.read_exact(&mut buf)?;
    Ok((len, SegmentFooter::from_bytes(&buf)?.body_crc32))
}

// ============================================================
// Node segment
// ============================================================

/// Immutable сегмент нод
pub struct NodeSegment {
    bytes: SegmentBytes,
    sections: Sections,
    len: usize,
    ids_offset: usize,
    kind_offset: usize,
    name_offset: usize,
    file_offset: usize,
    owner_offset: usize,
    metadata_offset: usize,
}

impl NodeSegment {
    /// Открыть существующий сегмент
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_bytes(SegmentBytes::map_file(path)?)
    }

    pub fn from_bytes(bytes: SegmentBytes) -> Result<Self> {
        let sections = parse_sections(&bytes, SegmentKind::Nodes, NODE_ROW_FIXED)?;
        let len = sections.header.record_count as usize;

        let ids_offset = HEADER_SIZE;
        let kind_offset = ids_offset + len * 16;
        let name_offset = kind_offset + len * 4;
        let file_offset = name_offset + len * 4;
        let owner_offset = file_offset + len * 4;
        let metadata_offset = owner_offset + len * 4;

        Ok(Self {
            bytes,
            sections,
            len,
            ids_offset,
            kind_offset,
            name_offset,
            file_offset,
            owner_offset,
            metadata_offset,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn level(&self) -> u8 {
        self.sections.header.level
    }

    pub fn seq(&self) -> u64 {
        self.sections.header.seq
    }

    pub fn body_crc32(&self) -> u32 {
        self.sections.footer.body_crc32
    }

    /// Recompute the body checksum over the whole mapping.
    pub fn verify_checksum(&self) -> Result<()> {
        verify_body_crc(&self.bytes).map(|_| ())
    }

    pub fn zone_map(&self) -> &ZoneMap {
        &self.sections.zone_map
    }

    pub fn has_index(&self) -> bool {
        self.sections.index.is_some()
    }

    pub fn may_contain(&self, id: u128) -> bool {
        self.sections.bloom.may_contain(id)
    }

    /// ID ноды по индексу
    pub fn id_at(&self, row: usize) -> u128 {
        read_u128(&self.bytes, self.ids_offset + row * 16)
    }

    fn str_col(&self, col_offset: usize, row: usize) -> Option<&str> {
        let r = read_u32(&self.bytes, col_offset + row * 4);
        self.sections.strings.resolve(r)
    }

    pub fn kind_at(&self, row: usize) -> &str {
        self.str_col(self.kind_offset, row).unwrap_or("UNKNOWN")
    }

    pub fn name_at(&self, row: usize) -> &str {
        self.str_col(self.name_offset, row).unwrap_or("")
    }

    pub fn file_at(&self, row: usize) -> &str {
        self.str_col(self.file_offset, row).unwrap_or("")
    }

    pub fn owner_at(&self, row: usize) -> &str {
        self.str_col(self.owner_offset, row).unwrap_or("")
    }

    pub fn metadata_at(&self, row: usize) -> Option<&str> {
        self.str_col(self.metadata_offset, row)
    }

    pub fn record_at(&self, row: usize) -> NodeRecord {
        NodeRecord {
            id: self.id_at(row),
            kind: self.kind_at(row).to_string(),
            name: self.name_at(row).to_string(),
            file: self.file_at(row).to_string(),
            metadata: self.metadata_at(row).map(str::to_string),
            owner: self.owner_at(row).to_string(),
        }
    }

    /// Row holding `id`. Sorted segments use binary search, L0 a column scan.
    pub fn find_row(&self, id: u128) -> Option<usize> {
        if !self.may_contain(id) {
            return None;
        }
        if self.level() >= LEVEL_L1 {
            let (mut lo, mut hi) = (0usize, self.len);
            while lo < hi {
                let mid = lo + (hi - lo) / 2;
                match self.id_at(mid).cmp(&id) {
                    std::cmp::Ordering::Less => lo = mid + 1,
                    std::cmp::Ordering::Greater => hi = mid,
                    std::cmp::Ordering::Equal => return Some(mid),
                }
            }
            None
        } else {
            (0..self.len).find(|&row| self.id_at(row) == id)
        }
    }

    /// Quick reject using the zone map (kind, file, owner).
    pub fn may_match(&self, query: &AttrQuery) -> bool {
        let zm = &self.sections.zone_map;
        if self.len == 0 {
            return false;
        }
        if let Some(ref k) = query.kind {
            if !zm.may_contain_kind(k) {
                return false;
            }
        }
        if let Some(ref f) = query.file {
            if !zm.may_contain(FIELD_FILE, f) {
                return false;
            }
        }
        if let Some(ref o) = query.owner {
            if !zm.may_contain(FIELD_OWNER, o) {
                return false;
            }
        }
        true
    }

    /// Candidate rows for a query. Indexed segments probe the inverted index
    /// (second element `true`); others return every row for a columnar scan.
    pub fn candidate_rows(&self, query: &AttrQuery) -> (Vec<u32>, bool) {
        let Some(ref index) = self.sections.index else {
            return ((0..self.len as u32).collect(), false);
        };

        let mut probes: Vec<Vec<u32>> = Vec::new();
        if let Some(ref k) = query.kind {
            probes.push(index.lookup_pattern(INDEX_FIELD_KIND, k));
        }
        if let Some(ref n) = query.name {
            probes.push(index.lookup(INDEX_FIELD_NAME, n).to_vec());
        }
        if let Some(ref f) = query.file {
            probes.push(index.lookup(INDEX_FIELD_FILE, f).to_vec());
        }
        if let Some(ref o) = query.owner {
            probes.push(index.lookup(INDEX_FIELD_OWNER, o).to_vec());
        }

        let mut probes = probes.into_iter();
        match probes.next() {
            None => ((0..self.len as u32).collect(), false),
            Some(first) => (probes.fold(first, |acc, rows| intersect_sorted(&acc, &rows)), true),
        }
    }

    /// Check one row against the query without materializing the record.
    pub fn row_matches(&self, row: usize, query: &AttrQuery) -> bool {
        if let Some(ref k) = query.kind {
            if !kind_matches(k, self.kind_at(row)) {
                return false;
            }
        }
        if let Some(ref n) = query.name {
            if n != self.name_at(row) {
                return false;
            }
        }
        if let Some(ref f) = query.file {
            if f != self.file_at(row) {
                return false;
            }
        }
        if let Some(ref o) = query.owner {
            if o != self.owner_at(row) {
                return false;
            }
        }
        metadata_matches(self.metadata_at(row), &query.metadata_filters)
    }
}

// ============================================================
// Edge segment
// ============================================================

/// Immutable сегмент рёбер
pub struct EdgeSegment {
    bytes: SegmentBytes,
    sections: Sections,
    len: usize,
    src_offset: usize,
    dst_offset: usize,
    kind_offset: usize,
    owner_offset: usize,
    metadata_offset: usize,
}

impl EdgeSegment {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_bytes(SegmentBytes::map_file(path)?)
    }

    pub fn from_bytes(bytes: SegmentBytes) -> Result<Self> {
        let sections = parse_sections(&bytes, SegmentKind::Edges, EDGE_ROW_FIXED)?;
        if sections.dst_bloom.is_none() {
            return Err(GraphError::InvalidFormat("Edge segment without dst bloom".into()));
        }
        let len = sections.header.record_count as usize;
        let src_offset = HEADER_SIZE;
        let dst_offset = src_offset + len * 16;
        let kind_offset = dst_offset + len * 16;
        let owner_offset = kind_offset + len * 4;
        let metadata_offset = owner_offset + len * 4;

        Ok(Self {
            bytes,
            sections,
            len,
            src_offset,
            dst_offset,
            kind_offset,
            owner_offset,
            metadata_offset,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn level(&self) -> u8 {
        self.sections.header.level
    }

    pub fn seq(&self) -> u64 {
        self.sections.header.seq
    }

    pub fn body_crc32(&self) -> u32 {
        self.sections.footer.body_crc32
    }

    /// Recompute the body checksum over the whole mapping.
    pub fn verify_checksum(&self) -> Result<()> {
        verify_body_crc(&self.bytes).map(|_| ())
    }

    pub fn zone_map(&self) -> &ZoneMap {
        &self.sections.zone_map
    }

    pub fn may_contain_src(&self, id: u128) -> bool {
        self.sections.bloom.may_contain(id)
    }

    pub fn may_contain_dst(&self, id: u128) -> bool {
        self.sections
            .dst_bloom
            .as_ref()
            .map_or(true, |b| b.may_contain(id))
    }

    pub fn src_at(&self, row: usize) -> u128 {
        read_u128(&self.bytes, self.src_offset + row * 16)
    }

    pub fn dst_at(&self, row: usize) -> u128 {
        read_u128(&self.bytes, self.dst_offset + row * 16)
    }

    fn str_col(&self, col_offset: usize, row: usize) -> Option<&str> {
        let r = read_u32(&self.bytes, col_offset + row * 4);
        self.sections.strings.resolve(r)
    }

    pub fn kind_at(&self, row: usize) -> &str {
        self.str_col(self.kind_offset, row).unwrap_or("UNKNOWN")
    }

    pub fn owner_at(&self, row: usize) -> &str {
        self.str_col(self.owner_offset, row).unwrap_or("")
    }

    pub fn metadata_at(&self, row: usize) -> Option<&str> {
        self.str_col(self.metadata_offset, row)
    }

    pub fn record_at(&self, row: usize) -> EdgeRecord {
        EdgeRecord {
            src: self.src_at(row),
            dst: self.dst_at(row),
            kind: self.kind_at(row).to_string(),
            metadata: self.metadata_at(row).map(str::to_string),
            owner: self.owner_at(row).to_string(),
        }
    }

    pub fn key_matches(&self, row: usize, key: &EdgeKey) -> bool {
        self.src_at(row) == key.0 && self.dst_at(row) == key.1 && self.kind_at(row) == key.2
    }

    /// Rows with the given `src`. Sorted segments return a contiguous range.
    pub fn rows_for_src(&self, src: u128) -> Vec<usize> {
        if !self.may_contain_src(src) {
            return Vec::new();
        }
        if self.level() >= LEVEL_L1 {
            let start = self.partition_point_src(|s| s < src);
            let end = self.partition_point_src(|s| s <= src);
            (start..end).collect()
        } else {
            (0..self.len).filter(|&row| self.src_at(row) == src).collect()
        }
    }

    pub fn rows_for_dst(&self, dst: u128) -> Vec<usize> {
        if !self.may_contain_dst(dst) {
            return Vec::new();
        }
        (0..self.len).filter(|&row| self.dst_at(row) == dst).collect()
    }

    fn partition_point_src(&self, pred: impl Fn(u128) -> bool) -> usize {
        let (mut lo, mut hi) = (0usize, self.len);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.src_at(mid)) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo
    }

    pub fn find_row(&self, key: &EdgeKey) -> Option<usize> {
        self.rows_for_src(key.0)
            .into_iter()
            .find(|&row| self.key_matches(row, key))
    }

    /// Rows owned by a unit: index probe when available, else a scan.
    pub fn rows_for_owner(&self, owner: &str) -> Vec<usize> {
        if !self.sections.zone_map.may_contain(FIELD_OWNER, owner) {
            return Vec::new();
        }
        match self.sections.index {
            Some(ref index) => index
                .lookup(INDEX_FIELD_OWNER, owner)
                .iter()
                .map(|&r| r as usize)
                .collect(),
            None => (0..self.len).filter(|&row| self.owner_at(row) == owner).collect(),
        }
    }

    pub fn may_contain_kind(&self, pattern: &str) -> bool {
        self.sections.zone_map.may_contain_kind(pattern)
    }
}
