//! Segment writer - запись сегментов в binary format
//!
//! Streams columns through a CRC-tracking writer, then patches the header
//! with the footer offset once every section has been laid down.

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{BufWriter, Cursor, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::index::{GlobalIndex, InvertedIndex};
use crate::storage::bloom::BloomFilter;
use crate::storage::manifest::{
    global_index_rel_path, segment_rel_path, tombstone_rel_path, GlobalIndexDescriptor,
    SegmentDescriptor, TombstoneDescriptor,
};
use crate::storage::segment::{
    EdgeSegment, NodeSegment, SegmentBytes, SegmentFooter, SegmentHeader, SegmentKind,
    EDGE_ROW_FIXED, HEADER_SIZE, INDEX_FIELD_FILE, INDEX_FIELD_KIND, INDEX_FIELD_NAME,
    INDEX_FIELD_OWNER, LEVEL_L1, NODE_ROW_FIXED,
};
use crate::storage::shard::{EdgeSegmentRef, NodeSegmentRef};
use crate::storage::string_table::StringTable;
use crate::storage::tombstone::TombstoneSet;
use crate::storage::zone_map::{ZoneMap, FIELD_FILE, FIELD_KIND, FIELD_OWNER};
use crate::storage::{EdgeRecord, NodeRecord};

/// What the manifest needs to know about a freshly written segment.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub kind: SegmentKind,
    pub level: u8,
    pub seq: u64,
    pub record_count: u64,
    pub byte_size: u64,
    pub crc32: u32,
    /// Smallest / largest id (nodes) or src (edges)
    pub min_key: u128,
    pub max_key: u128,
    pub kinds: BTreeSet<String>,
}

/// Tracks position and body checksum of everything written through it.
struct BodyWriter<'a, W: Write> {
    inner: &'a mut W,
    pos: u64,
    crc: crc32fast::Hasher,
}

impl<'a, W: Write> Write for BodyWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.crc.update(&buf[..n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct Trailer {
    strings: StringTable,
    bloom: BloomFilter,
    dst_bloom: Option<BloomFilter>,
    zone_map: ZoneMap,
    index: Option<InvertedIndex>,
}

fn finish<W: Write + Seek>(
    out: &mut W,
    mut header: SegmentHeader,
    write_columns: impl FnOnce(&mut BodyWriter<'_, W>) -> Result<()>,
    trailer: Trailer,
) -> Result<(u64, u32)> {
    let start = out.stream_position()?;
    out.write_all(&header.to_bytes())?;

    let mut body = BodyWriter {
        inner: out,
        pos: HEADER_SIZE as u64,
        crc: crc32fast::Hasher::new(),
    };
    write_columns(&mut body)?;

    let mut footer = SegmentFooter {
        strings_offset: body.pos,
        ..Default::default()
    };
    trailer.strings.write_to(&mut body)?;

    footer.bloom_offset = body.pos;
    trailer.bloom.write_to(&mut body)?;

    if let Some(ref dst_bloom) = trailer.dst_bloom {
        footer.dst_bloom_offset = body.pos;
        dst_bloom.write_to(&mut body)?;
    }

    footer.zone_map_offset = body.pos;
    body.write_all(&trailer.zone_map.to_bytes()?)?;

    if let Some(ref index) = trailer.index {
        footer.index_offset = body.pos;
        body.write_all(&index.to_bytes()?)?;
    }

    let footer_offset = body.pos;
    footer.body_crc32 = body.crc.finalize();
    out.write_all(&footer.to_bytes())?;

    // Обновляем header с правильным footer_offset
    header.footer_offset = footer_offset;
    out.seek(SeekFrom::Start(start))?;
    out.write_all(&header.to_bytes())?;
    out.seek(SeekFrom::End(0))?;

    Ok((footer_offset + crate::storage::segment::FOOTER_SIZE as u64, footer.body_crc32))
}

/// Записать nodes segment. Level 1 input must be sorted by id without duplicates.
pub fn write_nodes<W: Write + Seek, N: Borrow<NodeRecord>>(
    out: &mut W,
    nodes: &[N],
    level: u8,
    seq: u64,
) -> Result<SegmentMeta> {
    if nodes.is_empty() {
        return Err(GraphError::InvalidFormat("Refusing to write an empty node segment".into()));
    }
    if level >= LEVEL_L1 && nodes.windows(2).any(|w| w[0].borrow().id >= w[1].borrow().id) {
        return Err(GraphError::InvalidFormat("Level 1 node segment input is not sorted by id".into()));
    }

    // Собрать уникальные строки
    let mut strings = StringTable::new();
    let mut zone_map = ZoneMap::new();
    let mut index = (level >= LEVEL_L1).then(InvertedIndex::new);
    let mut cols: [Vec<u32>; 5] = Default::default();
    let mut kinds = BTreeSet::new();

    for (row, node) in nodes.iter().map(|n| -> &NodeRecord { n.borrow() }).enumerate() {
        cols[0].push(strings.column_ref(&node.kind));
        cols[1].push(strings.column_ref(&node.name));
        cols[2].push(strings.column_ref(&node.file));
        cols[3].push(strings.column_ref(&node.owner));
        cols[4].push(strings.column_ref_opt(node.metadata.as_deref()));

        zone_map.add(FIELD_KIND, &node.kind);
        zone_map.add(FIELD_FILE, &node.file);
        zone_map.add(FIELD_OWNER, &node.owner);
        if !kinds.contains(&node.kind) {
            kinds.insert(node.kind.clone());
        }

        if let Some(ref mut index) = index {
            let row = row as u32;
            index.add(INDEX_FIELD_KIND, &node.kind, row);
            index.add(INDEX_FIELD_NAME, &node.name, row);
            index.add(INDEX_FIELD_FILE, &node.file, row);
            index.add(INDEX_FIELD_OWNER, &node.owner, row);
        }
    }

    let bloom = BloomFilter::from_keys(nodes.iter().map(|n| n.borrow().id));
    let header = SegmentHeader::new(SegmentKind::Nodes, level, nodes.len() as u64, seq);

    let (byte_size, crc32) = finish(
        out,
        header,
        |w| {
            for node in nodes {
                w.write_all(&node.borrow().id.to_le_bytes())?;
            }
            for col in &cols {
                for v in col {
                    w.write_all(&v.to_le_bytes())?;
                }
            }
            debug_assert_eq!(w.pos, (HEADER_SIZE + nodes.len() * NODE_ROW_FIXED) as u64);
            Ok(())
        },
        Trailer { strings, bloom, dst_bloom: None, zone_map, index },
    )?;

    let (min_key, max_key) = nodes
        .iter()
        .map(|n| n.borrow().id)
        .fold((u128::MAX, 0u128), |(lo, hi), id| (lo.min(id), hi.max(id)));

    Ok(SegmentMeta {
        kind: SegmentKind::Nodes,
        level,
        seq,
        record_count: nodes.len() as u64,
        byte_size,
        crc32,
        min_key,
        max_key,
        kinds,
    })
}

/// Записать edges segment. Level 1 input must be sorted by (src, dst, kind).
pub fn write_edges<W: Write + Seek, E: Borrow<EdgeRecord>>(
    out: &mut W,
    edges: &[E],
    level: u8,
    seq: u64,
) -> Result<SegmentMeta> {
    if edges.is_empty() {
        return Err(GraphError::InvalidFormat("Refusing to write an empty edge segment".into()));
    }
    if level >= LEVEL_L1
        && edges
            .windows(2)
            .any(|w| {
                let (a, b) = (w[0].borrow(), w[1].borrow());
                (a.src, a.dst, &a.kind) >= (b.src, b.dst, &b.kind)
            })
    {
        return Err(GraphError::InvalidFormat("Level 1 edge segment input is not sorted by key".into()));
    }

    let mut strings = StringTable::new();
    let mut zone_map = ZoneMap::new();
    let mut index = (level >= LEVEL_L1).then(InvertedIndex::new);
    let mut cols: [Vec<u32>; 3] = Default::default();
    let mut kinds = BTreeSet::new();

    for (row, edge) in edges.iter().map(|e| -> &EdgeRecord { e.borrow() }).enumerate() {
        cols[0].push(strings.column_ref(&edge.kind));
        cols[1].push(strings.column_ref(&edge.owner));
        cols[2].push(strings.column_ref_opt(edge.metadata.as_deref()));

        zone_map.add(FIELD_KIND, &edge.kind);
        zone_map.add(FIELD_OWNER, &edge.owner);
        if !kinds.contains(&edge.kind) {
            kinds.insert(edge.kind.clone());
        }

        if let Some(ref mut index) = index {
            index.add(INDEX_FIELD_KIND, &edge.kind, row as u32);
            index.add(INDEX_FIELD_OWNER, &edge.owner, row as u32);
        }
    }

    let src_bloom = BloomFilter::from_keys(edges.iter().map(|e| e.borrow().src));
    let dst_bloom = BloomFilter::from_keys(edges.iter().map(|e| e.borrow().dst));
    let header = SegmentHeader::new(SegmentKind::Edges, level, edges.len() as u64, seq);

    let (byte_size, crc32) = finish(
        out,
        header,
        |w| {
            for edge in edges {
                w.write_all(&edge.borrow().src.to_le_bytes())?;
            }
            for edge in edges {
                w.write_all(&edge.borrow().dst.to_le_bytes())?;
            }
            for col in &cols {
                for v in col {
                    w.write_all(&v.to_le_bytes())?;
                }
            }
            debug_assert_eq!(w.pos, (HEADER_SIZE + edges.len() * EDGE_ROW_FIXED) as u64);
            Ok(())
        },
        Trailer {
            strings,
            bloom: src_bloom,
            dst_bloom: Some(dst_bloom),
            zone_map,
            index,
        },
    )?;

    let (min_key, max_key) = edges
        .iter()
        .map(|e| e.borrow().src)
        .fold((u128::MAX, 0u128), |(lo, hi), src| (lo.min(src), hi.max(src)));

    tracing::debug!(edges = edges.len(), level, seq, bytes = byte_size, "edge segment encoded");

    Ok(SegmentMeta {
        kind: SegmentKind::Edges,
        level,
        seq,
        record_count: edges.len() as u64,
        byte_size,
        crc32,
        min_key,
        max_key,
        kinds,
    })
}

/// Encode a node segment into memory.
pub fn encode_nodes<N: Borrow<NodeRecord>>(nodes: &[N], level: u8, seq: u64) -> Result<(Vec<u8>, SegmentMeta)> {
    let mut cursor = Cursor::new(Vec::new());
    let meta = write_nodes(&mut cursor, nodes, level, seq)?;
    Ok((cursor.into_inner(), meta))
}

/// Encode an edge segment into memory.
pub fn encode_edges<E: Borrow<EdgeRecord>>(edges: &[E], level: u8, seq: u64) -> Result<(Vec<u8>, SegmentMeta)> {
    let mut cursor = Cursor::new(Vec::new());
    let meta = write_edges(&mut cursor, edges, level, seq)?;
    Ok((cursor.into_inner(), meta))
}

/// Write bytes to `path` and fsync before returning.
pub fn write_file_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Stream a node segment straight into a file, fsync'd.
pub fn write_nodes_file<N: Borrow<NodeRecord>>(path: &Path, nodes: &[N], level: u8, seq: u64) -> Result<SegmentMeta> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);
    let meta = write_nodes(&mut writer, nodes, level, seq)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;

    tracing::debug!("Written {} nodes to {:?} ({} bytes)", nodes.len(), path, meta.byte_size);
    Ok(meta)
}

/// Stream an edge segment straight into a file, fsync'd.
pub fn write_edges_file<E: Borrow<EdgeRecord>>(path: &Path, edges: &[E], level: u8, seq: u64) -> Result<SegmentMeta> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let mut writer = BufWriter::new(file);
    let meta = write_edges(&mut writer, edges, level, seq)?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(meta)
}

// ============================================================
// Database-level sink: file naming, descriptors, reopening
// ============================================================

/// Writes segments, tombstone sets and the global index where the database
/// keeps them: files under `root`, or memory for ephemeral stores.
#[derive(Debug, Clone)]
pub struct SegmentSink {
    root: Option<PathBuf>,
}

fn descriptor(id: u64, file: String, meta: SegmentMeta) -> SegmentDescriptor {
    SegmentDescriptor {
        id,
        seq: meta.seq,
        file,
        level: meta.level,
        record_count: meta.record_count,
        byte_size: meta.byte_size,
        crc32: meta.crc32,
        min_key: meta.min_key,
        max_key: meta.max_key,
        kinds: meta.kinds,
    }
}

impl SegmentSink {
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }

    fn require_root(&self, what: &str) -> Result<&Path> {
        self.root
            .as_deref()
            .ok_or_else(|| GraphError::InvalidFormat(format!("ephemeral store cannot reopen {}", what)))
    }

    pub fn write_nodes<N: Borrow<NodeRecord>>(
        &self,
        shard: u16,
        id: u64,
        seq: u64,
        level: u8,
        nodes: &[N],
    ) -> Result<(SegmentDescriptor, Arc<NodeSegmentRef>)> {
        let rel = segment_rel_path(shard, id, SegmentKind::Nodes);
        let (meta, segment) = match self.root {
            Some(ref root) => {
                let path = root.join(&rel);
                let meta = write_nodes_file(&path, nodes, level, seq)?;
                (meta, NodeSegment::open(&path)?)
            }
            None => {
                let (bytes, meta) = encode_nodes(nodes, level, seq)?;
                (meta, NodeSegment::from_bytes(SegmentBytes::Owned(bytes.into()))?)
            }
        };
        Ok((descriptor(id, rel, meta), Arc::new(NodeSegmentRef { id, segment })))
    }

    pub fn write_edges<E: Borrow<EdgeRecord>>(
        &self,
        shard: u16,
        id: u64,
        seq: u64,
        level: u8,
        edges: &[E],
    ) -> Result<(SegmentDescriptor, Arc<EdgeSegmentRef>)> {
        let rel = segment_rel_path(shard, id, SegmentKind::Edges);
        let (meta, segment) = match self.root {
            Some(ref root) => {
                let path = root.join(&rel);
                let meta = write_edges_file(&path, edges, level, seq)?;
                (meta, EdgeSegment::open(&path)?)
            }
            None => {
                let (bytes, meta) = encode_edges(edges, level, seq)?;
                (meta, EdgeSegment::from_bytes(SegmentBytes::Owned(bytes.into()))?)
            }
        };
        Ok((descriptor(id, rel, meta), Arc::new(EdgeSegmentRef { id, segment })))
    }

    pub fn open_nodes(&self, desc: &SegmentDescriptor) -> Result<Arc<NodeSegmentRef>> {
        let root = self.require_root(&desc.file)?;
        let segment = NodeSegment::open(&root.join(&desc.file))?;
        Ok(Arc::new(NodeSegmentRef { id: desc.id, segment }))
    }

    pub fn open_edges(&self, desc: &SegmentDescriptor) -> Result<Arc<EdgeSegmentRef>> {
        let root = self.require_root(&desc.file)?;
        let segment = EdgeSegment::open(&root.join(&desc.file))?;
        Ok(Arc::new(EdgeSegmentRef { id: desc.id, segment }))
    }

    /// Persist a shard's full tombstone set. `None` when the set is empty.
    pub fn write_tombstones(&self, shard: u16, id: u64, set: &TombstoneSet) -> Result<Option<TombstoneDescriptor>> {
        if set.is_empty() {
            return Ok(None);
        }
        let bytes = set.to_bytes()?;
        let file = tombstone_rel_path(shard, id);
        if let Some(ref root) = self.root {
            write_file_synced(&root.join(&file), &bytes)?;
        }
        Ok(Some(TombstoneDescriptor {
            id,
            file,
            node_count: set.node_count() as u64,
            edge_count: set.edge_count() as u64,
            byte_size: bytes.len() as u64,
            crc32: u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }))
    }

    pub fn load_tombstones(&self, desc: &TombstoneDescriptor) -> Result<TombstoneSet> {
        let root = self.require_root(&desc.file)?;
        TombstoneSet::from_bytes(&std::fs::read(root.join(&desc.file))?)
    }

    pub fn write_global_index(&self, version: u64, index: &GlobalIndex) -> Result<GlobalIndexDescriptor> {
        let file = global_index_rel_path(version);
        let byte_size = match self.root {
            Some(ref root) => index.write_file(&root.join(&file))?,
            None => index.byte_size(),
        };
        Ok(GlobalIndexDescriptor {
            version,
            file,
            entry_count: index.len() as u64,
            byte_size,
            crc32: index.checksum(),
        })
    }

    pub fn open_global_index(&self, desc: &GlobalIndexDescriptor) -> Result<GlobalIndex> {
        let root = self.require_root(&desc.file)?;
        GlobalIndex::open(&root.join(&desc.file))
    }
}

/// Run an I/O step, retrying I/O errors with linear backoff.
pub fn retry_io<T>(
    attempts: u32,
    backoff_ms: u64,
    what: &str,
    mut op: impl FnMut() -> Result<T>,
) -> Result<T> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(GraphError::Io(e)) if attempt < attempts => {
                tracing::warn!(attempt, error = %e, "{} failed, retrying", what);
                std::thread::sleep(std::time::Duration::from_millis(backoff_ms * attempt as u64));
                attempt += 1;
            }
            other => return other,
        }
    }
}
