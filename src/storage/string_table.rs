//! String table embedded in every segment (kinds, names, paths, metadata)

use std::collections::HashMap;
use std::io::Write;

use crate::error::{GraphError, Result};

/// All strings in one blob plus an array of start offsets.
///
/// Strings are addressed by their position in `offsets` (string id).
/// Column values reference strings by `id + 1`; 0 is the "absent" sentinel.
#[derive(Debug, Default)]
pub struct StringTable {
    data: Vec<u8>,
    offsets: Vec<u32>,
    index: HashMap<String, u32>,
}

impl StringTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Добавить строку, вернуть её id
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.index.get(s) {
            return id;
        }

        let id = self.offsets.len() as u32;
        self.offsets.push(self.data.len() as u32);
        self.data.extend_from_slice(s.as_bytes());
        self.index.insert(s.to_string(), id);
        id
    }

    /// Column reference for a string: `id + 1`
    pub fn column_ref(&mut self, s: &str) -> u32 {
        self.intern(s) + 1
    }

    /// Column reference for an optional string (0 when absent)
    pub fn column_ref_opt(&mut self, s: Option<&str>) -> u32 {
        s.map_or(0, |s| self.column_ref(s))
    }

    /// Id of an already interned string
    pub fn lookup(&self, s: &str) -> Option<u32> {
        self.index.get(s).copied()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Получить строку по id
    pub fn get(&self, id: u32) -> Option<&str> {
        let pos = id as usize;
        let start = *self.offsets.get(pos)? as usize;
        let end = self
            .offsets
            .get(pos + 1)
            .map_or(self.data.len(), |&next| next as usize);
        std::str::from_utf8(self.data.get(start..end)?).ok()
    }

    /// Resolve a column reference (`id + 1`, 0 = none)
    pub fn resolve(&self, column_ref: u32) -> Option<&str> {
        if column_ref == 0 {
            return None;
        }
        self.get(column_ref - 1)
    }

    /// Записать в Writer (для встраивания в segment)
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<u64> {
        writer.write_all(&(self.data.len() as u64).to_le_bytes())?;
        writer.write_all(&self.data)?;
        writer.write_all(&(self.offsets.len() as u64).to_le_bytes())?;
        for &offset in &self.offsets {
            writer.write_all(&offset.to_le_bytes())?;
        }
        Ok(16 + self.data.len() as u64 + self.offsets.len() as u64 * 4)
    }

    /// Загрузить из slice (часть mmap сегмента)
    pub fn load_from_slice(slice: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;

        let data_len = read_u64(slice, &mut cursor)? as usize;
        let data = slice
            .get(cursor..cursor + data_len)
            .ok_or_else(|| GraphError::InvalidFormat("String table data truncated".into()))?
            .to_vec();
        cursor += data_len;

        let offsets_count = read_u64(slice, &mut cursor)? as usize;
        let raw = slice
            .get(cursor..cursor + offsets_count * 4)
            .ok_or_else(|| GraphError::InvalidFormat("String table offsets truncated".into()))?;
        let offsets: Vec<u32> = raw
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        if offsets.windows(2).any(|w| w[0] > w[1])
            || offsets.last().map_or(false, |&o| o as usize > data.len())
        {
            return Err(GraphError::InvalidFormat("String table offsets out of order".into()));
        }

        let mut index = HashMap::with_capacity(offsets.len());
        for (i, &start) in offsets.iter().enumerate() {
            let end = offsets.get(i + 1).map_or(data.len(), |&n| n as usize);
            if let Ok(s) = std::str::from_utf8(&data[start as usize..end]) {
                index.insert(s.to_string(), i as u32);
            }
        }

        Ok(Self { data, offsets, index })
    }
}

fn read_u64(slice: &[u8], cursor: &mut usize) -> Result<u64> {
    let bytes: [u8; 8] = slice
        .get(*cursor..*cursor + 8)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| GraphError::InvalidFormat("String table header truncated".into()))?;
    *cursor += 8;
    Ok(u64::from_le_bytes(bytes))
}
