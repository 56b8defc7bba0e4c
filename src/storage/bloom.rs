//! Membership filter for segment ids
//!
//! Keys are already BLAKE3 fingerprints, so no rehashing: the u128 is split
//! into two u64 halves and probe `i` lands on `h1 + i * h2 (mod m)`.
//! `h2` is forced odd so it stays coprime with power-of-two bit counts.
//!
//! On disk: `num_bits u64 | num_hashes u32 | 0u32 | words u64 × ceil(num_bits / 64)`

use std::io::Write;

use crate::error::{GraphError, Result};

pub const BLOOM_BITS_PER_KEY: usize = 10;
pub const BLOOM_NUM_HASHES: u32 = 7;

const HEADER_LEN: usize = 16;

#[derive(Debug, Clone)]
pub struct BloomFilter {
    words: Vec<u64>,
    num_bits: u64,
    num_hashes: u32,
}

impl BloomFilter {
    /// Sized for `expected_keys` (10 bits/key, at least one word). An empty
    /// filter is valid and rejects everything.
    pub fn with_capacity(expected_keys: usize) -> Self {
        let bits = expected_keys.saturating_mul(BLOOM_BITS_PER_KEY).max(64);
        let words = (bits + 63) / 64;
        Self {
            words: vec![0; words],
            num_bits: (words * 64) as u64,
            num_hashes: BLOOM_NUM_HASHES,
        }
    }

    pub fn from_keys(keys: impl ExactSizeIterator<Item = u128>) -> Self {
        let mut filter = Self::with_capacity(keys.len());
        for key in keys {
            filter.insert(key);
        }
        filter
    }

    pub fn insert(&mut self, key: u128) {
        for bit in probe_bits(key, self.num_hashes, self.num_bits) {
            self.words[(bit / 64) as usize] |= 1u64 << (bit % 64);
        }
    }

    /// `false` means definitely absent.
    pub fn may_contain(&self, key: u128) -> bool {
        probe_bits(key, self.num_hashes, self.num_bits)
            .all(|bit| self.words[(bit / 64) as usize] & (1u64 << (bit % 64)) != 0)
    }

    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<u64> {
        writer.write_all(&self.num_bits.to_le_bytes())?;
        writer.write_all(&self.num_hashes.to_le_bytes())?;
        writer.write_all(&0u32.to_le_bytes())?;
        for word in &self.words {
            writer.write_all(&word.to_le_bytes())?;
        }
        Ok((HEADER_LEN + self.words.len() * 8) as u64)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(GraphError::InvalidFormat("Bloom filter header truncated".into()));
        }
        let num_bits = u64::from_le_bytes(slice8(&bytes[0..8])?);
        let num_hashes = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if num_bits == 0 || num_bits % 64 != 0 || num_hashes == 0 {
            return Err(GraphError::InvalidFormat(format!(
                "Bloom filter geometry invalid: bits={} hashes={}",
                num_bits, num_hashes
            )));
        }
        let word_count = (num_bits / 64) as usize;
        let body = bytes
            .get(HEADER_LEN..HEADER_LEN + word_count * 8)
            .ok_or_else(|| GraphError::InvalidFormat("Bloom filter body truncated".into()))?;
        let words = body
            .chunks_exact(8)
            .map(slice8)
            .map(|r| r.map(u64::from_le_bytes))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { words, num_bits, num_hashes })
    }
}

#[inline]
fn probe_bits(key: u128, num_hashes: u32, num_bits: u64) -> impl Iterator<Item = u64> {
    let h1 = key as u64;
    let h2 = ((key >> 64) as u64) | 1;
    (0..num_hashes as u64).map(move |i| h1.wrapping_add(i.wrapping_mul(h2)) % num_bits)
}

fn slice8(b: &[u8]) -> Result<[u8; 8]> {
    b.try_into()
        .map_err(|_| GraphError::InvalidFormat("expected 8 bytes".into()))
}
