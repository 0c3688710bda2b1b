//! DVVI: flat, append-only vector index with exact L2 search.
//!
//! File layout (little-endian):
//!
//! ```text
//! [magic "DVVI":4][version:u16][reserved:u16][dimension:u32][count:u64]
//! [count * dimension f32 values]
//! ```
//!
//! Slots are positional: the vector appended n-th lives at slot n. Slots
//! only move when the index is truncated, reset, or rebuilt through
//! [`VectorIndex::retain_slots`].

use std::path::Path;

use crate::{Error, Result};

const MAGIC: &[u8; 4] = b"DVVI";
const VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 2 + 4 + 8;

/// Position of a vector in the index.
pub type Slot = u64;

/// 8-lane unrolled squared Euclidean distance.
fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len();
    let chunks = n / 8;
    let mut lanes = [0.0f32; 8];

    for i in 0..chunks {
        let base = i * 8;
        for (lane, acc) in lanes.iter_mut().enumerate() {
            let d = a[base + lane] - b[base + lane];
            *acc += d * d;
        }
    }

    let mut tail = 0.0f32;
    for i in (chunks * 8)..n {
        let d = a[i] - b[i];
        tail += d * d;
    }
    (lanes[0] + lanes[1]) + (lanes[2] + lanes[3]) + (lanes[4] + lanes[5]) + (lanes[6] + lanes[7])
        + tail
}

/// In-memory flat vector index.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl VectorIndex {
    /// Empty index of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of stored vectors; also the next slot to be assigned.
    pub fn size(&self) -> usize {
        if self.dimension == 0 {
            return 0;
        }
        self.data.len() / self.dimension
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append vectors in order, returning the slot of the first one.
    ///
    /// Every vector is checked before any is stored, so a dimension
    /// mismatch leaves the index untouched.
    pub fn append<V: AsRef<[f32]>>(&mut self, vectors: &[V]) -> Result<Slot> {
        if let Some(bad) = vectors.iter().find(|v| v.as_ref().len() != self.dimension) {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: bad.as_ref().len(),
            });
        }
        let first = self.size() as Slot;
        self.data.reserve(vectors.len() * self.dimension);
        for vector in vectors {
            self.data.extend_from_slice(vector.as_ref());
        }
        Ok(first)
    }

    /// Vector stored at `slot`.
    pub fn vector(&self, slot: Slot) -> Option<&[f32]> {
        let slot = usize::try_from(slot).ok()?;
        if slot >= self.size() {
            return None;
        }
        let start = slot * self.dimension;
        Some(&self.data[start..start + self.dimension])
    }

    /// Exact k-nearest-neighbour search.
    ///
    /// Returns `(slot, distance)` pairs sorted by ascending L2 distance,
    /// ties broken by the smaller slot, at most `min(k, size())` long.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(Slot, f32)>> {
        if query.len() != self.dimension {
            return Err(Error::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if self.is_empty() {
            return Err(Error::EmptyIndex);
        }

        let mut scored: Vec<(Slot, f32)> = self
            .data
            .chunks_exact(self.dimension)
            .enumerate()
            .map(|(slot, vector)| (slot as Slot, squared_l2(query, vector).sqrt()))
            .collect();
        scored.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    /// Drop every slot at or beyond `new_size`.
    pub fn truncate(&mut self, new_size: usize) -> Result<()> {
        let current = self.size();
        if new_size > current {
            return Err(Error::InvalidSize {
                requested: new_size,
                current,
            });
        }
        self.data.truncate(new_size * self.dimension);
        Ok(())
    }

    /// Remove all vectors, keeping the dimension.
    pub fn reset(&mut self) {
        self.data.clear();
    }

    /// Build a new index holding only `keep`, in the given order.
    ///
    /// The vector at `keep[i]` ends up at slot `i`.
    pub fn retain_slots(&self, keep: &[Slot]) -> Result<Self> {
        let mut data = Vec::with_capacity(keep.len() * self.dimension);
        for &slot in keep {
            let vector = self.vector(slot).ok_or_else(|| Error::InvalidSize {
                requested: usize::try_from(slot).unwrap_or(usize::MAX),
                current: self.size(),
            })?;
            data.extend_from_slice(vector);
        }
        Ok(Self {
            dimension: self.dimension,
            data,
        })
    }

    /// Serialize to the DVVI byte format.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&(self.dimension as u32).to_le_bytes());
        buf.extend_from_slice(&(self.size() as u64).to_le_bytes());
        for value in &self.data {
            buf.extend_from_slice(&value.to_le_bytes());
        }
        buf
    }

    /// Parse the DVVI byte format, validating magic, version and length.
    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(invalid("truncated header"));
        }
        if &bytes[0..4] != MAGIC {
            return Err(invalid("bad DVVI magic"));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            return Err(invalid(&format!("unsupported DVVI version: {version}")));
        }
        let dimension = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        if dimension == 0 {
            return Err(invalid("zero dimension"));
        }
        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[12..20]);
        let count = usize::try_from(u64::from_le_bytes(count_bytes))
            .map_err(|_| invalid("count overflows usize"))?;

        let expected = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(4))
            .and_then(|n| n.checked_add(HEADER_LEN))
            .ok_or_else(|| invalid("count overflows usize"))?;
        if bytes.len() != expected {
            return Err(invalid(&format!(
                "length mismatch: header implies {expected} bytes, found {}",
                bytes.len()
            )));
        }

        let data = bytes[HEADER_LEN..]
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(Self { dimension, data })
    }

    /// Write the index to `path` via a temp file and rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        crate::snapshot::write_atomic(path, &self.serialize())
    }

    /// Read an index previously written by [`VectorIndex::save`].
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).map_err(|e| Error::snapshot_io(path, e))?;
        Self::deserialize(&bytes)
    }
}

fn invalid(msg: &str) -> Error {
    Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, msg.to_string()))
}
