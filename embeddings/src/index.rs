//! Exact nearest-neighbour index over dense vectors.

use std::path::Path;

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::error::{EmbeddingError, Result};
use crate::similarity::squared_l2_unchecked;

const MAGIC: &[u8; 4] = b"XFLT";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

/// A search hit: the insertion position of the stored vector and its squared
/// L2 distance from the query.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Position of the vector in insertion order.
    pub position: usize,

    /// Squared euclidean distance to the query.
    pub distance: f32,
}

/// A flat index that compares the query against every stored vector.
///
/// Vectors are addressed by insertion position, which callers use to map a
/// hit back to whatever record the vector was built from. The index is never
/// mutated after it has been shared for search.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatL2Index {
    /// Dimension of every stored vector.
    dimension: usize,

    /// Row-major vector storage, `len * dimension` floats.
    data: Vec<f32>,
}

impl FlatL2Index {
    /// Create an empty index for vectors of the given dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
        }
    }

    /// Build an index from vectors, in order.
    pub fn from_vectors(dimension: usize, vectors: &[Vec<f32>]) -> Result<Self> {
        let mut index = Self::new(dimension);
        index.data.reserve(vectors.len() * dimension);
        for vector in vectors {
            index.add(vector)?;
        }
        Ok(index)
    }

    /// Dimension of the stored vectors.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        if self.dimension == 0 {
            0
        } else {
            self.data.len() / self.dimension
        }
    }

    /// Check if the index is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a vector. Its position is the previous `len()`.
    ///
    /// Vectors with NaN or infinite components are rejected, since they could
    /// not be read back from disk.
    pub fn add(&mut self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        if !vector.iter().all(|x| x.is_finite()) {
            return Err(EmbeddingError::InvalidResponse(
                "embedding contains non-finite values".to_string(),
            ));
        }
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// Get the vector stored at a position.
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        let start = position.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Iterate over stored vectors in insertion order.
    pub fn vectors(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dimension.max(1))
    }

    /// Find the `min(k, len)` nearest vectors to `query`.
    ///
    /// Results are in ascending distance order; equal distances keep
    /// insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        if query.len() != self.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if !query.iter().all(|x| x.is_finite()) {
            return Err(EmbeddingError::InvalidResponse(
                "query embedding contains non-finite values".to_string(),
            ));
        }

        let k = k.min(self.len());
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(OrderedFloat<f32>, usize)> = self
            .vectors()
            .enumerate()
            .map(|(position, vector)| (OrderedFloat(squared_l2_unchecked(query, vector)), position))
            .collect();

        scored.sort_unstable();
        scored.truncate(k);

        Ok(scored
            .into_iter()
            .map(|(distance, position)| Neighbor {
                position,
                distance: distance.0,
            })
            .collect())
    }

    /// Encode the index in its binary on-disk format.
    ///
    /// Layout (little-endian): magic, format version `u32`, dimension `u32`,
    /// vector count `u64`, then the vectors as `f32`.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let dimension = u32::try_from(self.dimension).map_err(|_| {
            EmbeddingError::CorruptIndex(format!("dimension {} does not fit u32", self.dimension))
        })?;

        let mut bytes = Vec::with_capacity(HEADER_LEN + std::mem::size_of_val(self.data.as_slice()));
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&dimension.to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        for &value in &self.data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Ok(bytes)
    }

    /// Decode an index from its binary on-disk format.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(EmbeddingError::CorruptIndex(format!(
                "header truncated: {} bytes",
                bytes.len()
            )));
        }
        if &bytes[0..4] != MAGIC {
            return Err(EmbeddingError::CorruptIndex("bad magic".to_string()));
        }

        let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if version != FORMAT_VERSION {
            return Err(EmbeddingError::CorruptIndex(format!(
                "unsupported format version {version}"
            )));
        }

        let dimension = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
        if dimension == 0 {
            return Err(EmbeddingError::CorruptIndex("zero dimension".to_string()));
        }

        let mut count_bytes = [0u8; 8];
        count_bytes.copy_from_slice(&bytes[12..HEADER_LEN]);
        let count = usize::try_from(u64::from_le_bytes(count_bytes))
            .map_err(|_| EmbeddingError::CorruptIndex("vector count overflow".to_string()))?;

        let expected_len = count
            .checked_mul(dimension)
            .and_then(|n| n.checked_mul(std::mem::size_of::<f32>()))
            .ok_or_else(|| EmbeddingError::CorruptIndex("body length overflow".to_string()))?;
        let body = &bytes[HEADER_LEN..];
        if body.len() != expected_len {
            return Err(EmbeddingError::CorruptIndex(format!(
                "invalid body length: expected {expected_len}, got {}",
                body.len()
            )));
        }

        let mut data = Vec::with_capacity(count * dimension);
        for chunk in body.chunks_exact(4) {
            let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if !value.is_finite() {
                return Err(EmbeddingError::CorruptIndex(
                    "index contains non-finite values".to_string(),
                ));
            }
            data.push(value);
        }

        Ok(Self { dimension, data })
    }

    /// Write the index to a file.
    pub async fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_bytes()?).await?;
        debug!("Wrote {} vectors to {}", self.len(), path.display());
        Ok(())
    }

    /// Read an index from a file.
    pub async fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).await?;
        let index = Self::from_bytes(&bytes)?;
        debug!("Read {} vectors from {}", index.len(), path.display());
        Ok(index)
    }
}
