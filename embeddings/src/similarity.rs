//! Distance and similarity computation for embeddings.

use crate::error::{EmbeddingError, Result};

/// Compute the squared euclidean distance between two embeddings.
///
/// This is the metric used by [`crate::FlatL2Index`]; the square root is
/// never taken.
pub fn squared_l2(a: &[f32], b: &[f32]) -> Result<f32> {
    if a.len() != b.len() {
        return Err(EmbeddingError::DimensionMismatch {
            expected: a.len(),
            actual: b.len(),
        });
    }

    Ok(squared_l2_unchecked(a, b))
}

pub(crate) fn squared_l2_unchecked(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Convert a squared L2 distance into a similarity score.
///
/// Computes `1 / (1 + d)`: 1.0 for identical vectors, approaching 0.0 as
/// the distance grows. Scores produced by earlier catalogs use the same
/// formula, so it must not change.
pub fn similarity_from_distance(distance: f32) -> f32 {
    1.0 / (1.0 + distance)
}

/// Normalize an embedding to unit length.
pub fn normalize(embedding: &mut [f32]) {
    let magnitude: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
    if magnitude > 0.0 {
        for x in embedding.iter_mut() {
            *x /= magnitude;
        }
    }
}
