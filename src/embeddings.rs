//! Shared embedding math: unit normalization and weighted text/image fusion.

use thiserror::Error;

use crate::mechanism::FusionWeights;

/// Tolerance used when asserting unit length.
pub const UNIT_NORM_TOLERANCE: f32 = 1e-4;

/// Errors produced while normalizing or combining vectors.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VectorError {
    /// Vector with no components.
    #[error("embedding is empty")]
    Empty,
    /// Vector containing NaN or infinite components.
    #[error("embedding contains non-finite values")]
    NonFinite,
    /// Vector whose length is zero, so it has no direction.
    #[error("embedding has zero norm")]
    ZeroNorm,
    /// Vectors that cannot be combined or compared.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension required by the other operand or the index.
        expected: usize,
        /// Dimension actually supplied.
        actual: usize,
    },
}

/// Euclidean length, accumulated in `f64`.
pub fn l2_norm(vector: &[f32]) -> f32 {
    vector
        .iter()
        .map(|v| f64::from(*v) * f64::from(*v))
        .sum::<f64>()
        .sqrt() as f32
}

/// Inner product of two equal-length vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum::<f64>() as f32
}

/// Returns `vector / ‖vector‖`.
pub fn normalize(vector: &[f32]) -> Result<Vec<f32>, VectorError> {
    if vector.is_empty() {
        return Err(VectorError::Empty);
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(VectorError::NonFinite);
    }
    let norm = l2_norm(vector);
    if norm <= f32::EPSILON {
        return Err(VectorError::ZeroNorm);
    }
    Ok(vector.iter().map(|v| v / norm).collect())
}

/// Unit-norm vector produced by fusing a text and an image embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedEmbedding(Vec<f32>);

impl FusedEmbedding {
    /// Normalizes an arbitrary vector into a fused embedding.
    pub fn from_raw(vector: &[f32]) -> Result<Self, VectorError> {
        normalize(vector).map(Self)
    }

    /// Vector components.
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Number of components.
    pub fn dimension(&self) -> usize {
        self.0.len()
    }
}

/// Per-post text and image embeddings, each already unit-normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct PostEmbedding {
    text: Vec<f32>,
    image: Vec<f32>,
}

impl PostEmbedding {
    /// Normalizes the raw encoder outputs; both must share one dimension.
    pub fn new(text: &[f32], image: &[f32]) -> Result<Self, VectorError> {
        if text.len() != image.len() {
            return Err(VectorError::DimensionMismatch {
                expected: text.len(),
                actual: image.len(),
            });
        }
        Ok(Self {
            text: normalize(text)?,
            image: normalize(image)?,
        })
    }

    /// `normalize(w_t * text + w_i * image)`.
    pub fn fuse(&self, weights: FusionWeights) -> Result<FusedEmbedding, VectorError> {
        let combined: Vec<f32> = self
            .text
            .iter()
            .zip(&self.image)
            .map(|(t, i)| weights.text() * t + weights.image() * i)
            .collect();
        FusedEmbedding::from_raw(&combined)
    }
}
