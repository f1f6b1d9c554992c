//! Exact inner-product similarity indexes over the reference corpus.

use crate::embeddings::{dot, FusedEmbedding, VectorError};
use crate::mechanism::FusionWeights;

/// Append-only flat index; search is brute-force and exact.
#[derive(Debug, Clone)]
pub struct SimilarityIndex {
    dimension: Option<usize>,
    ids: Vec<String>,
    vectors: Vec<f32>,
}

/// One search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor<'a> {
    /// Post identifier stored with the vector.
    pub post_id: &'a str,
    /// Inner product with the query.
    pub score: f32,
    /// Insertion position inside the index.
    pub position: usize,
}

impl SimilarityIndex {
    /// Creates an empty index; the dimension is fixed by the first insert.
    pub fn new() -> Self {
        Self {
            dimension: None,
            ids: Vec::new(),
            vectors: Vec::new(),
        }
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Vector dimension, once known.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Identifiers in insertion order.
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Appends a vector under `post_id`.
    pub fn add(&mut self, post_id: &str, vector: &FusedEmbedding) -> Result<(), VectorError> {
        let dim = vector.dimension();
        match self.dimension {
            Some(expected) if expected != dim => {
                return Err(VectorError::DimensionMismatch {
                    expected,
                    actual: dim,
                })
            }
            None => self.dimension = Some(dim),
            _ => {}
        }
        self.ids.push(post_id.to_string());
        self.vectors.extend_from_slice(vector.as_slice());
        Ok(())
    }

    /// Top-`k` vectors by descending inner product; ties keep insertion order.
    pub fn search(&self, query: &FusedEmbedding, k: usize) -> Result<Vec<Neighbor<'_>>, VectorError> {
        let Some(dim) = self.dimension else {
            return Ok(Vec::new());
        };
        if query.dimension() != dim {
            return Err(VectorError::DimensionMismatch {
                expected: dim,
                actual: query.dimension(),
            });
        }
        let mut hits: Vec<Neighbor<'_>> = self
            .vectors
            .chunks_exact(dim)
            .zip(&self.ids)
            .enumerate()
            .map(|(position, (vector, id))| Neighbor {
                post_id: id.as_str(),
                score: dot(vector, query.as_slice()),
                position,
            })
            .collect();
        // sort_by is stable, so equal scores stay in insertion order.
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(k);
        Ok(hits)
    }
}

impl Default for SimilarityIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// One index per distinct fusion weight pair.
#[derive(Debug, Clone, Default)]
pub struct FusionIndexes {
    entries: Vec<(FusionWeights, SimilarityIndex)>,
}

impl FusionIndexes {
    /// Creates empty indexes for each weight pair.
    pub fn new(weights: &[FusionWeights]) -> Self {
        let mut entries: Vec<(FusionWeights, SimilarityIndex)> = Vec::new();
        for w in weights {
            if !entries.iter().any(|(existing, _)| existing == w) {
                entries.push((*w, SimilarityIndex::new()));
            }
        }
        Self { entries }
    }

    /// Index built for `weights`.
    pub fn get(&self, weights: FusionWeights) -> Option<&SimilarityIndex> {
        self.entries
            .iter()
            .find(|(w, _)| *w == weights)
            .map(|(_, index)| index)
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = (FusionWeights, &mut SimilarityIndex)> {
        self.entries.iter_mut().map(|(w, index)| (*w, index))
    }
}
