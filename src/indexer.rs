//! Builds the per-fusion similarity indexes over the reference corpus.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::CoverCache;
use crate::embedder::{EncodeError, MultimodalEncoder};
use crate::embeddings::{FusedEmbedding, PostEmbedding, VectorError};
use crate::mechanism::{FusionWeights, GroupPlan};
use crate::metadata::MetadataStore;
use crate::vector_store::{FusionIndexes, SimilarityIndex};

/// Failure to embed a single post.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// Encoder call failed.
    #[error(transparent)]
    Encode(#[from] EncodeError),
    /// Encoder output was unusable.
    #[error(transparent)]
    Vector(#[from] VectorError),
}

/// Index build failures that abort a retrieval run.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Every reference post failed to fetch or encode.
    #[error("no reference post could be indexed ({skipped} skipped)")]
    Empty {
        /// Posts that were attempted and skipped.
        skipped: usize,
    },
}

/// Embeds a title and cover with the shared encoder.
pub fn embed_post(
    title: &str,
    cover: &[u8],
    encoder: &dyn MultimodalEncoder,
) -> Result<PostEmbedding, EmbedError> {
    let text = encoder.embed_text(title)?;
    let image = encoder.embed_image(cover)?;
    Ok(PostEmbedding::new(&text, &image)?)
}

/// Reference-only indexes, one per distinct fusion in the plan.
#[derive(Debug)]
pub struct ReferenceIndex {
    indexes: FusionIndexes,
    indexed: usize,
    skipped: usize,
}

impl ReferenceIndex {
    /// Index bound to `weights`.
    pub fn get(&self, weights: FusionWeights) -> Option<&SimilarityIndex> {
        self.indexes.get(weights)
    }

    /// Posts present in every index.
    pub fn indexed(&self) -> usize {
        self.indexed
    }

    /// Reference posts left out after a fetch or encode failure.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

/// Embeds every reference post and adds one fused vector per fusion variant.
/// Posts whose cover or encoding fails are left out of all indexes.
pub fn build_reference_index(
    store: &MetadataStore,
    plan: &GroupPlan,
    encoder: &dyn MultimodalEncoder,
    covers: &mut CoverCache,
) -> Result<ReferenceIndex, IndexError> {
    let weights = plan.distinct_weights();
    let mut indexes = FusionIndexes::new(&weights);
    let mut indexed = 0usize;
    let mut skipped = 0usize;

    for post_id in store.reference_ids() {
        let Some(record) = store.get(post_id) else {
            continue;
        };
        let cover = match covers.fetch(&record.cover_key) {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(post_id, error = %err, "reference cover unavailable; skipping");
                skipped += 1;
                continue;
            }
        };
        let fused = embed_post(&record.title, &cover, encoder)
            .and_then(|embedding| fuse_all(&embedding, &weights).map_err(EmbedError::from));
        let fused = match fused {
            Ok(fused) => fused,
            Err(err) => {
                warn!(post_id, error = %err, "reference embedding failed; skipping");
                skipped += 1;
                continue;
            }
        };
        if let Err(err) = add_to_all(&mut indexes, post_id, &fused) {
            warn!(post_id, error = %err, "reference vector rejected; skipping");
            skipped += 1;
            continue;
        }
        debug!(post_id, "indexed reference post");
        indexed += 1;
    }

    if indexed == 0 {
        return Err(IndexError::Empty { skipped });
    }
    info!(indexed, skipped, fusions = weights.len(), "reference index built");
    Ok(ReferenceIndex {
        indexes,
        indexed,
        skipped,
    })
}

fn fuse_all(
    embedding: &PostEmbedding,
    weights: &[FusionWeights],
) -> Result<Vec<(FusionWeights, FusedEmbedding)>, VectorError> {
    weights
        .iter()
        .map(|w| embedding.fuse(*w).map(|fused| (*w, fused)))
        .collect()
}

// Checks every index before touching any, so a post lands in all or none.
fn add_to_all(
    indexes: &mut FusionIndexes,
    post_id: &str,
    fused: &[(FusionWeights, FusedEmbedding)],
) -> Result<(), VectorError> {
    for (weights, vector) in fused {
        if let Some(expected) = indexes.get(*weights).and_then(SimilarityIndex::dimension) {
            if expected != vector.dimension() {
                return Err(VectorError::DimensionMismatch {
                    expected,
                    actual: vector.dimension(),
                });
            }
        }
    }
    for (weights, index) in indexes.iter_mut() {
        if let Some((_, vector)) = fused.iter().find(|(w, _)| *w == weights) {
            index.add(post_id, vector)?;
        }
    }
    Ok(())
}
