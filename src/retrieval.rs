//! Per-group exemplar retrieval for a task post.

use thiserror::Error;

use crate::embeddings::{PostEmbedding, VectorError};
use crate::indexer::ReferenceIndex;
use crate::mechanism::{FusionWeights, MechanismGroup};
use crate::metadata::{MetadataStore, PostRecord};

/// Default number of exemplars per group.
pub const DEFAULT_TOP_K: usize = 4;

/// Retrieval failures for one (task, group) query.
#[derive(Debug, Error)]
pub enum RetrievalError {
    /// No index was built for the group's fusion.
    #[error("no index for fusion {0}")]
    MissingIndex(FusionWeights),
    /// Query could not be fused or compared.
    #[error(transparent)]
    Vector(#[from] VectorError),
}

/// A reference post surfaced for a task.
#[derive(Debug, Clone, PartialEq)]
pub struct Retrieved<'a> {
    /// Reference record.
    pub record: &'a PostRecord,
    /// Inner product with the group's query vector.
    pub score: f32,
}

/// Queries the reference indexes with a group's fused vector.
pub struct Retriever<'a> {
    index: &'a ReferenceIndex,
    store: &'a MetadataStore,
    top_k: usize,
}

impl<'a> Retriever<'a> {
    /// Retriever returning at most `top_k` exemplars per group.
    pub fn new(index: &'a ReferenceIndex, store: &'a MetadataStore, top_k: usize) -> Self {
        Self {
            index,
            store,
            top_k,
        }
    }

    /// Top-K reference posts for `query` fused with `group`'s weights.
    pub fn retrieve(
        &self,
        query: &PostEmbedding,
        group: &MechanismGroup,
    ) -> Result<Vec<Retrieved<'a>>, RetrievalError> {
        let weights = group.weights();
        let index = self
            .index
            .get(weights)
            .ok_or(RetrievalError::MissingIndex(weights))?;
        let fused = query.fuse(weights)?;
        let hits = index.search(&fused, self.top_k)?;
        let store: &'a MetadataStore = self.store;
        Ok(hits
            .into_iter()
            .filter(|hit| !store.is_task(hit.post_id))
            .filter_map(|hit| {
                store.get(hit.post_id).map(|record| Retrieved {
                    record,
                    score: hit.score,
                })
            })
            .collect())
    }
}
