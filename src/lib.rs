#![warn(missing_docs)]
//! Retrieval-augmented multimodal annotation of social posts for persuasion hooks.

pub mod backoff;
pub mod cache;
pub mod controls;
pub mod embedder;
pub mod embeddings;
pub mod error;
pub mod executor;
pub mod extract;
pub mod indexer;
pub mod ledger;
pub mod llm;
pub mod mechanism;
pub mod metadata;
pub mod prompt;
pub mod response;
pub mod retrieval;
pub mod runtime;
pub mod storage;
pub mod vector_store;

pub use backoff::{BackoffPolicy, Sleeper, ThreadSleeper};
pub use cache::{CoverCache, DEFAULT_COVER_CACHE_CAPACITY};
pub use controls::{AnnotationControls, Cli, InputPaths, Mode};
pub use embedder::{EncodeError, HttpClipEncoder, MultimodalEncoder};
pub use embeddings::{FusedEmbedding, PostEmbedding};
pub use error::AttemptError;
pub use executor::{CallCounters, Executor, GroupOutcome, RetryPolicy};
pub use indexer::{build_reference_index, ReferenceIndex};
pub use ledger::{ColumnStyle, Ledger, LedgerError, LedgerPaths, OutputRecord};
pub use llm::{ChatRequest, LlmProvider, OpenAiChatProvider, ProviderError};
pub use mechanism::{FusionWeights, GroupPlan, Mechanism, MechanismGroup, PlanError};
pub use metadata::{MetadataError, MetadataStore, PostRecord, SourceRole};
pub use prompt::{CalibrationCase, ContentPart, Prompt, PromptAssembler};
pub use response::{HookLabels, ValidationError};
pub use retrieval::{Retrieved, Retriever};
pub use runtime::{run as run_annotation, RunContext, RunStats};
pub use storage::{FetchError, HttpObjectStore, LocalObjectStore, ObjectStore};
pub use vector_store::SimilarityIndex;
