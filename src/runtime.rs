//! Run loop: index the references, then annotate every pending task post.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backoff::Sleeper;
use crate::cache::CoverCache;
use crate::controls::{AnnotationControls, Mode};
use crate::embedder::MultimodalEncoder;
use crate::error::AttemptError;
use crate::executor::{CallCounters, Executor, GroupOutcome};
use crate::indexer::{build_reference_index, embed_post};
use crate::ledger::{Ledger, OutputRecord};
use crate::mechanism::GroupPlan;
use crate::metadata::{MetadataStore, PostRecord};
use crate::prompt::{Exemplar, PromptAssembler};
use crate::retrieval::Retriever;

/// Reason recorded when a task post cannot be embedded or queried.
pub const EMBEDDING_FAILED_REASON: &str = "EMBEDDING_FAILED";

/// Clients and shared state a run borrows.
pub struct RunContext<'a> {
    /// Unified metadata.
    pub store: &'a MetadataStore,
    /// Prompt renderer.
    pub assembler: &'a PromptAssembler,
    /// Cover bytes cache.
    pub covers: &'a mut CoverCache,
    /// Chat backend.
    pub provider: &'a dyn crate::llm::LlmProvider,
    /// Embedding backend; required in retrieval mode.
    pub encoder: Option<&'a dyn MultimodalEncoder>,
    /// Wait strategy for backoff, pauses and the row delay.
    pub sleeper: &'a dyn Sleeper,
}

/// Retry settings echoed into the statistics file.
#[derive(Debug, Clone, Serialize)]
pub struct RetrySettings {
    /// Content-invalid attempts per group.
    pub max_invalid_attempts: u32,
    /// Backoff retries per group.
    pub rate_limit_max_retry: u32,
    /// First backoff delay, seconds.
    pub rate_limit_base_sleep: f64,
    /// Backoff cap, seconds.
    pub rate_limit_max_sleep: f64,
    /// Jitter fraction.
    pub rate_limit_jitter: f64,
    /// Pause after each post, seconds.
    pub sleep_per_row_sec: f64,
}

/// Summary written to `stats.json` at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunStats {
    /// Chat model name.
    pub model_name: String,
    /// `rag` or `zero-shot`.
    pub mode: &'static str,
    /// Group plan in `--groups` syntax.
    pub groups: String,
    /// Reference table.
    pub reference_csv: Option<PathBuf>,
    /// Task table.
    pub task_csv: PathBuf,
    /// Golden-label table.
    pub labels_csv: Option<PathBuf>,
    /// Output table.
    pub output_csv: PathBuf,
    /// Resumable log.
    pub output_jsonl: PathBuf,
    /// Reference posts in the index.
    pub indexed_references: usize,
    /// Reference posts left out after a cover or encoder failure.
    pub skipped_references: usize,
    /// Requests sent to the model.
    pub total_model_calls: u64,
    /// Requests that spent a content-invalid attempt.
    pub invalid_model_calls: u64,
    /// `invalid / total`.
    pub invalid_rate: f64,
    /// Rows written by this run.
    pub processed_rows: usize,
    /// Task posts already in the ledger.
    pub skipped_rows: usize,
    /// Rows with at least one zero-label fallback.
    pub fallback_rows: usize,
    /// Rows in the ledger after the run.
    pub done_rows: usize,
    /// Cover lookups served from memory.
    pub cover_cache_hits: u64,
    /// Cover lookups that reached storage.
    pub cover_cache_misses: u64,
    /// Retry settings in effect.
    pub settings: RetrySettings,
}

/// Runs one annotation pass and writes `stats.json`.
pub fn run<R: Rng>(controls: &AnnotationControls, ctx: RunContext<'_>, rng: R) -> Result<RunStats> {
    let RunContext {
        store,
        assembler,
        covers,
        provider,
        encoder,
        sleeper,
    } = ctx;

    let retrieval = match controls.mode {
        Mode::Rag => {
            let Some(encoder) = encoder else {
                bail!("rag mode requires an embedding encoder");
            };
            let index = build_reference_index(store, &controls.plan, encoder, covers)
                .context("failed to build reference index")?;
            Some((encoder, index))
        }
        Mode::ZeroShot => None,
    };
    let indexed_references = retrieval.as_ref().map_or(0, |(_, index)| index.indexed());
    let skipped_references = retrieval.as_ref().map_or(0, |(_, index)| index.skipped());
    let retriever = retrieval
        .as_ref()
        .map(|(encoder, index)| (*encoder, Retriever::new(index, store, controls.top_k)));

    // Opened only once the index exists; a fresh run truncates it.
    let mut ledger = Ledger::open(
        &controls.output_dir,
        controls.mode.column_style(),
        controls.resume,
    )
    .with_context(|| format!("failed to open ledger in {}", controls.output_dir.display()))?;

    let mut executor = Executor::new(provider, sleeper, controls.retry, rng);
    let tasks = store.task_ids();
    info!(
        mode = controls.mode.as_str(),
        tasks = tasks.len(),
        done = ledger.done_count(),
        groups = %controls.plan,
        "annotation started"
    );

    let mut processed = 0usize;
    let mut skipped = 0usize;
    let mut fallbacks = 0usize;
    for (position, post_id) in tasks.iter().enumerate() {
        if ledger.is_done(post_id) {
            skipped += 1;
            debug!(post_id = %post_id, "already annotated; skipping");
            continue;
        }
        let Some(record) = store.get(post_id) else {
            continue;
        };

        let annotation = annotate_post(
            record,
            &controls.plan,
            assembler,
            covers,
            retriever.as_ref().map(|(e, r)| (*e, r)),
            &mut executor,
        );
        if annotation.fallback {
            fallbacks += 1;
        }
        ledger
            .append(&annotation.record)
            .with_context(|| format!("failed to record {post_id}"))?;
        processed += 1;
        info!(
            post_id = %post_id,
            position = position + 1,
            total = tasks.len(),
            fallback = annotation.fallback,
            "post annotated"
        );
        if !controls.row_delay.is_zero() {
            sleeper.sleep(controls.row_delay);
        }
    }

    let counters: CallCounters = executor.counters();
    let backoff = controls.retry.backoff;
    let stats = RunStats {
        model_name: provider.model().to_string(),
        mode: controls.mode.as_str(),
        groups: controls.plan.to_string(),
        reference_csv: controls.inputs.reference.clone(),
        task_csv: controls.inputs.tasks.clone(),
        labels_csv: controls.inputs.labels.clone(),
        output_csv: ledger.paths().csv.clone(),
        output_jsonl: ledger.paths().jsonl.clone(),
        indexed_references,
        skipped_references,
        total_model_calls: counters.total_calls,
        invalid_model_calls: counters.invalid_calls,
        invalid_rate: counters.invalid_rate(),
        processed_rows: processed,
        skipped_rows: skipped,
        fallback_rows: fallbacks,
        done_rows: ledger.done_count(),
        cover_cache_hits: covers.hits(),
        cover_cache_misses: covers.misses(),
        settings: RetrySettings {
            max_invalid_attempts: controls.retry.max_invalid,
            rate_limit_max_retry: controls.retry.max_retryable,
            rate_limit_base_sleep: backoff.base.as_secs_f64(),
            rate_limit_max_sleep: backoff.cap.as_secs_f64(),
            rate_limit_jitter: backoff.jitter,
            sleep_per_row_sec: controls.row_delay.as_secs_f64(),
        },
    };
    ledger
        .write_stats(&stats)
        .context("failed to write run statistics")?;
    info!(
        total_calls = stats.total_model_calls,
        invalid_calls = stats.invalid_model_calls,
        invalid_rate = stats.invalid_rate,
        processed,
        skipped,
        fallbacks,
        "annotation finished"
    );
    Ok(stats)
}

struct Annotation {
    record: OutputRecord,
    fallback: bool,
}

impl Annotation {
    fn failed(record: &PostRecord, reason: &str) -> Self {
        Self {
            record: OutputRecord::fallback(&record.post_id, &record.title, reason),
            fallback: true,
        }
    }
}

/// Resolves every group for one post. Never fails: problems become fallbacks.
fn annotate_post<R: Rng>(
    record: &PostRecord,
    plan: &GroupPlan,
    assembler: &PromptAssembler,
    covers: &mut CoverCache,
    retrieval: Option<(&dyn MultimodalEncoder, &Retriever<'_>)>,
    executor: &mut Executor<'_, R>,
) -> Annotation {
    let cover = match covers.fetch(&record.cover_key) {
        Ok(bytes) => bytes,
        Err(err) => {
            let err = AttemptError::from(err);
            warn!(post_id = %record.post_id, error = %err, "task cover unavailable");
            return Annotation::failed(record, &err.reason());
        }
    };

    // Retrieval runs for every group before any model call so a failure
    // costs no requests.
    let mut exemplars_by_group: Vec<Vec<Exemplar<'_>>> = Vec::with_capacity(plan.groups().len());
    if let Some((encoder, retriever)) = retrieval {
        let embedding = match embed_post(&record.title, &cover, encoder) {
            Ok(embedding) => embedding,
            Err(err) => {
                warn!(post_id = %record.post_id, error = %err, "task embedding failed");
                return Annotation::failed(record, EMBEDDING_FAILED_REASON);
            }
        };
        for group in plan.groups() {
            let hits = match retriever.retrieve(&embedding, group) {
                Ok(hits) => hits,
                Err(err) => {
                    warn!(post_id = %record.post_id, group = group.name(), error = %err, "retrieval failed");
                    return Annotation::failed(record, EMBEDDING_FAILED_REASON);
                }
            };
            let exemplars = hits
                .into_iter()
                .map(|hit| {
                    let image = covers
                        .fetch(&hit.record.cover_key)
                        .map_err(|err| {
                            debug!(post_id = %hit.record.post_id, error = %err, "exemplar cover unavailable");
                        })
                        .ok();
                    Exemplar {
                        record: hit.record,
                        image,
                        score: hit.score,
                    }
                })
                .collect();
            exemplars_by_group.push(exemplars);
        }
    }

    let mut labels = [0u8; crate::mechanism::MECHANISM_COUNT as usize];
    let mut notes = Vec::with_capacity(plan.groups().len());
    let mut fallback = false;
    for (idx, group) in plan.groups().iter().enumerate() {
        let exemplars = exemplars_by_group.get(idx).map_or(&[][..], Vec::as_slice);
        let prompt = assembler.assemble(group, record, &cover, exemplars);
        let note = match executor.run_group(&record.post_id, group, &prompt) {
            GroupOutcome::Success(result) => {
                for (mechanism, bit) in result.iter() {
                    labels[mechanism.index()] = bit;
                }
                result.reasoning().to_string()
            }
            GroupOutcome::Exhausted { reason } => {
                fallback = true;
                format!("FAILED:{reason}")
            }
        };
        notes.push((group.name(), note));
    }

    let reasoning = if notes.len() == 1 {
        notes.pop().map(|(_, note)| note).unwrap_or_default()
    } else {
        notes
            .iter()
            .map(|(name, note)| format!("{name}: {note}"))
            .collect::<Vec<_>>()
            .join(" | ")
    };
    Annotation {
        record: OutputRecord {
            post_id: record.post_id.clone(),
            labels,
            title: record.title.clone(),
            reasoning,
        },
        fallback,
    }
}
