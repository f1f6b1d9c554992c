//! Run configuration and the command-line surface that produces it.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::{Parser, ValueEnum};

use crate::backoff::BackoffPolicy;
use crate::cache::DEFAULT_COVER_CACHE_CAPACITY;
use crate::executor::RetryPolicy;
use crate::ledger::ColumnStyle;
use crate::mechanism::GroupPlan;
use crate::retrieval::DEFAULT_TOP_K;

/// How exemplars are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Retrieval-augmented, one call per mechanism group.
    Rag,
    /// Definitions only, one call per post.
    ZeroShot,
}

impl Mode {
    /// Stable name used in logs and statistics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rag => "rag",
            Self::ZeroShot => "zero-shot",
        }
    }

    /// Output column naming for this mode.
    pub fn column_style(self) -> ColumnStyle {
        match self {
            Self::Rag => ColumnStyle::Prefixed,
            Self::ZeroShot => ColumnStyle::Bare,
        }
    }
}

/// Input tables for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPaths {
    /// Reference (exemplar) table.
    pub reference: Option<PathBuf>,
    /// Task table.
    pub tasks: PathBuf,
    /// Golden-label table merged into reference records.
    pub labels: Option<PathBuf>,
}

/// Everything the runtime needs besides its clients.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotationControls {
    /// Execution mode.
    pub mode: Mode,
    /// Mechanism partition and fusion bindings.
    pub plan: GroupPlan,
    /// Exemplars per group.
    pub top_k: usize,
    /// Skip posts already in the ledger.
    pub resume: bool,
    /// Executor budgets and call parameters.
    pub retry: RetryPolicy,
    /// Pause after each annotated post.
    pub row_delay: Duration,
    /// Ledger directory.
    pub output_dir: PathBuf,
    /// Input tables.
    pub inputs: InputPaths,
}

impl AnnotationControls {
    /// Defaults for `mode` reading tasks from `tasks`.
    pub fn new(mode: Mode, tasks: PathBuf, output_dir: PathBuf) -> Self {
        Self {
            mode,
            plan: match mode {
                Mode::Rag => GroupPlan::default_rag(),
                Mode::ZeroShot => GroupPlan::single(),
            },
            top_k: DEFAULT_TOP_K,
            resume: true,
            retry: RetryPolicy::default(),
            row_delay: Duration::from_secs(1),
            output_dir,
            inputs: InputPaths {
                reference: None,
                tasks,
                labels: None,
            },
        }
    }
}

/// Command-line interface for the annotator.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "hooktag-annotate",
    about = "Annotate social posts for persuasion hooks with a multimodal LLM"
)]
pub struct Cli {
    /// Execution mode
    #[arg(long, env = "HOOKTAG_MODE", value_enum, default_value_t = Mode::Rag)]
    pub mode: Mode,

    /// CSV of posts to annotate (post_id,title)
    #[arg(long, env = "HOOKTAG_TASK_CSV")]
    pub task_csv: PathBuf,

    /// CSV of labeled reference posts (post_id,title); required in rag mode
    #[arg(long, env = "HOOKTAG_REFERENCE_CSV")]
    pub reference_csv: Option<PathBuf>,

    /// CSV of golden labels with columns 1..8 or h1..h8
    #[arg(long, env = "HOOKTAG_LABELS_CSV")]
    pub labels_csv: Option<PathBuf>,

    /// Directory for predictions.csv, predictions.jsonl and stats.json
    #[arg(long, env = "HOOKTAG_OUTPUT_DIR", default_value = "results")]
    pub output_dir: PathBuf,

    /// Mechanism groups, e.g. "semantic-heavy=1,2,3,4,6@0.8:0.2;balanced-visual=5,7,8@0.5:0.5"
    #[arg(long, env = "HOOKTAG_GROUPS")]
    pub groups: Option<String>,

    /// Exemplars retrieved per group
    #[arg(long, env = "HOOKTAG_TOP_K", default_value_t = DEFAULT_TOP_K)]
    pub top_k: usize,

    /// Start a fresh ledger instead of resuming
    #[arg(long, env = "HOOKTAG_NO_RESUME", default_value_t = false)]
    pub no_resume: bool,

    /// OpenAI-compatible API root for chat completions
    #[arg(long, env = "HOOKTAG_LLM_BASE_URL", default_value = crate::llm::openai::DEFAULT_OPENAI_BASE_URL)]
    pub llm_base_url: String,

    /// Chat model name
    #[arg(long, env = "HOOKTAG_LLM_MODEL", default_value = "gpt-4o")]
    pub llm_model: String,

    /// API key for the chat service
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub llm_api_key: Option<String>,

    /// Chat request timeout in seconds
    #[arg(long, env = "HOOKTAG_LLM_TIMEOUT_SECS", default_value_t = 60)]
    pub llm_timeout_secs: u64,

    /// Completion token limit
    #[arg(long, env = "HOOKTAG_MAX_TOKENS")]
    pub max_tokens: Option<usize>,

    /// Do not request a JSON-object response format
    #[arg(long, env = "HOOKTAG_NO_JSON_MODE", default_value_t = false)]
    pub no_json_mode: bool,

    /// Embedding service root (POST {base}/embeddings); required in rag mode
    #[arg(long, env = "HOOKTAG_ENCODER_BASE_URL")]
    pub encoder_base_url: Option<String>,

    /// Multimodal embedding model name
    #[arg(long, env = "HOOKTAG_ENCODER_MODEL", default_value = "chinese-clip-vit-base-patch16")]
    pub encoder_model: String,

    /// API key for the embedding service
    #[arg(long, env = "HOOKTAG_ENCODER_API_KEY", hide_env_values = true)]
    pub encoder_api_key: Option<String>,

    /// Attempts per embedding request
    #[arg(long, env = "HOOKTAG_ENCODER_MAX_RETRIES", default_value_t = 3)]
    pub encoder_max_retries: usize,

    /// Path-style object storage endpoint (GET {endpoint}/{bucket}/{key})
    #[arg(long, env = "HOOKTAG_STORAGE_ENDPOINT", conflicts_with = "storage_dir")]
    pub storage_endpoint: Option<String>,

    /// Local directory mirroring the bucket layout
    #[arg(long, env = "HOOKTAG_STORAGE_DIR")]
    pub storage_dir: Option<PathBuf>,

    /// Bucket holding downloads/{post_id}/cover.jpg
    #[arg(long, env = "HOOKTAG_STORAGE_BUCKET", default_value = "covers")]
    pub storage_bucket: String,

    /// Bearer token for object storage
    #[arg(long, env = "HOOKTAG_STORAGE_TOKEN", hide_env_values = true)]
    pub storage_token: Option<String>,

    /// Covers kept in memory
    #[arg(long, env = "HOOKTAG_COVER_CACHE_CAPACITY", default_value_t = DEFAULT_COVER_CACHE_CAPACITY)]
    pub cover_cache_capacity: usize,

    /// Seconds before a cached cover is refetched
    #[arg(long, env = "HOOKTAG_COVER_CACHE_TTL_SECS")]
    pub cover_cache_ttl_secs: Option<u64>,

    /// Content-invalid attempts per group
    #[arg(long, env = "HOOKTAG_MAX_INVALID", default_value_t = 3)]
    pub max_invalid: u32,

    /// Backoff retries per group for rate limits and truncation
    #[arg(long, env = "HOOKTAG_MAX_RETRYABLE", default_value_t = 20)]
    pub max_retryable: u32,

    /// First backoff delay in milliseconds
    #[arg(long, env = "HOOKTAG_BACKOFF_BASE_MS", default_value_t = 2_000)]
    pub backoff_base_ms: u64,

    /// Backoff cap in milliseconds
    #[arg(long, env = "HOOKTAG_BACKOFF_CAP_MS", default_value_t = 60_000)]
    pub backoff_cap_ms: u64,

    /// Backoff jitter fraction in [0, 1]
    #[arg(long, env = "HOOKTAG_BACKOFF_JITTER", default_value_t = 0.3)]
    pub backoff_jitter: f64,

    /// Minimum backoff delay in milliseconds
    #[arg(long, env = "HOOKTAG_BACKOFF_FLOOR_MS", default_value_t = 500)]
    pub backoff_floor_ms: u64,

    /// Pause after an invalid response in milliseconds
    #[arg(long, env = "HOOKTAG_INVALID_PAUSE_MS", default_value_t = 300)]
    pub invalid_pause_ms: u64,

    /// Pause after a provider error in milliseconds
    #[arg(long, env = "HOOKTAG_PROVIDER_ERROR_PAUSE_MS", default_value_t = 800)]
    pub provider_error_pause_ms: u64,

    /// Pause after each annotated post in milliseconds
    #[arg(long, env = "HOOKTAG_ROW_DELAY_MS", default_value_t = 1_000)]
    pub row_delay_ms: u64,

    /// Characters of model rationale kept per group
    #[arg(long, env = "HOOKTAG_REASONING_CHARS", default_value_t = crate::response::DEFAULT_REASONING_CHARS)]
    pub reasoning_chars: usize,

    /// File replacing the built-in hook definitions
    #[arg(long, env = "HOOKTAG_SYSTEM_PROMPT")]
    pub system_prompt: Option<PathBuf>,

    /// JSONL calibration cases appended to the system prompt
    #[arg(long, env = "HOOKTAG_CALIBRATION_CASES")]
    pub calibration_cases: Option<PathBuf>,

    /// Seed for backoff jitter
    #[arg(long, env = "HOOKTAG_SEED")]
    pub seed: Option<u64>,
}

impl Cli {
    /// Converts the parsed CLI into `AnnotationControls`.
    pub fn build_controls(&self) -> Result<AnnotationControls> {
        let mut controls =
            AnnotationControls::new(self.mode, self.task_csv.clone(), self.output_dir.clone());
        if let Some(raw) = self.groups.as_deref() {
            controls.plan = raw
                .parse()
                .with_context(|| format!("invalid --groups value '{raw}'"))?;
        }
        ensure!(self.top_k > 0, "--top-k must be at least 1");
        ensure!(
            (0.0..=1.0).contains(&self.backoff_jitter),
            "--backoff-jitter must be within [0, 1]"
        );
        ensure!(self.max_invalid > 0, "--max-invalid must be at least 1");
        if self.mode == Mode::Rag {
            ensure!(
                self.reference_csv.is_some(),
                "rag mode requires --reference-csv"
            );
        }
        controls.top_k = self.top_k;
        controls.resume = !self.no_resume;
        controls.row_delay = Duration::from_millis(self.row_delay_ms);
        controls.inputs.reference = self.reference_csv.clone();
        controls.inputs.labels = self.labels_csv.clone();
        controls.retry = RetryPolicy {
            max_invalid: self.max_invalid,
            max_retryable: self.max_retryable,
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.backoff_base_ms),
                cap: Duration::from_millis(self.backoff_cap_ms),
                jitter: self.backoff_jitter,
                floor: Duration::from_millis(self.backoff_floor_ms),
            },
            invalid_pause: Duration::from_millis(self.invalid_pause_ms),
            provider_error_pause: Duration::from_millis(self.provider_error_pause_ms),
            reasoning_chars: self.reasoning_chars,
            temperature: 0.0,
            max_tokens: self.max_tokens,
            json_mode: !self.no_json_mode,
        };
        Ok(controls)
    }

    /// Cover cache TTL, if configured.
    pub fn cover_cache_ttl(&self) -> Option<Duration> {
        self.cover_cache_ttl_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["hooktag-annotate", "--task-csv", "tasks.csv"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("cli parses")
    }

    #[test]
    fn defaults_match_documented_policy() {
        let controls = parse(&["--reference-csv", "refs.csv"]).build_controls().unwrap();
        assert_eq!(controls.mode, Mode::Rag);
        assert_eq!(controls.plan, GroupPlan::default_rag());
        assert_eq!(controls.top_k, 4);
        assert!(controls.resume);
        assert_eq!(controls.retry, RetryPolicy::default());
        assert_eq!(controls.row_delay, Duration::from_secs(1));
    }

    #[test]
    fn rag_requires_reference_table() {
        assert!(parse(&[]).build_controls().is_err());
    }

    #[test]
    fn zero_shot_uses_single_group_and_bare_columns() {
        let controls = parse(&["--mode", "zero-shot", "--no-resume"]).build_controls().unwrap();
        assert_eq!(controls.plan, GroupPlan::single());
        assert!(!controls.resume);
        assert_eq!(controls.mode.column_style(), ColumnStyle::Bare);
    }

    #[test]
    fn custom_groups_and_knobs() {
        let controls = parse(&[
            "--reference-csv",
            "refs.csv",
            "--groups",
            "a=1,2,3,4@0.9:0.1;b=5,6,7,8@0.3:0.7",
            "--top-k",
            "2",
            "--backoff-base-ms",
            "10",
            "--max-tokens",
            "256",
        ])
        .build_controls()
        .unwrap();
        assert_eq!(controls.plan.groups().len(), 2);
        assert_eq!(controls.top_k, 2);
        assert_eq!(controls.retry.backoff.base, Duration::from_millis(10));
        assert_eq!(controls.retry.max_tokens, Some(256));
        assert!(parse(&["--reference-csv", "r", "--groups", "1,2@1:0"])
            .build_controls()
            .is_err());
    }
}
