use std::fs;
use std::num::NonZeroUsize;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use hooktag::prompt::{load_calibration_cases, render_calibration_block};
use hooktag::{
    run_annotation, Cli, CoverCache, HttpClipEncoder, HttpObjectStore, LocalObjectStore,
    MetadataStore, Mode, MultimodalEncoder, ObjectStore, OpenAiChatProvider, PromptAssembler,
    RunContext, SourceRole, ThreadSleeper,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::info;
use tracing_subscriber::EnvFilter;

const STORAGE_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hooktag=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let controls = cli.build_controls()?;

    let mut store = MetadataStore::default();
    if let Some(path) = &controls.inputs.reference {
        store
            .add_source_path(path, SourceRole::Reference)
            .context("failed to load reference table")?;
    }
    store
        .add_source_path(&controls.inputs.tasks, SourceRole::Task)
        .context("failed to load task table")?;
    if let Some(path) = &controls.inputs.labels {
        store
            .merge_labels_path(path)
            .context("failed to load golden labels")?;
    }

    let definitions = match &cli.system_prompt {
        Some(path) => Some(
            fs::read_to_string(path)
                .with_context(|| format!("failed to read system prompt {}", path.display()))?,
        ),
        None => None,
    };
    let calibration = match &cli.calibration_cases {
        Some(path) => {
            let cases = load_calibration_cases(path)?;
            info!(cases = cases.len(), "loaded calibration cases");
            Some(render_calibration_block(&cases, &store))
        }
        None => None,
    };
    let assembler = match controls.mode {
        Mode::Rag => PromptAssembler::retrieval(definitions, calibration),
        Mode::ZeroShot => PromptAssembler::zero_shot(definitions, calibration),
    };

    let object_store: Box<dyn ObjectStore> = match (&cli.storage_endpoint, &cli.storage_dir) {
        (Some(endpoint), _) => Box::new(HttpObjectStore::new(
            endpoint.clone(),
            cli.storage_bucket.clone(),
            cli.storage_token.clone(),
            STORAGE_TIMEOUT,
        )?),
        (None, Some(dir)) => Box::new(LocalObjectStore::new(dir, cli.storage_bucket.clone())),
        (None, None) => bail!("set --storage-endpoint or --storage-dir"),
    };
    let capacity = NonZeroUsize::new(cli.cover_cache_capacity)
        .ok_or_else(|| anyhow!("--cover-cache-capacity must be at least 1"))?;
    let mut covers = CoverCache::new(object_store, capacity, cli.cover_cache_ttl());

    let api_key = cli
        .llm_api_key
        .clone()
        .context("missing LLM API key (set OPENAI_API_KEY or --llm-api-key)")?;
    let provider = OpenAiChatProvider::new(
        api_key,
        cli.llm_base_url.clone(),
        cli.llm_model.clone(),
        Duration::from_secs(cli.llm_timeout_secs.max(1)),
    )?;

    let encoder = match (controls.mode, &cli.encoder_base_url) {
        (Mode::Rag, Some(base)) => Some(HttpClipEncoder::new(
            cli.encoder_api_key.clone(),
            base.clone(),
            cli.encoder_model.clone(),
            Duration::from_secs(cli.llm_timeout_secs.max(1)),
            cli.encoder_max_retries,
            ThreadSleeper,
        )?),
        (Mode::Rag, None) => bail!("rag mode requires --encoder-base-url"),
        (Mode::ZeroShot, _) => None,
    };

    let rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let sleeper = ThreadSleeper;
    let stats = run_annotation(
        &controls,
        RunContext {
            store: &store,
            assembler: &assembler,
            covers: &mut covers,
            provider: &provider,
            encoder: encoder.as_ref().map(|e| e as &dyn MultimodalEncoder),
            sleeper: &sleeper,
        },
        rng,
    )?;

    println!(
        "calls {} | invalid {} | invalid rate {:.2}% | written {} | skipped {} | fallbacks {}",
        stats.total_model_calls,
        stats.invalid_model_calls,
        stats.invalid_rate * 100.0,
        stats.processed_rows,
        stats.skipped_rows,
        stats.fallback_rows
    );
    println!("results: {}", stats.output_csv.display());
    Ok(())
}
