use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use hooktag::storage::cover_key;
use hooktag::{
    run_annotation, AnnotationControls, ChatRequest, CoverCache, EncodeError, FetchError,
    LlmProvider, MetadataStore, Mode, MultimodalEncoder, ObjectStore, PromptAssembler,
    ProviderError, RunContext, RunStats, Sleeper, SourceRole,
};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

struct MemoryStore {
    objects: HashMap<String, Vec<u8>>,
}

impl MemoryStore {
    fn with_covers(post_ids: &[&str]) -> Self {
        let objects = post_ids
            .iter()
            .map(|id| (cover_key(id), format!("cover-of-{id}").into_bytes()))
            .collect();
        Self { objects }
    }
}

impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        "covers"
    }

    fn get_object(&self, key: &str) -> Result<Vec<u8>, FetchError> {
        self.objects.get(key).cloned().ok_or_else(|| FetchError::NotFound {
            locator: self.locator(key),
        })
    }
}

struct ByteEncoder;

fn bucket_vector(bytes: &[u8]) -> Vec<f32> {
    let mut v = vec![0.5f32, 0.0, 0.0, 0.0];
    for b in bytes {
        v[usize::from(*b) % 4] += 1.0;
    }
    v
}

impl MultimodalEncoder for ByteEncoder {
    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EncodeError> {
        Ok(bucket_vector(text.as_bytes()))
    }

    fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>, EncodeError> {
        Ok(bucket_vector(image))
    }
}

type Responder = Box<dyn Fn(&[u8]) -> Result<String, ProviderError>>;

/// Answers from the hook list found in the prompt and records every request.
struct FakeChat {
    respond: Responder,
    calls: RefCell<Vec<Vec<u8>>>,
    transcripts: RefCell<Vec<String>>,
}

impl FakeChat {
    fn new(respond: impl Fn(&[u8]) -> Result<String, ProviderError> + 'static) -> Self {
        Self {
            respond: Box::new(respond),
            calls: RefCell::new(Vec::new()),
            transcripts: RefCell::new(Vec::new()),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.borrow().len()
    }
}

fn requested_hooks(parts_text: &str) -> Vec<u8> {
    let Some(start) = parts_text.find("for hooks: [") else {
        return Vec::new();
    };
    let rest = &parts_text[start + "for hooks: [".len()..];
    let end = rest.find(']').unwrap_or(rest.len());
    rest[..end]
        .split(',')
        .filter_map(|n| n.trim().parse().ok())
        .collect()
}

impl LlmProvider for FakeChat {
    fn model(&self) -> &str {
        "fake-vision"
    }

    fn complete(&self, request: &ChatRequest<'_>) -> Result<String, ProviderError> {
        let text = request
            .parts
            .iter()
            .filter_map(|p| p.as_text())
            .collect::<Vec<_>>()
            .join("\n");
        let hooks = requested_hooks(&text);
        self.calls.borrow_mut().push(hooks.clone());
        self.transcripts.borrow_mut().push(text);
        (self.respond)(&hooks)
    }
}

/// Marks hooks 1, 5 and 8 present and names the group by its first hook.
fn well_behaved(hooks: &[u8]) -> Result<String, ProviderError> {
    let mut fields = vec![format!(
        "\"reasoning\": \"{}\"",
        if hooks.first() == Some(&5) { "visual cues" } else { "title wording" }
    )];
    for hook in hooks {
        let value = u8::from(matches!(hook, 1 | 5 | 8));
        fields.push(format!("\"h{hook}\": {value}"));
    }
    Ok(format!("Sure!\n```json\n{{{}}}\n```", fields.join(", ")))
}

#[derive(Default)]
struct RecordingSleeper {
    naps: RefCell<Vec<Duration>>,
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.naps.borrow_mut().push(duration);
    }
}

struct Fixture {
    dir: TempDir,
    store: MetadataStore,
}

fn write(path: &Path, contents: &str) {
    fs::write(path, contents).unwrap();
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let reference = dir.path().join("reference.csv");
    let tasks = dir.path().join("tasks.csv");
    let labels = dir.path().join("labels.csv");
    write(
        &reference,
        "post_id,title\nR1,Doctors hate this trick...\nr2,My morning routine\n",
    );
    write(&tasks, "\u{feff}post_id,title\nT1,You won't believe this\nt2,Quiet cafe review\n");
    write(&labels, "post_id,1,2,3,4,5,6,7,8\nr1,1,0,0,1,0,0,0,0\n");

    let mut store = MetadataStore::default();
    store.add_source_path(&reference, SourceRole::Reference).unwrap();
    store.add_source_path(&tasks, SourceRole::Task).unwrap();
    store.merge_labels_path(&labels).unwrap();
    Fixture { dir, store }
}

fn controls(fixture: &Fixture, mode: Mode) -> AnnotationControls {
    let root = fixture.dir.path();
    let mut controls = AnnotationControls::new(mode, root.join("tasks.csv"), root.join("out"));
    controls.inputs.reference = Some(root.join("reference.csv"));
    controls.inputs.labels = Some(root.join("labels.csv"));
    controls.row_delay = Duration::ZERO;
    controls
}

fn try_run(
    fixture: &Fixture,
    controls: &AnnotationControls,
    objects: MemoryStore,
    chat: &FakeChat,
    sleeper: &RecordingSleeper,
) -> anyhow::Result<RunStats> {
    let assembler = match controls.mode {
        Mode::Rag => PromptAssembler::retrieval(None, None),
        Mode::ZeroShot => PromptAssembler::zero_shot(None, None),
    };
    let mut covers = CoverCache::new(Box::new(objects), NonZeroUsize::new(16).unwrap(), None);
    let encoder = ByteEncoder;
    run_annotation(
        controls,
        RunContext {
            store: &fixture.store,
            assembler: &assembler,
            covers: &mut covers,
            provider: chat,
            encoder: match controls.mode {
                Mode::Rag => Some(&encoder as &dyn MultimodalEncoder),
                Mode::ZeroShot => None,
            },
            sleeper,
        },
        StdRng::seed_from_u64(7),
    )
}

fn run(
    fixture: &Fixture,
    controls: &AnnotationControls,
    objects: MemoryStore,
    chat: &FakeChat,
    sleeper: &RecordingSleeper,
) -> RunStats {
    try_run(fixture, controls, objects, chat, sleeper).unwrap()
}

fn read_rows(path: &Path) -> (Vec<String>, Vec<Vec<String>>) {
    let text = fs::read_to_string(path).unwrap();
    let mut reader = csv::Reader::from_reader(text.trim_start_matches('\u{feff}').as_bytes());
    let header = reader.headers().unwrap().iter().map(str::to_string).collect();
    let rows = reader
        .records()
        .map(|r| r.unwrap().iter().map(str::to_string).collect())
        .collect();
    (header, rows)
}

fn all_covers() -> MemoryStore {
    MemoryStore::with_covers(&["r1", "r2", "t1", "t2"])
}

#[test]
fn rag_run_merges_groups_into_one_row_per_post() {
    let fixture = fixture();
    let controls = controls(&fixture, Mode::Rag);
    let chat = FakeChat::new(well_behaved);
    let sleeper = RecordingSleeper::default();

    let stats = run(&fixture, &controls, all_covers(), &chat, &sleeper);

    assert_eq!(stats.indexed_references, 2);
    assert_eq!(stats.total_model_calls, 4);
    assert_eq!(stats.invalid_model_calls, 0);
    assert_eq!(stats.processed_rows, 2);
    assert_eq!(stats.fallback_rows, 0);
    assert_eq!(
        *chat.calls.borrow(),
        vec![vec![1u8, 2, 3, 4, 6], vec![5u8, 7, 8], vec![1u8, 2, 3, 4, 6], vec![5u8, 7, 8]]
    );
    let transcripts = chat.transcripts.borrow();
    assert!(transcripts[0].contains("[REFERENCE 1]"));
    assert!(transcripts[0].contains("[REFERENCE 2]"));
    assert!(transcripts[0].contains("Known Labels:"));

    let (header, rows) = read_rows(&stats.output_csv);
    assert_eq!(
        header,
        vec!["post_id", "h1", "h2", "h3", "h4", "h5", "h6", "h7", "h8", "title", "reasoning"]
    );
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0][0], "t1");
    assert_eq!(&rows[0][1..9], &["1", "0", "0", "0", "1", "0", "0", "1"]);
    assert_eq!(rows[0][9], "You won't believe this");
    assert_eq!(
        rows[0][10],
        "semantic-heavy: title wording | balanced-visual: visual cues"
    );

    let jsonl = fs::read_to_string(&stats.output_jsonl).unwrap();
    assert_eq!(jsonl.lines().count(), 2);
    let first: serde_json::Value = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
    assert_eq!(first["post_id"], "t1");
    assert_eq!(first["h8"], 1);

    let stats_file = stats.output_csv.with_file_name("stats.json");
    let saved: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(stats_file).unwrap()).unwrap();
    assert_eq!(saved["model_name"], "fake-vision");
    assert_eq!(saved["total_model_calls"], 4);
}

#[test]
fn rerun_resumes_without_new_calls() {
    let fixture = fixture();
    let controls = controls(&fixture, Mode::Rag);
    let sleeper = RecordingSleeper::default();
    let first = FakeChat::new(well_behaved);
    run(&fixture, &controls, all_covers(), &first, &sleeper);

    let second = FakeChat::new(well_behaved);
    let stats = run(&fixture, &controls, all_covers(), &second, &sleeper);

    assert_eq!(second.call_count(), 0);
    assert_eq!(stats.skipped_rows, 2);
    assert_eq!(stats.processed_rows, 0);
    assert_eq!(stats.done_rows, 2);
    let (_, rows) = read_rows(&stats.output_csv);
    assert_eq!(rows.len(), 2);
}

#[test]
fn partial_ledger_resumes_with_pending_posts_only() {
    let fixture = fixture();
    let controls = controls(&fixture, Mode::Rag);
    fs::create_dir_all(&controls.output_dir).unwrap();
    write(
        &controls.output_dir.join("predictions.csv"),
        "\u{feff}post_id,h1,h2,h3,h4,h5,h6,h7,h8,title,reasoning\n\
         t1,1,0,0,0,0,0,0,0,You won't believe this,seeded\n",
    );
    let chat = FakeChat::new(well_behaved);
    let sleeper = RecordingSleeper::default();

    let stats = run(&fixture, &controls, all_covers(), &chat, &sleeper);

    assert_eq!(chat.call_count(), 2);
    assert!(chat
        .transcripts
        .borrow()
        .iter()
        .all(|t| t.contains("[TARGET] Title: Quiet cafe review")));
    assert_eq!(stats.processed_rows, 1);
    assert_eq!(stats.skipped_rows, 1);
    assert_eq!(stats.done_rows, 2);
    let (_, rows) = read_rows(&stats.output_csv);
    let ids: Vec<&str> = rows.iter().map(|r| r[0].as_str()).collect();
    assert_eq!(ids, vec!["t1", "t2"]);
    assert_eq!(rows[0][10], "seeded");
    assert_eq!(
        rows[1][10],
        "semantic-heavy: title wording | balanced-visual: visual cues"
    );
    let jsonl = fs::read_to_string(&stats.output_jsonl).unwrap();
    assert_eq!(jsonl.lines().count(), 1);
}

#[test]
fn failed_index_build_keeps_previous_output() {
    let fixture = fixture();
    let mut controls = controls(&fixture, Mode::Rag);
    let sleeper = RecordingSleeper::default();
    let first = run(&fixture, &controls, all_covers(), &FakeChat::new(well_behaved), &sleeper);
    let before = fs::read_to_string(&first.output_csv).unwrap();

    controls.resume = false;
    let chat = FakeChat::new(well_behaved);
    let err = try_run(
        &fixture,
        &controls,
        MemoryStore::with_covers(&["t1", "t2"]),
        &chat,
        &sleeper,
    )
    .unwrap_err();

    assert!(format!("{err:#}").contains("reference index"));
    assert_eq!(chat.call_count(), 0);
    assert_eq!(fs::read_to_string(&first.output_csv).unwrap(), before);
    assert_eq!(fs::read_to_string(&first.output_jsonl).unwrap().lines().count(), 2);
}

#[test]
fn missing_reference_cover_is_left_out_of_the_index() {
    let fixture = fixture();
    let controls = controls(&fixture, Mode::Rag);
    let chat = FakeChat::new(well_behaved);
    let sleeper = RecordingSleeper::default();

    let stats = run(
        &fixture,
        &controls,
        MemoryStore::with_covers(&["r1", "t1", "t2"]),
        &chat,
        &sleeper,
    );

    assert_eq!(stats.indexed_references, 1);
    assert_eq!(stats.skipped_references, 1);
    assert!(chat.transcripts.borrow()[0].contains("[REFERENCE 1]"));
    assert!(!chat.transcripts.borrow()[0].contains("[REFERENCE 2]"));
    let saved: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(stats.output_csv.with_file_name("stats.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(saved["skipped_references"], 1);
}

#[test]
fn fresh_run_discards_previous_rows() {
    let fixture = fixture();
    let mut controls = controls(&fixture, Mode::Rag);
    let sleeper = RecordingSleeper::default();
    run(&fixture, &controls, all_covers(), &FakeChat::new(well_behaved), &sleeper);

    controls.resume = false;
    let chat = FakeChat::new(well_behaved);
    let stats = run(&fixture, &controls, all_covers(), &chat, &sleeper);

    assert_eq!(chat.call_count(), 4);
    assert_eq!(stats.skipped_rows, 0);
    let (_, rows) = read_rows(&stats.output_csv);
    assert_eq!(rows.len(), 2);
}

#[test]
fn missing_task_cover_writes_fallback_without_calls() {
    let fixture = fixture();
    let controls = controls(&fixture, Mode::Rag);
    let chat = FakeChat::new(well_behaved);
    let sleeper = RecordingSleeper::default();

    let stats = run(
        &fixture,
        &controls,
        MemoryStore::with_covers(&["r1", "r2", "t2"]),
        &chat,
        &sleeper,
    );

    assert_eq!(chat.call_count(), 2);
    assert_eq!(stats.fallback_rows, 1);
    let (_, rows) = read_rows(&stats.output_csv);
    assert_eq!(rows[0][0], "t1");
    assert!(rows[0][1..9].iter().all(|v| v == "0"));
    assert_eq!(rows[0][10], "FAILED:MISSING_COVER_OR_FETCH_ERROR");
    assert_eq!(rows[1][0], "t2");
}

#[test]
fn exhausted_group_keeps_the_other_groups_labels() {
    let fixture = fixture();
    let mut controls = controls(&fixture, Mode::Rag);
    controls.retry.max_retryable = 2;
    let chat = FakeChat::new(|hooks| {
        if hooks.first() == Some(&5) {
            Ok("{\"reasoning\": \"cut off\", \"h5\": 1, \"h7\"".to_string())
        } else {
            well_behaved(hooks)
        }
    });
    let sleeper = RecordingSleeper::default();

    let stats = run(&fixture, &controls, all_covers(), &chat, &sleeper);

    // One semantic call plus three truncated visual calls per post.
    assert_eq!(stats.total_model_calls, 8);
    assert_eq!(stats.invalid_model_calls, 0);
    assert_eq!(stats.fallback_rows, 2);
    assert_eq!(sleeper.naps.borrow().len(), 4);
    let (_, rows) = read_rows(&stats.output_csv);
    assert_eq!(&rows[0][1..9], &["1", "0", "0", "0", "0", "0", "0", "0"]);
    assert_eq!(
        rows[0][10],
        "semantic-heavy: title wording | balanced-visual: FAILED:TRUNCATED_JSON_MAX_RETRY_EXCEEDED"
    );
}

#[test]
fn invalid_values_spend_the_invalid_budget() {
    let fixture = fixture();
    let controls = controls(&fixture, Mode::Rag);
    let chat = FakeChat::new(|hooks| {
        if hooks.first() == Some(&5) {
            Ok(r#"{"reasoning": "unsure", "h5": "maybe", "h7": 0, "h8": 1}"#.to_string())
        } else {
            well_behaved(hooks)
        }
    });
    let sleeper = RecordingSleeper::default();

    let stats = run(&fixture, &controls, all_covers(), &chat, &sleeper);

    assert_eq!(stats.total_model_calls, 8);
    assert_eq!(stats.invalid_model_calls, 6);
    assert!((stats.invalid_rate - 0.75).abs() < 1e-9);
    let (_, rows) = read_rows(&stats.output_csv);
    assert!(rows[1][10].ends_with("balanced-visual: FAILED:INVALID_VALUE_h5"));
    // Two pauses per exhausted group; the third failure ends the group.
    assert_eq!(
        *sleeper.naps.borrow(),
        vec![controls.retry.invalid_pause; 4]
    );
}

#[test]
fn zero_shot_uses_bare_columns_and_one_call_per_post() {
    let fixture = fixture();
    let controls = controls(&fixture, Mode::ZeroShot);
    let chat = FakeChat::new(well_behaved);
    let sleeper = RecordingSleeper::default();

    let stats = run(
        &fixture,
        &controls,
        MemoryStore::with_covers(&["t1", "t2"]),
        &chat,
        &sleeper,
    );

    assert_eq!(stats.indexed_references, 0);
    assert_eq!(chat.call_count(), 2);
    assert_eq!(chat.calls.borrow()[0], vec![1u8, 2, 3, 4, 5, 6, 7, 8]);
    assert!(!chat.transcripts.borrow()[0].contains("[REFERENCE"));
    let (header, rows) = read_rows(&stats.output_csv);
    assert_eq!(
        header,
        vec!["post_id", "1", "2", "3", "4", "5", "6", "7", "8", "title", "reasoning"]
    );
    assert_eq!(&rows[1][1..9], &["1", "0", "0", "0", "1", "0", "0", "1"]);
    assert_eq!(rows[1][10], "title wording");
}
