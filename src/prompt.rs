//! Multimodal prompt rendering for one (task, group) call.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::mechanism::{Mechanism, MechanismGroup};
use crate::metadata::{MetadataStore, PostRecord};

/// Built-in mechanism definitions and output contract.
pub const HOOK_DEFINITIONS: &str = include_str!("prompts/hook_definitions.txt");

const REFERENCE_INSTRUCTION: &str = "Instruction: Distinguish between [REFERENCE] images and the [TARGET] image. Only output labels for the [TARGET].";
const END_OF_REFERENCES: &str = "--- END OF REFERENCES ---";
const FALLBACK_MIME: &str = "image/jpeg";

/// One element of the user message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// Text body.
        text: String,
    },
    /// Image by URL, usually an inline `data:` URL.
    ImageUrl {
        /// URL and detail level.
        image_url: ImageUrl,
    },
}

/// Image reference inside a [`ContentPart::ImageUrl`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageUrl {
    /// `data:{mime};base64,...` or a remote URL.
    pub url: String,
    /// Vision detail level.
    pub detail: String,
}

impl ContentPart {
    /// Text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Low-detail image part for `url`.
    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl {
                url: url.into(),
                detail: "low".to_string(),
            },
        }
    }

    /// Low-detail inline image; the MIME type is sniffed from the bytes.
    pub fn inline_image(bytes: &[u8]) -> Self {
        Self::image_url(data_url(bytes))
    }

    /// Text content, if this is a text part.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::ImageUrl { .. } => None,
        }
    }
}

/// Encodes `bytes` as a base64 `data:` URL.
pub fn data_url(bytes: &[u8]) -> String {
    let mime = infer::get(bytes)
        .filter(|kind| kind.matcher_type() == infer::MatcherType::Image)
        .map(|kind| kind.mime_type())
        .unwrap_or(FALLBACK_MIME);
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

/// Retrieved reference post as shown to the model.
#[derive(Debug, Clone)]
pub struct Exemplar<'a> {
    /// Reference record.
    pub record: &'a PostRecord,
    /// Cover bytes; `None` when the fetch failed.
    pub image: Option<Arc<[u8]>>,
    /// Inner-product similarity to the query.
    pub score: f32,
}

/// Rendered system message and user parts.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    /// System message.
    pub system: String,
    /// Ordered user message parts.
    pub parts: Vec<ContentPart>,
}

/// Renders prompts; the system message is fixed for the run.
#[derive(Debug, Clone)]
pub struct PromptAssembler {
    system: String,
    with_references: bool,
}

impl PromptAssembler {
    /// Prompt assembler for retrieval runs.
    pub fn retrieval(definitions: Option<String>, calibration: Option<String>) -> Self {
        Self::build(definitions, calibration, true)
    }

    /// Prompt assembler without exemplars or the reference disclaimer.
    pub fn zero_shot(definitions: Option<String>, calibration: Option<String>) -> Self {
        Self::build(definitions, calibration, false)
    }

    fn build(definitions: Option<String>, calibration: Option<String>, with_references: bool) -> Self {
        let mut system = definitions.unwrap_or_else(|| HOOK_DEFINITIONS.to_string());
        if let Some(block) = calibration.filter(|b| !b.trim().is_empty()) {
            system.push_str("\n\n");
            system.push_str(block.trim_end());
        }
        if with_references {
            system.push('\n');
            system.push_str(REFERENCE_INSTRUCTION);
        }
        Self {
            system,
            with_references,
        }
    }

    /// System message sent with every call.
    pub fn system(&self) -> &str {
        &self.system
    }

    /// Builds the prompt for `target` restricted to `group`'s mechanisms.
    pub fn assemble(
        &self,
        group: &MechanismGroup,
        target: &PostRecord,
        target_image: &[u8],
        exemplars: &[Exemplar<'_>],
    ) -> Prompt {
        let mut parts = Vec::with_capacity(exemplars.len() * 2 + 6);
        if self.with_references {
            parts.push(ContentPart::text(format!(
                "IMPORTANT: Below are {} [REFERENCE EXAMPLES] retrieved by visual and semantic similarity. \
                 Use them only to understand the criteria; their labels carry no correlation with the target. Do NOT label them.",
                exemplars.len()
            )));
            for (rank, exemplar) in exemplars.iter().enumerate() {
                let labels = exemplar
                    .record
                    .reference_labels
                    .as_deref()
                    .unwrap_or("unknown");
                parts.push(ContentPart::text(format!(
                    "[REFERENCE {}] Title: {} | Known Labels: {}",
                    rank + 1,
                    exemplar.record.title,
                    labels
                )));
                if let Some(image) = &exemplar.image {
                    parts.push(ContentPart::inline_image(image));
                }
            }
            parts.push(ContentPart::text(END_OF_REFERENCES));
            parts.push(ContentPart::text(format!(
                "NOW, evaluate the [TARGET SAMPLE] below for hooks: {}.",
                hook_list(group.mechanisms())
            )));
        } else {
            parts.push(ContentPart::text(format!(
                "Evaluate the [TARGET] post below for hooks: {}.",
                hook_list(group.mechanisms())
            )));
        }
        parts.push(ContentPart::text(output_instruction(group.mechanisms())));
        parts.push(ContentPart::text(format!("[TARGET] Title: {}", target.title)));
        parts.push(ContentPart::inline_image(target_image));
        Prompt {
            system: self.system.clone(),
            parts,
        }
    }
}

fn hook_list(mechanisms: &[Mechanism]) -> String {
    let numbers: Vec<String> = mechanisms.iter().map(|m| m.number().to_string()).collect();
    let names: Vec<String> = mechanisms
        .iter()
        .map(|m| format!("{} {}", m.number(), m.name()))
        .collect();
    format!("[{}] ({})", numbers.join(", "), names.join("; "))
}

fn output_instruction(mechanisms: &[Mechanism]) -> String {
    let keys: Vec<String> = mechanisms.iter().map(|m| format!("\"{}\"", m.key())).collect();
    format!(
        "Output exactly one JSON object with \"reasoning\" first, then only these keys valued 0 or 1: {}.",
        keys.join(", ")
    )
}

/// Hand-labeled example rendered into the system prompt.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CalibrationCase {
    /// Post the case refers to.
    pub post_id: String,
    /// Mechanism number the label applies to.
    pub hook: u8,
    /// Short explanation of the label.
    pub reasoning: String,
    /// Expected 0/1 label.
    pub label: u8,
}

/// Reads calibration cases from a JSONL file; blank lines are skipped.
pub fn load_calibration_cases(path: &Path) -> Result<Vec<CalibrationCase>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open calibration cases {}", path.display()))?;
    let mut cases = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let case: CalibrationCase = serde_json::from_str(&line)
            .with_context(|| format!("invalid calibration case at {}:{}", path.display(), idx + 1))?;
        if Mechanism::new(case.hook).is_err() {
            bail!("calibration case at line {} names hook {}", idx + 1, case.hook);
        }
        if case.label > 1 {
            bail!("calibration case at line {} has label {}", idx + 1, case.label);
        }
        cases.push(case);
    }
    Ok(cases)
}

/// Renders cases grouped by mechanism, looking titles up in `store`.
pub fn render_calibration_block(cases: &[CalibrationCase], store: &MetadataStore) -> String {
    let mut by_hook: BTreeMap<u8, Vec<&CalibrationCase>> = BTreeMap::new();
    for case in cases {
        by_hook.entry(case.hook).or_default().push(case);
    }
    let mut block = String::from(
        "[Calibration Cases]\nEach hook below lists calibration cases. The 'label' refers ONLY to that hook.\n",
    );
    for (hook, cases) in by_hook {
        let _ = write!(block, "\n## hook{hook} cases\n");
        for (idx, case) in cases.iter().enumerate() {
            let title = store
                .get(&case.post_id)
                .map(|record| record.title.as_str())
                .unwrap_or("(title unavailable)");
            let _ = write!(
                block,
                "- case{}: post_id={}\n  title={}\n  reasoning={}\n  label={}\n",
                idx + 1,
                crate::metadata::normalize_post_id(&case.post_id),
                title,
                case.reasoning,
                case.label
            );
        }
    }
    block
}
