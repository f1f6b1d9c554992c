//! Schema validation for the model's label object.
//!
//! Permitted keys are the rationale (`reasoning`, with `rationale`/`reason`
//! accepted as aliases) and mechanism keys `h1..h8` (`hook1..hook8` accepted
//! when the short form is absent). Mechanism-shaped keys outside `1..=8` are
//! reported as extra keys; anything else is an unexpected key. Every
//! mechanism the caller requires must be present with a binary value.

use std::collections::BTreeMap;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::extract::{scan_first_object, ObjectScan};
use crate::mechanism::{Mechanism, MECHANISM_COUNT};

/// Key carrying the model's short rationale.
pub const REASONING_KEY: &str = "reasoning";
const REASONING_ALIASES: [&str; 3] = [REASONING_KEY, "rationale", "reason"];

/// Default character budget kept from the rationale.
pub const DEFAULT_REASONING_CHARS: usize = 20;

/// Why a response failed validation.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    /// Output contains no `{` at all.
    #[error("response contains no JSON object")]
    NoObject,
    /// Output opens an object but never closes it.
    #[error("response JSON object is unterminated")]
    Truncated,
    /// Balanced braces but not valid JSON.
    #[error("response JSON failed to parse: {0}")]
    Parse(String),
    /// Mechanism key outside `1..=8`.
    #[error("extra mechanism key '{0}'")]
    ExtraKey(String),
    /// Key outside the response contract.
    #[error("unexpected key '{0}'")]
    UnexpectedKey(String),
    /// Required mechanism absent.
    #[error("required key '{0}' is missing")]
    MissingKey(String),
    /// Required mechanism present with a non-binary value.
    #[error("key '{key}' has non-binary value {value}")]
    InvalidValue {
        /// Offending key, e.g. `h3`.
        key: String,
        /// JSON rendering of the rejected value.
        value: String,
    },
}

impl ValidationError {
    /// Short diagnostic code written into fallback rows.
    pub fn code(&self) -> String {
        match self {
            Self::NoObject | Self::Parse(_) => "JSON_PARSE_FAILED".to_string(),
            Self::Truncated => "TRUNCATED_JSON".to_string(),
            Self::ExtraKey(key) => format!("EXTRA_HOOK_KEY_{key}"),
            Self::UnexpectedKey(key) => format!("UNEXPECTED_KEY_{key}"),
            Self::MissingKey(key) => format!("MISSING_{key}"),
            Self::InvalidValue { key, .. } => format!("INVALID_VALUE_{key}"),
        }
    }
}

/// Validated labels for the requested mechanisms plus a trimmed rationale.
#[derive(Debug, Clone, PartialEq)]
pub struct HookLabels {
    labels: BTreeMap<Mechanism, u8>,
    reasoning: String,
}

impl HookLabels {
    /// Label for `mechanism`, if it was requested.
    pub fn get(&self, mechanism: Mechanism) -> Option<u8> {
        self.labels.get(&mechanism).copied()
    }

    /// `(mechanism, label)` pairs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = (Mechanism, u8)> + '_ {
        self.labels.iter().map(|(m, v)| (*m, *v))
    }

    /// Trimmed rationale text.
    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }
}

/// Coerces `true/false`, `0/1` (integer or float) and `"0"/"1"` into a bit.
pub fn coerce_binary(value: &Value) -> Option<u8> {
    match value {
        Value::Bool(flag) => Some(u8::from(*flag)),
        Value::Number(number) => {
            if let Some(n) = number.as_u64() {
                return (n <= 1).then_some(n as u8);
            }
            match number.as_f64() {
                Some(f) if f == 0.0 => Some(0),
                Some(f) if f == 1.0 => Some(1),
                _ => None,
            }
        }
        Value::String(text) => match text.trim() {
            "0" => Some(0),
            "1" => Some(1),
            _ => None,
        },
        _ => None,
    }
}

enum KeyKind {
    Reasoning,
    Mechanism { number: u32, long_form: bool },
    Other,
}

fn classify_key(key: &str) -> KeyKind {
    let normalized = key.trim().to_ascii_lowercase();
    if REASONING_ALIASES.contains(&normalized.as_str()) {
        return KeyKind::Reasoning;
    }
    let (digits, long_form) = if let Some(rest) = normalized.strip_prefix("hook") {
        (rest, true)
    } else if let Some(rest) = normalized.strip_prefix('h') {
        (rest, false)
    } else {
        return KeyKind::Other;
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return KeyKind::Other;
    }
    match digits.parse::<u32>() {
        Ok(number) => KeyKind::Mechanism { number, long_form },
        // More digits than fit in u32 is certainly out of range.
        Err(_) => KeyKind::Mechanism {
            number: u32::MAX,
            long_form,
        },
    }
}

/// Extracts and validates the first JSON object in `raw`.
pub fn validate_response(
    raw: &str,
    required: &[Mechanism],
    reasoning_chars: usize,
) -> Result<HookLabels, ValidationError> {
    match scan_first_object(raw) {
        ObjectScan::Complete(object) => validate_object(object, required, reasoning_chars),
        ObjectScan::Unterminated => Err(ValidationError::Truncated),
        ObjectScan::Absent => Err(ValidationError::NoObject),
    }
}

/// Validates an already extracted JSON object.
pub fn validate_object(
    object: &str,
    required: &[Mechanism],
    reasoning_chars: usize,
) -> Result<HookLabels, ValidationError> {
    let map: Map<String, Value> =
        serde_json::from_str(object).map_err(|err| ValidationError::Parse(err.to_string()))?;

    let mut found: BTreeMap<u8, &Value> = BTreeMap::new();
    let mut reasoning: Option<&Value> = None;
    let mut unexpected: Option<&String> = None;
    for (key, value) in &map {
        match classify_key(key) {
            KeyKind::Reasoning => {
                reasoning.get_or_insert(value);
            }
            KeyKind::Mechanism { number, long_form } => {
                if number == 0 || number > u32::from(MECHANISM_COUNT) {
                    return Err(ValidationError::ExtraKey(key.clone()));
                }
                let number = number as u8;
                if long_form {
                    found.entry(number).or_insert(value);
                } else {
                    found.insert(number, value);
                }
            }
            KeyKind::Other => {
                unexpected.get_or_insert(key);
            }
        }
    }
    if let Some(key) = unexpected {
        return Err(ValidationError::UnexpectedKey(key.clone()));
    }

    let mut labels = BTreeMap::new();
    for &mechanism in required {
        let value = found
            .get(&mechanism.number())
            .ok_or_else(|| ValidationError::MissingKey(mechanism.key()))?;
        let bit = coerce_binary(value).ok_or_else(|| ValidationError::InvalidValue {
            key: mechanism.key(),
            value: value.to_string(),
        })?;
        labels.insert(mechanism, bit);
    }

    let reasoning = match reasoning {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.trim().to_string(),
        Some(other) => other.to_string(),
    };
    Ok(HookLabels {
        labels,
        reasoning: reasoning.chars().take(reasoning_chars).collect(),
    })
}
