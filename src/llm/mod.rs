//! Chat-completion provider boundary.

use thiserror::Error;

use crate::prompt::ContentPart;

pub mod openai;

pub use openai::OpenAiChatProvider;

/// Wording that marks a provider failure as throttling.
const RATE_LIMIT_MARKERS: [&str; 8] = [
    "rate limit",
    "ratelimit",
    "too many requests",
    "429",
    "quota",
    "throttl",
    "exceeded",
    "temporarily unavailable",
];

/// One chat call: a system message and an ordered multimodal user message.
pub struct ChatRequest<'a> {
    /// System message text.
    pub system: &'a str,
    /// User message parts in order.
    pub parts: &'a [ContentPart],
    /// Sampling temperature.
    pub temperature: f32,
    /// Optional completion token limit.
    pub max_tokens: Option<usize>,
    /// Ask the service for a JSON-object response.
    pub json_mode: bool,
}

/// Failures from a provider call, pre-classified for retry routing.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Service throttled the request.
    #[error("rate limited ({status:?}): {message}")]
    RateLimited {
        /// HTTP status when one was received.
        status: Option<u16>,
        /// Provider message.
        message: String,
    },
    /// Timeout, dropped connection or 5xx.
    #[error("transient provider failure: {0}")]
    Transient(String),
    /// Non-retryable HTTP status.
    #[error("provider returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// Request could not be built or sent.
    #[error("provider transport failure: {0}")]
    Transport(String),
    /// Response body did not match the chat-completions shape.
    #[error("failed to decode provider response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// Whether the executor should back off and retry without spending a content attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }

    /// Classifies a non-success HTTP answer.
    pub fn from_status(status: u16, body: String) -> Self {
        // 400 bodies mention "exceeded" for context-length errors.
        if status == 429 || (status != 400 && mentions_rate_limit(&body)) {
            Self::RateLimited {
                status: Some(status),
                message: body,
            }
        } else if status >= 500 {
            Self::Transient(format!("status {status}: {body}"))
        } else {
            Self::Status { status, body }
        }
    }
}

/// Case-insensitive scan for throttling wording.
pub fn mentions_rate_limit(message: &str) -> bool {
    let lowered = message.to_lowercase();
    RATE_LIMIT_MARKERS
        .iter()
        .any(|marker| lowered.contains(marker))
}

/// Chat-completion backend.
pub trait LlmProvider {
    /// Model identifier, recorded in run statistics.
    fn model(&self) -> &str;

    /// Returns the assistant message text.
    fn complete(&self, request: &ChatRequest<'_>) -> Result<String, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_statuses() {
        assert!(matches!(
            ProviderError::from_status(429, String::new()),
            ProviderError::RateLimited { status: Some(429), .. }
        ));
        assert!(matches!(
            ProviderError::from_status(403, "Quota exceeded for model".into()),
            ProviderError::RateLimited { .. }
        ));
        assert!(ProviderError::from_status(503, "busy".into()).is_retryable());
        let err = ProviderError::from_status(401, "bad key".into());
        assert!(!err.is_retryable());
        assert!(matches!(err, ProviderError::Status { status: 401, .. }));
    }

    #[test]
    fn rate_limit_wording_is_case_insensitive() {
        assert!(mentions_rate_limit("Request was THROTTLED"));
        assert!(mentions_rate_limit("Too Many Requests"));
        assert!(!mentions_rate_limit("invalid image"));
    }
}
