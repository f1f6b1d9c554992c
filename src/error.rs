//! Per-attempt failure routed through the executor's retry state machine.

use thiserror::Error;

use crate::llm::ProviderError;
use crate::response::ValidationError;
use crate::storage::FetchError;

/// Why one annotation attempt did not produce labels.
#[derive(Debug, Error)]
pub enum AttemptError {
    /// Cover image could not be fetched.
    #[error(transparent)]
    Fetch(#[from] FetchError),
    /// Response held no parseable JSON object.
    #[error("unparseable response: {0}")]
    Parse(String),
    /// Response parsed but broke the output contract.
    #[error(transparent)]
    Validation(ValidationError),
    /// Service signalled throttling.
    #[error("rate limited: {0}")]
    RateLimited(String),
    /// Response ended before the JSON object closed.
    #[error("response truncated")]
    Truncated,
    /// Any other provider failure.
    #[error(transparent)]
    Provider(ProviderError),
}

impl From<ProviderError> for AttemptError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited { message, .. } => Self::RateLimited(message),
            other => Self::Provider(other),
        }
    }
}

impl From<ValidationError> for AttemptError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::Truncated => Self::Truncated,
            ValidationError::NoObject => Self::Parse("no JSON object".to_string()),
            ValidationError::Parse(message) => Self::Parse(message),
            other => Self::Validation(other),
        }
    }
}

impl AttemptError {
    /// Retried with backoff without spending the content-invalid budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited(_) | Self::Truncated => true,
            Self::Provider(err) => err.is_retryable(),
            Self::Fetch(_) | Self::Parse(_) | Self::Validation(_) => false,
        }
    }

    /// Diagnostic code for the last failure of a task.
    pub fn reason(&self) -> String {
        match self {
            Self::Fetch(_) => "MISSING_COVER_OR_FETCH_ERROR".to_string(),
            Self::Parse(_) => "JSON_PARSE_FAILED".to_string(),
            Self::Validation(err) => err.code(),
            Self::RateLimited(_) => "RATE_LIMITED".to_string(),
            Self::Truncated => "TRUNCATED_JSON".to_string(),
            Self::Provider(err) => match err {
                ProviderError::Status { status, .. } => format!("API_EXCEPTION_{status}"),
                ProviderError::Transient(_) => "API_EXCEPTION_TRANSIENT".to_string(),
                ProviderError::Transport(_) => "API_EXCEPTION_TRANSPORT".to_string(),
                ProviderError::Decode(_) => "API_EXCEPTION_DECODE".to_string(),
                ProviderError::RateLimited { .. } => "RATE_LIMITED".to_string(),
            },
        }
    }

    /// Code recorded when the retryable ceiling is exhausted on this error.
    pub fn exhaustion_reason(&self) -> String {
        match self {
            Self::Truncated => "TRUNCATED_JSON_MAX_RETRY_EXCEEDED".to_string(),
            Self::RateLimited(_) => "RATE_LIMIT_MAX_RETRY_EXCEEDED".to_string(),
            Self::Provider(_) => "TRANSIENT_MAX_RETRY_EXCEEDED".to_string(),
            other => other.reason(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_route_by_kind() {
        assert!(AttemptError::from(ValidationError::Truncated).is_retryable());
        let parse = AttemptError::from(ValidationError::NoObject);
        assert!(!parse.is_retryable());
        assert_eq!(parse.reason(), "JSON_PARSE_FAILED");
        let extra = AttemptError::from(ValidationError::ExtraKey("h9".into()));
        assert_eq!(extra.reason(), "EXTRA_HOOK_KEY_h9");
    }

    #[test]
    fn provider_errors_route_by_kind() {
        let limited = AttemptError::from(ProviderError::from_status(429, "slow down".into()));
        assert!(limited.is_retryable());
        assert_eq!(limited.exhaustion_reason(), "RATE_LIMIT_MAX_RETRY_EXCEEDED");
        let transient = AttemptError::from(ProviderError::Transient("timeout".into()));
        assert!(transient.is_retryable());
        let denied = AttemptError::from(ProviderError::from_status(401, "no".into()));
        assert!(!denied.is_retryable());
        assert_eq!(denied.reason(), "API_EXCEPTION_401");
    }

    #[test]
    fn missing_cover_is_terminal() {
        let missing = AttemptError::from(FetchError::NotFound {
            locator: "covers/p1.jpg".into(),
        });
        assert!(!missing.is_retryable());
        assert_eq!(missing.reason(), "MISSING_COVER_OR_FETCH_ERROR");
    }
}
