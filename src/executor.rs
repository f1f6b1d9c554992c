//! Resilient call loop for one (task, group) annotation.
//!
//! Each call ends in one of: success; a retryable failure (rate limit,
//! transient service error, truncated output) that sleeps with jittered
//! exponential backoff up to a high ceiling; or a content-invalid failure that
//! spends one of a few attempts after a short pause. Running out of either
//! budget yields an exhausted outcome carrying the last diagnostic code.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, warn};

use crate::backoff::{Backoff, BackoffPolicy, Sleeper};
use crate::error::AttemptError;
use crate::llm::{ChatRequest, LlmProvider};
use crate::mechanism::{Mechanism, MechanismGroup};
use crate::prompt::Prompt;
use crate::response::{validate_response, HookLabels, DEFAULT_REASONING_CHARS};

const RAW_PREVIEW_CHARS: usize = 160;

/// Retry budgets, pauses and call parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Content-invalid attempts before giving up.
    pub max_invalid: u32,
    /// Backoff retries before giving up on rate limits and truncation.
    pub max_retryable: u32,
    /// Backoff schedule for retryable failures.
    pub backoff: BackoffPolicy,
    /// Pause after a content-invalid response.
    pub invalid_pause: Duration,
    /// Pause after a non-retryable provider error.
    pub provider_error_pause: Duration,
    /// Characters kept from the model's rationale.
    pub reasoning_chars: usize,
    /// Sampling temperature.
    pub temperature: f32,
    /// Completion token limit.
    pub max_tokens: Option<usize>,
    /// Request a JSON-object response format.
    pub json_mode: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_invalid: 3,
            max_retryable: 20,
            backoff: BackoffPolicy::default(),
            invalid_pause: Duration::from_millis(300),
            provider_error_pause: Duration::from_millis(800),
            reasoning_chars: DEFAULT_REASONING_CHARS,
            temperature: 0.0,
            max_tokens: None,
            json_mode: true,
        }
    }
}

/// Terminal result for one group.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupOutcome {
    /// Validated labels.
    Success(HookLabels),
    /// Budgets exhausted; labels fall back to zero.
    Exhausted {
        /// Last diagnostic code.
        reason: String,
    },
}

/// Model call accounting for run statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CallCounters {
    /// Every request sent.
    pub total_calls: u64,
    /// Requests that spent a content-invalid attempt.
    pub invalid_calls: u64,
}

impl CallCounters {
    /// `invalid / total`, zero before any call.
    pub fn invalid_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.invalid_calls as f64 / self.total_calls as f64
        }
    }
}

/// Turns raw model output into labels or a routed failure. Blank output is
/// treated as truncation.
pub fn classify_response(
    raw: &str,
    required: &[Mechanism],
    reasoning_chars: usize,
) -> Result<HookLabels, AttemptError> {
    if raw.trim().is_empty() {
        return Err(AttemptError::Truncated);
    }
    Ok(validate_response(raw, required, reasoning_chars)?)
}

/// Drives provider calls with retry routing. Owns the jitter RNG and the call counters.
pub struct Executor<'a, R> {
    provider: &'a dyn LlmProvider,
    sleeper: &'a dyn Sleeper,
    policy: RetryPolicy,
    rng: R,
    counters: CallCounters,
}

impl<'a, R: Rng> Executor<'a, R> {
    /// Executor over `provider`; all waits go through `sleeper`.
    pub fn new(
        provider: &'a dyn LlmProvider,
        sleeper: &'a dyn Sleeper,
        policy: RetryPolicy,
        rng: R,
    ) -> Self {
        Self {
            provider,
            sleeper,
            policy,
            rng,
            counters: CallCounters::default(),
        }
    }

    /// Calls so far.
    pub fn counters(&self) -> CallCounters {
        self.counters
    }

    /// Policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Resolves one group for one task. Never fails; exhaustion is an outcome.
    pub fn run_group(&mut self, post_id: &str, group: &MechanismGroup, prompt: &Prompt) -> GroupOutcome {
        let mut invalid_attempts = 0u32;
        let mut backoff = Backoff::new(self.policy.backoff);
        loop {
            self.counters.total_calls += 1;
            let err = match self.attempt(group, prompt) {
                Ok(labels) => return GroupOutcome::Success(labels),
                Err(err) => err,
            };

            if err.is_retryable() {
                if backoff.retries() >= self.policy.max_retryable {
                    let reason = err.exhaustion_reason();
                    warn!(post_id, group = group.name(), %reason, "retry ceiling reached");
                    return GroupOutcome::Exhausted { reason };
                }
                let delay = backoff.next_delay(&mut self.rng);
                warn!(
                    post_id,
                    group = group.name(),
                    retry = backoff.retries(),
                    max = self.policy.max_retryable,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable failure; backing off"
                );
                self.sleeper.sleep(delay);
                continue;
            }

            self.counters.invalid_calls += 1;
            invalid_attempts += 1;
            warn!(
                post_id,
                group = group.name(),
                attempt = invalid_attempts,
                max = self.policy.max_invalid,
                reason = %err.reason(),
                error = %err,
                "invalid model output"
            );
            if invalid_attempts >= self.policy.max_invalid {
                return GroupOutcome::Exhausted {
                    reason: err.reason(),
                };
            }
            let pause = match err {
                AttemptError::Provider(_) => self.policy.provider_error_pause,
                _ => self.policy.invalid_pause,
            };
            self.sleeper.sleep(pause);
        }
    }

    fn attempt(&self, group: &MechanismGroup, prompt: &Prompt) -> Result<HookLabels, AttemptError> {
        let request = ChatRequest {
            system: &prompt.system,
            parts: &prompt.parts,
            temperature: self.policy.temperature,
            max_tokens: self.policy.max_tokens,
            json_mode: self.policy.json_mode,
        };
        let raw = self.provider.complete(&request)?;
        let result = classify_response(&raw, group.mechanisms(), self.policy.reasoning_chars);
        if result.is_err() {
            let preview: String = raw.chars().take(RAW_PREVIEW_CHARS).collect();
            debug!(group = group.name(), chars = raw.len(), preview = %preview, "rejected raw response");
        }
        result
    }
}
