//! HTTP client for CLIP-style multimodal embedding endpoints.

use std::time::Duration;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{EncodeError, MultimodalEncoder};
use crate::backoff::{Sleeper, ThreadSleeper};

/// Blocking client for `POST {base}/embeddings` with mixed text/image inputs.
#[derive(Clone)]
pub struct HttpClipEncoder<S = ThreadSleeper> {
    client: Client,
    endpoint: String,
    model: String,
    max_retries: usize,
    sleeper: S,
}

impl<S: Sleeper> HttpClipEncoder<S> {
    /// Builds a new encoder client; `sleeper` waits out retry backoff.
    pub fn new(
        api_key: Option<String>,
        base_url: String,
        model: String,
        timeout: Duration,
        max_retries: usize,
        sleeper: S,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!model.trim().is_empty(), "missing encoder model name");
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            let auth = format!("Bearer {}", key.trim());
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth).context("invalid encoder API key")?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build encoder HTTP client")?;
        let endpoint = format!("{}/embeddings", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            max_retries: max_retries.max(1),
            sleeper,
        })
    }

    fn embed_one(&self, input: EncoderInput<'_>) -> Result<Vec<f32>, EncodeError> {
        retry_with(self.max_retries, &self.sleeper, || self.send_once(&input))
    }

    fn send_once(&self, input: &EncoderInput<'_>) -> Outcome<Vec<f32>> {
        let request = EncoderRequest {
            model: &self.model,
            input: [input],
        };
        let resp = match self.client.post(&self.endpoint).json(&request).send() {
            Ok(resp) => resp,
            Err(err) if is_retryable_error(&err) => {
                return Outcome::Retry(EncodeError::Request(err.to_string()))
            }
            Err(err) => return Outcome::Fail(EncodeError::Request(err.to_string())),
        };
        let status = resp.status();
        if !status.is_success() {
            let body = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            let err = EncodeError::Status {
                status: status.as_u16(),
                body,
            };
            return if should_retry(status) {
                Outcome::Retry(err)
            } else {
                Outcome::Fail(err)
            };
        }
        let parsed: Result<EncoderResponse, _> = resp.json();
        match parsed {
            Ok(mut parsed) => {
                parsed.data.sort_by_key(|entry| entry.index);
                match parsed.data.into_iter().next() {
                    Some(entry) => Outcome::Done(entry.embedding),
                    None => Outcome::Fail(EncodeError::Decode("no embeddings returned".into())),
                }
            }
            Err(err) => Outcome::Fail(EncodeError::Decode(err.to_string())),
        }
    }
}

/// Result of one encoder request.
enum Outcome<T> {
    Done(T),
    Retry(EncodeError),
    Fail(EncodeError),
}

/// Repeats `send` while it asks for a retry, up to `max_attempts` sends in total.
fn retry_with<T>(
    max_attempts: usize,
    sleeper: &dyn Sleeper,
    mut send: impl FnMut() -> Outcome<T>,
) -> Result<T, EncodeError> {
    let mut attempt = 0usize;
    loop {
        match send() {
            Outcome::Done(value) => return Ok(value),
            Outcome::Retry(err) if attempt + 1 < max_attempts => {
                attempt += 1;
                warn!(error = %err, attempt, "encoder request failed; retrying");
                sleeper.sleep(retry_backoff(attempt));
            }
            Outcome::Retry(err) | Outcome::Fail(err) => return Err(err),
        }
    }
}

impl<S: Sleeper> MultimodalEncoder for HttpClipEncoder<S> {
    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EncodeError> {
        self.embed_one(EncoderInput::Text { text })
    }

    fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>, EncodeError> {
        let encoded = BASE64.encode(image);
        self.embed_one(EncoderInput::Image { image: &encoded })
    }
}

fn should_retry(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
}

fn retry_backoff(attempt: usize) -> Duration {
    let capped = attempt.min(5) as u32;
    Duration::from_millis(500 * (1 << capped))
}

#[derive(Serialize)]
struct EncoderRequest<'a> {
    model: &'a str,
    input: [&'a EncoderInput<'a>; 1],
}

#[derive(Serialize)]
#[serde(untagged)]
enum EncoderInput<'a> {
    Text { text: &'a str },
    Image { image: &'a str },
}

#[derive(Debug, Deserialize)]
struct EncoderResponse {
    data: Vec<EncoderData>,
}

#[derive(Debug, Deserialize)]
struct EncoderData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}
