//! OpenAI-compatible chat-completions client.

use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{mentions_rate_limit, ChatRequest, LlmProvider, ProviderError};
use crate::prompt::ContentPart;

/// Default OpenAI-compatible API root.
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Blocking client for `POST {base}/chat/completions`.
pub struct OpenAiChatProvider {
    client: Client,
    endpoint: String,
    model: String,
}

impl OpenAiChatProvider {
    /// Builds a client with bearer auth against `base_url`.
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing LLM API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing LLM model name");
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid LLM API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build LLM HTTP client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            model,
        })
    }
}

impl LlmProvider for OpenAiChatProvider {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete(&self, request: &ChatRequest<'_>) -> Result<String, ProviderError> {
        let body = build_body(&self.model, request);
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .map_err(classify_transport)?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ProviderError::from_status(status.as_u16(), text));
        }
        let parsed: ChatResponse = resp
            .json()
            .map_err(|err| ProviderError::Decode(err.to_string()))?;
        let answer = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        trace!(chars = answer.len(), "chat completion received");
        Ok(answer)
    }
}

fn classify_transport(err: reqwest::Error) -> ProviderError {
    let message = err.to_string();
    if err.status().map(|s| s.as_u16()) == Some(429) || mentions_rate_limit(&message) {
        ProviderError::RateLimited {
            status: err.status().map(|s| s.as_u16()),
            message,
        }
    } else if err.is_timeout() || err.is_connect() || err.is_body() {
        ProviderError::Transient(message)
    } else {
        ProviderError::Transport(message)
    }
}

fn build_body<'a>(model: &'a str, request: &'a ChatRequest<'a>) -> ChatBody<'a> {
    ChatBody {
        model,
        temperature: request.temperature,
        max_tokens: request.max_tokens,
        response_format: request
            .json_mode
            .then_some(ResponseFormat { kind: "json_object" }),
        messages: [
            ChatMessage::System {
                content: request.system,
            },
            ChatMessage::User {
                content: request.parts,
            },
        ],
    }
}

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
    messages: [ChatMessage<'a>; 2],
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
#[serde(tag = "role", rename_all = "lowercase")]
enum ChatMessage<'a> {
    System { content: &'a str },
    User { content: &'a [ContentPart] },
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    #[serde(default)]
    content: Option<String>,
}
