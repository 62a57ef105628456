//! OpenAI-compatible chat-completions client.
//!
//! Works against any endpoint that speaks the `/chat/completions` protocol
//! (OpenAI, OpenRouter, vLLM, Ollama's compatibility layer, ...). Buffered
//! requests read a single JSON body; streaming requests decode Server-Sent
//! Events and concatenate `choices[].delta.content`.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{LlmError, LlmResult};
use crate::message::Message;
use crate::service::ChatService;

/// Default endpoint base when `OPENAI_API_URL` is unset.
pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1";

/// Default model when `GPT_MODEL` is unset.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Connection settings for the chat service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    /// Bearer token. Never written back out when a config is serialized.
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    /// Endpoint base URL (`.../v1`) or the full `.../chat/completions` URL.
    pub api_url: String,
    /// Model identifier sent with every request.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Whole-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            api_key: None,
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            temperature: 0.7,
            timeout_secs: 300,
        }
    }
}

impl LlmConfig {
    /// Defaults overridden by `OPENAI_API_KEY`, `OPENAI_API_URL` and `GPT_MODEL`.
    pub fn from_env() -> Self {
        Self::default().merge_env()
    }

    /// Override fields that have a matching environment variable set.
    pub fn merge_env(mut self) -> Self {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            if !key.trim().is_empty() {
                self.api_key = Some(key);
            }
        }
        if let Ok(url) = std::env::var("OPENAI_API_URL") {
            if !url.trim().is_empty() {
                self.api_url = url;
            }
        }
        if let Ok(model) = std::env::var("GPT_MODEL") {
            if !model.trim().is_empty() {
                self.model = model;
            }
        }
        self
    }

    /// Full chat-completions URL.
    pub fn endpoint(&self) -> String {
        let base = self.api_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{}/chat/completions", base)
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Deserialize, Default)]
struct Delta {
    content: Option<String>,
}

/// HTTP client for an OpenAI-compatible chat endpoint.
pub struct OpenAiChatClient {
    config: LlmConfig,
    http_client: reqwest::Client,
}

impl OpenAiChatClient {
    /// Create a new client.
    pub fn new(config: LlmConfig) -> LlmResult<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("stratloop/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(OpenAiChatClient {
            config,
            http_client,
        })
    }

    /// Create a client from environment variables.
    pub fn from_env() -> LlmResult<Self> {
        Self::new(LlmConfig::from_env())
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    async fn send(&self, messages: &[Message], stream: bool) -> LlmResult<reqwest::Response> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or(LlmError::MissingApiKey)?;

        let request = ChatRequest {
            model: &self.config.model,
            messages,
            temperature: self.config.temperature,
            stream,
        };

        debug!(
            model = %self.config.model,
            messages = messages.len(),
            stream = stream,
            "sending chat request"
        );

        let response = self
            .http_client
            .post(self.config.endpoint())
            .bearer_auth(api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "chat request rejected");
            return Err(LlmError::status(status.as_u16(), &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl ChatService for OpenAiChatClient {
    async fn complete(&self, messages: &[Message]) -> LlmResult<String> {
        let response = self.send(messages, false).await?;
        let body = response.text().await?;
        parse_completion(&body)
    }

    async fn complete_streaming(
        &self,
        messages: &[Message],
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> LlmResult<String> {
        let response = self.send(messages, true).await?;
        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut content = String::new();

        'read: while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            for payload in decoder.push(&bytes) {
                if apply_stream_payload(&payload, &mut content, on_chunk)? {
                    break 'read;
                }
            }
        }
        if let Some(payload) = decoder.finish() {
            apply_stream_payload(&payload, &mut content, on_chunk)?;
        }

        if content.is_empty() {
            return Err(LlmError::EmptyResponse);
        }
        Ok(content)
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

/// Extract the first choice's text from a buffered completion body.
pub(crate) fn parse_completion(body: &str) -> LlmResult<String> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|err| LlmError::MalformedResponse(format!("invalid completion body: {}", err)))?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::MalformedResponse("response has no choices".to_string()))?;
    match choice.message.and_then(|m| m.content) {
        Some(text) if !text.is_empty() => Ok(text),
        _ => Err(LlmError::EmptyResponse),
    }
}

/// Apply one SSE `data:` payload. Returns `true` on the `[DONE]` terminator.
pub(crate) fn apply_stream_payload(
    payload: &str,
    content: &mut String,
    on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
) -> LlmResult<bool> {
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(false);
    }
    if payload == "[DONE]" {
        return Ok(true);
    }

    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|err| LlmError::MalformedResponse(format!("invalid stream chunk: {}", err)))?;
    for choice in chunk.choices {
        if let Some(text) = choice.delta.content {
            if !text.is_empty() {
                content.push_str(&text);
                on_chunk(&text);
            }
        }
    }
    Ok(false)
}

/// Incremental Server-Sent Events decoder.
///
/// Bytes are buffered until a full line is available so multi-byte UTF-8
/// sequences split across network chunks decode correctly.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    event_data: String,
}

impl SseDecoder {
    /// Feed raw bytes; returns the payloads of every event completed by them.
    pub(crate) fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(&['\n', '\r'][..]);

            if line.is_empty() {
                if !self.event_data.is_empty() {
                    events.push(std::mem::take(&mut self.event_data));
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            if let Some(data) = line.strip_prefix("data:") {
                if !self.event_data.is_empty() {
                    self.event_data.push('\n');
                }
                self.event_data.push_str(data.strip_prefix(' ').unwrap_or(data));
            }
        }
        events
    }

    /// Flush a trailing event that was not terminated by a blank line.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            if let Some(data) = line.trim_end().strip_prefix("data:") {
                if !self.event_data.is_empty() {
                    self.event_data.push('\n');
                }
                self.event_data.push_str(data.trim_start());
            }
        }
        if self.event_data.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.event_data))
        }
    }
}
