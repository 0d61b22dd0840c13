//! Model client for AI inference using OpenAI-compatible API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;

/// Default number of retry attempts for failed requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay between retry attempts in seconds.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 2;

/// Model client errors.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("Failed to parse response: {0}")]
    ParseError(String),
    #[error("API error: {0}")]
    ApiError(String),
    #[error("Max retries exceeded after {0} attempts: {1}")]
    MaxRetriesExceeded(u32, String),
    #[error("Model unavailable: {0}")]
    Unavailable(String),
}

/// A text-completion service.
///
/// Callers must never assume the returned text is valid structured output.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Complete a prompt.
    async fn complete(&self, prompt: &str) -> Result<String, ModelError>;

    /// Complete a prompt, forwarding text deltas as they arrive.
    ///
    /// Returns the full text. The default forwards the whole completion as
    /// a single delta.
    async fn complete_stream(
        &self,
        prompt: &str,
        deltas: mpsc::Sender<String>,
    ) -> Result<String, ModelError> {
        let text = self.complete(prompt).await?;
        // A dropped receiver only means nobody is watching.
        let _ = deltas.send(text.clone()).await;
        Ok(text)
    }
}

/// Configuration for the AI model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub base_url: String,
    pub api_key: String,
    pub model_name: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub extra_body: HashMap<String, Value>,
    /// System message prepended to every completion.
    pub system_prompt: Option<String>,
    /// Maximum number of retry attempts for failed requests.
    pub max_retries: u32,
    /// Delay between retry attempts in seconds.
    pub retry_delay_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            api_key: "EMPTY".to_string(),
            model_name: "gpt-4o-mini".to_string(),
            max_tokens: 2000,
            // Deterministic planning relies on a zero temperature.
            temperature: 0.0,
            top_p: 0.85,
            extra_body: HashMap::new(),
            system_prompt: None,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY_SECS,
        }
    }
}

impl ModelConfig {
    /// Create a new ModelConfig with custom base URL.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Create a new ModelConfig with custom API key.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Create a new ModelConfig with custom model name.
    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = model_name.into();
        self
    }

    /// Set the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the maximum number of retry attempts for failed requests.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the delay between retry attempts in seconds.
    pub fn with_retry_delay(mut self, delay_secs: u64) -> Self {
        self.retry_delay_secs = delay_secs;
        self
    }
}

/// OpenAI API response structures.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Client for OpenAI-compatible chat completion endpoints.
pub struct ModelClient {
    config: ModelConfig,
    client: Client,
}

impl ModelClient {
    /// Create a new ModelClient with the given configuration.
    pub fn new(config: ModelConfig) -> Self {
        Self {
            config,
            client: Client::new(),
        }
    }

    /// Create a new ModelClient with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ModelConfig::default())
    }

    /// The client configuration.
    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// Send a chat request and return the assistant text.
    ///
    /// Retries network errors, 5xx, 429 and timeouts up to
    /// `max_retries` times.
    pub async fn request(&self, messages: &[Value]) -> Result<String, ModelError> {
        let url = self.completions_url();
        let body = self.build_body(messages, false);

        let mut last_error: Option<ModelError> = None;
        let max_attempts = self.config.max_retries + 1;

        for attempt in 1..=max_attempts {
            match self.send_request(&url, &body).await {
                Ok(content) => return Ok(content),
                Err(e) => {
                    if !Self::is_retryable_error(&e) {
                        return Err(e);
                    }
                    if attempt < max_attempts {
                        tracing::warn!(
                            attempt,
                            max_attempts,
                            delay_secs = self.config.retry_delay_secs,
                            "Model request failed, retrying: {}",
                            e
                        );
                        sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(ModelError::MaxRetriesExceeded(
            self.config.max_retries,
            last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "Unknown error".to_string()),
        ))
    }

    /// Send a streaming chat request, forwarding deltas.
    pub async fn request_stream(
        &self,
        messages: &[Value],
        deltas: mpsc::Sender<String>,
    ) -> Result<String, ModelError> {
        let url = self.completions_url();
        let body = self.build_body(messages, true);

        let mut response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ModelError::ApiError(format!("{}: {}", status, error_text)));
        }

        let mut lines = SseLineBuffer::default();
        let mut full_text = String::new();

        while let Some(chunk) = response.chunk().await? {
            lines.extend(&chunk);

            while let Some(line) = lines.next_line() {
                match parse_sse_line(&line) {
                    SseLine::Delta(text) => {
                        full_text.push_str(&text);
                        let _ = deltas.send(text).await;
                    }
                    SseLine::Done => return Ok(full_text),
                    SseLine::Skip => {}
                }
            }
        }

        if let SseLine::Delta(text) = parse_sse_line(&lines.remainder()) {
            full_text.push_str(&text);
            let _ = deltas.send(text).await;
        }

        Ok(full_text)
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn build_body(&self, messages: &[Value], stream: bool) -> Value {
        let mut body = json!({
            "messages": messages,
            "model": self.config.model_name,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "top_p": self.config.top_p,
            "stream": stream,
        });

        if let Value::Object(ref mut map) = body {
            for (key, value) in &self.config.extra_body {
                map.insert(key.clone(), value.clone());
            }
        }

        body
    }

    fn build_messages(&self, prompt: &str) -> Vec<Value> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.config.system_prompt {
            messages.push(MessageBuilder::create_system_message(system));
        }
        messages.push(MessageBuilder::create_user_message(prompt));
        messages
    }

    /// Check if an error is retryable (network errors, timeouts, etc.)
    fn is_retryable_error(error: &ModelError) -> bool {
        match error {
            ModelError::RequestFailed(_) => true,
            ModelError::ApiError(msg) => {
                let lower = msg.to_lowercase();
                ["500", "502", "503", "504", "429"]
                    .iter()
                    .any(|code| msg.contains(code))
                    || lower.contains("timeout")
                    || lower.contains("rate limit")
            }
            ModelError::ParseError(_)
            | ModelError::MaxRetriesExceeded(_, _)
            | ModelError::Unavailable(_) => false,
        }
    }

    /// Send a single request to the API.
    async fn send_request(&self, url: &str, body: &Value) -> Result<String, ModelError> {
        let response = self
            .client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(ModelError::ApiError(format!("{}: {}", status, error_text)));
        }

        let completion: ChatCompletionResponse = response.json().await?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| ModelError::ParseError("No choices in response".to_string()))
    }
}

#[async_trait]
impl LanguageModel for ModelClient {
    async fn complete(&self, prompt: &str) -> Result<String, ModelError> {
        let messages = self.build_messages(prompt);
        self.request(&messages).await
    }

    async fn complete_stream(
        &self,
        prompt: &str,
        deltas: mpsc::Sender<String>,
    ) -> Result<String, ModelError> {
        let messages = self.build_messages(prompt);
        self.request_stream(&messages, deltas).await
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Delta(String),
    Done,
    Skip,
}

/// Raw stream bytes split into lines.
///
/// Chunks may end inside a multi-byte character, so decoding waits for a
/// full line.
#[derive(Default)]
struct SseLineBuffer {
    bytes: Vec<u8>,
}

impl SseLineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<String> {
        let newline = self.bytes.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.bytes.drain(..=newline).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }

    fn remainder(&mut self) -> String {
        let rest = std::mem::take(&mut self.bytes);
        String::from_utf8_lossy(&rest).into_owned()
    }
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(payload) = line.trim().strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    serde_json::from_str::<StreamChunk>(payload)
        .ok()
        .and_then(|chunk| chunk.choices.into_iter().next())
        .and_then(|choice| choice.delta.content)
        .filter(|text| !text.is_empty())
        .map(SseLine::Delta)
        .unwrap_or(SseLine::Skip)
}

/// Helper for building conversation messages.
pub struct MessageBuilder;

impl MessageBuilder {
    /// Create a system message.
    pub fn create_system_message(content: &str) -> Value {
        json!({
            "role": "system",
            "content": content
        })
    }

    /// Create a user message.
    pub fn create_user_message(content: &str) -> Value {
        json!({
            "role": "user",
            "content": content
        })
    }

    /// Create an assistant message.
    pub fn create_assistant_message(content: &str) -> Value {
        json!({
            "role": "assistant",
            "content": content
        })
    }
}

static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(\{.*?\})\s*```").expect("valid fenced block regex")
});

/// Extract the first JSON object from free-form model output.
///
/// Tries, in order: the whole text, fenced code blocks, and the span from
/// the first `{` to the last `}`. Returns `None` if nothing parses as an
/// object.
pub fn extract_json(response: &str) -> Option<Value> {
    let trimmed = response.trim();

    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    for captures in FENCED_BLOCK.captures_iter(trimmed) {
        if let Some(block) = captures.get(1) {
            if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(block.as_str()) {
                return Some(value);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}
