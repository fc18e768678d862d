//! Language-model provider abstraction and the OpenAI-compatible client.
//!
//! Defines the [`LlmProvider`] trait consumed by every prompt-driven
//! component (analyzer, judge, synthesizer, evaluator, refiner) and one
//! concrete implementation, [`OpenAiCompatProvider`], which speaks the
//! `POST /chat/completions` dialect served by OpenAI, Ollama, vLLM, and
//! most local inference servers.
//!
//! # Retry Strategy
//!
//! The HTTP provider retries transient failures with exponential backoff:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Retry exists only at this boundary; the orchestration layer above never
//! retries and converts any surviving error into fallback data.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::LlmConfig;

/// Per-call generation parameters. `None` fields use server defaults.
#[derive(Debug, Clone, Default)]
pub struct GenerationParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// A language-model inference engine.
///
/// Implementations must support both a single buffered result and
/// incremental token delivery. The orchestration core only consumes the
/// buffered form; streaming exists for callers that relay tokens onward.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"qwen3:8b"`).
    fn model_name(&self) -> &str;

    /// Generate a complete response for the prompt.
    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        params: Option<&GenerationParams>,
    ) -> Result<String>;

    /// Generate a response as a stream of text deltas.
    ///
    /// The default implementation buffers [`generate`](LlmProvider::generate)
    /// and delivers it as a single delta.
    async fn generate_stream(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        params: Option<&GenerationParams>,
    ) -> Result<mpsc::Receiver<String>> {
        let text = self.generate(prompt, system_prompt, params).await?;
        let (tx, rx) = mpsc::channel(1);
        // Receiver may already be dropped; nothing to do then.
        let _ = tx.send(text).await;
        Ok(rx)
    }
}

/// Provider for OpenAI-compatible chat-completion endpoints.
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_retries: u32,
    default_temperature: f32,
}

impl OpenAiCompatProvider {
    /// Create a provider from configuration.
    ///
    /// When `api_key_env` is set, the key is read from that environment
    /// variable once at construction; a missing variable is an error.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = match &config.api_key_env {
            Some(var) => Some(
                std::env::var(var)
                    .map_err(|_| anyhow::anyhow!("{} environment variable not set", var))?,
            ),
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            max_retries: config.max_retries,
            default_temperature: config.temperature,
        })
    }

    fn request_body(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        params: Option<&GenerationParams>,
        stream: bool,
    ) -> Value {
        let mut messages = Vec::new();
        if let Some(system) = system_prompt {
            messages.push(serde_json::json!({ "role": "system", "content": system }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": prompt }));

        let temperature = params
            .and_then(|p| p.temperature)
            .unwrap_or(self.default_temperature);

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "stream": stream,
        });
        if let Some(max_tokens) = params.and_then(|p| p.max_tokens) {
            body["max_tokens"] = max_tokens.into();
        }
        body
    }

    async fn send(&self, body: &Value) -> Result<reqwest::Response> {
        let mut req = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(key) = &self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        Ok(req.send().await?)
    }
}

#[async_trait]
impl LlmProvider for OpenAiCompatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        params: Option<&GenerationParams>,
    ) -> Result<String> {
        let body = self.request_body(prompt, system_prompt, params, false);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            match self.send(&body).await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response.json().await?;
                        return parse_completion(&json);
                    }

                    // Rate limited or server error, retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        debug!(attempt, %status, "chat completion retryable error");
                        last_err =
                            Some(anyhow::anyhow!("LLM API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429), don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("LLM API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e);
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Generation failed after retries")))
    }

    async fn generate_stream(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
        params: Option<&GenerationParams>,
    ) -> Result<mpsc::Receiver<String>> {
        let body = self.request_body(prompt, system_prompt, params, true);
        let response = self.send(&body).await?;
        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            bail!("LLM API error {}: {}", status, body_text);
        }

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut response = response;
            let mut buffer = String::new();
            while let Ok(Some(bytes)) = response.chunk().await {
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                // SSE events are newline-delimited `data: {...}` lines.
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(payload) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let payload = payload.trim();
                    if payload == "[DONE]" {
                        return;
                    }
                    if let Ok(json) = serde_json::from_str::<Value>(payload) {
                        if let Some(delta) = json["choices"][0]["delta"]["content"].as_str() {
                            if !delta.is_empty() && tx.send(delta.to_string()).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Pull the assistant message text out of a chat-completion response.
fn parse_completion(json: &Value) -> Result<String> {
    json["choices"]
        .get(0)
        .and_then(|c| c["message"]["content"].as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| anyhow::anyhow!("Invalid completion response: missing message content"))
}
