//! HTTP clients for the text-generation service.
//!
//! Supports:
//! - OpenAI-compatible chat completions (`/v1/chat/completions`)
//! - Ollama chat (`/api/chat`, non-streaming)

use crate::config::{ModelConfig, Provider};
use crate::error::{PipelineError, Result};
use crate::generator::prompt::build_prompt;
use crate::generator::SummaryGenerator;
use crate::models::ClientAggregate;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Message in a chat request or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
}

impl ChatMessage {
    fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.to_string()),
        }
    }
}

/// OpenAI chat completions request.
#[derive(Debug, Serialize)]
struct OpenAiChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

/// OpenAI chat completions response.
#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: ChatMessage,
}

/// Ollama chat API request.
#[derive(Debug, Serialize)]
struct OllamaChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

/// Ollama chat API response.
#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

/// Summary generator backed by a chat-completion API.
pub struct LlmSummaryGenerator {
    config: ModelConfig,
    http_client: reqwest::Client,
}

impl LlmSummaryGenerator {
    /// Create a generator from the model settings.
    pub fn new(config: ModelConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| PipelineError::config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http_client,
        })
    }

    /// Send one prompt and return the trimmed completion.
    async fn complete(&self, client: &str, prompt: &str) -> Result<String> {
        let base = self.config.api_url.trim_end_matches('/');

        let request = match self.config.provider {
            Provider::Openai => {
                let body = OpenAiChatRequest {
                    model: &self.config.name,
                    messages: vec![ChatMessage::user(prompt)],
                    temperature: self.config.temperature,
                };
                let mut request = self
                    .http_client
                    .post(format!("{}/v1/chat/completions", base))
                    .json(&body);
                if let Some(ref key) = self.config.api_key {
                    request = request.bearer_auth(key);
                }
                request
            }
            Provider::Ollama => {
                let body = OllamaChatRequest {
                    model: &self.config.name,
                    messages: vec![ChatMessage::user(prompt)],
                    stream: false,
                    options: OllamaOptions {
                        temperature: self.config.temperature,
                    },
                };
                self.http_client
                    .post(format!("{}/api/chat", base))
                    .json(&body)
            }
        };

        debug!(
            "Requesting summary for {} from {} ({} chars)",
            client,
            self.config.name,
            prompt.len()
        );

        let response = request.send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("Request timed out after {}s", self.config.timeout_seconds)
            } else if e.is_connect() {
                format!("Cannot connect to {}", self.config.api_url)
            } else {
                format!("Failed to send request: {}", e)
            };
            PipelineError::generation(client, message)
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::generation(
                client,
                format!("API error {}: {}", status, body),
            ));
        }

        let content = match self.config.provider {
            Provider::Openai => {
                let parsed: OpenAiChatResponse = response.json().await.map_err(|e| {
                    PipelineError::generation(client, format!("Malformed response: {}", e))
                })?;
                parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|choice| choice.message.content)
            }
            Provider::Ollama => {
                let parsed: OllamaChatResponse = response.json().await.map_err(|e| {
                    PipelineError::generation(client, format!("Malformed response: {}", e))
                })?;
                parsed.message.content
            }
        };

        let text = content.map(|c| c.trim().to_string()).unwrap_or_default();
        if text.is_empty() {
            return Err(PipelineError::generation(client, "Empty completion"));
        }

        Ok(text)
    }
}

#[async_trait]
impl SummaryGenerator for LlmSummaryGenerator {
    async fn summarize(
        &self,
        client: &str,
        period_label: &str,
        aggregate: &ClientAggregate,
    ) -> Result<String> {
        let prompt = build_prompt(client, period_label, aggregate);
        self.complete(client, &prompt).await
    }
}
