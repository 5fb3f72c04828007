//! OpenAI-compatible chat client.
//!
//! Works against OpenAI, Azure OpenAI, Ollama, vLLM, LM Studio, and any
//! endpoint that follows the chat completions API format.

use crate::config::{LlmConfig, resolve_api_key};
use crate::error::{ConfigError, ProviderError};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const PROVIDER: &str = "openai";

/// One message of a chat exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A text-in, text-out language model.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Run one completion and return the assistant's text.
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ProviderError>;

    fn model_name(&self) -> &str;
}

/// Chat completions over HTTP.
pub struct OpenAiCompatibleClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
    timeout_secs: u64,
}

impl OpenAiCompatibleClient {
    /// Create a client from configuration.
    ///
    /// Local endpoints (Ollama, vLLM, LM Studio) don't need an API key.
    pub fn new(config: &LlmConfig) -> Result<Self, ConfigError> {
        let api_key = match resolve_api_key(config.api_key.as_deref(), &config.api_key_env) {
            Ok(key) => key,
            Err(_) if is_local(&config.base_url) => {
                debug!("No API key set for local endpoint; using dummy bearer token");
                "ollama".to_string()
            }
            Err(e) => return Err(e),
        };
        Self::new_with_key(config, api_key)
    }

    /// Create a client with an API key resolved elsewhere.
    pub fn new_with_key(config: &LlmConfig, api_key: String) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid {
                message: format!("Failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout_secs: config.timeout_secs,
        })
    }

    fn request_body(&self, messages: &[ChatMessage]) -> Value {
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        })
    }

    /// Pull the assistant text out of a chat completions response.
    fn parse_response(body: &Value) -> Result<String, ProviderError> {
        let parse_error = |message: &str| ProviderError::ResponseParse {
            provider: PROVIDER.to_string(),
            message: message.to_string(),
        };
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| parse_error("No choices in response"))?;
        let content = choice
            .get("message")
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| parse_error("No message content in choice"))?;
        if content.trim().is_empty() {
            return Err(parse_error("Empty completion"));
        }
        Ok(content.to_string())
    }
}

fn is_local(base_url: &str) -> bool {
    base_url.contains("localhost") || base_url.contains("127.0.0.1")
}

#[async_trait]
impl ChatModel for OpenAiCompatibleClient {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(url = %url, model = %self.model, messages = messages.len(), "Sending chat completion request");

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.request_body(messages))
            .send()
            .await
            .map_err(|e| super::map_send_error(PROVIDER, self.timeout_secs, e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let response_body = response
            .text()
            .await
            .map_err(|e| super::map_send_error(PROVIDER, self.timeout_secs, e))?;

        if !status.is_success() {
            return Err(super::map_http_error(
                PROVIDER,
                status,
                retry_after.as_deref(),
                &response_body,
            ));
        }

        let json: Value =
            serde_json::from_str(&response_body).map_err(|e| ProviderError::ResponseParse {
                provider: PROVIDER.to_string(),
                message: format!("Invalid JSON: {e}"),
            })?;
        Self::parse_response(&json)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
