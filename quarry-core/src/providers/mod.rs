//! HTTP adapters for the capability ports.
//!
//! - [`exa`]: web search and page contents from an Exa-compatible API
//! - [`openai_compat`]: chat completions from any OpenAI-compatible endpoint
//! - [`model`]: the research judgments and writing built on a chat model

pub mod exa;
pub mod model;
pub mod openai_compat;
pub mod prompts;

use crate::config::{LlmConfig, SearchConfig};
use crate::error::{ConfigError, ProviderError};
use crate::ports::{ResearchModel, SearchProvider};
use std::sync::Arc;
use tracing::debug;

pub use exa::ExaSearchProvider;
pub use model::LlmResearchModel;
pub use openai_compat::{ChatMessage, ChatModel, OpenAiCompatibleClient};

/// Default wait when a 429 carries no usable retry hint.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

/// Map a non-success HTTP status to a classified provider error.
pub(crate) fn map_http_error(
    provider: &str,
    status: reqwest::StatusCode,
    retry_after: Option<&str>,
    body: &str,
) -> ProviderError {
    let provider = provider.to_string();
    let message = body.chars().take(300).collect::<String>();
    match status.as_u16() {
        401 | 403 => {
            debug!(provider = %provider, body = %body, "Authentication failed");
            ProviderError::AuthFailed { provider }
        }
        429 => ProviderError::RateLimited {
            provider,
            retry_after_secs: retry_after
                .and_then(|v| v.trim().parse::<u64>().ok())
                .or_else(|| retry_hint_from_body(body))
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS),
        },
        408 => ProviderError::Timeout {
            provider,
            timeout_secs: 0,
        },
        status if status >= 500 => ProviderError::Server {
            provider,
            status,
            message,
        },
        status => ProviderError::InvalidRequest {
            provider,
            message: format!("HTTP {status}: {message}"),
        },
    }
}

/// Pull "try again in Ns" out of an error body.
fn retry_hint_from_body(body: &str) -> Option<u64> {
    let message = serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error")?.get("message")?.as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string());
    let tail = message.rsplit("in ").next()?;
    let digits: String = tail
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Map a transport-level failure.
pub(crate) fn map_send_error(provider: &str, timeout_secs: u64, err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout {
            provider: provider.to_string(),
            timeout_secs,
        }
    } else {
        ProviderError::Connection {
            provider: provider.to_string(),
            message: err.to_string(),
        }
    }
}

/// Build the search adapter from configuration.
pub fn create_search_provider(
    config: &SearchConfig,
    max_content_chars: usize,
) -> Result<Arc<dyn SearchProvider>, ConfigError> {
    Ok(Arc::new(ExaSearchProvider::new(config, max_content_chars)?))
}

/// Build the research model on top of an OpenAI-compatible chat client.
pub fn create_research_model(config: &LlmConfig) -> Result<Arc<dyn ResearchModel>, ConfigError> {
    let chat = OpenAiCompatibleClient::new(config)?;
    Ok(Arc::new(LlmResearchModel::new(Arc::new(chat))))
}
