//! Exa search API adapter.

use crate::config::{SearchConfig, resolve_api_key};
use crate::error::{ConfigError, ProviderError};
use crate::ports::{Document, SearchFilters, SearchProvider, SourceRef};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

const PROVIDER: &str = "exa";

/// Web search and page text over the Exa HTTP API.
pub struct ExaSearchProvider {
    client: Client,
    base_url: String,
    api_key: String,
    timeout_secs: u64,
    max_characters: usize,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExaResult {
    #[serde(default)]
    id: Option<String>,
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    score: Option<f64>,
    #[serde(default)]
    published_date: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExaResponse {
    #[serde(default)]
    results: Vec<ExaResult>,
}

impl ExaSearchProvider {
    /// `max_characters` caps the text the API returns per page.
    pub fn new(config: &SearchConfig, max_characters: usize) -> Result<Self, ConfigError> {
        let api_key = resolve_api_key(config.api_key.as_deref(), &config.api_key_env)?;
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
            timeout_secs: config.timeout_secs,
            max_characters,
        })
    }

    fn search_body(query: &str, filters: &SearchFilters) -> Value {
        let mut body = json!({
            "query": query,
            "numResults": filters.max_results,
            "type": "auto",
        });
        if !filters.include_domains.is_empty() {
            body["includeDomains"] = json!(filters.include_domains);
        }
        if !filters.exclude_domains.is_empty() {
            body["excludeDomains"] = json!(filters.exclude_domains);
        }
        body
    }

    async fn post(&self, path: &str, body: &Value) -> Result<ExaResponse, ProviderError> {
        let url = format!("{}/{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| super::map_send_error(PROVIDER, self.timeout_secs, e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response
            .text()
            .await
            .map_err(|e| super::map_send_error(PROVIDER, self.timeout_secs, e))?;

        if !status.is_success() {
            return Err(super::map_http_error(
                PROVIDER,
                status,
                retry_after.as_deref(),
                &text,
            ));
        }
        parse_response(&text)
    }
}

fn parse_response(text: &str) -> Result<ExaResponse, ProviderError> {
    serde_json::from_str(text).map_err(|e| ProviderError::ResponseParse {
        provider: PROVIDER.to_string(),
        message: format!("Invalid JSON: {e}"),
    })
}

impl From<ExaResult> for SourceRef {
    fn from(r: ExaResult) -> Self {
        SourceRef {
            id: r.id.unwrap_or_else(|| r.url.clone()),
            title: r.title.unwrap_or_default(),
            url: r.url,
            score: r.score,
            published_date: r.published_date,
            author: r.author,
        }
    }
}

#[async_trait]
impl SearchProvider for ExaSearchProvider {
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<SourceRef>, ProviderError> {
        debug!(query = %query, max_results = filters.max_results, "Exa search");
        let response = self
            .post("search", &Self::search_body(query, filters))
            .await?;
        Ok(response.results.into_iter().map(SourceRef::from).collect())
    }

    async fn fetch_content(&self, url: &str) -> Result<Document, ProviderError> {
        let body = json!({
            "urls": [url],
            "text": { "maxCharacters": self.max_characters },
        });
        let response = self.post("contents", &body).await?;
        let result = response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::ResponseParse {
                provider: PROVIDER.to_string(),
                message: format!("No content returned for {url}"),
            })?;
        Ok(Document {
            url: result.url,
            title: result.title.unwrap_or_default(),
            text: result.text.unwrap_or_default(),
            published_date: result.published_date,
        })
    }

    fn name(&self) -> &str {
        PROVIDER
    }
}
