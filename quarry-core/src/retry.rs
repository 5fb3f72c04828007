//! Retry with exponential backoff, and the bounded-concurrency content fetcher.

use crate::config::RetryConfig;
use crate::error::ProviderError;
use crate::ports::{Document, SearchFilters, SearchProvider, SourceRef};
use futures::future;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Run `operation` until it succeeds, fails fatally, or runs out of attempts.
///
/// Transient errors (see [`ProviderError::is_transient`]) are retried with
/// exponential backoff; a rate limit waits at least the server's retry-after.
/// Fatal errors return unchanged on first sight. Running out of attempts on
/// a transient error yields [`ProviderError::Exhausted`].
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    label: &str,
    operation: F,
) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation().await {
            Ok(val) => {
                if attempt > 1 {
                    tracing::debug!(label, attempt, "Succeeded after retry");
                }
                return Ok(val);
            }
            Err(e) if !e.is_transient() => {
                tracing::debug!(label, attempt, error = %e, "Non-retryable error");
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::warn!(label, attempts = attempt, error = %e, "Retries exhausted");
                return Err(ProviderError::Exhausted {
                    attempts: attempt,
                    last: Box::new(e),
                });
            }
            Err(e) => {
                let backoff_ms = compute_backoff(config, attempt - 1, &e);
                tracing::warn!(
                    label,
                    attempt,
                    max = max_attempts,
                    backoff_ms,
                    error = %e,
                    "Retrying after transient error"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}

/// Backoff before the retry that follows failed attempt `attempt` (0-based),
/// never shorter than a server-provided retry-after.
fn compute_backoff(config: &RetryConfig, attempt: u32, err: &ProviderError) -> u64 {
    let computed = compute_exponential_backoff(config, attempt);
    if let ProviderError::RateLimited {
        retry_after_secs, ..
    } = err
    {
        return (retry_after_secs * 1000).max(computed);
    }
    computed
}

fn compute_exponential_backoff(config: &RetryConfig, attempt: u32) -> u64 {
    let base = config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let capped = base.min(config.max_backoff_ms as f64) as u64;
    if config.jitter {
        // Up to 25% on top.
        let jitter = (capped as f64 * 0.25 * rand::thread_rng().r#gen::<f64>()) as u64;
        capped + jitter
    } else {
        capped
    }
}

/// A URL that could not be fetched.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub url: String,
    pub error: ProviderError,
}

/// Result of fetching a batch of URLs.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Successful fetches, in input order.
    pub documents: Vec<Document>,
    pub failures: Vec<FetchFailure>,
}

/// Search provider wrapped with retry and bounded fetch concurrency.
#[derive(Clone)]
pub struct RetryingFetcher {
    provider: Arc<dyn SearchProvider>,
    config: RetryConfig,
}

impl RetryingFetcher {
    pub fn new(provider: Arc<dyn SearchProvider>, config: RetryConfig) -> Self {
        Self { provider, config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Retry an arbitrary capability call under this fetcher's policy.
    pub async fn call<F, Fut, T>(&self, label: &str, operation: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        with_retry(&self.config, label, operation).await
    }

    pub async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<SourceRef>, ProviderError> {
        let mut hits = self
            .call("search", || self.provider.search(query, filters))
            .await?;
        hits.truncate(filters.max_results);
        Ok(hits)
    }

    /// Fetch every source with at most `fetch_concurrency` requests in flight.
    ///
    /// Per-URL failures, retried or fatal, are collected instead of failing
    /// the batch.
    pub async fn fetch_all(&self, sources: &[SourceRef]) -> FetchOutcome {
        let semaphore = Semaphore::new(self.config.fetch_concurrency.max(1));
        let fetches = sources.iter().cloned().map(|source| {
            let semaphore = &semaphore;
            async move {
                let _permit = semaphore.acquire().await.ok();
                let result = self
                    .call("fetch_content", || self.provider.fetch_content(&source.url))
                    .await
                    .map(|mut doc| {
                        if doc.title.trim().is_empty() {
                            doc.title = source.title.clone();
                        }
                        if doc.published_date.is_none() {
                            doc.published_date = source.published_date.clone();
                        }
                        doc
                    });
                (source.url, result)
            }
        });
        let results = future::join_all(fetches).await;

        let mut outcome = FetchOutcome::default();
        for (url, result) in results {
            match result {
                Ok(doc) => outcome.documents.push(doc),
                Err(error) => {
                    tracing::warn!(url = %url, error = %error, "Dropping source after fetch failure");
                    outcome.failures.push(FetchFailure { url, error });
                }
            }
        }
        outcome
    }
}
