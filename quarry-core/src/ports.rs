//! Capability ports: the search and language-model seams the orchestrator
//! depends on.
//!
//! Both traits are object-safe and injected as `Arc<dyn ...>`, so the job
//! pipeline runs unchanged against the HTTP adapters in [`crate::providers`]
//! or the scripted doubles in [`crate::mock`].

use crate::error::ProviderError;
use crate::research::{Citation, Note};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A search hit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRef {
    pub id: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub published_date: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
}

impl SourceRef {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            id: url.clone(),
            url,
            title: title.into(),
            score: None,
            published_date: None,
            author: None,
        }
    }
}

/// Fetched page content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    pub url: String,
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub published_date: Option<String>,
}

/// Search restrictions applied to every query of a job.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchFilters {
    pub max_results: usize,
    pub include_domains: Vec<String>,
    pub exclude_domains: Vec<String>,
}

impl SearchFilters {
    /// Same domain restrictions with a different result count.
    pub fn with_max_results(&self, max_results: usize) -> Self {
        Self {
            max_results,
            ..self.clone()
        }
    }
}

/// The research plan produced by `decompose`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Brief {
    pub title: String,
    pub scope: String,
    pub subtopics: Vec<String>,
}

/// Outcome of the ambiguity judgment on the probe results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ambiguity {
    Clear,
    Ambiguous { question: String },
}

/// The judge's sufficiency signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sufficiency {
    /// More research is needed; `proposed` is the judge's preferred next subtopic.
    Continue {
        proposed: Option<String>,
        reason: String,
    },
    /// The notes cover the query.
    Stop { reason: String },
}

/// Everything the sufficiency judge sees.
#[derive(Debug, Clone, Copy)]
pub struct SufficiencyRequest<'a> {
    pub query: &'a str,
    pub brief: &'a Brief,
    pub notes: &'a [Note],
    /// Planned subtopics not yet researched.
    pub remaining_plan: &'a [String],
    pub researched: &'a [String],
    pub iteration: usize,
    pub max_iterations: usize,
}

/// Job context handed to `synthesize`.
#[derive(Debug, Clone, Copy)]
pub struct SynthesisContext<'a> {
    pub query: &'a str,
    pub brief: &'a Brief,
}

/// Everything the report writer sees.
#[derive(Debug, Clone, Copy)]
pub struct ReportRequest<'a> {
    pub query: &'a str,
    pub brief: &'a Brief,
    pub notes: &'a [Note],
    pub citations: &'a [Citation],
}

/// Report text before the core renumbers sources and persists it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftReport {
    pub title: String,
    pub content: String,
}

/// Web search and content retrieval.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Search the web, returning hits in relevance order.
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<SourceRef>, ProviderError>;

    /// Fetch the readable text of one URL.
    async fn fetch_content(&self, url: &str) -> Result<Document, ProviderError>;

    /// Name used in logs and error messages.
    fn name(&self) -> &str;
}

/// The judgment and writing capabilities of the research pipeline.
#[async_trait]
pub trait ResearchModel: Send + Sync {
    /// Turn a query into a titled plan of at most `max_subtopics` subtopics.
    async fn decompose(&self, query: &str, max_subtopics: usize) -> Result<Brief, ProviderError>;

    /// Decide whether the query needs a clarifying question.
    async fn judge_ambiguity(
        &self,
        query: &str,
        probe: &[SourceRef],
    ) -> Result<Ambiguity, ProviderError>;

    async fn judge_sufficiency(
        &self,
        request: SufficiencyRequest<'_>,
    ) -> Result<Sufficiency, ProviderError>;

    /// Summarize documents for a subtopic. Inline `[n]` markers refer to
    /// the 1-based position of a document in `documents`.
    async fn synthesize(
        &self,
        subtopic: &str,
        documents: &[Document],
        context: SynthesisContext<'_>,
    ) -> Result<String, ProviderError>;

    /// Merge two notes into one shorter summary, keeping their `[n]` markers.
    async fn compress_pair(&self, a: &Note, b: &Note) -> Result<String, ProviderError>;

    async fn generate_report(
        &self,
        request: ReportRequest<'_>,
    ) -> Result<DraftReport, ProviderError>;

    fn name(&self) -> &str;
}
