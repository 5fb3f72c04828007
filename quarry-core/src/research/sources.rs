//! Citation registry: stable numbering of every source a job cites.

use crate::ports::Document;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use url::Url;

/// Maximum characters kept from a document as the citation's supporting quote.
pub const QUOTE_CHARS: usize = 600;

/// A source referenced by notes and the final report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Citation {
    /// 1-based, assigned in first-seen order, never reused within a job.
    pub id: u32,
    pub url: String,
    pub title: String,
    pub quote: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
}

/// Deduplicates sources by URL and hands out stable citation ids.
#[derive(Debug, Clone, Default)]
pub struct CitationRegistry {
    citations: Vec<Citation>,
    by_url: HashMap<String, u32>,
}

impl CitationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a source, returning its id. A URL seen before keeps its
    /// original id and metadata.
    pub fn register(&mut self, url: &str, title: &str, text: &str) -> u32 {
        let key = normalize_url(url);
        if let Some(id) = self.by_url.get(&key) {
            return *id;
        }
        let id = self.citations.len() as u32 + 1;
        let title = if title.trim().is_empty() {
            url.to_string()
        } else {
            title.trim().to_string()
        };
        self.citations.push(Citation {
            id,
            url: url.to_string(),
            title,
            quote: text.chars().take(QUOTE_CHARS).collect(),
            published_at: None,
        });
        self.by_url.insert(key, id);
        id
    }

    /// Register a fetched document, keeping its publication date if known.
    pub fn register_document(&mut self, doc: &Document) -> u32 {
        let before = self.citations.len();
        let id = self.register(&doc.url, &doc.title, &doc.text);
        if self.citations.len() > before
            && let Some(citation) = self.citations.last_mut()
        {
            citation.published_at = doc.published_date.clone();
        }
        id
    }

    pub fn get(&self, id: u32) -> Option<&Citation> {
        id.checked_sub(1)
            .and_then(|idx| self.citations.get(idx as usize))
    }

    pub fn contains(&self, id: u32) -> bool {
        self.get(id).is_some()
    }

    /// All citations in id order.
    pub fn citations(&self) -> &[Citation] {
        &self.citations
    }

    pub fn len(&self) -> usize {
        self.citations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.citations.is_empty()
    }
}

/// Identity key for a URL: scheme and host lowercased, default port and
/// fragment dropped, no trailing slash. Unparseable input is only trimmed.
fn normalize_url(url: &str) -> String {
    let trimmed = url.trim();
    match Url::parse(trimmed) {
        Ok(mut parsed) => {
            parsed.set_fragment(None);
            parsed.as_str().trim_end_matches('/').to_string()
        }
        Err(_) => trimmed.trim_end_matches('/').to_string(),
    }
}
