//! Scripted capability doubles for tests and offline runs.
//!
//! Each double is cheap to clone and shares its state across clones, so a
//! test can hand one copy to the orchestrator and inspect another.

use crate::error::{ProviderError, StorageError};
use crate::ports::{
    Ambiguity, Brief, Document, DraftReport, ReportRequest, ResearchModel, SearchFilters,
    SearchProvider, SourceRef, Sufficiency, SufficiencyRequest, SynthesisContext,
};
use crate::providers::{ChatMessage, ChatModel};
use crate::research::{Note, Report, ReportStore};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn slug(text: &str) -> String {
    text.split_whitespace()
        .map(|w| {
            w.chars()
                .filter(|c| c.is_ascii_alphanumeric())
                .collect::<String>()
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SearchState {
    results: HashMap<String, Vec<SourceRef>>,
    search_error: Option<ProviderError>,
    fetch_failures: HashMap<String, VecDeque<ProviderError>>,
    fetch_attempts: HashMap<String, usize>,
    queries: Vec<String>,
}

/// A search provider that answers from a script.
///
/// Unscripted queries get synthetic hits at `https://example.com/<query>/<n>`,
/// and every fetch returns a short page unless a failure is queued for it.
#[derive(Clone)]
pub struct ScriptedSearch {
    state: Arc<Mutex<SearchState>>,
    hits_per_query: usize,
    search_delay: Duration,
    fetch_delay: Duration,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl Default for ScriptedSearch {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedSearch {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(SearchState::default())),
            hits_per_query: 3,
            search_delay: Duration::ZERO,
            fetch_delay: Duration::ZERO,
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_hits_per_query(mut self, hits: usize) -> Self {
        self.hits_per_query = hits;
        self
    }

    /// Fixed hits for one query. An empty list scripts a search with no results.
    pub fn with_results(self, query: &str, hits: Vec<SourceRef>) -> Self {
        lock(&self.state).results.insert(query.to_string(), hits);
        self
    }

    pub fn with_search_delay(mut self, delay: Duration) -> Self {
        self.search_delay = delay;
        self
    }

    pub fn with_fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Fail every search with `error`.
    pub fn fail_search(&self, error: ProviderError) {
        lock(&self.state).search_error = Some(error);
    }

    /// Fail the next fetches of `url`, one queued error per attempt.
    pub fn fail_fetch(&self, url: &str, errors: Vec<ProviderError>) {
        lock(&self.state)
            .fetch_failures
            .insert(url.to_string(), errors.into());
    }

    pub fn search_calls(&self) -> usize {
        lock(&self.state).queries.len()
    }

    pub fn queries(&self) -> Vec<String> {
        lock(&self.state).queries.clone()
    }

    pub fn fetch_attempts(&self, url: &str) -> usize {
        lock(&self.state)
            .fetch_attempts
            .get(url)
            .copied()
            .unwrap_or(0)
    }

    /// Peak number of fetches that were running at once.
    pub fn max_concurrent_fetches(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn synthetic_hits(&self, query: &str) -> Vec<SourceRef> {
        let base = slug(query);
        (1..=self.hits_per_query)
            .map(|n| {
                let mut hit = SourceRef::new(
                    format!("https://example.com/{base}/{n}"),
                    format!("{query} source {n}"),
                );
                hit.score = Some(1.0 - n as f64 / 100.0);
                hit
            })
            .collect()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    async fn search(
        &self,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<Vec<SourceRef>, ProviderError> {
        if !self.search_delay.is_zero() {
            tokio::time::sleep(self.search_delay).await;
        }
        let scripted = {
            let mut state = lock(&self.state);
            state.queries.push(query.to_string());
            if let Some(err) = &state.search_error {
                return Err(err.clone());
            }
            state.results.get(query).cloned()
        };
        let mut hits = scripted.unwrap_or_else(|| self.synthetic_hits(query));
        hits.truncate(filters.max_results);
        Ok(hits)
    }

    async fn fetch_content(&self, url: &str) -> Result<Document, ProviderError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }

        let mut state = lock(&self.state);
        *state.fetch_attempts.entry(url.to_string()).or_default() += 1;
        if let Some(err) = state
            .fetch_failures
            .get_mut(url)
            .and_then(|queue| queue.pop_front())
        {
            return Err(err);
        }
        Ok(Document {
            url: url.to_string(),
            title: String::new(),
            text: format!(
                "Page at {url}. It reports a measured result and names the team behind it. \
                 It also dates the work and compares it with earlier attempts."
            ),
            published_date: None,
        })
    }

    fn name(&self) -> &str {
        "scripted-search"
    }
}

// ---------------------------------------------------------------------------
// Research model
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ModelState {
    ambiguity: Option<Ambiguity>,
    brief: Option<Brief>,
    verdicts: VecDeque<Sufficiency>,
    decompose_error: Option<ProviderError>,
    synthesis_error: Option<ProviderError>,
    compression_error: Option<ProviderError>,
    report_error: Option<ProviderError>,
    verbose_compression: bool,
    panic_in_report: bool,
    decomposed: Vec<String>,
    judge_calls: usize,
    synthesize_calls: usize,
    compress_calls: usize,
    report_calls: usize,
}

/// A research model with deterministic, scriptable answers.
///
/// Defaults: queries are clear, the plan has three subtopics derived from
/// the query, the judge keeps asking for more, synthesis cites every
/// document, compression halves both notes, and the report stitches the
/// notes together.
#[derive(Clone, Default)]
pub struct ScriptedModel {
    state: Arc<Mutex<ModelState>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ambiguity(self, ambiguity: Ambiguity) -> Self {
        lock(&self.state).ambiguity = Some(ambiguity);
        self
    }

    pub fn with_brief(self, brief: Brief) -> Self {
        lock(&self.state).brief = Some(brief);
        self
    }

    /// Verdicts returned in order by `judge_sufficiency`; once used up the
    /// judge answers `Continue` with no proposal.
    pub fn with_verdicts(self, verdicts: Vec<Sufficiency>) -> Self {
        lock(&self.state).verdicts = verdicts.into();
        self
    }

    /// Make `compress_pair` return more text than it was given.
    pub fn with_verbose_compression(self) -> Self {
        lock(&self.state).verbose_compression = true;
        self
    }

    pub fn fail_decompose(self, error: ProviderError) -> Self {
        lock(&self.state).decompose_error = Some(error);
        self
    }

    pub fn fail_synthesis(self, error: ProviderError) -> Self {
        lock(&self.state).synthesis_error = Some(error);
        self
    }

    pub fn fail_compression(self, error: ProviderError) -> Self {
        lock(&self.state).compression_error = Some(error);
        self
    }

    pub fn fail_report(self, error: ProviderError) -> Self {
        lock(&self.state).report_error = Some(error);
        self
    }

    pub fn panic_in_report(self) -> Self {
        lock(&self.state).panic_in_report = true;
        self
    }

    /// Queries `decompose` was called with.
    pub fn decomposed_queries(&self) -> Vec<String> {
        lock(&self.state).decomposed.clone()
    }

    pub fn judge_calls(&self) -> usize {
        lock(&self.state).judge_calls
    }

    pub fn synthesize_calls(&self) -> usize {
        lock(&self.state).synthesize_calls
    }

    pub fn compress_calls(&self) -> usize {
        lock(&self.state).compress_calls
    }

    pub fn report_calls(&self) -> usize {
        lock(&self.state).report_calls
    }

    fn default_brief(query: &str, max_subtopics: usize) -> Brief {
        let subtopics = ["background", "current state", "open problems"]
            .iter()
            .take(max_subtopics.max(1))
            .map(|angle| format!("{query} {angle}"))
            .collect();
        Brief {
            title: format!("Research: {query}"),
            scope: format!("An overview of {query}"),
            subtopics,
        }
    }
}

fn first_half(text: &str) -> String {
    let keep = text.chars().count().div_ceil(2);
    text.chars().take(keep).collect()
}

#[async_trait]
impl ResearchModel for ScriptedModel {
    async fn decompose(&self, query: &str, max_subtopics: usize) -> Result<Brief, ProviderError> {
        let mut state = lock(&self.state);
        state.decomposed.push(query.to_string());
        if let Some(err) = &state.decompose_error {
            return Err(err.clone());
        }
        Ok(state
            .brief
            .clone()
            .unwrap_or_else(|| Self::default_brief(query, max_subtopics)))
    }

    async fn judge_ambiguity(
        &self,
        _query: &str,
        _probe: &[SourceRef],
    ) -> Result<Ambiguity, ProviderError> {
        Ok(lock(&self.state)
            .ambiguity
            .clone()
            .unwrap_or(Ambiguity::Clear))
    }

    async fn judge_sufficiency(
        &self,
        _request: SufficiencyRequest<'_>,
    ) -> Result<Sufficiency, ProviderError> {
        let mut state = lock(&self.state);
        state.judge_calls += 1;
        Ok(state
            .verdicts
            .pop_front()
            .unwrap_or(Sufficiency::Continue {
                proposed: None,
                reason: "More coverage needed".to_string(),
            }))
    }

    async fn synthesize(
        &self,
        subtopic: &str,
        documents: &[Document],
        _context: SynthesisContext<'_>,
    ) -> Result<String, ProviderError> {
        let mut state = lock(&self.state);
        state.synthesize_calls += 1;
        if let Some(err) = &state.synthesis_error {
            return Err(err.clone());
        }
        let lines: Vec<String> = documents
            .iter()
            .enumerate()
            .map(|(i, doc)| format!("- {} covers {subtopic} [{}].", doc.title, i + 1))
            .collect();
        Ok(format!("Findings on {subtopic}:\n{}", lines.join("\n")))
    }

    async fn compress_pair(&self, a: &Note, b: &Note) -> Result<String, ProviderError> {
        let mut state = lock(&self.state);
        state.compress_calls += 1;
        if let Some(err) = &state.compression_error {
            return Err(err.clone());
        }
        if state.verbose_compression {
            return Ok(format!(
                "{}\n\n{}\n\nBoth notes above are restated here in full for completeness.",
                a.summary, b.summary
            ));
        }
        Ok(format!("{} {}", first_half(&a.summary), first_half(&b.summary)))
    }

    async fn generate_report(
        &self,
        request: ReportRequest<'_>,
    ) -> Result<DraftReport, ProviderError> {
        let (error, panic) = {
            let mut state = lock(&self.state);
            state.report_calls += 1;
            (state.report_error.clone(), state.panic_in_report)
        };
        if panic {
            panic!("scripted report failure");
        }
        if let Some(err) = error {
            return Err(err);
        }
        let mut content = format!("{}\n\n", request.brief.scope);
        for note in request.notes {
            content.push_str(&format!("## {}\n\n{}\n\n", note.subtopic, note.summary));
        }
        Ok(DraftReport {
            title: request.brief.title.clone(),
            content: content.trim_end().to_string(),
        })
    }

    fn name(&self) -> &str {
        "scripted-model"
    }
}

// ---------------------------------------------------------------------------
// Chat
// ---------------------------------------------------------------------------

/// A chat model that replays queued replies and records what it was sent.
#[derive(Clone, Default)]
pub struct ScriptedChat {
    replies: Arc<Mutex<VecDeque<String>>>,
    sent: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedChat {
    pub fn new(replies: Vec<String>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            sent: Arc::default(),
        }
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.replies).push_back(reply.into());
    }

    pub fn calls(&self) -> usize {
        lock(&self.sent).len()
    }

    pub fn sent(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedChat {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ProviderError> {
        lock(&self.sent).push(messages.to_vec());
        lock(&self.replies)
            .pop_front()
            .ok_or_else(|| ProviderError::InvalidRequest {
                provider: "scripted-chat".to_string(),
                message: "No scripted reply left".to_string(),
            })
    }

    fn model_name(&self) -> &str {
        "scripted-chat"
    }
}

// ---------------------------------------------------------------------------
// Report store
// ---------------------------------------------------------------------------

/// Keeps saved reports in memory.
#[derive(Clone, Default)]
pub struct MemoryReportStore {
    reports: Arc<Mutex<Vec<Report>>>,
    fail: bool,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every save fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn saved(&self) -> Vec<Report> {
        lock(&self.reports).clone()
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn save(&self, report: &Report) -> Result<String, StorageError> {
        let location = format!("memory://{}", report.request_id);
        if self.fail {
            return Err(StorageError::Write {
                path: location.into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        lock(&self.reports).push(report.clone());
        Ok(location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_hits_are_stable_and_capped() {
        let search = ScriptedSearch::new().with_hits_per_query(5);
        let filters = SearchFilters {
            max_results: 2,
            ..SearchFilters::default()
        };
        let hits = search.search("Quantum Computing!", &filters).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].url, "https://example.com/quantum-computing/1");
        assert_eq!(search.search_calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_empty_results() {
        let search = ScriptedSearch::new().with_results("nothing", vec![]);
        let filters = SearchFilters {
            max_results: 10,
            ..SearchFilters::default()
        };
        assert!(search.search("nothing", &filters).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_failures_are_consumed_in_order() {
        let search = ScriptedSearch::new();
        search.fail_fetch("https://a.com", vec![ProviderError::AuthFailed {
            provider: "x".into(),
        }]);
        assert!(search.fetch_content("https://a.com").await.is_err());
        assert!(search.fetch_content("https://a.com").await.is_ok());
        assert_eq!(search.fetch_attempts("https://a.com"), 2);
    }

    #[tokio::test]
    async fn test_default_brief_has_three_subtopics() {
        let model = ScriptedModel::new();
        let brief = model.decompose("fusion energy", 4).await.unwrap();
        assert_eq!(brief.subtopics.len(), 3);
        assert!(brief.subtopics.iter().all(|s| s.starts_with("fusion energy")));
        assert_eq!(model.decomposed_queries(), vec!["fusion energy"]);
    }

    #[tokio::test]
    async fn test_compression_halves_summaries() {
        let model = ScriptedModel::new();
        let a = Note::new("a", "aaaaaaaa", vec![]);
        let b = Note::new("b", "bbbb", vec![]);
        assert_eq!(model.compress_pair(&a, &b).await.unwrap(), "aaaa bb");
    }

    #[tokio::test]
    async fn test_memory_store_location() {
        let store = MemoryReportStore::new();
        let location = store
            .save(&Report::new("research_1", "T", "body", 0))
            .await
            .unwrap();
        assert_eq!(location, "memory://research_1");
        assert_eq!(store.saved().len(), 1);
    }
}
