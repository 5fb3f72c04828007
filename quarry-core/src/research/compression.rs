//! Note compression: keep the accumulated notes under a token budget
//! without losing any citation.

use super::session::Note;
use super::sources::CitationRegistry;
use crate::config::RetryConfig;
use crate::error::CompressionError;
use crate::ports::ResearchModel;
use crate::retry::with_retry;
use std::sync::Arc;

/// Approximate token size of a note. Overestimates on purpose so budget
/// checks stay conservative.
pub fn approx_tokens(summary: &str, citations: usize) -> usize {
    summary.chars().count().div_ceil(4) + 8 * citations + 4
}

pub fn total_tokens(notes: &[Note]) -> usize {
    notes.iter().map(|n| n.tokens).sum()
}

/// What a compression pass did.
#[derive(Debug, Clone)]
pub struct CompressionOutcome {
    pub notes: Vec<Note>,
    pub merges: usize,
    pub truncations: usize,
    pub tokens_before: usize,
    pub tokens_after: usize,
    /// Still over budget after truncation: the remaining citations alone
    /// cost more than the budget allows. The summary text is empty in that
    /// case and every citation is kept.
    pub over_budget: bool,
}

/// Merges low-density notes through the model until the set fits the budget.
pub struct CompressionEngine {
    model: Arc<dyn ResearchModel>,
    retry: RetryConfig,
    budget: usize,
}

impl CompressionEngine {
    pub fn new(model: Arc<dyn ResearchModel>, retry: RetryConfig, budget: usize) -> Self {
        Self {
            model,
            retry,
            budget,
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn needs_compression(&self, notes: &[Note]) -> bool {
        total_tokens(notes) > self.budget
    }

    /// Compress `notes` to fit the budget.
    ///
    /// The result never has a larger total size than the input and carries
    /// the same set of citation ids. A set already within budget comes back
    /// unchanged.
    pub async fn compress(
        &self,
        notes: Vec<Note>,
        registry: &CitationRegistry,
    ) -> Result<CompressionOutcome, CompressionError> {
        let tokens_before = total_tokens(&notes);
        let mut notes = notes;
        let mut merges = 0;
        let mut truncations = 0;

        while total_tokens(&notes) > self.budget && notes.len() > 1 {
            let (i, j) = lowest_density_pair(&notes);
            let (merged, truncated) = self.merge(&notes[i], &notes[j]).await?;
            tracing::debug!(
                first = %notes[i].subtopic,
                second = %notes[j].subtopic,
                before = notes[i].tokens + notes[j].tokens,
                after = merged.tokens,
                "Merged notes"
            );
            notes[i] = merged;
            notes.remove(j);
            merges += 1;
            if truncated {
                truncations += 1;
            }
        }

        if total_tokens(&notes) > self.budget
            && let Some(note) = notes.first_mut()
        {
            let citation_cost = 8 * note.citations.len() + 4;
            let max_chars = self.budget.saturating_sub(citation_cost) * 4;
            if citation_cost > self.budget {
                tracing::warn!(
                    citations = note.citations.len(),
                    budget = self.budget,
                    "Citations alone exceed the token budget; keeping them"
                );
            }
            note.summary = truncate_at_boundary(&note.summary, max_chars);
            note.tokens = approx_tokens(&note.summary, note.citations.len());
            truncations += 1;
        }

        for note in &notes {
            if let Some(id) = note.citations.iter().find(|id| !registry.contains(**id)) {
                return Err(CompressionError::DanglingCitation { id: *id });
            }
        }

        let tokens_after = total_tokens(&notes);
        Ok(CompressionOutcome {
            notes,
            merges,
            truncations,
            tokens_before,
            tokens_after,
            over_budget: tokens_after > self.budget,
        })
    }

    /// Merge two notes; the boolean reports whether the model's text had to
    /// be cut to stay smaller than the pair.
    async fn merge(&self, a: &Note, b: &Note) -> Result<(Note, bool), CompressionError> {
        let text = with_retry(&self.retry, "compress_pair", || self.model.compress_pair(a, b))
            .await
            .map_err(CompressionError::Summarize)?;

        let mut citations = a.citations.clone();
        for id in &b.citations {
            if !citations.contains(id) {
                citations.push(*id);
            }
        }
        let subtopic = if a.subtopic == b.subtopic {
            a.subtopic.clone()
        } else {
            format!("{}; {}", a.subtopic, b.subtopic)
        };

        let merged = Note::new(subtopic.clone(), text, citations.clone());
        if merged.tokens < a.tokens + b.tokens {
            return Ok((merged, false));
        }
        // Cap at the pair's combined prose; the dropped per-note overhead
        // then makes the merge strictly smaller.
        let max_chars = a.summary.chars().count() + b.summary.chars().count();
        let summary = truncate_at_boundary(&merged.summary, max_chars);
        Ok((Note::new(subtopic, summary, citations), true))
    }
}

/// Indices `(i, j)` with `i < j` of the two notes with the least prose per
/// citation.
fn lowest_density_pair(notes: &[Note]) -> (usize, usize) {
    let mut order: Vec<usize> = (0..notes.len()).collect();
    order.sort_by(|&x, &y| density(&notes[x]).total_cmp(&density(&notes[y])));
    let (i, j) = (order[0], order[1]);
    (i.min(j), i.max(j))
}

fn density(note: &Note) -> f64 {
    note.summary.chars().count() as f64 / note.citations.len().max(1) as f64
}

/// Cut `text` to at most `max_chars` characters, preferring to end at a
/// sentence or line break in the second half of the allowed span.
pub fn truncate_at_boundary(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let prefix: String = text.chars().take(max_chars).collect();
    let boundary = prefix
        .char_indices()
        .filter(|(_, c)| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|(idx, c)| idx + c.len_utf8())
        .next_back();
    match boundary {
        Some(end) if prefix[..end].chars().count() * 2 >= max_chars => {
            prefix[..end].trim_end().to_string()
        }
        _ => prefix,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::mock::ScriptedModel;

    fn registry_with(n: u32) -> CitationRegistry {
        let mut registry = CitationRegistry::new();
        for i in 1..=n {
            registry.register(&format!("https://s{i}.com"), &format!("S{i}"), "text");
        }
        registry
    }

    fn note(subtopic: &str, chars: usize, citations: Vec<u32>) -> Note {
        let sentence = "Findings are described here. ";
        let summary: String = sentence.chars().cycle().take(chars).collect();
        Note::new(subtopic, summary, citations)
    }

    fn engine(model: ScriptedModel, budget: usize) -> CompressionEngine {
        let retry = RetryConfig {
            initial_backoff_ms: 1,
            jitter: false,
            ..RetryConfig::default()
        };
        CompressionEngine::new(Arc::new(model), retry, budget)
    }

    fn citation_ids(notes: &[Note]) -> Vec<u32> {
        let mut ids: Vec<u32> = notes.iter().flat_map(|n| n.citations.clone()).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    #[test]
    fn test_approx_tokens() {
        assert_eq!(approx_tokens("", 0), 4);
        assert_eq!(approx_tokens("abcde", 1), 2 + 8 + 4);
    }

    #[test]
    fn test_truncate_prefers_sentence_end() {
        let text = "First sentence here. Second sentence is longer than the rest.";
        assert_eq!(truncate_at_boundary(text, 30), "First sentence here.");
        assert_eq!(truncate_at_boundary(text, 200), text);
    }

    #[test]
    fn test_truncate_falls_back_to_hard_cut() {
        let text = "A. bcdefghijklmnopqrstuvwxyz";
        assert_eq!(truncate_at_boundary(text, 10), "A. bcdefgh");
    }

    #[tokio::test]
    async fn test_compliant_set_is_unchanged() {
        let registry = registry_with(2);
        let notes = vec![note("a", 100, vec![1]), note("b", 100, vec![2])];
        let outcome = engine(ScriptedModel::new(), 6000)
            .compress(notes.clone(), &registry)
            .await
            .unwrap();
        assert_eq!(outcome.notes, notes);
        assert_eq!(outcome.merges, 0);
    }

    #[tokio::test]
    async fn test_five_notes_fit_budget() {
        let registry = registry_with(10);
        let notes: Vec<Note> = (0..5u32)
            .map(|i| note(&format!("topic {i}"), 1900, vec![2 * i + 1, 2 * i + 2]))
            .collect();
        assert!(total_tokens(&notes) > 2400);

        let outcome = engine(ScriptedModel::new(), 1800)
            .compress(notes.clone(), &registry)
            .await
            .unwrap();

        assert!(outcome.tokens_after <= 1800, "{} tokens", outcome.tokens_after);
        assert!(outcome.merges > 0);
        assert_eq!(citation_ids(&outcome.notes), citation_ids(&notes));
    }

    #[tokio::test]
    async fn test_verbose_merge_is_truncated() {
        let registry = registry_with(2);
        let model = ScriptedModel::new().with_verbose_compression();
        let notes = vec![note("a", 400, vec![1]), note("b", 400, vec![2])];
        let before = total_tokens(&notes);
        let outcome = engine(model, 150).compress(notes, &registry).await.unwrap();
        assert!(outcome.tokens_after < before);
        assert!(outcome.truncations >= 1);
        assert_eq!(outcome.notes.len(), 1);
        assert_eq!(outcome.notes[0].citations, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_single_note_truncated_keeping_citations() {
        let registry = registry_with(3);
        let notes = vec![note("only", 4000, vec![1, 2, 3])];
        let outcome = engine(ScriptedModel::new(), 300)
            .compress(notes, &registry)
            .await
            .unwrap();
        assert!(outcome.tokens_after <= 300);
        assert!(!outcome.over_budget);
        assert_eq!(outcome.notes[0].citations, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_citations_over_budget_are_reported() {
        let registry = registry_with(4);
        let notes = vec![note("a", 800, vec![1, 2]), note("b", 800, vec![3, 4])];
        let outcome = engine(ScriptedModel::new(), 20)
            .compress(notes, &registry)
            .await
            .unwrap();
        assert!(outcome.over_budget);
        assert_eq!(outcome.notes.len(), 1);
        assert_eq!(outcome.notes[0].summary, "");
        assert_eq!(outcome.notes[0].citations, vec![1, 2, 3, 4]);
        assert_eq!(outcome.tokens_after, approx_tokens("", 4));
    }

    #[tokio::test]
    async fn test_compress_pair_failure_is_fatal() {
        let registry = registry_with(2);
        let model = ScriptedModel::new().fail_compression(ProviderError::InvalidRequest {
            provider: "scripted".into(),
            message: "context too long".into(),
        });
        let notes = vec![note("a", 2000, vec![1]), note("b", 2000, vec![2])];
        let err = engine(model, 100).compress(notes, &registry).await.unwrap_err();
        assert!(matches!(err, CompressionError::Summarize(_)));
    }

    #[tokio::test]
    async fn test_dangling_citation_detected() {
        let registry = registry_with(1);
        let notes = vec![note("a", 100, vec![1, 7])];
        let err = engine(ScriptedModel::new(), 6000)
            .compress(notes, &registry)
            .await
            .unwrap_err();
        assert!(matches!(err, CompressionError::DanglingCitation { id: 7 }));
    }

    #[test]
    fn test_lowest_density_pair_ordered() {
        let notes = vec![
            note("wordy", 900, vec![]),
            note("terse", 100, vec![1, 2, 3]),
            note("wordier", 1200, vec![5]),
            note("mid", 300, vec![4]),
        ];
        assert_eq!(lowest_density_pair(&notes), (1, 3));
    }
}
