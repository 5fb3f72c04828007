//! Per-iteration continue/stop decision and next-subtopic selection.

use super::session::Note;
use crate::config::RetryConfig;
use crate::error::ProviderError;
use crate::ports::{Brief, ResearchModel, Sufficiency, SufficiencyRequest};
use crate::retry::with_retry;
use std::sync::Arc;

/// Why the loop stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The judge considers the notes sufficient.
    Sufficient(String),
    MaxIterations,
    /// The judge wants more but nothing unresearched is left to propose.
    NothingNew,
}

impl StopReason {
    pub fn describe(&self) -> String {
        match self {
            StopReason::Sufficient(reason) if reason.is_empty() => {
                "Research is sufficient".to_string()
            }
            StopReason::Sufficient(reason) => reason.clone(),
            StopReason::MaxIterations => "Reached the iteration limit".to_string(),
            StopReason::NothingNew => "No new subtopics left to research".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Continue(String),
    Stop(StopReason),
}

/// State the supervisor decides on.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorInput<'a> {
    pub query: &'a str,
    pub brief: &'a Brief,
    pub plan: &'a [String],
    pub researched: &'a [String],
    pub notes: &'a [Note],
    /// Iterations already completed.
    pub iteration: usize,
}

pub struct Supervisor {
    model: Arc<dyn ResearchModel>,
    retry: RetryConfig,
    max_iterations: usize,
}

impl Supervisor {
    pub fn new(model: Arc<dyn ResearchModel>, retry: RetryConfig, max_iterations: usize) -> Self {
        Self {
            model,
            retry,
            max_iterations,
        }
    }

    pub fn max_iterations(&self) -> usize {
        self.max_iterations
    }

    pub async fn decide(&self, input: SupervisorInput<'_>) -> Result<Decision, ProviderError> {
        if input.iteration >= self.max_iterations {
            return Ok(Decision::Stop(StopReason::MaxIterations));
        }

        let remaining: Vec<String> = input
            .plan
            .iter()
            .filter(|topic| !is_researched(topic, input.researched))
            .cloned()
            .collect();

        if input.notes.is_empty()
            && let Some(first) = remaining.first()
        {
            return Ok(Decision::Continue(first.clone()));
        }

        let request = SufficiencyRequest {
            query: input.query,
            brief: input.brief,
            notes: input.notes,
            remaining_plan: &remaining,
            researched: input.researched,
            iteration: input.iteration,
            max_iterations: self.max_iterations,
        };
        let verdict = with_retry(&self.retry, "judge_sufficiency", || {
            self.model.judge_sufficiency(request)
        })
        .await?;

        let decision = match verdict {
            Sufficiency::Stop { reason } => Decision::Stop(StopReason::Sufficient(reason)),
            Sufficiency::Continue { proposed, reason } => {
                tracing::debug!(reason = %reason, proposed = ?proposed, "Judge asks for more research");
                choose_next(proposed, &remaining, input.researched)
            }
        };
        Ok(decision)
    }
}

/// Planned subtopics win over novel proposals; a proposal that names a
/// remaining planned topic takes that topic's wording.
fn choose_next(proposed: Option<String>, remaining: &[String], researched: &[String]) -> Decision {
    let proposed = proposed
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty());

    if let Some(p) = &proposed
        && let Some(planned) = remaining.iter().find(|topic| same_topic(topic, p))
    {
        return Decision::Continue(planned.clone());
    }
    if let Some(next) = remaining.first() {
        return Decision::Continue(next.clone());
    }
    match proposed {
        Some(p) if !researched.iter().any(|done| same_topic(&p, done)) => Decision::Continue(p),
        Some(p) => {
            tracing::debug!(proposed = %p, "Discarding proposal that duplicates researched topic");
            Decision::Stop(StopReason::NothingNew)
        }
        None => Decision::Stop(StopReason::NothingNew),
    }
}

/// Lowercased with whitespace runs collapsed.
pub fn normalize_topic(topic: &str) -> String {
    topic
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Case-insensitive containment in either direction. Only used to match a
/// judge's free-form proposal against known topics.
fn same_topic(a: &str, b: &str) -> bool {
    let a = normalize_topic(a);
    let b = normalize_topic(b);
    !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a))
}

/// Whether `topic` names exactly one of `researched`, ignoring case and spacing.
pub fn is_researched(topic: &str, researched: &[String]) -> bool {
    let topic = normalize_topic(topic);
    researched.iter().any(|done| normalize_topic(done) == topic)
}
