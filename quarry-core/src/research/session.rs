//! Research job state: the phase machine, notes, and the job record itself.
//!
//! The job record is owned by the job manager; the orchestrator reads and
//! publishes into it through `JobControl` and never holds it across an await.

use super::sources::{Citation, CitationRegistry};
use crate::ports::Brief;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Current phase of a research job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No job running, or a job that has not left its probe yet.
    Idle,
    /// Waiting for the user to disambiguate the query.
    Clarifying,
    /// Building the research plan.
    Briefing,
    /// Researching one subtopic per iteration.
    Researching,
    /// Shrinking accumulated notes to fit the token budget.
    Compressing,
    /// Writing the final report.
    Reporting,
    /// Report written.
    Done,
    /// Stopped by the user.
    Canceled,
    /// Stopped by a provider failure.
    Error,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Clarifying => "clarifying",
            Phase::Briefing => "briefing",
            Phase::Researching => "researching",
            Phase::Compressing => "compressing",
            Phase::Reporting => "reporting",
            Phase::Done => "done",
            Phase::Canceled => "canceled",
            Phase::Error => "error",
        }
    }

    /// Terminal phases free the job slot.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Canceled | Phase::Error)
    }

    /// Whether the state graph allows moving from `self` to `next`.
    ///
    /// `clarifying` and `briefing` are never re-entered; only
    /// `researching` and `compressing` alternate.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Phase::Canceled | Phase::Error) {
            return true;
        }
        matches!(
            (self, next),
            (Phase::Idle, Phase::Clarifying)
                | (Phase::Idle, Phase::Briefing)
                | (Phase::Clarifying, Phase::Briefing)
                | (Phase::Briefing, Phase::Researching)
                | (Phase::Researching, Phase::Compressing)
                | (Phase::Researching, Phase::Reporting)
                | (Phase::Compressing, Phase::Researching)
                | (Phase::Compressing, Phase::Reporting)
                | (Phase::Reporting, Phase::Done)
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options supplied with a start command.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StartOptions {
    /// Overrides the configured results per subtopic search.
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub include_domains: Vec<String>,
    #[serde(default)]
    pub exclude_domains: Vec<String>,
}

/// A clarification exchange with the user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Clarification {
    pub question: String,
    pub answer: Option<String>,
}

/// Synthesized findings about one subtopic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Note {
    pub subtopic: String,
    /// Markdown summary; inline `[n]` markers are citation ids.
    pub summary: String,
    /// Citation ids in first-cited order.
    pub citations: Vec<u32>,
    /// Approximate token size, computed once at construction.
    pub tokens: usize,
    pub created_at: DateTime<Utc>,
}

impl Note {
    pub fn new(subtopic: impl Into<String>, summary: impl Into<String>, citations: Vec<u32>) -> Self {
        let summary = summary.into();
        let tokens = super::compression::approx_tokens(&summary, citations.len());
        Self {
            subtopic: subtopic.into(),
            summary,
            citations,
            tokens,
            created_at: Utc::now(),
        }
    }

    /// A note that records the absence of usable sources.
    pub fn empty(subtopic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(subtopic, reason, Vec::new())
    }
}

/// One research request's full lifecycle state.
#[derive(Debug, Clone)]
pub struct Job {
    pub request_id: String,
    pub query: String,
    pub options: StartOptions,
    pub clarification: Option<Clarification>,
    pub brief: Option<Brief>,
    /// Planned subtopics from the brief, in order.
    pub plan: Vec<String>,
    pub phase: Phase,
    pub iteration: usize,
    pub max_iterations: usize,
    pub current_subtopic: Option<String>,
    pub notes: Vec<Note>,
    pub citations: CitationRegistry,
    pub cancel_requested: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(query: impl Into<String>, options: StartOptions, max_iterations: usize) -> Self {
        Self {
            request_id: format!("research_{}", Uuid::new_v4().simple()),
            query: query.into(),
            options,
            clarification: None,
            brief: None,
            plan: Vec::new(),
            phase: Phase::Idle,
            iteration: 0,
            max_iterations,
            current_subtopic: None,
            notes: Vec::new(),
            citations: CitationRegistry::new(),
            cancel_requested: false,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Progress estimate (0-100) derived from the phase and iteration count.
    pub fn progress_pct(&self) -> f32 {
        match self.phase {
            Phase::Idle => 0.0,
            Phase::Clarifying => 5.0,
            Phase::Briefing => 10.0,
            Phase::Researching | Phase::Compressing => {
                let max = self.max_iterations.max(1) as f32;
                let done = self.iteration.min(self.max_iterations) as f32;
                15.0 + 70.0 * (done / max)
            }
            Phase::Reporting => 90.0,
            Phase::Done => 100.0,
            // Keep where we stopped.
            Phase::Canceled | Phase::Error => {
                let max = self.max_iterations.max(1) as f32;
                15.0 * (self.iteration.min(1) as f32)
                    + 70.0 * (self.iteration.min(self.max_iterations) as f32 / max)
            }
        }
    }

    /// Apply a validated phase change.
    pub(crate) fn set_phase(&mut self, next: Phase) {
        self.phase = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            request_id: self.request_id.clone(),
            query: self.query.clone(),
            options: self.options.clone(),
            clarification: self.clarification.clone(),
            brief: self.brief.clone(),
            plan: self.plan.clone(),
            phase: self.phase,
            iteration: self.iteration,
            max_iterations: self.max_iterations,
            current_subtopic: self.current_subtopic.clone(),
            notes: self.notes.clone(),
            citations: self.citations.citations().to_vec(),
            cancel_requested: self.cancel_requested,
            error: self.error.clone(),
            progress_pct: self.progress_pct(),
            created_at: self.created_at,
            completed_at: self.completed_at,
        }
    }
}

/// Read-only copy of a job, handed to callers outside the execution path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub request_id: String,
    pub query: String,
    pub options: StartOptions,
    pub clarification: Option<Clarification>,
    pub brief: Option<Brief>,
    pub plan: Vec<String>,
    pub phase: Phase,
    pub iteration: usize,
    pub max_iterations: usize,
    pub current_subtopic: Option<String>,
    pub notes: Vec<Note>,
    pub citations: Vec<Citation>,
    pub cancel_requested: bool,
    pub error: Option<String>,
    pub progress_pct: f32,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobSnapshot {
    pub fn is_active(&self) -> bool {
        !self.phase.is_terminal()
    }

    /// One-line status for the conversational layer.
    pub fn status_line(&self) -> String {
        match self.phase {
            Phase::Done => format!(
                "Research completed with {} notes from {} sources.",
                self.notes.len(),
                self.citations.len()
            ),
            Phase::Canceled => "The research job was canceled.".to_string(),
            Phase::Error => format!(
                "The research job failed: {}",
                self.error.as_deref().unwrap_or("unknown error")
            ),
            phase => {
                let mut parts = vec![format!("Research is currently {phase}")];
                if let Some(subtopic) = &self.current_subtopic {
                    parts.push(format!("working on: {subtopic}"));
                }
                if self.iteration > 0 {
                    parts.push(format!(
                        "{}/{} iterations",
                        self.iteration, self.max_iterations
                    ));
                }
                if !self.citations.is_empty() {
                    parts.push(format!("{} sources so far", self.citations.len()));
                }
                format!("{}.", parts.join(", "))
            }
        }
    }
}
