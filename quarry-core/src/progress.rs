//! Progress events and their fan-out to observers.
//!
//! Events go out on a `tokio::sync::broadcast` channel and are also kept in
//! a bounded ring so late subscribers can replay recent history before
//! switching to the live stream.

use crate::research::{Citation, Note, Phase, Report};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Live channel capacity; slow receivers beyond this see `Lagged`.
const CHANNEL_CAPACITY: usize = 256;

/// Smallest history ring we keep, whatever the configuration says.
pub const MIN_HISTORY: usize = 50;

/// Title of the event emitted when a subtopic's research begins.
pub const SUBTOPIC_STARTED: &str = "Starting research";

/// Clarification question carried on a `clarifying` event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationPayload {
    pub question: String,
    pub original_query: String,
}

/// A finished note, with its citations resolved for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NotePayload {
    pub subtopic: String,
    pub summary_markdown: String,
    pub citations: Vec<Citation>,
}

impl NotePayload {
    pub fn new(note: &Note, citations: Vec<Citation>) -> Self {
        Self {
            subtopic: note.subtopic.clone(),
            summary_markdown: note.summary.clone(),
            citations,
        }
    }
}

/// One progress update for a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub request_id: String,
    pub phase: Phase,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_pct: Option<f32>,
    #[serde(default)]
    pub stats: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarificationPayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<NotePayload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<Report>,
}

impl ProgressEvent {
    pub fn new(
        request_id: impl Into<String>,
        phase: Phase,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            phase,
            title: title.into(),
            message: message.into(),
            progress_pct: None,
            stats: BTreeMap::new(),
            timestamp: Utc::now(),
            clarification: None,
            note: None,
            report: None,
        }
    }

    pub fn with_progress(mut self, pct: f32) -> Self {
        self.progress_pct = Some(pct.clamp(0.0, 100.0));
        self
    }

    pub fn with_stat(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.stats.insert(key.to_string(), value.into());
        self
    }

    pub fn with_clarification(mut self, clarification: ClarificationPayload) -> Self {
        self.clarification = Some(clarification);
        self
    }

    pub fn with_note(mut self, note: NotePayload) -> Self {
        self.note = Some(note);
        self
    }

    pub fn with_report(mut self, report: Report) -> Self {
        self.report = Some(report);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// Replayed history plus the live stream that continues right after it.
pub struct Subscription {
    pub history: Vec<ProgressEvent>,
    pub live: broadcast::Receiver<ProgressEvent>,
}

/// Fans progress events out to every observer.
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressEvent>,
    history: Mutex<VecDeque<ProgressEvent>>,
    capacity: usize,
}

impl ProgressBroadcaster {
    pub fn new(history_capacity: usize) -> Self {
        let capacity = history_capacity.max(MIN_HISTORY);
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY.max(capacity));
        Self {
            tx,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Record and broadcast an event. Returns the number of live receivers.
    pub fn publish(&self, event: ProgressEvent) -> usize {
        // History and live send happen under one lock so a concurrent
        // subscriber sees each event exactly once.
        let mut history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(event.clone());
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription {
        let history = self
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Subscription {
            history: history.iter().cloned().collect(),
            live: self.tx.subscribe(),
        }
    }

    /// Live stream only, without history.
    pub fn subscribe_live(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn history_capacity(&self) -> usize {
        self.capacity
    }
}
