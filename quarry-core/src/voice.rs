//! Spoken status updates: a second progress consumer that turns events
//! into short lines for a voice front end.
//!
//! Runs as a `tokio::spawn` task. Only a few event kinds are worth saying
//! out loud, and they are rate limited so the listener is not talked over.

use crate::config::VoiceConfig;
use crate::progress::{ProgressEvent, SUBTOPIC_STARTED};
use crate::research::Phase;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

/// A line ready to be spoken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpokenUpdate {
    pub request_id: String,
    pub phase: Phase,
    pub text: String,
}

/// Whether an event is worth interrupting the user for.
pub fn is_speakable(event: &ProgressEvent) -> bool {
    match event.phase {
        Phase::Done | Phase::Canceled | Phase::Error => true,
        Phase::Clarifying => event.clarification.is_some(),
        Phase::Reporting => true,
        Phase::Researching => event.title == SUBTOPIC_STARTED,
        _ => false,
    }
}

/// Turns an event into a sentence.
pub trait StatusNarrator: Send + Sync {
    /// `None` skips the event.
    fn narrate(&self, event: &ProgressEvent) -> Option<String>;
}

/// Fixed phrasing per event kind, capped to a short speaking time.
pub struct TemplateNarrator {
    max_words: usize,
}

impl Default for TemplateNarrator {
    fn default() -> Self {
        // About 15 seconds at a normal speaking rate.
        Self { max_words: 36 }
    }
}

impl TemplateNarrator {
    pub fn new(max_words: usize) -> Self {
        Self { max_words }
    }

    fn format_for_speech(&self, text: &str) -> String {
        let cleaned: String = text
            .chars()
            .filter(|c| !matches!(c, '#' | '*' | '`' | '_'))
            .collect();
        let words: Vec<&str> = cleaned.split_whitespace().collect();
        if words.len() > self.max_words {
            let mut out = words[..self.max_words].join(" ");
            out.push_str("...");
            out
        } else {
            words.join(" ")
        }
    }
}

impl StatusNarrator for TemplateNarrator {
    fn narrate(&self, event: &ProgressEvent) -> Option<String> {
        let text = match event.phase {
            Phase::Clarifying => {
                let clarification = event.clarification.as_ref()?;
                format!("Quick question before I start: {}", clarification.question)
            }
            Phase::Researching => match event.stats.get("subtopic").and_then(|v| v.as_str()) {
                Some(subtopic) => format!("Now researching {subtopic}."),
                None => event.message.clone(),
            },
            Phase::Reporting => {
                "I've gathered enough material and I'm writing the report now.".to_string()
            }
            Phase::Done => match &event.report {
                Some(report) => format!(
                    "Your report on {} is ready, drawing on {} sources.",
                    report.title, report.num_sources
                ),
                None => "Your report is ready.".to_string(),
            },
            Phase::Canceled => "Research canceled.".to_string(),
            Phase::Error => format!("Research stopped because of a problem: {}", event.message),
            _ => return None,
        };
        Some(self.format_for_speech(&text))
    }
}

/// Throttles speakable events into at most one line per `min_interval`.
///
/// When several speakable events arrive inside one interval, only the most
/// recent is spoken once the interval has passed. Terminal events skip the
/// wait and discard anything pending.
pub struct VoiceSummarizer {
    narrator: Arc<dyn StatusNarrator>,
    min_interval: Duration,
}

impl VoiceSummarizer {
    pub fn new(narrator: Arc<dyn StatusNarrator>, min_interval: Duration) -> Self {
        Self {
            narrator,
            min_interval,
        }
    }

    pub fn from_config(config: &VoiceConfig) -> Self {
        Self::new(
            Arc::new(TemplateNarrator::default()),
            Duration::from_secs(config.min_interval_secs),
        )
    }

    pub fn spawn(
        self,
        events: broadcast::Receiver<ProgressEvent>,
        sink: mpsc::Sender<SpokenUpdate>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(events, sink))
    }

    /// Consume events until the channel closes or the sink is dropped. A line
/// still held back when the channel closes is spoken in its slot first.
    pub async fn run(
        self,
        mut events: broadcast::Receiver<ProgressEvent>,
        sink: mpsc::Sender<SpokenUpdate>,
    ) {
        info!(interval_secs = self.min_interval.as_secs(), "Voice summarizer started");
        let mut last_spoken: Option<Instant> = None;
        let mut pending: Option<ProgressEvent> = None;

        loop {
            let next_slot = last_spoken.map(|at| at + self.min_interval);
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) if !is_speakable(&event) => {}
                    Ok(event) => {
                        let ready = next_slot.is_none_or(|at| Instant::now() >= at);
                        if event.is_terminal() || ready {
                            pending = None;
                            if !self.speak(&sink, &event).await {
                                break;
                            }
                            last_spoken = Some(Instant::now());
                        } else {
                            pending = Some(event);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Voice summarizer lagged; skipping events");
                    }
                    Err(RecvError::Closed) => {
                        if let Some(event) = pending.take() {
                            if let Some(at) = next_slot {
                                tokio::time::sleep_until(at).await;
                            }
                            self.speak(&sink, &event).await;
                        }
                        break;
                    }
                },
                _ = tokio::time::sleep_until(next_slot.unwrap_or_else(Instant::now)), if pending.is_some() => {
                    if let Some(event) = pending.take() {
                        if !self.speak(&sink, &event).await {
                            break;
                        }
                        last_spoken = Some(Instant::now());
                    }
                }
            }
        }
        debug!("Voice summarizer stopped");
    }

    /// Returns false once nobody is listening.
    async fn speak(&self, sink: &mpsc::Sender<SpokenUpdate>, event: &ProgressEvent) -> bool {
        let Some(text) = self.narrator.narrate(event) else {
            return true;
        };
        let update = SpokenUpdate {
            request_id: event.request_id.clone(),
            phase: event.phase,
            text,
        };
        sink.send(update).await.is_ok()
    }
}
