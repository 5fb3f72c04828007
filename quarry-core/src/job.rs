//! The job manager: owns the single research slot and is the only writer of
//! a job's phase.
//!
//! Control operations (`start`, `cancel`, `answer_clarification`, state
//! queries) take the slot lock briefly and never wait on the running job.
//! The job itself runs on its own task and reaches back into the slot
//! through a [`JobControl`].

use crate::error::JobError;
use crate::progress::{ProgressBroadcaster, ProgressEvent, Subscription};
use crate::research::{Job, JobSnapshot, Phase, Report, ResearchOrchestrator, StartOptions};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Done(Report),
    Canceled,
    /// Carries the short cause reported on the terminal event.
    Failed(String),
}

impl TerminalOutcome {
    pub fn phase(&self) -> Phase {
        match self {
            TerminalOutcome::Done(_) => Phase::Done,
            TerminalOutcome::Canceled => Phase::Canceled,
            TerminalOutcome::Failed(_) => Phase::Error,
        }
    }
}

/// Handle to a started job.
pub struct JobHandle {
    pub request_id: String,
    join: JoinHandle<TerminalOutcome>,
}

impl JobHandle {
    /// Wait for the job to reach a terminal phase.
    pub async fn wait(self) -> TerminalOutcome {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) => TerminalOutcome::Failed(format!("research task ended abnormally: {e}")),
        }
    }
}

struct Slot {
    job: Option<Job>,
    cancel: CancellationToken,
    clarification_tx: Option<oneshot::Sender<String>>,
    last_report: Option<Report>,
}

struct Shared {
    slot: Mutex<Slot>,
    progress: ProgressBroadcaster,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owns the single-active-job slot and starts jobs on their own tasks.
pub struct JobManager {
    shared: Arc<Shared>,
    orchestrator: Arc<ResearchOrchestrator>,
}

impl JobManager {
    pub fn new(orchestrator: ResearchOrchestrator) -> Self {
        let history = orchestrator.config().history_capacity;
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    job: None,
                    cancel: CancellationToken::new(),
                    clarification_tx: None,
                    last_report: None,
                }),
                progress: ProgressBroadcaster::new(history),
            }),
            orchestrator: Arc::new(orchestrator),
        }
    }

    /// Start a research job. Fails fast if one is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, query: &str, options: StartOptions) -> Result<JobHandle, JobError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(JobError::EmptyQuery);
        }

        let ctl = {
            let mut slot = self.shared.lock();
            if slot.job.as_ref().is_some_and(|job| !job.phase.is_terminal()) {
                return Err(JobError::AlreadyActive);
            }
            let job = Job::new(query, options, self.orchestrator.config().max_iterations);
            let cancel = CancellationToken::new();
            let ctl = JobControl {
                shared: Arc::clone(&self.shared),
                request_id: job.request_id.clone(),
                cancel: cancel.clone(),
            };
            self.shared.progress.publish(
                ProgressEvent::new(
                    &job.request_id,
                    Phase::Idle,
                    "Research started",
                    format!("Starting research on: {query}"),
                )
                .with_progress(0.0),
            );
            slot.job = Some(job);
            slot.cancel = cancel;
            slot.clarification_tx = None;
            ctl
        };

        let request_id = ctl.request_id.clone();
        tracing::info!(request_id = %request_id, query, "Research job started");

        let orchestrator = Arc::clone(&self.orchestrator);
        let join = tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(orchestrator.run(&ctl)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::error!(request_id = %ctl.request_id, "Research task panicked");
                    TerminalOutcome::Failed("research task panicked".to_string())
                }
            };
            ctl.finish(&outcome);
            outcome
        });

        Ok(JobHandle { request_id, join })
    }

    /// Request cancellation of the running job. Returns immediately; the
    /// job stops at its next checkpoint.
    pub fn cancel(&self) -> Result<(), JobError> {
        let mut slot = self.shared.lock();
        let cancel = slot.cancel.clone();
        match slot.job.as_mut() {
            Some(job) if !job.phase.is_terminal() => {
                job.cancel_requested = true;
                cancel.cancel();
                tracing::info!(request_id = %job.request_id, phase = %job.phase, "Cancellation requested");
                Ok(())
            }
            _ => Err(JobError::NoActiveJob),
        }
    }

    /// Forward the user's answer to a job waiting in `clarifying`.
    pub fn answer_clarification(&self, answer: &str) -> Result<(), JobError> {
        let mut slot = self.shared.lock();
        let phase = match slot.job.as_ref() {
            Some(job) if !job.phase.is_terminal() => job.phase,
            _ => return Err(JobError::NoActiveJob),
        };
        if phase != Phase::Clarifying {
            return Err(JobError::NotClarifying);
        }
        let tx = slot
            .clarification_tx
            .take()
            .ok_or(JobError::NotClarifying)?;
        let answer = answer.trim().to_string();
        tx.send(answer.clone()).map_err(|_| JobError::NotClarifying)?;
        if let Some(clarification) = slot.job.as_mut().and_then(|j| j.clarification.as_mut()) {
            clarification.answer = Some(answer);
        }
        Ok(())
    }

    /// Snapshot of the current (or most recently finished) job.
    pub fn current_state(&self) -> Option<JobSnapshot> {
        self.shared.lock().job.as_ref().map(Job::snapshot)
    }

    pub fn is_active(&self) -> bool {
        self.shared
            .lock()
            .job
            .as_ref()
            .is_some_and(|job| !job.phase.is_terminal())
    }

    /// Recent history plus the live event stream.
    pub fn subscribe(&self) -> Subscription {
        self.shared.progress.subscribe()
    }

    pub fn subscribe_live(&self) -> broadcast::Receiver<ProgressEvent> {
        self.shared.progress.subscribe_live()
    }

    /// The most recent completed report, kept after the slot frees up.
    pub fn last_report(&self) -> Option<Report> {
        self.shared.lock().last_report.clone()
    }

    pub fn status_summary(&self) -> String {
        self.current_state()
            .map(|snapshot| snapshot.status_line())
            .unwrap_or_else(|| "No research has been started.".to_string())
    }
}

/// The running job's access to its own record in the slot.
///
/// Every method takes the slot lock, does its work, and releases it before
/// returning. Calls from a control that no longer owns the slot are ignored.
pub struct JobControl {
    shared: Arc<Shared>,
    request_id: String,
    cancel: CancellationToken,
}

impl JobControl {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Read from the job record.
    pub fn read<R>(&self, f: impl FnOnce(&Job) -> R) -> Option<R> {
        let slot = self.shared.lock();
        slot.job
            .as_ref()
            .filter(|job| job.request_id == self.request_id)
            .map(f)
    }

    /// Publish working state into the job record.
    pub fn update(&self, f: impl FnOnce(&mut Job)) {
        let mut slot = self.shared.lock();
        if let Some(job) = slot
            .job
            .as_mut()
            .filter(|job| job.request_id == self.request_id)
        {
            f(job);
        }
    }

    pub fn transition(&self, to: Phase, title: &str, message: &str) -> Result<(), JobError> {
        self.transition_with(to, title, message, |event| event)
    }

    /// Move to `to` and emit the corresponding event, decorated by `decorate`.
    pub fn transition_with(
        &self,
        to: Phase,
        title: &str,
        message: &str,
        decorate: impl FnOnce(ProgressEvent) -> ProgressEvent,
    ) -> Result<(), JobError> {
        let mut slot = self.shared.lock();
        let job = slot
            .job
            .as_mut()
            .filter(|job| job.request_id == self.request_id)
            .ok_or(JobError::NoActiveJob)?;
        let from = job.phase;
        if !from.can_transition_to(to) {
            return Err(JobError::InvalidTransition { from, to });
        }
        job.set_phase(to);
        tracing::info!(request_id = %job.request_id, from = %from, to = %to, "Phase transition");
        let event = decorate(
            ProgressEvent::new(&job.request_id, to, title, message)
                .with_progress(job.progress_pct()),
        );
        if to.is_terminal() {
            slot.clarification_tx = None;
        }
        self.shared.progress.publish(event);
        Ok(())
    }

    /// Emit an event in the current phase.
    pub fn emit(&self, title: &str, message: &str) {
        self.emit_with(title, message, |event| event)
    }

    pub fn emit_with(
        &self,
        title: &str,
        message: &str,
        decorate: impl FnOnce(ProgressEvent) -> ProgressEvent,
    ) {
        let slot = self.shared.lock();
        let Some(job) = slot
            .job
            .as_ref()
            .filter(|job| job.request_id == self.request_id)
        else {
            return;
        };
        let event = decorate(
            ProgressEvent::new(&job.request_id, job.phase, title, message)
                .with_progress(job.progress_pct()),
        );
        self.shared.progress.publish(event);
    }

    /// Install the channel an answer will arrive on. Call before moving to
    /// `clarifying`, so no answer can be accepted without a receiver.
    pub fn open_clarification(&self) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        let mut slot = self.shared.lock();
        if slot
            .job
            .as_ref()
            .is_some_and(|job| job.request_id == self.request_id)
        {
            slot.clarification_tx = Some(tx);
        }
        rx
    }

    /// Drop a pending clarification channel, e.g. after a timeout.
    pub fn close_clarification(&self) {
        self.shared.lock().clarification_tx = None;
    }

    /// Record the terminal outcome and emit the final event.
    fn finish(&self, outcome: &TerminalOutcome) {
        let result = match outcome {
            TerminalOutcome::Done(report) => {
                self.shared.lock().last_report = Some(report.clone());
                self.transition_with(
                    Phase::Done,
                    "Research complete",
                    &format!("Report ready: {}", report.title),
                    |event| {
                        event
                            .with_stat("numSources", report.num_sources)
                            .with_stat("sizeBytes", report.size_bytes)
                            .with_report(report.clone())
                    },
                )
            }
            TerminalOutcome::Canceled => self.transition(
                Phase::Canceled,
                "Research canceled",
                "Research was canceled",
            ),
            TerminalOutcome::Failed(cause) => {
                self.update(|job| job.error = Some(cause.clone()));
                self.transition_with(Phase::Error, "Research failed", cause, |event| {
                    event.with_stat("error", cause.as_str())
                })
            }
        };
        match result {
            Ok(()) => {
                tracing::info!(request_id = %self.request_id, outcome = %outcome.phase(), "Research job finished")
            }
            Err(e) => {
                tracing::error!(request_id = %self.request_id, error = %e, "Could not record job outcome")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResearchConfig, RetryConfig};
    use crate::mock::{MemoryReportStore, ScriptedModel, ScriptedSearch};
    use std::time::Duration;

    fn manager(search: ScriptedSearch, model: ScriptedModel) -> JobManager {
        let orchestrator = ResearchOrchestrator::new(
            Arc::new(search),
            Arc::new(model),
            Arc::new(MemoryReportStore::new()),
            ResearchConfig::default(),
            RetryConfig {
                initial_backoff_ms: 1,
                jitter: false,
                ..RetryConfig::default()
            },
        );
        JobManager::new(orchestrator)
    }

    #[tokio::test]
    async fn test_start_rejects_empty_query() {
        let mgr = manager(ScriptedSearch::new(), ScriptedModel::new());
        assert_eq!(mgr.start("   ", StartOptions::default()).err(), Some(JobError::EmptyQuery));
        assert!(mgr.current_state().is_none());
    }

    #[tokio::test]
    async fn test_second_start_while_active() {
        let search = ScriptedSearch::new().with_search_delay(Duration::from_millis(50));
        let mgr = manager(search, ScriptedModel::new());
        let handle = mgr.start("quantum computing", StartOptions::default()).unwrap();
        let first_id = handle.request_id.clone();

        let err = mgr.start("something else", StartOptions::default()).err();
        assert_eq!(err, Some(JobError::AlreadyActive));
        assert_eq!(mgr.current_state().unwrap().request_id, first_id);

        let outcome = handle.wait().await;
        assert!(matches!(outcome, TerminalOutcome::Done(_)));
        assert!(!mgr.is_active());
        assert!(mgr.start("something else", StartOptions::default()).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_without_job() {
        let mgr = manager(ScriptedSearch::new(), ScriptedModel::new());
        assert_eq!(mgr.cancel(), Err(JobError::NoActiveJob));
    }

    #[tokio::test]
    async fn test_answer_outside_clarifying() {
        let search = ScriptedSearch::new().with_search_delay(Duration::from_millis(50));
        let mgr = manager(search, ScriptedModel::new());
        assert_eq!(mgr.answer_clarification("x"), Err(JobError::NoActiveJob));
        let handle = mgr.start("quantum computing", StartOptions::default()).unwrap();
        assert_eq!(mgr.answer_clarification("x"), Err(JobError::NotClarifying));
        handle.wait().await;
    }

    #[tokio::test]
    async fn test_last_report_survives_slot_reuse() {
        let mgr = manager(ScriptedSearch::new(), ScriptedModel::new());
        let outcome = mgr
            .start("quantum computing", StartOptions::default())
            .unwrap()
            .wait()
            .await;
        let TerminalOutcome::Done(report) = &outcome else {
            panic!("expected done, got {outcome:?}");
        };
        assert_eq!(mgr.last_report().unwrap().request_id, report.request_id);
        assert!(mgr.status_summary().starts_with("Research completed"));
    }

    #[tokio::test]
    async fn test_stale_control_is_ignored() {
        let mgr = manager(ScriptedSearch::new(), ScriptedModel::new());
        mgr.start("quantum computing", StartOptions::default())
            .unwrap()
            .wait()
            .await;
        let stale = JobControl {
            shared: Arc::clone(&mgr.shared),
            request_id: "research_gone".into(),
            cancel: CancellationToken::new(),
        };
        assert_eq!(
            stale.transition(Phase::Briefing, "x", "y"),
            Err(JobError::NoActiveJob)
        );
        stale.update(|job| job.iteration = 99);
        assert_ne!(mgr.current_state().unwrap().iteration, 99);
    }
}
