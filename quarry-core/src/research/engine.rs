//! Research orchestrator: drives one job from probe to report.

use super::compression::CompressionEngine;
use super::output::{Report, ReportStore, finalize_report, remap_citations};
use super::session::{Clarification, Note, Phase};
use super::sources::CitationRegistry;
use super::supervisor::{Decision, Supervisor, SupervisorInput, is_researched};
use crate::config::{ResearchConfig, RetryConfig};
use crate::error::{CompressionError, JobError, ProviderError, QuarryError, StorageError};
use crate::job::{JobControl, TerminalOutcome};
use crate::ports::{
    Ambiguity, Brief, Document, ReportRequest, ResearchModel, SearchFilters, SearchProvider,
    SynthesisContext,
};
use crate::progress::{ClarificationPayload, NotePayload, SUBTOPIC_STARTED};
use crate::retry::RetryingFetcher;
use std::collections::HashMap;
use std::sync::Arc;

/// Why the pipeline stopped early.
enum Halt {
    Canceled,
    Failed(QuarryError),
}

impl From<ProviderError> for Halt {
    fn from(e: ProviderError) -> Self {
        Halt::Failed(e.into())
    }
}

impl From<JobError> for Halt {
    fn from(e: JobError) -> Self {
        Halt::Failed(e.into())
    }
}

impl From<CompressionError> for Halt {
    fn from(e: CompressionError) -> Self {
        Halt::Failed(e.into())
    }
}

impl From<StorageError> for Halt {
    fn from(e: StorageError) -> Self {
        Halt::Failed(e.into())
    }
}

fn checkpoint(ctl: &JobControl) -> Result<(), Halt> {
    if ctl.is_cancelled() {
        Err(Halt::Canceled)
    } else {
        Ok(())
    }
}

/// Notes and citations the orchestrator owns while a job runs.
#[derive(Default)]
struct WorkingState {
    notes: Vec<Note>,
    registry: CitationRegistry,
    researched: Vec<String>,
    iteration: usize,
}

/// Runs the research pipeline for one job at a time.
pub struct ResearchOrchestrator {
    fetcher: RetryingFetcher,
    model: Arc<dyn ResearchModel>,
    store: Arc<dyn ReportStore>,
    supervisor: Supervisor,
    compressor: CompressionEngine,
    config: ResearchConfig,
}

impl ResearchOrchestrator {
    pub fn new(
        search: Arc<dyn SearchProvider>,
        model: Arc<dyn ResearchModel>,
        store: Arc<dyn ReportStore>,
        config: ResearchConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            fetcher: RetryingFetcher::new(search, retry.clone()),
            supervisor: Supervisor::new(Arc::clone(&model), retry.clone(), config.max_iterations),
            compressor: CompressionEngine::new(Arc::clone(&model), retry, config.token_budget),
            model,
            store,
            config,
        }
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    /// Run the job to a terminal outcome. The caller records the outcome.
    pub async fn run(&self, ctl: &JobControl) -> TerminalOutcome {
        match self.drive(ctl).await {
            Ok(report) => TerminalOutcome::Done(report),
            Err(Halt::Canceled) => {
                tracing::info!(request_id = %ctl.request_id(), "Research canceled");
                TerminalOutcome::Canceled
            }
            Err(Halt::Failed(e)) => {
                tracing::error!(request_id = %ctl.request_id(), error = %e, "Research failed");
                TerminalOutcome::Failed(e.short_cause())
            }
        }
    }

    async fn drive(&self, ctl: &JobControl) -> Result<Report, Halt> {
        let (query, options) = ctl
            .read(|job| (job.query.clone(), job.options.clone()))
            .ok_or(JobError::NoActiveJob)?;
        let filters = SearchFilters {
            max_results: options
                .max_results
                .unwrap_or(self.config.max_results_per_search),
            include_domains: options.include_domains,
            exclude_domains: options.exclude_domains,
        };

        let query = self.clarify(ctl, &query, &filters).await?;
        let brief = self.plan(ctl, &query).await?;
        let mut state = WorkingState::default();
        self.iterate(ctl, &query, &brief, &filters, &mut state).await?;
        self.report(ctl, &query, &brief, state).await
    }

    /// Probe the query and, when it looks ambiguous, ask the user. Returns
    /// the effective query.
    async fn clarify(
        &self,
        ctl: &JobControl,
        query: &str,
        filters: &SearchFilters,
    ) -> Result<String, Halt> {
        checkpoint(ctl)?;
        ctl.emit("Quick search", &format!("Searching for: {query}"));
        let probe_filters = filters.with_max_results(self.config.probe_results);
        let probe = match self.fetcher.search(query, &probe_filters).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "Probe search failed; skipping clarification");
                return Ok(query.to_string());
            }
        };

        let ambiguity = if probe.is_empty() {
            Ambiguity::Ambiguous {
                question: format!(
                    "I couldn't find much about \"{query}\". Could you say more about what you want researched?"
                ),
            }
        } else {
            self.fetcher
                .call("judge_ambiguity", || self.model.judge_ambiguity(query, &probe))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "Ambiguity check failed; assuming the query is clear");
                    Ambiguity::Clear
                })
        };
        let Ambiguity::Ambiguous { question } = ambiguity else {
            return Ok(query.to_string());
        };

        checkpoint(ctl)?;
        let answer_rx = ctl.open_clarification();
        ctl.update(|job| {
            job.clarification = Some(Clarification {
                question: question.clone(),
                answer: None,
            })
        });
        ctl.transition_with(Phase::Clarifying, "Clarification needed", &question, |event| {
            event.with_clarification(ClarificationPayload {
                question: question.clone(),
                original_query: query.to_string(),
            })
        })?;

        let window = self.config.clarification_timeout();
        let answer = tokio::select! {
            _ = ctl.cancelled() => return Err(Halt::Canceled),
            result = tokio::time::timeout(window, answer_rx) => match result {
                Ok(Ok(answer)) => Some(answer),
                Ok(Err(_)) => None,
                Err(_) => {
                    tracing::info!(
                        timeout_secs = window.as_secs(),
                        "No clarification received; continuing with the original query"
                    );
                    None
                }
            },
        };
        ctl.close_clarification();

        Ok(match answer.filter(|a| !a.is_empty()) {
            Some(answer) => format!("{query} ({answer})"),
            None => query.to_string(),
        })
    }

    async fn plan(&self, ctl: &JobControl, query: &str) -> Result<Brief, Halt> {
        checkpoint(ctl)?;
        ctl.transition(
            Phase::Briefing,
            "Planning research",
            &format!("Creating research plan for: {query}"),
        )?;

        let max = self.config.max_iterations;
        let mut brief = self
            .fetcher
            .call("decompose", || self.model.decompose(query, max))
            .await?;
        brief.subtopics = clean_subtopics(brief.subtopics, max);
        if brief.subtopics.is_empty() {
            tracing::warn!("Plan has no subtopics; researching the query directly");
            brief.subtopics.push(query.to_string());
        }
        if brief.title.trim().is_empty() {
            brief.title = query.to_string();
        }

        ctl.update(|job| {
            job.brief = Some(brief.clone());
            job.plan = brief.subtopics.clone();
        });
        ctl.emit_with(
            "Research plan ready",
            &format!("Research plan ready: {}", brief.title),
            |event| event.with_stat("subtopics", brief.subtopics.clone()),
        );
        Ok(brief)
    }

    async fn iterate(
        &self,
        ctl: &JobControl,
        query: &str,
        brief: &Brief,
        filters: &SearchFilters,
        state: &mut WorkingState,
    ) -> Result<(), Halt> {
        checkpoint(ctl)?;
        ctl.transition(
            Phase::Researching,
            "Researching",
            &format!("Researching: {}", brief.title),
        )?;
        let mut since_compression = 0;

        loop {
            checkpoint(ctl)?;
            let decision = self
                .supervisor
                .decide(SupervisorInput {
                    query,
                    brief,
                    plan: &brief.subtopics,
                    researched: &state.researched,
                    notes: &state.notes,
                    iteration: state.iteration,
                })
                .await?;
            let subtopic = match decision {
                Decision::Continue(subtopic) => subtopic,
                Decision::Stop(reason) => {
                    let why = reason.describe();
                    tracing::info!(iterations = state.iteration, reason = %why, "Research loop finished");
                    ctl.emit_with("Wrapping up research", &why, |event| {
                        event.with_stat("iterations", state.iteration)
                    });
                    return Ok(());
                }
            };

            if ctl.read(|job| job.phase) == Some(Phase::Compressing) {
                checkpoint(ctl)?;
                ctl.transition(Phase::Researching, "Researching", "Continuing research")?;
            }

            state.iteration += 1;
            ctl.update(|job| {
                job.iteration = state.iteration;
                job.current_subtopic = Some(subtopic.clone());
            });
            ctl.emit_with(
                SUBTOPIC_STARTED,
                &format!("Investigating: {subtopic}"),
                |event| {
                    event
                        .with_stat("subtopic", subtopic.as_str())
                        .with_stat("iteration", state.iteration)
                },
            );

            let note = self
                .research_subtopic(ctl, query, brief, &subtopic, filters, &mut state.registry)
                .await?;
            state.researched.push(subtopic.clone());
            state.notes.push(note.clone());
            since_compression += 1;

            ctl.update(|job| {
                job.notes = state.notes.clone();
                job.citations = state.registry.clone();
            });
            let citations = note
                .citations
                .iter()
                .filter_map(|id| state.registry.get(*id).cloned())
                .collect();
            ctl.emit_with(
                "Research note complete",
                &format!("Finished researching: {subtopic}"),
                |event| {
                    event
                        .with_stat("subtopic", subtopic.as_str())
                        .with_stat("numCitations", note.citations.len())
                        .with_stat("totalSources", state.registry.len())
                        .with_note(NotePayload::new(&note, citations))
                },
            );

            if since_compression >= self.config.compression_threshold {
                checkpoint(ctl)?;
                self.compress(ctl, state).await?;
                since_compression = 0;
            }
        }
    }

    async fn research_subtopic(
        &self,
        ctl: &JobControl,
        query: &str,
        brief: &Brief,
        subtopic: &str,
        filters: &SearchFilters,
        registry: &mut CitationRegistry,
    ) -> Result<Note, Halt> {
        let hits = self.fetcher.search(subtopic, filters).await?;
        if hits.is_empty() {
            let message = format!("No results found for: {subtopic}");
            ctl.emit("No sources found", &message);
            return Ok(Note::empty(subtopic, message));
        }
        ctl.emit_with(
            "Gathering sources",
            &format!("Found {} relevant sources about {subtopic}", hits.len()),
            |event| event.with_stat("numResults", hits.len()),
        );

        let fetched = self.fetcher.fetch_all(&hits).await;
        let failed: Vec<&str> = fetched.failures.iter().map(|f| f.url.as_str()).collect();
        let max_chars = self.config.max_content_chars;
        let documents: Vec<Document> = fetched
            .documents
            .iter()
            .filter(|doc| !doc.text.trim().is_empty())
            .map(|doc| Document {
                text: doc.text.chars().take(max_chars).collect(),
                ..doc.clone()
            })
            .collect();

        if documents.is_empty() {
            let message = format!("No content could be retrieved for: {subtopic}");
            ctl.emit_with("No usable sources", &message, |event| {
                event
                    .with_stat("partialFetchFailure", failed.len())
                    .with_stat("failedUrls", failed.clone())
            });
            return Ok(Note::empty(subtopic, message));
        }

        ctl.emit_with(
            "Synthesizing findings",
            &format!("Analyzing {} sources about {subtopic}", documents.len()),
            |event| {
                let event = event.with_stat("sourcesFetched", documents.len());
                if failed.is_empty() {
                    event
                } else {
                    event
                        .with_stat("partialFetchFailure", failed.len())
                        .with_stat("failedUrls", failed.clone())
                }
            },
        );

        let mut local_to_global = HashMap::new();
        let mut citation_ids = Vec::with_capacity(documents.len());
        for (idx, doc) in documents.iter().enumerate() {
            let id = registry.register_document(doc);
            local_to_global.insert(idx as u32 + 1, id);
            if !citation_ids.contains(&id) {
                citation_ids.push(id);
            }
        }

        let context = SynthesisContext { query, brief };
        let text = self
            .fetcher
            .call("synthesize", || {
                self.model.synthesize(subtopic, &documents, context)
            })
            .await?;

        Ok(Note::new(
            subtopic,
            remap_citations(&text, &local_to_global, documents.len() as u32),
            citation_ids,
        ))
    }

    async fn compress(&self, ctl: &JobControl, state: &mut WorkingState) -> Result<(), Halt> {
        let message = format!("Consolidating {} research notes", state.notes.len());
        if ctl.read(|job| job.phase) == Some(Phase::Compressing) {
            ctl.emit("Organizing findings", &message);
        } else {
            ctl.transition(Phase::Compressing, "Organizing findings", &message)?;
        }
        let notes = std::mem::take(&mut state.notes);
        let outcome = self.compressor.compress(notes, &state.registry).await?;
        state.notes = outcome.notes;

        ctl.update(|job| job.notes = state.notes.clone());
        ctl.emit_with(
            "Findings organized",
            &format!("{} notes after consolidation", state.notes.len()),
            |event| {
                event
                    .with_stat("tokensBefore", outcome.tokens_before)
                    .with_stat("tokensAfter", outcome.tokens_after)
                    .with_stat("merges", outcome.merges)
                    .with_stat("overBudget", outcome.over_budget)
            },
        );
        Ok(())
    }

    async fn report(
        &self,
        ctl: &JobControl,
        query: &str,
        brief: &Brief,
        mut state: WorkingState,
    ) -> Result<Report, Halt> {
        checkpoint(ctl)?;
        if self.compressor.needs_compression(&state.notes) {
            self.compress(ctl, &mut state).await?;
            checkpoint(ctl)?;
        }
        ctl.transition(
            Phase::Reporting,
            "Writing final report",
            &format!("Compiling all findings into a report on: {}", brief.title),
        )?;

        let request = ReportRequest {
            query,
            brief,
            notes: &state.notes,
            citations: state.registry.citations(),
        };
        let draft = self
            .fetcher
            .call("generate_report", || self.model.generate_report(request))
            .await?;

        let title = match draft.title.trim() {
            "" => brief.title.clone(),
            title => title.to_string(),
        };
        let content = finalize_report(&draft.content, &state.registry);
        let mut report = Report::new(ctl.request_id(), title, content, state.registry.len());

        checkpoint(ctl)?;
        report.location = Some(self.store.save(&report).await?);
        Ok(report)
    }
}

/// Trim, drop blanks and duplicates, and cap the plan length.
fn clean_subtopics(subtopics: Vec<String>, max: usize) -> Vec<String> {
    let mut cleaned: Vec<String> = Vec::new();
    for topic in subtopics {
        let topic = topic.trim().to_string();
        if topic.is_empty() || is_researched(&topic, &cleaned) {
            continue;
        }
        cleaned.push(topic);
        if cleaned.len() == max {
            break;
        }
    }
    cleaned
}
