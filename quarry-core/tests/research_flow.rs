//! End-to-end research jobs driven through the JobManager with the scripted
//! search and model doubles.

use pretty_assertions::assert_eq;
use quarry_core::config::{ResearchConfig, RetryConfig};
use quarry_core::error::ProviderError;
use quarry_core::mock::{MemoryReportStore, ScriptedChat, ScriptedModel, ScriptedSearch};
use quarry_core::ports::{Ambiguity, Brief, SourceRef};
use quarry_core::progress::{ProgressEvent, SUBTOPIC_STARTED};
use quarry_core::providers::LlmResearchModel;
use quarry_core::{JobManager, Phase, ResearchOrchestrator, StartOptions, TerminalOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// Helper to build a manager over scripted capabilities.
fn manager(
    search: ScriptedSearch,
    model: ScriptedModel,
    store: MemoryReportStore,
    tweak: impl FnOnce(&mut ResearchConfig),
) -> JobManager {
    let mut config = ResearchConfig::default();
    tweak(&mut config);
    JobManager::new(ResearchOrchestrator::new(
        Arc::new(search),
        Arc::new(model),
        Arc::new(store),
        config,
        quick_retry(),
    ))
}

fn quick_retry() -> RetryConfig {
    RetryConfig {
        initial_backoff_ms: 1,
        max_backoff_ms: 10,
        jitter: false,
        ..RetryConfig::default()
    }
}

fn brief(subtopics: &[&str]) -> Brief {
    Brief {
        title: "Test research".into(),
        scope: "Scripted scope".into(),
        subtopics: subtopics.iter().map(|s| s.to_string()).collect(),
    }
}

fn timeout() -> ProviderError {
    ProviderError::Timeout {
        provider: "scripted-search".into(),
        timeout_secs: 30,
    }
}

/// Receive events up to and including the first terminal one.
async fn until_terminal(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        match rx.recv().await {
            Ok(event) => {
                let terminal = event.is_terminal();
                events.push(event);
                if terminal {
                    return events;
                }
            }
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return events,
        }
    }
}

/// Receive events until one matches `pred`.
async fn until(
    rx: &mut broadcast::Receiver<ProgressEvent>,
    pred: impl Fn(&ProgressEvent) -> bool,
) -> ProgressEvent {
    loop {
        match rx.recv().await {
            Ok(event) if pred(&event) => return event,
            Ok(_) | Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => panic!("progress channel closed"),
        }
    }
}

/// Phases in order with consecutive repeats collapsed.
fn phase_path(events: &[ProgressEvent]) -> Vec<Phase> {
    let mut path: Vec<Phase> = Vec::new();
    for event in events {
        if path.last() != Some(&event.phase) {
            path.push(event.phase);
        }
    }
    path
}

fn terminal_count(events: &[ProgressEvent]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

#[tokio::test(start_paused = true)]
async fn test_clear_query_runs_without_clarification() {
    let store = MemoryReportStore::new();
    let mgr = manager(ScriptedSearch::new(), ScriptedModel::new(), store.clone(), |_| {});
    let mut rx = mgr.subscribe_live();

    let handle = mgr
        .start("Research quantum computing", StartOptions::default())
        .unwrap();
    let outcome = handle.wait().await;
    let events = until_terminal(&mut rx).await;

    assert_eq!(
        phase_path(&events),
        vec![
            Phase::Idle,
            Phase::Briefing,
            Phase::Researching,
            Phase::Reporting,
            Phase::Done
        ]
    );
    assert_eq!(terminal_count(&events), 1);

    let TerminalOutcome::Done(report) = outcome else {
        panic!("expected a report, got {outcome:?}");
    };
    assert_eq!(report.num_sources, 9);
    assert!(report.content.contains("### Sources"));
    assert_eq!(
        report.location.as_deref(),
        Some(format!("memory://{}", report.request_id).as_str())
    );
    assert_eq!(store.saved().len(), 1);

    let done = events.last().unwrap();
    assert_eq!(done.report.as_ref().map(|r| r.num_sources), Some(9));
    assert_eq!(done.progress_pct, Some(100.0));

    let snapshot = mgr.current_state().unwrap();
    assert_eq!(snapshot.phase, Phase::Done);
    assert_eq!(snapshot.notes.len(), 3);
    assert!(snapshot.completed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_clarification_answer_refines_query() {
    let model = ScriptedModel::new().with_ambiguity(Ambiguity::Ambiguous {
        question: "Do you mean the planet, the element, or the musician?".into(),
    });
    let mgr = manager(
        ScriptedSearch::new(),
        model.clone(),
        MemoryReportStore::new(),
        |_| {},
    );
    let mut rx = mgr.subscribe_live();
    let handle = mgr.start("mercury", StartOptions::default()).unwrap();

    let asked = until(&mut rx, |e| e.phase == Phase::Clarifying).await;
    let payload = asked.clarification.expect("clarifying event carries the question");
    assert_eq!(payload.original_query, "mercury");
    assert!(payload.question.contains("planet"));

    mgr.answer_clarification("the planet").unwrap();
    assert!(matches!(handle.wait().await, TerminalOutcome::Done(_)));
    assert_eq!(model.decomposed_queries(), vec!["mercury (the planet)"]);

    let snapshot = mgr.current_state().unwrap();
    let clarification = snapshot.clarification.unwrap();
    assert_eq!(clarification.answer.as_deref(), Some("the planet"));
}

#[tokio::test(start_paused = true)]
async fn test_clarification_timeout_keeps_original_query() {
    let model = ScriptedModel::new().with_ambiguity(Ambiguity::Ambiguous {
        question: "Which Mercury?".into(),
    });
    let mgr = manager(
        ScriptedSearch::new(),
        model.clone(),
        MemoryReportStore::new(),
        |config| config.clarification_timeout_secs = 120,
    );
    let mut rx = mgr.subscribe_live();
    let started = tokio::time::Instant::now();

    let outcome = mgr
        .start("mercury", StartOptions::default())
        .unwrap()
        .wait()
        .await;
    let events = until_terminal(&mut rx).await;

    assert!(matches!(outcome, TerminalOutcome::Done(_)));
    assert!(started.elapsed() >= Duration::from_secs(120));
    assert_eq!(model.decomposed_queries(), vec!["mercury"]);
    assert_eq!(
        &phase_path(&events)[..3],
        &[Phase::Idle, Phase::Clarifying, Phase::Briefing]
    );
}

#[tokio::test(start_paused = true)]
async fn test_empty_probe_asks_for_more_detail() {
    let search = ScriptedSearch::new().with_results("xyzzy plugh", vec![]);
    let mgr = manager(search, ScriptedModel::new(), MemoryReportStore::new(), |_| {});
    let mut rx = mgr.subscribe_live();
    let _handle = mgr.start("xyzzy plugh", StartOptions::default()).unwrap();

    let asked = until(&mut rx, |e| e.phase == Phase::Clarifying).await;
    assert!(asked.message.contains("xyzzy plugh"));
    mgr.cancel().unwrap();
    let rest = until_terminal(&mut rx).await;
    assert_eq!(rest.last().unwrap().phase, Phase::Canceled);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_research_never_reports() {
    let search = ScriptedSearch::new().with_search_delay(Duration::from_millis(100));
    let model = ScriptedModel::new();
    let mgr = manager(search, model.clone(), MemoryReportStore::new(), |_| {});
    let mut rx = mgr.subscribe_live();
    let handle = mgr
        .start("history of the printing press", StartOptions::default())
        .unwrap();

    let mut seen = vec![until(&mut rx, |e| e.title == SUBTOPIC_STARTED).await];
    mgr.cancel().unwrap();
    assert!(matches!(handle.wait().await, TerminalOutcome::Canceled));
    seen.extend(until_terminal(&mut rx).await);

    assert!(seen.iter().all(|e| e.phase != Phase::Reporting));
    assert_eq!(seen.last().unwrap().phase, Phase::Canceled);
    assert_eq!(terminal_count(&seen), 1);
    assert_eq!(model.report_calls(), 0);

    let snapshot = mgr.current_state().unwrap();
    assert_eq!(snapshot.phase, Phase::Canceled);
    assert!(snapshot.cancel_requested);
    assert!(mgr.last_report().is_none());
    assert_eq!(mgr.cancel(), Err(quarry_core::error::JobError::NoActiveJob));
}

#[tokio::test(start_paused = true)]
async fn test_partial_fetch_failure_is_absorbed() {
    let subtopic = "solar panel efficiency records";
    let search = ScriptedSearch::new().with_results(
        subtopic,
        vec![
            SourceRef::new("https://a.example/cells", "Cell records"),
            SourceRef::new("https://b.example/modules", "Module records"),
            SourceRef::new("https://c.example/down", "Unreachable"),
        ],
    );
    search.fail_fetch("https://a.example/cells", vec![timeout(), timeout()]);
    search.fail_fetch("https://b.example/modules", vec![timeout(), timeout()]);
    search.fail_fetch(
        "https://c.example/down",
        vec![timeout(), timeout(), timeout()],
    );
    let model = ScriptedModel::new().with_brief(brief(&[subtopic]));
    let mgr = manager(search.clone(), model, MemoryReportStore::new(), |_| {});
    let mut rx = mgr.subscribe_live();

    let outcome = mgr
        .start("solar power", StartOptions::default())
        .unwrap()
        .wait()
        .await;
    let events = until_terminal(&mut rx).await;
    assert!(matches!(outcome, TerminalOutcome::Done(_)), "{outcome:?}");

    let note = events
        .iter()
        .find_map(|e| e.note.as_ref())
        .expect("a note event");
    let urls: Vec<&str> = note.citations.iter().map(|c| c.url.as_str()).collect();
    assert_eq!(urls, vec!["https://a.example/cells", "https://b.example/modules"]);
    assert_eq!(note.citations[0].title, "Cell records");

    let synthesizing = events
        .iter()
        .find(|e| e.title == "Synthesizing findings")
        .unwrap();
    assert_eq!(synthesizing.stats["partialFetchFailure"], 1);
    assert_eq!(synthesizing.stats["failedUrls"][0], "https://c.example/down");
    assert_eq!(search.fetch_attempts("https://c.example/down"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_sources_give_an_empty_note() {
    let subtopic = "offline archive";
    let search = ScriptedSearch::new().with_results(
        subtopic,
        vec![SourceRef::new("https://gone.example", "Gone")],
    );
    search.fail_fetch(
        "https://gone.example",
        vec![ProviderError::AuthFailed {
            provider: "scripted-search".into(),
        }],
    );
    let model = ScriptedModel::new().with_brief(brief(&[subtopic]));
    let mgr = manager(search, model.clone(), MemoryReportStore::new(), |_| {});

    let outcome = mgr
        .start("old archives", StartOptions::default())
        .unwrap()
        .wait()
        .await;
    let TerminalOutcome::Done(report) = outcome else {
        panic!("expected done, got {outcome:?}");
    };
    assert_eq!(report.num_sources, 0);
    assert_eq!(model.synthesize_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_compression_alternates_with_research() {
    let model = ScriptedModel::new().with_brief(brief(&["alpha", "beta", "gamma", "delta"]));
    let mgr = manager(
        ScriptedSearch::new(),
        model.clone(),
        MemoryReportStore::new(),
        |config| {
            config.compression_threshold = 2;
            config.token_budget = 150;
        },
    );
    let mut rx = mgr.subscribe_live();

    let outcome = mgr
        .start("greek letters", StartOptions::default())
        .unwrap()
        .wait()
        .await;
    let events = until_terminal(&mut rx).await;

    assert_eq!(
        phase_path(&events),
        vec![
            Phase::Idle,
            Phase::Briefing,
            Phase::Researching,
            Phase::Compressing,
            Phase::Researching,
            Phase::Compressing,
            Phase::Reporting,
            Phase::Done
        ]
    );
    let TerminalOutcome::Done(report) = outcome else {
        panic!("expected done, got {outcome:?}");
    };
    assert_eq!(report.num_sources, 12);
    assert!(model.compress_calls() > 0);

    let last_pass = events
        .iter()
        .rev()
        .find(|e| e.title == "Findings organized")
        .unwrap();
    assert!(last_pass.stats["tokensAfter"].as_u64().unwrap() <= 150);
    assert!(
        last_pass.stats["tokensAfter"].as_u64() <= last_pass.stats["tokensBefore"].as_u64()
    );

    let snapshot = mgr.current_state().unwrap();
    let mut cited: Vec<u32> = snapshot
        .notes
        .iter()
        .flat_map(|n| n.citations.clone())
        .collect();
    cited.sort_unstable();
    cited.dedup();
    assert_eq!(cited, (1..=12).collect::<Vec<u32>>());
}

#[tokio::test(start_paused = true)]
async fn test_report_failure_ends_in_error() {
    let model = ScriptedModel::new().fail_report(ProviderError::InvalidRequest {
        provider: "scripted-model".into(),
        message: "x".repeat(500),
    });
    let mgr = manager(ScriptedSearch::new(), model, MemoryReportStore::new(), |_| {});
    let mut rx = mgr.subscribe_live();

    let outcome = mgr
        .start("deep sea mining", StartOptions::default())
        .unwrap()
        .wait()
        .await;
    let events = until_terminal(&mut rx).await;

    let TerminalOutcome::Failed(cause) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(cause.chars().count() <= 200);
    let last = events.last().unwrap();
    assert_eq!(last.phase, Phase::Error);
    assert_eq!(terminal_count(&events), 1);
    assert!(!mgr.is_active());
    assert!(mgr.current_state().unwrap().error.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_transient_model_errors_exhaust_into_error() {
    let model = ScriptedModel::new().fail_decompose(ProviderError::Server {
        provider: "scripted-model".into(),
        status: 503,
        message: "overloaded".into(),
    });
    let mgr = manager(ScriptedSearch::new(), model.clone(), MemoryReportStore::new(), |_| {});

    let outcome = mgr
        .start("lunar regolith", StartOptions::default())
        .unwrap()
        .wait()
        .await;
    assert!(matches!(outcome, TerminalOutcome::Failed(_)));
    assert_eq!(model.decomposed_queries().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_task_still_reaches_error() {
    let model = ScriptedModel::new().panic_in_report();
    let mgr = manager(ScriptedSearch::new(), model, MemoryReportStore::new(), |_| {});
    let mut rx = mgr.subscribe_live();

    let outcome = mgr
        .start("volcanoes", StartOptions::default())
        .unwrap()
        .wait()
        .await;
    let events = until_terminal(&mut rx).await;

    assert!(matches!(outcome, TerminalOutcome::Failed(_)));
    assert_eq!(events.last().unwrap().phase, Phase::Error);
    assert!(mgr.start("volcanoes again", StartOptions::default()).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_storage_failure_ends_in_error() {
    let mgr = manager(
        ScriptedSearch::new(),
        ScriptedModel::new(),
        MemoryReportStore::failing(),
        |_| {},
    );
    let outcome = mgr
        .start("coral reefs", StartOptions::default())
        .unwrap()
        .wait()
        .await;
    let TerminalOutcome::Failed(cause) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(cause.contains("memory://"));
    assert!(mgr.last_report().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_replays_history() {
    let mgr = manager(
        ScriptedSearch::new(),
        ScriptedModel::new(),
        MemoryReportStore::new(),
        |_| {},
    );
    mgr.start("tidal energy", StartOptions::default())
        .unwrap()
        .wait()
        .await;

    let subscription = mgr.subscribe();
    let history = subscription.history;
    assert_eq!(history.first().unwrap().title, "Research started");
    assert_eq!(history.last().unwrap().phase, Phase::Done);
    assert_eq!(terminal_count(&history), 1);
}

#[tokio::test(start_paused = true)]
async fn test_max_results_option_caps_each_search() {
    let search = ScriptedSearch::new().with_hits_per_query(8);
    let mgr = manager(search.clone(), ScriptedModel::new(), MemoryReportStore::new(), |_| {});
    let options = StartOptions {
        max_results: Some(2),
        include_domains: vec!["arxiv.org".into()],
        exclude_domains: vec![],
    };
    let outcome = mgr.start("graphene", options).unwrap().wait().await;
    let TerminalOutcome::Done(report) = outcome else {
        panic!("expected done, got {outcome:?}");
    };
    // Three subtopics at two results each.
    assert_eq!(report.num_sources, 6);
    assert_eq!(search.queries()[0], "graphene");
}

#[tokio::test(start_paused = true)]
async fn test_planned_subtopics_that_extend_each_other_are_all_researched() {
    let planned = ["Rust", "Rust async runtimes", "Rust embedded"];
    let search = ScriptedSearch::new();
    let model = ScriptedModel::new().with_brief(brief(&planned));
    let mgr = manager(search.clone(), model, MemoryReportStore::new(), |_| {});

    let outcome = mgr
        .start("rust language", StartOptions::default())
        .unwrap()
        .wait()
        .await;
    assert!(matches!(outcome, TerminalOutcome::Done(_)), "{outcome:?}");

    let snapshot = mgr.current_state().unwrap();
    assert_eq!(snapshot.plan, planned);
    let researched: Vec<&str> = snapshot.notes.iter().map(|n| n.subtopic.as_str()).collect();
    assert_eq!(researched, planned);
    assert_eq!(
        search.queries(),
        vec!["rust language", "Rust", "Rust async runtimes", "Rust embedded"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_prose_model_replies_still_produce_a_report() {
    let chat = ScriptedChat::new(
        [
            r#"{"need_clarification":false}"#,
            "Here is a research plan: cover borrowing and lifetimes.",
            "Values have a single owner and moves transfer it [1].",
            "I think the notes could go a little deeper.",
            "# Rust Ownership\n\nEach value has one owner [1].",
        ]
        .into_iter()
        .map(String::from)
        .collect(),
    );
    let model = LlmResearchModel::new(Arc::new(chat.clone()));
    let mgr = JobManager::new(ResearchOrchestrator::new(
        Arc::new(ScriptedSearch::new()),
        Arc::new(model),
        Arc::new(MemoryReportStore::new()),
        ResearchConfig::default(),
        quick_retry(),
    ));

    let outcome = mgr
        .start("rust ownership", StartOptions::default())
        .unwrap()
        .wait()
        .await;
    let TerminalOutcome::Done(report) = outcome else {
        panic!("expected a report, got {outcome:?}");
    };
    assert_eq!(report.title, "Rust Ownership");
    assert!(report.content.contains("one owner [1]"));
    assert_eq!(chat.calls(), 5);

    let snapshot = mgr.current_state().unwrap();
    assert_eq!(snapshot.plan, vec!["rust ownership"]);
    assert_eq!(snapshot.notes.len(), 1);
}
