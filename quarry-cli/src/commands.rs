//! Subcommand handlers.

use crate::{Commands, ConfigAction, ResearchArgs};
use quarry_core::config::{QuarryConfig, load_config};
use quarry_core::providers::{create_research_model, create_search_provider};
use quarry_core::{
    FileReportStore, JobManager, Phase, ProgressEvent, ResearchOrchestrator, SpokenUpdate,
    StartOptions, TerminalOutcome, VoiceSummarizer,
};
use std::path::Path;
use std::pin::pin;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

pub async fn handle_command(command: Commands, workspace: &Path, quiet: bool) -> anyhow::Result<()> {
    match command {
        Commands::Research(args) => handle_research(args, workspace, quiet).await,
        Commands::Config { action } => handle_config(action.unwrap_or(ConfigAction::Show), workspace),
    }
}

fn load(workspace: &Path) -> anyhow::Result<QuarryConfig> {
    let config = load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;
    for warning in config.validate()? {
        tracing::warn!("{warning}");
    }
    Ok(config)
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".quarry");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let toml_str = toml::to_string_pretty(&QuarryConfig::default())?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load(workspace)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn handle_research(args: ResearchArgs, workspace: &Path, quiet: bool) -> anyhow::Result<()> {
    let mut config = load(workspace)?;
    if let Some(max) = args.max_iterations {
        config.research.max_iterations = max.max(1);
    }
    if let Some(model) = args.model {
        config.llm.model = model;
    }
    if args.voice {
        config.voice.enabled = true;
    }

    let search = create_search_provider(&config.search, config.research.max_content_chars)?;
    let model = create_research_model(&config.llm)?;
    let store = Arc::new(FileReportStore::new(&config.storage.reports_dir));
    let orchestrator = ResearchOrchestrator::new(
        search,
        model,
        store,
        config.research.clone(),
        config.retry.clone(),
    );
    let manager = JobManager::new(orchestrator);

    let mut events = manager.subscribe_live();
    let _voice = config.voice.enabled.then(|| {
        let (tx, rx) = mpsc::channel(16);
        VoiceSummarizer::from_config(&config.voice).spawn(manager.subscribe_live(), tx);
        tokio::spawn(print_spoken(rx))
    });

    let options = StartOptions {
        max_results: args.max_results,
        include_domains: args.include_domains,
        exclude_domains: args.exclude_domains,
    };
    let handle = manager.start(&args.query, options)?;
    let mut finished = pin!(handle.wait());
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut awaiting_answer = false;

    let outcome = loop {
        tokio::select! {
            outcome = &mut finished => break outcome,
            received = events.recv() => match received {
                Ok(event) => {
                    if !quiet {
                        println!("{}", format_event(&event));
                    }
                    if let Some(clarification) = &event.clarification {
                        println!("\n? {}", clarification.question);
                        println!("  (type an answer and press Enter)");
                        awaiting_answer = true;
                    }
                    if event.phase != Phase::Clarifying {
                        awaiting_answer = false;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress printer lagged");
                }
                Err(RecvError::Closed) => {}
            },
            line = stdin.next_line(), if awaiting_answer => {
                awaiting_answer = false;
                match line {
                    Ok(Some(answer)) if !answer.trim().is_empty() => {
                        if let Err(e) = manager.answer_clarification(&answer) {
                            eprintln!("Answer not accepted: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "Failed to read answer from stdin"),
                }
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nCanceling research...");
                if let Err(e) = manager.cancel() {
                    tracing::debug!(error = %e, "Nothing to cancel");
                }
            }
        }
    };

    // Print whatever was published between the last recv and completion.
    while let Ok(event) = events.try_recv() {
        if !quiet {
            println!("{}", format_event(&event));
        }
    }

    match outcome {
        TerminalOutcome::Done(report) => {
            println!("\n{}", report.title);
            println!(
                "  {} sources, {} bytes",
                report.num_sources, report.size_bytes
            );
            if let Some(location) = &report.location {
                println!("  Saved to: {location}");
            }
            Ok(())
        }
        TerminalOutcome::Canceled => {
            println!("Research canceled.");
            Ok(())
        }
        TerminalOutcome::Failed(cause) => Err(anyhow::anyhow!("Research failed: {cause}")),
    }
}

async fn print_spoken(mut rx: mpsc::Receiver<SpokenUpdate>) {
    while let Some(update) = rx.recv().await {
        println!("  >> {}", update.text);
    }
}

/// One progress line: `[phase  42%] Title: message`.
fn format_event(event: &ProgressEvent) -> String {
    let pct = event
        .progress_pct
        .map(|p| format!(" {:>3.0}%", p))
        .unwrap_or_default();
    let mut line = format!(
        "[{}{}] {}: {}",
        event.phase, pct, event.title, event.message
    );
    if let Some(note) = &event.note {
        line.push_str(&format!(" ({} citations)", note.citations.len()));
    }
    line
}
