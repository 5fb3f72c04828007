//! Quarry CLI: run deep research jobs from the terminal.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Quarry: deep research from a single question
#[derive(Parser, Debug)]
#[command(name = "quarry", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Workspace directory (for `.quarry/config.toml`)
    #[arg(short, long, default_value = ".", global = true)]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum Commands {
    /// Research a question and write a cited report
    Research(ResearchArgs),
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(clap::Args, Debug)]
pub(crate) struct ResearchArgs {
    /// The research question
    pub query: String,

    /// Results per search
    #[arg(long)]
    pub max_results: Option<usize>,

    /// Only search these domains (repeatable)
    #[arg(long = "include-domain")]
    pub include_domains: Vec<String>,

    /// Never search these domains (repeatable)
    #[arg(long = "exclude-domain")]
    pub exclude_domains: Vec<String>,

    /// Upper bound on research iterations
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// LLM model to use
    #[arg(short, long)]
    pub model: Option<String>,

    /// Print spoken-style status updates
    #[arg(long)]
    pub voice: bool,
}

#[derive(clap::Subcommand, Debug)]
pub(crate) enum ConfigAction {
    /// Print the effective configuration (default)
    Show,
    /// Write a default `.quarry/config.toml` into the workspace
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let stderr_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(stderr_filter);

    let log_dir = directories::ProjectDirs::from("dev", "quarry", "quarry")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "quarry.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.quiet).await
}
