//! # Quarry Core
//!
//! Core library for Quarry, a voice-friendly deep research assistant.
//! Provides the research job lifecycle, the iterative research pipeline,
//! progress fan-out, the search and language-model ports with their HTTP
//! adapters, configuration, and the spoken status summarizer.

pub mod config;
pub mod error;
pub mod job;
pub mod mock;
pub mod ports;
pub mod progress;
pub mod providers;
pub mod research;
pub mod retry;
pub mod voice;

// Re-export commonly used types at the crate root.
pub use config::{QuarryConfig, load_config};
pub use error::{ProviderError, QuarryError, Result};
pub use job::{JobControl, JobHandle, JobManager, TerminalOutcome};
pub use ports::{ResearchModel, SearchProvider};
pub use progress::{ProgressBroadcaster, ProgressEvent, Subscription};
pub use research::{
    FileReportStore, JobSnapshot, Phase, Report, ReportStore, ResearchOrchestrator, StartOptions,
};
pub use voice::{SpokenUpdate, VoiceSummarizer};
