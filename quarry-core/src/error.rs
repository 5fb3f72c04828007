//! Error types for the Quarry research core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering capability providers, the job lifecycle, compression, report
//! storage, and configuration.

use std::path::PathBuf;

use crate::research::Phase;

/// Top-level error type for the Quarry core library.
#[derive(Debug, thiserror::Error)]
pub enum QuarryError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from search and language-model capability calls.
///
/// Variants split into two classes: transient failures that the retrying
/// fetcher retries with backoff, and fatal failures that end the attempt
/// sequence immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Rate limited by {provider}, retry after {retry_after_secs}s")]
    RateLimited {
        provider: String,
        retry_after_secs: u64,
    },

    #[error("Request to {provider} timed out after {timeout_secs}s")]
    Timeout { provider: String, timeout_secs: u64 },

    #[error("Connection to {provider} failed: {message}")]
    Connection { provider: String, message: String },

    #[error("{provider} server error ({status}): {message}")]
    Server {
        provider: String,
        status: u16,
        message: String,
    },

    #[error("Authentication failed for {provider}")]
    AuthFailed { provider: String },

    #[error("Invalid request to {provider}: {message}")]
    InvalidRequest { provider: String, message: String },

    #[error("Could not parse {provider} response: {message}")]
    ResponseParse { provider: String, message: String },

    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited { .. }
                | ProviderError::Timeout { .. }
                | ProviderError::Connection { .. }
                | ProviderError::Server { .. }
        )
    }

    /// Short, single-line cause suitable for a terminal progress event.
    pub fn short_cause(&self) -> String {
        truncate_cause(&self.to_string())
    }
}

/// Errors from the job lifecycle and its state machine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("A research job is already active")]
    AlreadyActive,

    #[error("No research job is active")]
    NoActiveJob,

    #[error("The active job is not waiting for clarification")]
    NotClarifying,

    #[error("Invalid phase transition: {from} -> {to}")]
    InvalidTransition { from: Phase, to: Phase },

    #[error("Research query is empty")]
    EmptyQuery,
}

/// Errors from the note compression engine.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("Summarizing notes failed: {0}")]
    Summarize(#[source] ProviderError),

    #[error("Compressed notes reference unknown citation {id}")]
    DanglingCitation { id: u32 },
}

/// Errors from the report storage collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to write report to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the configuration system.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Environment variable not set: {var}")]
    EnvVarMissing { var: String },

    #[error("Configuration parse error: {0}")]
    Parse(#[from] Box<figment::Error>),
}

/// A type alias for results using the top-level `QuarryError`.
pub type Result<T> = std::result::Result<T, QuarryError>;

const MAX_CAUSE_CHARS: usize = 200;

fn truncate_cause(message: &str) -> String {
    let line = message.lines().next().unwrap_or_default();
    if line.chars().count() <= MAX_CAUSE_CHARS {
        return line.to_string();
    }
    let mut out: String = line.chars().take(MAX_CAUSE_CHARS - 3).collect();
    out.push_str("...");
    out
}

impl QuarryError {
    /// Short, single-line cause suitable for a terminal progress event.
    pub fn short_cause(&self) -> String {
        truncate_cause(&self.to_string())
    }
}
