//! Configuration system for Quarry.
//!
//! Uses `figment` for layered configuration: defaults -> config file -> environment -> overrides.
//! Configuration is loaded from `~/.config/quarry/config.toml` and/or `.quarry/config.toml`
//! in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level configuration for the research orchestrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuarryConfig {
    pub research: ResearchConfig,
    pub retry: RetryConfig,
    pub search: SearchConfig,
    pub llm: LlmConfig,
    pub voice: VoiceConfig,
    pub storage: StorageConfig,
}

/// Workflow limits for a single research job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchConfig {
    /// Hard ceiling on supervisor iterations (one subtopic per iteration).
    pub max_iterations: usize,
    /// Search results requested per subtopic.
    pub max_results_per_search: usize,
    /// Results requested by the quick ambiguity probe.
    pub probe_results: usize,
    /// How long to wait for a clarification answer before proceeding.
    pub clarification_timeout_secs: u64,
    /// Notes accumulated since the last compression that trigger another one.
    pub compression_threshold: usize,
    /// Approximate token budget for the whole note set.
    pub token_budget: usize,
    /// Characters of page text requested per fetched source.
    pub max_content_chars: usize,
    /// Progress events kept for replay to late observers.
    pub history_capacity: usize,
}

impl Default for ResearchConfig {
    fn default() -> Self {
        Self {
            max_iterations: 4,
            max_results_per_search: 10,
            probe_results: 5,
            clarification_timeout_secs: 120,
            compression_threshold: 4,
            token_budget: 6000,
            max_content_chars: 5000,
            history_capacity: 128,
        }
    }
}

impl ResearchConfig {
    pub fn clarification_timeout(&self) -> Duration {
        Duration::from_secs(self.clarification_timeout_secs)
    }
}

/// Retry policy shared by every capability call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per call, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff_ms: u64,
    /// Upper bound on any single delay.
    pub max_backoff_ms: u64,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
    /// Content fetches in flight per subtopic.
    pub fetch_concurrency: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            backoff_multiplier: 2.0,
            jitter: true,
            fetch_concurrency: 3,
        }
    }
}

/// Web search provider settings (Exa-compatible HTTP API).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub base_url: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    /// Explicit API key; takes precedence over `api_key_env`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.exa.ai".to_string(),
            api_key_env: "EXA_API_KEY".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// Language-model provider settings (OpenAI-compatible chat completions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub base_url: String,
    /// Model identifier (e.g., "gpt-4o-mini").
    pub model: String,
    /// Environment variable name containing the API key.
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub temperature: f32,
    /// Maximum tokens to generate in a response.
    pub max_tokens: usize,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            api_key: None,
            temperature: 0.3,
            max_tokens: 4096,
            timeout_secs: 120,
        }
    }
}

/// Spoken progress updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceConfig {
    pub enabled: bool,
    /// Minimum gap between two spoken updates.
    pub min_interval_secs: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_interval_secs: 8,
        }
    }
}

/// Where finished reports are written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub reports_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let reports_dir = directories::ProjectDirs::from("dev", "quarry", "quarry")
            .map(|d| d.data_dir().join("reports"))
            .unwrap_or_else(|| PathBuf::from("reports"));
        Self { reports_dir }
    }
}

impl QuarryConfig {
    /// Validate this config and return any warnings.
    ///
    /// Returns an empty Vec if the config is sensible. Hard errors are only
    /// raised for values that would make the workflow unable to run.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        let research = &self.research;
        if research.max_iterations == 0 {
            return Err(ConfigError::Invalid {
                message: "research.max_iterations must be at least 1".to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                message: "retry.max_attempts must be at least 1".to_string(),
            });
        }
        if self.retry.fetch_concurrency == 0 {
            return Err(ConfigError::Invalid {
                message: "retry.fetch_concurrency must be at least 1".to_string(),
            });
        }

        let mut warnings = Vec::new();
        if !(2..=8).contains(&research.compression_threshold) {
            warnings.push(format!(
                "research.compression_threshold ({}) is outside 2..=8; compression will run {}",
                research.compression_threshold,
                if research.compression_threshold < 2 {
                    "after every note"
                } else {
                    "rarely"
                }
            ));
        }
        if research.history_capacity < 50 {
            warnings.push(format!(
                "research.history_capacity ({}) is below 50; late observers may miss phases",
                research.history_capacity
            ));
        }
        if research.token_budget < 500 {
            warnings.push(format!(
                "research.token_budget ({}) is very small; notes will be heavily truncated",
                research.token_budget
            ));
        }
        if self.llm.temperature < 0.0 || self.llm.temperature > 2.0 {
            warnings.push(format!(
                "llm.temperature ({}) is outside the typical range 0.0-2.0",
                self.llm.temperature
            ));
        }
        Ok(warnings)
    }
}

/// Resolve an API key from an explicit value or an environment variable.
pub fn resolve_api_key(explicit: Option<&str>, env_var: &str) -> Result<String, ConfigError> {
    if let Some(key) = explicit.filter(|k| !k.is_empty()) {
        return Ok(key.to_string());
    }
    std::env::var(env_var).map_err(|_| ConfigError::EnvVarMissing {
        var: env_var.to_string(),
    })
}

fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "quarry", "quarry")
        .map(|d| d.config_dir().join("config.toml"))
}

/// Load configuration with layered sources.
///
/// Priority (highest to lowest):
/// 1. Explicit overrides (passed as argument)
/// 2. Environment variables (prefixed with `QUARRY_`)
/// 3. Workspace-local config (`.quarry/config.toml`)
/// 4. User config (`~/.config/quarry/config.toml`)
/// 5. Built-in defaults
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&QuarryConfig>,
) -> Result<QuarryConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(QuarryConfig::default()));

    if let Some(user_config) = user_config_path()
        && user_config.exists()
    {
        figment = figment.merge(Toml::file(&user_config));
    }

    figment = merge_workspace_and_env(figment, workspace);

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(|e| ConfigError::Parse(Box::new(e)))
}

fn merge_workspace_and_env(mut figment: Figment, workspace: Option<&Path>) -> Figment {
    if let Some(ws) = workspace {
        let ws_config = ws.join(".quarry").join("config.toml");
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // QUARRY_RESEARCH__MAX_ITERATIONS, QUARRY_LLM__MODEL, etc.
    figment.merge(Env::prefixed("QUARRY_").split("__"))
}
