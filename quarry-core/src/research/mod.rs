//! The research pipeline.
//!
//! A job moves through a fixed state graph:
//! `idle -> clarifying? -> briefing -> researching <-> compressing -> reporting -> done`,
//! with `canceled` and `error` reachable from any non-terminal phase.
//!
//! - [`engine`] drives one job through the graph
//! - [`supervisor`] picks the next subtopic or stops the loop
//! - [`compression`] keeps notes under the token budget
//! - [`sources`] numbers citations
//! - [`output`] shapes and stores the final report

pub mod compression;
pub mod engine;
pub mod output;
pub mod session;
pub mod sources;
pub mod supervisor;

pub use compression::{CompressionEngine, CompressionOutcome};
pub use engine::ResearchOrchestrator;
pub use output::{FileReportStore, Report, ReportStore};
pub use session::{Clarification, Job, JobSnapshot, Note, Phase, StartOptions};
pub use sources::{Citation, CitationRegistry};
pub use supervisor::{Decision, StopReason, Supervisor};
