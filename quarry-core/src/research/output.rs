//! Final report shaping and persistence.

use super::sources::CitationRegistry;
use crate::error::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

static CITATION_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(\d+(?:\s*,\s*\d+)*)\]").expect("citation marker pattern is valid")
});

const MAX_FILENAME_TITLE: usize = 50;

/// A completed research report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub request_id: String,
    #[serde(rename = "reportTitle")]
    pub title: String,
    #[serde(rename = "reportContent")]
    pub content: String,
    pub size_bytes: usize,
    pub num_sources: usize,
    /// Where the store put it, once saved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub generated_at: DateTime<Utc>,
}

impl Report {
    pub fn new(
        request_id: impl Into<String>,
        title: impl Into<String>,
        content: impl Into<String>,
        num_sources: usize,
    ) -> Self {
        let content = content.into();
        Self {
            request_id: request_id.into(),
            title: title.into(),
            size_bytes: content.len(),
            content,
            num_sources,
            location: None,
            generated_at: Utc::now(),
        }
    }
}

/// Rewrite inline `[n]` / `[n, m]` markers through `mapping`.
///
/// Only markers whose numbers all fall in `1..=given` are treated as
/// citations; anything else (`[2024]`, `arr[0]`) is left as written. Within
/// that range, numbers with no mapping are dropped and a marker left empty
/// disappears.
pub fn remap_citations(text: &str, mapping: &HashMap<u32, u32>, given: u32) -> String {
    CITATION_MARKER
        .replace_all(text, |caps: &regex::Captures<'_>| {
            let numbers: Vec<u32> = caps[1]
                .split(',')
                .filter_map(|n| n.trim().parse::<u32>().ok())
                .collect();
            if numbers.iter().any(|n| !(1..=given).contains(n)) {
                return caps[0].to_string();
            }
            let mapped: Vec<String> = numbers
                .iter()
                .filter_map(|n| mapping.get(n))
                .map(|n| n.to_string())
                .collect();
            if mapped.is_empty() {
                String::new()
            } else {
                format!("[{}]", mapped.join(", "))
            }
        })
        .into_owned()
}

/// Citation ids referenced inline, in first-appearance order.
pub fn cited_ids(text: &str) -> Vec<u32> {
    let mut ids = Vec::new();
    for caps in CITATION_MARKER.captures_iter(text) {
        for n in caps[1].split(',').filter_map(|n| n.trim().parse::<u32>().ok()) {
            if !ids.contains(&n) {
                ids.push(n);
            }
        }
    }
    ids
}

fn has_sources_section(content: &str) -> bool {
    content.lines().any(|line| {
        let line = line.trim().to_lowercase();
        line == "## sources" || line == "### sources"
    })
}

/// Append a `### Sources` section unless the writer already included one.
pub fn finalize_report(content: &str, registry: &CitationRegistry) -> String {
    let mut body = content.trim_end().to_string();
    if !has_sources_section(&body) && !registry.is_empty() {
        body.push_str("\n\n### Sources\n\n");
        for citation in registry.citations() {
            body.push_str(&format!(
                "[{}] {}: {}\n",
                citation.id, citation.title, citation.url
            ));
        }
    }
    body
}

/// Where finished reports go.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Persist the report, returning a location string.
    async fn save(&self, report: &Report) -> Result<String, StorageError>;
}

/// Writes each report as a markdown file.
pub struct FileReportStore {
    dir: PathBuf,
}

impl FileReportStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(report: &Report) -> String {
        let safe: String = report
            .title
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
            .take(MAX_FILENAME_TITLE)
            .collect();
        let safe = safe.trim().replace(' ', "_");
        let stamp = report.generated_at.format("%Y-%m-%d_%H%M%S");
        if safe.is_empty() {
            format!("{stamp}_report.md")
        } else {
            format!("{stamp}_{safe}.md")
        }
    }

    pub fn render(report: &Report) -> String {
        format!(
            "# {}\n\n*Generated: {}*\n\n---\n\n{}\n",
            report.title,
            report.generated_at.format("%Y-%m-%d %H:%M:%S"),
            report.content.trim_end()
        )
    }
}

#[async_trait]
impl ReportStore for FileReportStore {
    async fn save(&self, report: &Report) -> Result<String, StorageError> {
        let path = self.dir.join(Self::file_name(report));
        atomic_write(&path, Self::render(report).as_bytes())
            .await
            .map_err(|source| StorageError::Write {
                path: path.clone(),
                source,
            })?;
        tracing::info!(path = %path.display(), bytes = report.size_bytes, "Report saved");
        Ok(path.display().to_string())
    }
}

/// Write to a `.tmp` sibling and rename over the target.
async fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, data).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> CitationRegistry {
        let mut registry = CitationRegistry::new();
        registry.register("https://a.com", "Alpha", "a");
        registry.register("https://b.com", "Beta", "b");
        registry
    }

    #[test]
    fn test_remap_local_to_global() {
        let mapping = HashMap::from([(1, 4), (2, 7)]);
        let text = "Qubits decohere [1]. Error rates fell [2][1]. Both agree [1, 2].";
        assert_eq!(
            remap_citations(text, &mapping, 2),
            "Qubits decohere [4]. Error rates fell [7][4]. Both agree [4, 7]."
        );
    }

    #[test]
    fn test_remap_drops_unmapped_markers_in_range() {
        let mapping = HashMap::from([(1, 3)]);
        assert_eq!(
            remap_citations("Claim [2]. Other [1, 2].", &mapping, 2),
            "Claim . Other [3]."
        );
    }

    #[test]
    fn test_remap_keeps_brackets_outside_range() {
        let mapping = HashMap::from([(1, 3), (2, 5)]);
        assert_eq!(
            remap_citations("Since [2024], arr[0] and [1, 9] stay; [2] moves.", &mapping, 2),
            "Since [2024], arr[0] and [1, 9] stay; [5] moves."
        );
    }

    #[test]
    fn test_remap_leaves_links_alone() {
        let mapping = HashMap::from([(1, 2)]);
        assert_eq!(
            remap_citations("See [the docs](https://x.io) [1].", &mapping, 1),
            "See [the docs](https://x.io) [2]."
        );
    }

    #[test]
    fn test_cited_ids_first_appearance() {
        assert_eq!(cited_ids("x [3] y [1, 3] z [2]"), vec![3, 1, 2]);
    }

    #[test]
    fn test_finalize_appends_sources() {
        let report = finalize_report("## Summary\n\nFindings [1] and [2].", &registry());
        assert!(report.ends_with(
            "### Sources\n\n[1] Alpha: https://a.com\n[2] Beta: https://b.com\n"
        ));
    }

    #[test]
    fn test_finalize_keeps_existing_sources() {
        let content = "Findings [1].\n\n## Sources\n\n1. Alpha";
        let report = finalize_report(content, &registry());
        assert_eq!(report.matches("Sources").count(), 1);
    }

    #[test]
    fn test_report_serializes_wire_names() {
        let report = Report::new("research_1", "Quantum", "body", 2);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["reportTitle"], "Quantum");
        assert_eq!(json["reportContent"], "body");
        assert_eq!(json["sizeBytes"], 4);
        assert_eq!(json["numSources"], 2);
    }

    #[test]
    fn test_file_name_is_safe() {
        let report = Report::new("r", "Quantum: computing / today?", "x", 0);
        let name = FileReportStore::file_name(&report);
        assert!(name.ends_with("_Quantum_computing__today.md"), "{name}");
        assert!(!name.contains('/'));
    }

    #[tokio::test]
    async fn test_file_store_writes_markdown() {
        let dir = TempDir::new().unwrap();
        let store = FileReportStore::new(dir.path().join("reports"));
        let report = Report::new("research_1", "Quantum Computing", "Body [1].", 1);

        let location = store.save(&report).await.unwrap();
        let written = std::fs::read_to_string(&location).unwrap();
        assert!(written.starts_with("# Quantum Computing\n\n*Generated: "));
        assert!(written.contains("---\n\nBody [1]."));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("reports"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
