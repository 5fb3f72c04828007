//! [`ResearchModel`] on top of a chat completion model.

use super::openai_compat::ChatModel;
use super::prompts;
use crate::error::ProviderError;
use crate::ports::{
    Ambiguity, Brief, DraftReport, Document, ReportRequest, ResearchModel, SourceRef, Sufficiency,
    SufficiencyRequest, SynthesisContext,
};
use crate::research::Note;
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};

/// Fallback question when the model flags ambiguity without asking anything.
const DEFAULT_QUESTION: &str = "Could you tell me a bit more about what you'd like researched?";

pub struct LlmResearchModel {
    chat: Arc<dyn ChatModel>,
}

#[derive(Debug, Deserialize)]
struct BriefReply {
    #[serde(default)]
    title: String,
    #[serde(default, alias = "brief")]
    scope: String,
    #[serde(default)]
    subtopics: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct AmbiguityReply {
    need_clarification: bool,
    #[serde(default)]
    question: String,
}

#[derive(Debug, Deserialize)]
struct SufficiencyReply {
    action: String,
    #[serde(default)]
    topic: Option<String>,
    #[serde(default)]
    reason: String,
}

impl LlmResearchModel {
    pub fn new(chat: Arc<dyn ChatModel>) -> Self {
        Self { chat }
    }

    fn parse_error(&self, message: impl Into<String>) -> ProviderError {
        ProviderError::ResponseParse {
            provider: self.chat.model_name().to_string(),
            message: message.into(),
        }
    }

    async fn complete_json<T: DeserializeOwned>(
        &self,
        what: &str,
        messages: &[super::ChatMessage],
    ) -> Result<T, ProviderError> {
        let reply = self.chat.complete(messages).await?;
        extract_json(&reply).ok_or_else(|| {
            debug!(what, reply = %reply, "Unparseable model reply");
            self.parse_error(format!("Expected JSON for {what}"))
        })
    }
}

/// Parse JSON out of a model reply: the whole reply, a fenced block, or the
/// outermost braces.
pub(crate) fn extract_json<T: DeserializeOwned>(reply: &str) -> Option<T> {
    let trimmed = reply.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    if let Some(start) = trimmed.find("```") {
        let fenced = &trimmed[start + 3..];
        let body = fenced.strip_prefix("json").unwrap_or(fenced);
        if let Some(end) = body.find("```")
            && let Ok(value) = serde_json::from_str(body[..end].trim())
        {
            return Some(value);
        }
    }
    // '{' and '}' are ASCII, so the byte offsets are char boundaries.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

/// Split a leading `# ` heading off the report body.
fn split_title(content: &str) -> (String, String) {
    let trimmed = content.trim_start();
    match trimmed.strip_prefix("# ") {
        Some(rest) => {
            let (title, body) = rest.split_once('\n').unwrap_or((rest, ""));
            (title.trim().to_string(), body.trim_start().to_string())
        }
        None => (String::new(), content.trim().to_string()),
    }
}

#[async_trait]
impl ResearchModel for LlmResearchModel {
    async fn decompose(&self, query: &str, max_subtopics: usize) -> Result<Brief, ProviderError> {
        let raw = self
            .chat
            .complete(&prompts::decompose(query, max_subtopics))
            .await?;
        let Some(reply) = extract_json::<BriefReply>(&raw) else {
            warn!("Plan reply was not JSON; using it as the scope");
            let scope = match raw.trim() {
                "" => query.to_string(),
                text => text.to_string(),
            };
            return Ok(Brief {
                title: String::new(),
                scope,
                subtopics: Vec::new(),
            });
        };
        Ok(Brief {
            title: reply.title,
            scope: if reply.scope.trim().is_empty() {
                query.to_string()
            } else {
                reply.scope
            },
            subtopics: reply.subtopics,
        })
    }

    async fn judge_ambiguity(
        &self,
        query: &str,
        probe: &[SourceRef],
    ) -> Result<Ambiguity, ProviderError> {
        let reply: AmbiguityReply = self
            .complete_json("ambiguity", &prompts::ambiguity(query, probe))
            .await?;
        if !reply.need_clarification {
            return Ok(Ambiguity::Clear);
        }
        let question = match reply.question.trim() {
            "" => DEFAULT_QUESTION.to_string(),
            q => q.to_string(),
        };
        Ok(Ambiguity::Ambiguous { question })
    }

    async fn judge_sufficiency(
        &self,
        request: SufficiencyRequest<'_>,
    ) -> Result<Sufficiency, ProviderError> {
        let raw = self.chat.complete(&prompts::sufficiency(request)).await?;
        let Some(reply) = extract_json::<SufficiencyReply>(&raw) else {
            warn!("Supervisor reply was not JSON; researching the brief");
            let topic = match request.brief.title.trim() {
                "" => request.query.to_string(),
                title => title.to_string(),
            };
            return Ok(Sufficiency::Continue {
                proposed: Some(topic),
                reason: "Unreadable supervisor reply".to_string(),
            });
        };
        match reply.action.as_str() {
            "research_complete" => Ok(Sufficiency::Stop {
                reason: reply.reason,
            }),
            "research_topic" => Ok(Sufficiency::Continue {
                proposed: reply.topic.filter(|t| !t.trim().is_empty()),
                reason: reply.reason,
            }),
            other => {
                warn!(action = other, "Unknown supervisor action; continuing");
                Ok(Sufficiency::Continue {
                    proposed: None,
                    reason: reply.reason,
                })
            }
        }
    }

    async fn synthesize(
        &self,
        subtopic: &str,
        documents: &[Document],
        context: SynthesisContext<'_>,
    ) -> Result<String, ProviderError> {
        let reply = self
            .chat
            .complete(&prompts::synthesize(subtopic, documents, context))
            .await?;
        Ok(reply.trim().to_string())
    }

    async fn compress_pair(&self, a: &Note, b: &Note) -> Result<String, ProviderError> {
        let reply = self.chat.complete(&prompts::compress_pair(a, b)).await?;
        Ok(reply.trim().to_string())
    }

    async fn generate_report(
        &self,
        request: ReportRequest<'_>,
    ) -> Result<DraftReport, ProviderError> {
        let reply = self.chat.complete(&prompts::report(request)).await?;
        let (title, content) = split_title(&reply);
        Ok(DraftReport { title, content })
    }

    fn name(&self) -> &str {
        self.chat.model_name()
    }
}
