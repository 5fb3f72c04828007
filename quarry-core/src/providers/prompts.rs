//! Prompt builders for the research model.
//!
//! Each builder returns the system/user pair for one capability. The JSON
//! shapes named here are what [`super::model`] parses.

use super::openai_compat::ChatMessage;
use crate::ports::{Document, ReportRequest, SourceRef, SufficiencyRequest, SynthesisContext};
use crate::research::Note;
use std::fmt::Write;

/// Per-document excerpt length in synthesis prompts.
const EXCERPT_CHARS: usize = 3000;

fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

fn numbered(items: &[String]) -> String {
    if items.is_empty() {
        return "(none)".to_string();
    }
    items
        .iter()
        .enumerate()
        .map(|(i, s)| format!("{}. {s}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn decompose(query: &str, max_subtopics: usize) -> Vec<ChatMessage> {
    let system = format!(
        "You plan web research. Today's date is {}.\n\
         Respond with JSON only: {{\"title\": string, \"scope\": string, \"subtopics\": [string]}}.\n\
         - title: a descriptive title of at most 50 characters\n\
         - scope: one short paragraph on what the research covers and any constraints\n\
         - subtopics: between 1 and {max_subtopics} distinct research angles\n\
         Every subtopic is used directly as a search query: name the main subject in it, \
         add disambiguating terms when the subject is ambiguous, and keep it to 3-10 words.",
        today()
    );
    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!("Research question:\n{query}")),
    ]
}

pub fn ambiguity(query: &str, probe: &[SourceRef]) -> Vec<ChatMessage> {
    let mut hits = String::new();
    for (i, hit) in probe.iter().enumerate() {
        let _ = writeln!(hits, "{}. {} ({})", i + 1, hit.title, hit.url);
    }
    if hits.is_empty() {
        hits.push_str("(no results)\n");
    }
    let system = "You decide whether a research request is specific enough to start. \
                  Ask only when the query or the search results point at clearly different \
                  subjects, or when an acronym or term is unknown.\n\
                  Respond with JSON only: {\"need_clarification\": bool, \"question\": string}. \
                  Leave question empty when no clarification is needed. A question is one \
                  short sentence the user can answer aloud.";
    vec![
        ChatMessage::system(system),
        ChatMessage::user(format!(
            "Query: {query}\n\nTop search results:\n{hits}"
        )),
    ]
}

pub fn sufficiency(request: SufficiencyRequest<'_>) -> Vec<ChatMessage> {
    let mut findings = String::new();
    for note in request.notes {
        let _ = writeln!(findings, "## {}\n{}\n", note.subtopic, note.summary);
    }
    if findings.is_empty() {
        findings.push_str("(no findings yet)\n");
    }
    let system = format!(
        "You supervise iterative web research. Today's date is {}.\n\
         Decide whether the findings answer the research question or an important gap remains. \
         Research is expensive: only ask for a topic that is clearly different from what has \
         already been researched.\n\
         Respond with JSON only, one of:\n\
         {{\"action\": \"research_topic\", \"topic\": string, \"reason\": string}}\n\
         {{\"action\": \"research_complete\", \"reason\": string}}\n\
         A topic is used directly as a search query of 3-10 words naming the main subject.",
        today()
    );
    let user = format!(
        "Research question: {}\nBrief: {}\n\nIteration {} of {}.\n\n\
         Already researched:\n{}\n\nStill planned:\n{}\n\nFindings:\n{}",
        request.query,
        request.brief.scope,
        request.iteration + 1,
        request.max_iterations,
        numbered(request.researched),
        numbered(request.remaining_plan),
        findings
    );
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

pub fn synthesize(
    subtopic: &str,
    documents: &[Document],
    context: SynthesisContext<'_>,
) -> Vec<ChatMessage> {
    let mut sources = String::new();
    for (i, doc) in documents.iter().enumerate() {
        let _ = writeln!(
            sources,
            "[{}] {} ({})\n{}\n",
            i + 1,
            doc.title,
            doc.url,
            excerpt(&doc.text, EXCERPT_CHARS)
        );
    }
    let system = "You write research notes from web sources. Keep every relevant fact, figure, \
                  and date, drop what is off topic, and merge statements that several sources \
                  share. Cite sources inline as [n] using the numbers given. Use markdown \
                  bullets or short paragraphs. Do not add a sources list.";
    let user = format!(
        "Overall question: {}\nBrief: {}\n\nSubtopic: {subtopic}\n\nSources:\n{sources}",
        context.query, context.brief.scope
    );
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

pub fn compress_pair(a: &Note, b: &Note) -> Vec<ChatMessage> {
    let system = "You merge two research notes into one shorter note. Remove repetition and \
                  keep every distinct fact. Keep the inline [n] citation markers exactly as \
                  written, attached to the facts they support. Reply with the merged note only.";
    let user = format!(
        "Note A ({}):\n{}\n\nNote B ({}):\n{}",
        a.subtopic, a.summary, b.subtopic, b.summary
    );
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

pub fn report(request: ReportRequest<'_>) -> Vec<ChatMessage> {
    let mut findings = String::new();
    for note in request.notes {
        let _ = writeln!(findings, "## {}\n{}\n", note.subtopic, note.summary);
    }
    let mut sources = String::new();
    for citation in request.citations {
        let _ = writeln!(sources, "[{}] {}", citation.id, citation.title);
    }
    let system = format!(
        "You write the final research report in markdown. Today's date is {}.\n\
         Start with a single '# ' title line, then organize the body with '##' sections \
         suited to the question. Use simple, clear language without referring to yourself. \
         Support statements with the inline [n] citations already present in the findings \
         and do not invent new numbers. Do not write a sources section; it is added afterwards.",
        today()
    );
    let user = format!(
        "Research question: {}\nBrief: {}\n\nFindings:\n{findings}\nAvailable sources:\n{sources}",
        request.query, request.brief.scope
    );
    vec![ChatMessage::system(system), ChatMessage::user(user)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Brief;

    fn brief() -> Brief {
        Brief {
            title: "Quantum".into(),
            scope: "State of quantum computing".into(),
            subtopics: vec!["Qubits".into()],
        }
    }

    #[test]
    fn test_excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo", 2), "hé...");
        assert_eq!(excerpt("hi", 5), "hi");
    }

    #[test]
    fn test_synthesis_numbers_documents_from_one() {
        let docs = vec![
            Document {
                url: "https://a.com".into(),
                title: "A".into(),
                text: "alpha".into(),
                published_date: None,
            },
            Document {
                url: "https://b.com".into(),
                title: "B".into(),
                text: "beta".into(),
                published_date: None,
            },
        ];
        let b = brief();
        let messages = synthesize("Qubits", &docs, SynthesisContext {
            query: "quantum",
            brief: &b,
        });
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("[1] A (https://a.com)"));
        assert!(messages[1].content.contains("[2] B (https://b.com)"));
    }

    #[test]
    fn test_sufficiency_lists_plan_and_history() {
        let b = brief();
        let researched = vec!["Qubits".to_string()];
        let remaining = vec!["Error correction".to_string()];
        let messages = sufficiency(SufficiencyRequest {
            query: "quantum",
            brief: &b,
            notes: &[],
            remaining_plan: &remaining,
            researched: &researched,
            iteration: 1,
            max_iterations: 4,
        });
        let user = &messages[1].content;
        assert!(user.contains("Iteration 2 of 4"));
        assert!(user.contains("1. Qubits"));
        assert!(user.contains("1. Error correction"));
        assert!(user.contains("(no findings yet)"));
    }
}
