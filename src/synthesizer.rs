//! Response Synthesizer: one model call turning retrieved context into a
//! cited answer.
//!
//! The prompt numbers every source and instructs bracket citations. After
//! generation the answer is scanned for `[n]` markers and only the sources
//! actually cited are returned. Generation failure yields an apologetic
//! response instead of an error.

use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Instant;
use tracing::warn;

use crate::analyzer::render_history;
use crate::llm::{GenerationParams, LlmProvider};
use crate::models::{HistoryTurn, Source};

/// Everything one synthesis call needs. Optional fields default to absent.
pub struct SynthesisRequest<'a> {
    pub query: &'a str,
    pub query_id: &'a str,
    pub context: &'a str,
    pub sources: &'a [Source],
    pub execution_result: Option<&'a Value>,
    pub conversation_context: Option<&'a [HistoryTurn]>,
    pub system_prompt: Option<&'a str>,
    pub parameters: Option<&'a GenerationParams>,
}

impl<'a> SynthesisRequest<'a> {
    pub fn new(query: &'a str, query_id: &'a str, context: &'a str, sources: &'a [Source]) -> Self {
        Self {
            query,
            query_id,
            context,
            sources,
            execution_result: None,
            conversation_context: None,
            system_prompt: None,
            parameters: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SynthesisResult {
    pub response: String,
    /// Sources the answer actually cited, in first-citation order.
    pub sources: Vec<Source>,
    pub execution_time_ms: u64,
}

pub struct ResponseSynthesizer {
    llm: Arc<dyn LlmProvider>,
}

impl ResponseSynthesizer {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    pub async fn synthesize(&self, request: &SynthesisRequest<'_>) -> SynthesisResult {
        let started = Instant::now();
        let prompt = build_prompt(request);

        let response = match self
            .llm
            .generate(&prompt, request.system_prompt, request.parameters)
            .await
        {
            Ok(text) => text,
            Err(e) => {
                warn!(query_id = %request.query_id, error = %e, "synthesis model call failed");
                return SynthesisResult {
                    response:
                        "I'm sorry, I was unable to generate an answer for this query right now."
                            .to_string(),
                    sources: Vec::new(),
                    execution_time_ms: started.elapsed().as_millis() as u64,
                };
            }
        };

        let sources = cited_sources(&response, request.sources);

        SynthesisResult {
            response,
            sources,
            execution_time_ms: started.elapsed().as_millis() as u64,
        }
    }
}

fn build_prompt(request: &SynthesisRequest<'_>) -> String {
    let mut prompt = String::new();

    if let Some(history) = request.conversation_context {
        prompt.push_str(&render_history(history));
    }

    if !request.context.is_empty() {
        prompt.push_str("Retrieved context:\n");
        prompt.push_str(request.context);
        prompt.push_str("\n\n");
    }

    if let Some(execution) = request.execution_result {
        prompt.push_str("Tool results:\n");
        prompt.push_str(&execution.to_string());
        prompt.push_str("\n\n");
    }

    if !request.sources.is_empty() {
        prompt.push_str("Sources:\n");
        for (i, source) in request.sources.iter().enumerate() {
            let title = source.title.as_deref().unwrap_or(&source.id);
            match &source.snippet {
                Some(snippet) => {
                    prompt.push_str(&format!("[{}] {}: {}\n", i + 1, title, snippet))
                }
                None => prompt.push_str(&format!("[{}] {}\n", i + 1, title)),
            }
        }
        prompt.push('\n');
    }

    prompt.push_str(&format!(
        "Question: {}\n\n\
         Answer the question using only the context and tool results above. \
         Cite sources with bracketed numbers like [1]. If the context does \
         not contain the answer, say so.",
        request.query
    ));
    prompt
}

fn citation_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[(\d+)\]").unwrap())
}

/// Map `[n]` markers in the answer back to 1-indexed sources, deduplicated
/// in first-citation order. Out-of-range markers are ignored.
pub(crate) fn cited_sources(response: &str, sources: &[Source]) -> Vec<Source> {
    let mut seen = Vec::new();
    for caps in citation_re().captures_iter(response) {
        let Ok(n) = caps[1].parse::<usize>() else {
            continue;
        };
        if n == 0 || n > sources.len() {
            continue;
        }
        if !seen.contains(&n) {
            seen.push(n);
        }
    }
    seen.into_iter().map(|n| sources[n - 1].clone()).collect()
}
