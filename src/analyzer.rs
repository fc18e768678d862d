//! Query Analyzer: classifies a query's complexity and tool needs.
//!
//! Builds a structured prompt describing the registered tool capabilities
//! and recent conversation history, requests a fixed JSON shape, and parses
//! it through the layered extractor. Never raises on malformed model
//! output: parsing degrades from structured parse → targeted pattern
//! extraction → the [`QueryAnalysis::fallback`] sentinel.

use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::extract::{self, extract_json_object};
use crate::llm::LlmProvider;
use crate::models::{Complexity, HistoryTurn, QueryAnalysis, Role};
use crate::tool::ToolRegistry;

/// Turns of history rendered into analyzer and synthesis prompts.
pub(crate) const HISTORY_WINDOW: usize = 5;

pub struct QueryAnalyzer {
    llm: Arc<dyn LlmProvider>,
    registry: Arc<ToolRegistry>,
}

impl QueryAnalyzer {
    pub fn new(llm: Arc<dyn LlmProvider>, registry: Arc<ToolRegistry>) -> Self {
        Self { llm, registry }
    }

    /// Classify a query. Infallible by design: every failure path lands on
    /// a named default rather than an error.
    pub async fn analyze(&self, query: &str, history: &[HistoryTurn]) -> QueryAnalysis {
        let prompt = self.build_prompt(query, history);

        let text = match self.llm.generate(&prompt, None, None).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "analyzer model call failed");
                return QueryAnalysis::fallback(&format!("model call failed: {e}"));
            }
        };

        if let Some(analysis) = self.parse_structured(&text) {
            return analysis;
        }
        debug!("analyzer output not valid JSON, trying pattern extraction");
        self.parse_patterns(&text)
    }

    fn build_prompt(&self, query: &str, history: &[HistoryTurn]) -> String {
        let tool_listing: String = self
            .registry
            .list_tools()
            .iter()
            .map(|t| format!("- {}: {}\n", t.name(), t.description()))
            .collect();

        let history_section = render_history(history);

        format!(
            "Analyze the user query and decide how it should be answered.\n\n\
             Available tools:\n{tool_listing}\n{history_section}\
             Query: {query}\n\n\
             Respond with a JSON object:\n\
             {{\"complexity\": \"simple|moderate|complex\", \
             \"requires_tools\": [<tool names>], \
             \"sub_queries\": [<search queries for sub-topics>], \
             \"reasoning\": \"...\"}}\n\
             Use \"simple\" for queries a single document lookup can answer."
        )
    }

    /// Layer 1: structured parse of the expected JSON shape.
    fn parse_structured(&self, text: &str) -> Option<QueryAnalysis> {
        let obj = extract_json_object(text)?;
        let complexity = obj
            .get("complexity")
            .and_then(|v| v.as_str())
            .and_then(Complexity::parse)?;

        // Only keep tool names the registry actually knows.
        let requires_tools: Vec<String> = extract::field_string_list(&obj, "requires_tools")
            .into_iter()
            .filter(|name| {
                let known = self.registry.contains(name);
                if !known {
                    debug!(tool = %name, "analyzer requested unknown tool, dropping");
                }
                known
            })
            .collect();

        Some(QueryAnalysis {
            complexity,
            requires_tools,
            sub_queries: extract::field_string_list(&obj, "sub_queries"),
            reasoning: extract::field_string(&obj, "reasoning", ""),
        })
    }

    /// Layer 2: targeted pattern extraction for the complexity field and
    /// tool names mentioned in free text. Layer 3 is the fallback sentinel.
    fn parse_patterns(&self, text: &str) -> QueryAnalysis {
        let Some(complexity) = complexity_re()
            .captures(text)
            .and_then(|caps| Complexity::parse(&caps[1]))
        else {
            return QueryAnalysis::fallback("no complexity found in model output");
        };

        let lowered = text.to_lowercase();
        let requires_tools: Vec<String> = self
            .registry
            .list_tools()
            .iter()
            .map(|t| t.name().to_string())
            .filter(|name| lowered.contains(name.as_str()))
            .collect();

        QueryAnalysis {
            complexity,
            requires_tools,
            sub_queries: Vec::new(),
            reasoning: "recovered from unstructured model output".to_string(),
        }
    }
}

fn complexity_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(simple|moderate|complex)\b").unwrap())
}

/// Render the most recent turns as a prompt section, oldest first.
pub(crate) fn render_history(history: &[HistoryTurn]) -> String {
    if history.is_empty() {
        return String::new();
    }
    let start = history.len().saturating_sub(HISTORY_WINDOW);
    let mut section = String::from("Conversation so far:\n");
    for turn in &history[start..] {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        section.push_str(&format!("{}: {}\n", role, turn.content));
    }
    section.push('\n');
    section
}
