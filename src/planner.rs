//! Query Planner: turns a [`QueryAnalysis`] into an ordered step sequence.
//!
//! Planning is purely forward: the planner never re-invokes the analyzer
//! mid-plan. Simple queries get exactly one retrieval step; everything else
//! gets one step per required tool, one retrieval step per sub-query, and a
//! terminal synthesize step that considers conversation history.

use regex::Regex;
use serde_json::json;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::analyzer::QueryAnalyzer;
use crate::models::{Complexity, HistoryTurn, Plan, PlanStep, QueryAnalysis, StepResult};
use crate::tool::ToolRegistry;

/// Tool name used for document retrieval steps.
pub const RETRIEVAL_TOOL: &str = "retrieval";
/// Tool name used for arithmetic steps.
pub const CALCULATOR_TOOL: &str = "calculator";
/// Tool name used for structured-data steps.
pub const STRUCTURED_QUERY_TOOL: &str = "structured_query";

/// `top_k` for the single retrieval step of a simple query.
const SIMPLE_TOP_K: u64 = 5;
/// `top_k` for per-sub-query retrieval steps.
const SUB_QUERY_TOP_K: u64 = 3;

pub struct QueryPlanner {
    analyzer: QueryAnalyzer,
    registry: Arc<ToolRegistry>,
}

impl QueryPlanner {
    pub fn new(analyzer: QueryAnalyzer, registry: Arc<ToolRegistry>) -> Self {
        Self { analyzer, registry }
    }

    /// Analyze the query and build its plan.
    pub async fn create_plan(
        &self,
        query_id: &str,
        query: &str,
        history: &[HistoryTurn],
    ) -> Plan {
        let analysis = self.analyzer.analyze(query, history).await;
        debug!(
            query_id,
            complexity = analysis.complexity.as_str(),
            tools = ?analysis.requires_tools,
            sub_queries = analysis.sub_queries.len(),
            "query analyzed"
        );
        self.plan_from_analysis(query_id, query, &analysis, history)
    }

    /// Build a plan from an existing analysis.
    ///
    /// Unregistered tool names are flagged but kept: the executor records
    /// their failure as a step error instead of the step silently vanishing
    /// from the plan.
    pub fn plan_from_analysis(
        &self,
        query_id: &str,
        query: &str,
        analysis: &QueryAnalysis,
        history: &[HistoryTurn],
    ) -> Plan {
        let mut steps = Vec::new();

        if analysis.complexity == Complexity::Simple {
            steps.push(PlanStep::Tool {
                tool: RETRIEVAL_TOOL.to_string(),
                input: json!({ "query": query, "top_k": SIMPLE_TOP_K }),
                description: "retrieve documents for the query".to_string(),
            });
            return Plan::new(query_id, query, steps, history.to_vec());
        }

        for tool_name in &analysis.requires_tools {
            if !self.registry.contains(tool_name) {
                warn!(tool = %tool_name, "analysis names an unregistered tool");
            }
            steps.push(PlanStep::Tool {
                tool: tool_name.clone(),
                input: tool_input_heuristic(tool_name, query),
                description: format!("run {} for the query", tool_name),
            });
        }

        for sub_query in &analysis.sub_queries {
            steps.push(PlanStep::Tool {
                tool: RETRIEVAL_TOOL.to_string(),
                input: json!({ "query": sub_query, "top_k": SUB_QUERY_TOP_K }),
                description: format!("retrieve documents for sub-query: {}", sub_query),
            });
        }

        steps.push(PlanStep::Synthesize {
            description: "synthesize the final answer from all step results".to_string(),
            use_history: true,
        });

        Plan::new(query_id, query, steps, history.to_vec())
    }

    /// Record a step result on the plan.
    ///
    /// A failed tool step is logged but triggers no corrective action;
    /// inserting an alternative step here is a deliberate extension point.
    pub fn update_plan(&self, plan: &mut Plan, result: StepResult) {
        if let Some(error) = result.outcome.error() {
            warn!(
                query_id = %plan.query_id,
                step = %result.step,
                error,
                "plan step failed, continuing"
            );
        }
        plan.record_step_result(result);
    }
}

fn calculate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)calculate\s+(.+)").unwrap())
}

/// Per-tool input construction from the raw query text.
fn tool_input_heuristic(tool_name: &str, query: &str) -> serde_json::Value {
    match tool_name {
        CALCULATOR_TOOL => {
            // Prefer the text after "calculate ..."; fall back to the whole query.
            let expression = calculate_re()
                .captures(query)
                .map(|caps| caps[1].trim().trim_end_matches(['?', '.']).to_string())
                .unwrap_or_else(|| query.to_string());
            json!({ "expression": expression })
        }
        STRUCTURED_QUERY_TOOL => json!({ "query": query }),
        RETRIEVAL_TOOL => json!({ "query": query, "top_k": SIMPLE_TOP_K }),
        _ => json!({ "query": query }),
    }
}
