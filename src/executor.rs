//! Plan Executor: runs a [`Plan`] step by step against the tool registry.
//!
//! A state machine with partial-failure semantics: a missing tool or a tool
//! that errors produces an error payload on that step's result and the plan
//! continues. Termination is guaranteed because `record_step_result`
//! strictly increments the cursor each iteration and steps are finite.
//!
//! Steps execute strictly sequentially; the terminal synthesize step
//! depends on all earlier results, so there is no intra-plan parallelism.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::analyzer::render_history;
use crate::llm::LlmProvider;
use crate::models::{Plan, PlanStep, Source, StepOutcome, StepResult};
use crate::planner::{QueryPlanner, CALCULATOR_TOOL, RETRIEVAL_TOOL, STRUCTURED_QUERY_TOOL};
use crate::process_log::ProcessLog;
use crate::tool::ToolRegistry;

/// Everything produced by one plan execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub query_id: String,
    pub response: String,
    pub steps: Vec<StepResult>,
    pub sources: Vec<Source>,
    pub execution_time_ms: u64,
}

pub struct PlanExecutor {
    planner: Arc<QueryPlanner>,
    registry: Arc<ToolRegistry>,
    llm: Option<Arc<dyn LlmProvider>>,
    log: Option<Arc<ProcessLog>>,
}

impl PlanExecutor {
    pub fn new(
        planner: Arc<QueryPlanner>,
        registry: Arc<ToolRegistry>,
        llm: Option<Arc<dyn LlmProvider>>,
        log: Option<Arc<ProcessLog>>,
    ) -> Self {
        Self {
            planner,
            registry,
            llm,
            log,
        }
    }

    /// Run the plan to completion, tolerating per-step failure.
    pub async fn execute_plan(&self, plan: &mut Plan) -> Result<ExecutionResult> {
        let started = Instant::now();
        let mut response: Option<String> = None;

        while let Some(step) = plan.next_step().cloned() {
            self.log_step(
                &plan.query_id,
                "step_start",
                serde_json::json!({
                    "step": step.name(),
                    "index": plan.current_step,
                    "description": step.description(),
                }),
            );

            let step_started = Instant::now();
            let result = match &step {
                PlanStep::Tool { tool, input, .. } => {
                    let outcome = self.execute_tool(tool, input).await;
                    StepResult {
                        step: tool.clone(),
                        outcome,
                        duration_ms: step_started.elapsed().as_millis() as u64,
                    }
                }
                PlanStep::Synthesize { use_history, .. } => {
                    let text = self
                        .synthesize(&plan.query_text, &plan.results, *use_history, &plan.history)
                        .await;
                    response = Some(text.clone());
                    StepResult {
                        step: "synthesize".to_string(),
                        outcome: StepOutcome::Success {
                            output: serde_json::json!({ "response": text }),
                        },
                        duration_ms: step_started.elapsed().as_millis() as u64,
                    }
                }
            };

            self.log_step(
                &plan.query_id,
                "step_complete",
                serde_json::json!({
                    "step": result.step,
                    "duration_ms": result.duration_ms,
                    "error": result.outcome.error(),
                }),
            );

            self.planner.update_plan(plan, result);
        }

        // Plans without a synthesize step (the simple-query path) still
        // produce a best-effort response from their results.
        let response = match response {
            Some(text) => text,
            None => assemble_response(&plan.results),
        };

        Ok(ExecutionResult {
            query_id: plan.query_id.clone(),
            response,
            sources: collect_sources(&plan.results),
            steps: plan.results.clone(),
            execution_time_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Failure boundary around a tool call: absence and internal errors both
    /// become error outcomes, never `Err`.
    async fn execute_tool(&self, name: &str, input: &Value) -> StepOutcome {
        let Some(tool) = self.registry.get(name) else {
            return StepOutcome::Error {
                error: format!("tool not found: {}", name),
            };
        };
        match tool.execute(input).await {
            Ok(output) => StepOutcome::Success { output },
            Err(e) => {
                debug!(tool = name, error = %e, "tool execution failed");
                StepOutcome::Error {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn synthesize(
        &self,
        query: &str,
        results: &[StepResult],
        use_history: bool,
        history: &[crate::models::HistoryTurn],
    ) -> String {
        let Some(llm) = &self.llm else {
            return assemble_response(results);
        };

        let history_section = if use_history {
            render_history(history)
        } else {
            String::new()
        };
        let results_section: String = results
            .iter()
            .map(|r| format!("{}\n", format_step_result(r)))
            .collect();

        let prompt = format!(
            "Answer the user's question using the step results below. Be direct and factual; \
             do not invent information the results don't support.\n\n\
             {history_section}Step results:\n{results_section}\nQuestion: {query}"
        );

        match llm.generate(&prompt, None, None).await {
            Ok(text) => text.trim().to_string(),
            Err(e) => {
                debug!(error = %e, "synthesis generation failed, assembling deterministically");
                assemble_response(results)
            }
        }
    }

    fn log_step(&self, query_id: &str, step_name: &str, data: Value) {
        if let Some(log) = &self.log {
            log.log_step(query_id, step_name, data);
        }
    }
}

/// Per-tool formatting rule used when serializing step results into the
/// synthesis prompt.
fn format_step_result(result: &StepResult) -> String {
    if let Some(error) = result.outcome.error() {
        return format!("[{}] failed: {}", result.step, error);
    }
    let output = result.outcome.output().cloned().unwrap_or(Value::Null);

    match result.step.as_str() {
        RETRIEVAL_TOOL => {
            let mut section = format!("[{}] retrieved excerpts:", result.step);
            if let Some(chunks) = output.get("chunks").and_then(|v| v.as_array()) {
                for chunk in chunks.iter().take(3) {
                    let content = chunk.get("content").and_then(|v| v.as_str()).unwrap_or("");
                    let excerpt: String = content.chars().take(300).collect();
                    section.push_str(&format!("\n  - {}", excerpt));
                }
            }
            section
        }
        CALCULATOR_TOOL => {
            let value = output.get("result").cloned().unwrap_or(Value::Null);
            format!("[{}] result: {}", result.step, value)
        }
        STRUCTURED_QUERY_TOOL => {
            let count = output
                .get("row_count")
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let sample = output
                .get("rows")
                .and_then(|v| v.as_array())
                .and_then(|rows| rows.first())
                .map(|row| row.to_string())
                .unwrap_or_else(|| "none".to_string());
            format!("[{}] {} rows; sample row: {}", result.step, count, sample)
        }
        _ => format!("[{}] output: {}", result.step, output),
    }
}

/// Deterministic response assembly, used when no LLM provider is configured
/// or synthesis generation fails.
pub(crate) fn assemble_response(results: &[StepResult]) -> String {
    if let Some(failed) = results.iter().find(|r| r.outcome.is_error()) {
        return format!(
            "I'm sorry, I couldn't complete that request: the '{}' step failed ({}).",
            failed.step,
            failed.outcome.error().unwrap_or("unknown error")
        );
    }

    // First retrieval result's top chunk.
    for result in results {
        if result.step != RETRIEVAL_TOOL {
            continue;
        }
        if let Some(content) = result
            .outcome
            .output()
            .and_then(|o| o.get("chunks"))
            .and_then(|v| v.as_array())
            .and_then(|chunks| chunks.first())
            .and_then(|c| c.get("content"))
            .and_then(|v| v.as_str())
        {
            return content.to_string();
        }
    }

    // Numeric or record-count summary.
    for result in results {
        let Some(output) = result.outcome.output() else {
            continue;
        };
        if let Some(value) = output.get("result") {
            return format!("The result is {}.", value);
        }
        if let Some(count) = output.get("row_count").and_then(|v| v.as_i64()) {
            return format!("The query matched {} records.", count);
        }
    }

    "I couldn't find an answer to that question.".to_string()
}

/// Gather citable sources from retrieval step outputs, deduplicated by
/// document id in first-seen order.
fn collect_sources(results: &[StepResult]) -> Vec<Source> {
    let mut seen = std::collections::HashSet::new();
    let mut sources = Vec::new();

    for result in results {
        if result.step != RETRIEVAL_TOOL {
            continue;
        }
        let Some(chunks) = result
            .outcome
            .output()
            .and_then(|o| o.get("chunks"))
            .and_then(|v| v.as_array())
        else {
            continue;
        };
        for chunk in chunks {
            let Some(document_id) = chunk
                .get("metadata")
                .and_then(|m| m.get("document_id"))
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            if !seen.insert(document_id.to_string()) {
                continue;
            }
            let title = chunk
                .get("metadata")
                .and_then(|m| m.get("filename"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string());
            let snippet = chunk
                .get("content")
                .and_then(|v| v.as_str())
                .map(|s| s.chars().take(200).collect());
            sources.push(Source {
                id: document_id.to_string(),
                title,
                snippet,
            });
        }
    }
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::QueryAnalyzer;
    use crate::llm::GenerationParams;
    use crate::tool::{Tool, ToolExample};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedLlm {
        responses: Mutex<VecDeque<String>>,
    }

    impl ScriptedLlm {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn generate(
            &self,
            _prompt: &str,
            _system: Option<&str>,
            _params: Option<&GenerationParams>,
        ) -> Result<String> {
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted response left"))
        }
    }

    /// A retrieval stand-in returning one fixed chunk.
    struct FixedRetrieval;

    #[async_trait]
    impl Tool for FixedRetrieval {
        fn name(&self) -> &str {
            RETRIEVAL_TOOL
        }
        fn description(&self) -> &str {
            "fixed retrieval"
        }
        fn input_schema(&self) -> Value {
            json!({})
        }
        fn output_schema(&self) -> Value {
            json!({})
        }
        fn examples(&self) -> Vec<ToolExample> {
            Vec::new()
        }
        async fn execute(&self, _input: &Value) -> Result<Value> {
            Ok(json!({
                "chunks": [{
                    "chunk_id": "c1",
                    "content": "Paris is the capital of France.",
                    "metadata": { "document_id": "doc-1", "filename": "france.md" },
                    "distance": 0.1
                }],
                "count": 1
            }))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl Tool for FailingTool {
        fn name(&self) -> &str {
            "failing"
        }
        fn description(&self) -> &str {
            "always errors"
        }
        fn input_schema(&self) -> Value {
            json!({})
        }
        fn output_schema(&self) -> Value {
            json!({})
        }
        async fn execute(&self, _input: &Value) -> Result<Value> {
            anyhow::bail!("synthetic failure")
        }
    }

    fn executor(llm: Option<Arc<dyn LlmProvider>>) -> PlanExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(FixedRetrieval));
        registry.register(Arc::new(FailingTool));
        let registry = Arc::new(registry);
        // The planner's analyzer is unused in these tests: plans are built by hand.
        let planner_llm = Arc::new(ScriptedLlm::new(vec![]));
        let planner = Arc::new(QueryPlanner::new(
            QueryAnalyzer::new(planner_llm, registry.clone()),
            registry.clone(),
        ));
        PlanExecutor::new(planner, registry, llm, None)
    }

    fn tool_step(tool: &str) -> PlanStep {
        PlanStep::Tool {
            tool: tool.to_string(),
            input: json!({ "query": "q" }),
            description: format!("run {tool}"),
        }
    }

    #[tokio::test]
    async fn retrieval_only_plan_answers_from_top_chunk() {
        let executor = executor(None);
        let mut plan = Plan::new("q1", "capital of France?", vec![tool_step(RETRIEVAL_TOOL)], vec![]);

        let result = executor.execute_plan(&mut plan).await.unwrap();
        assert!(result.response.contains("Paris"));
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.sources[0].id, "doc-1");
        assert!(plan.completed);
        assert_eq!(result.steps.len(), 1);
    }

    #[tokio::test]
    async fn missing_tool_becomes_error_payload_and_plan_continues() {
        let executor = executor(None);
        let mut plan = Plan::new(
            "q1",
            "q",
            vec![tool_step("nonexistent"), tool_step(RETRIEVAL_TOOL)],
            vec![],
        );

        let result = executor.execute_plan(&mut plan).await.unwrap();
        assert!(plan.completed);
        assert_eq!(result.steps.len(), 2);
        assert!(result.steps[0].outcome.is_error());
        assert!(result.steps[0]
            .outcome
            .error()
            .unwrap()
            .contains("tool not found"));
        assert!(!result.steps[1].outcome.is_error());
        // First error wins in deterministic assembly
        assert!(result.response.contains("couldn't complete"));
    }

    #[tokio::test]
    async fn failing_tool_is_caught_at_the_boundary() {
        let executor = executor(None);
        let mut plan = Plan::new("q1", "q", vec![tool_step("failing")], vec![]);
        let result = executor.execute_plan(&mut plan).await.unwrap();
        assert!(result.steps[0].outcome.is_error());
        assert!(result.steps[0].outcome.error().unwrap().contains("synthetic"));
    }

    #[tokio::test]
    async fn synthesize_step_uses_llm_when_configured() {
        let llm: Arc<dyn LlmProvider> =
            Arc::new(ScriptedLlm::new(vec!["Paris is the capital. [1]"]));
        let executor = executor(Some(llm));
        let mut plan = Plan::new(
            "q1",
            "capital of France?",
            vec![
                tool_step(RETRIEVAL_TOOL),
                PlanStep::Synthesize {
                    description: "final".to_string(),
                    use_history: true,
                },
            ],
            vec![],
        );

        let result = executor.execute_plan(&mut plan).await.unwrap();
        assert_eq!(result.response, "Paris is the capital. [1]");
        assert_eq!(result.steps.len(), 2);
    }

    #[tokio::test]
    async fn synthesize_falls_back_when_generation_fails() {
        // Scripted queue is empty: generation errors, deterministic assembly kicks in.
        let llm: Arc<dyn LlmProvider> = Arc::new(ScriptedLlm::new(vec![]));
        let executor = executor(Some(llm));
        let mut plan = Plan::new(
            "q1",
            "capital of France?",
            vec![
                tool_step(RETRIEVAL_TOOL),
                PlanStep::Synthesize {
                    description: "final".to_string(),
                    use_history: false,
                },
            ],
            vec![],
        );
        let result = executor.execute_plan(&mut plan).await.unwrap();
        assert!(result.response.contains("Paris"));
    }

    #[test]
    fn deterministic_assembly_priorities() {
        // Numeric summary when no retrieval output exists.
        let results = vec![StepResult {
            step: CALCULATOR_TOOL.to_string(),
            outcome: StepOutcome::Success {
                output: json!({ "result": 14.0 }),
            },
            duration_ms: 1,
        }];
        assert_eq!(assemble_response(&results), "The result is 14.0.");

        // Generic message when there is nothing at all.
        assert!(assemble_response(&[]).contains("couldn't find"));
    }
}
