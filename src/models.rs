//! Core data models used throughout Query Harness.
//!
//! These types represent the queries, plans, step results, and retrieval
//! chunks that flow through the orchestration and response-quality pipeline.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Who produced a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One turn of prior conversation, oldest first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
}

/// An incoming user query. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
}

impl Query {
    /// Create a query with a fresh v4 UUID and no history.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            history: Vec::new(),
        }
    }

    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }
}

/// How much orchestration a query needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Complexity::Simple => "simple",
            Complexity::Moderate => "moderate",
            Complexity::Complex => "complex",
        }
    }

    /// Parse a complexity label, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Some(Complexity::Simple),
            "moderate" => Some(Complexity::Moderate),
            "complex" => Some(Complexity::Complex),
            _ => None,
        }
    }
}

/// The analyzer's verdict on a query. Produced once, read-only thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryAnalysis {
    pub complexity: Complexity,
    #[serde(default)]
    pub requires_tools: Vec<String>,
    #[serde(default)]
    pub sub_queries: Vec<String>,
    #[serde(default)]
    pub reasoning: String,
}

impl QueryAnalysis {
    /// Named sentinel used when the model output could not be parsed at all:
    /// treat the query as simple and explain why in `reasoning`.
    pub fn fallback(reason: &str) -> Self {
        Self {
            complexity: Complexity::Simple,
            requires_tools: Vec::new(),
            sub_queries: Vec::new(),
            reasoning: format!("analysis fallback: {}", reason),
        }
    }
}

/// One unit of work in a [`Plan`]. Steps are immutable once the plan is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PlanStep {
    /// Invoke a named tool from the registry with a JSON input map.
    Tool {
        tool: String,
        input: Value,
        description: String,
    },
    /// Synthesize a response from every prior step's result.
    Synthesize {
        description: String,
        use_history: bool,
    },
}

impl PlanStep {
    /// Short label for logging: the tool name, or `"synthesize"`.
    pub fn name(&self) -> &str {
        match self {
            PlanStep::Tool { tool, .. } => tool,
            PlanStep::Synthesize { .. } => "synthesize",
        }
    }

    pub fn description(&self) -> &str {
        match self {
            PlanStep::Tool { description, .. } => description,
            PlanStep::Synthesize { description, .. } => description,
        }
    }
}

/// Success payload or error string from one executed step.
///
/// Tool failures are converted to the `Error` variant at the tool boundary
/// and never propagate as panics or `Err` past the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum StepOutcome {
    Success { output: Value },
    Error { error: String },
}

impl StepOutcome {
    pub fn is_error(&self) -> bool {
        matches!(self, StepOutcome::Error { .. })
    }

    pub fn output(&self) -> Option<&Value> {
        match self {
            StepOutcome::Success { output } => Some(output),
            StepOutcome::Error { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            StepOutcome::Error { error } => Some(error),
            StepOutcome::Success { .. } => None,
        }
    }
}

/// The recorded result of one executed plan step, plus timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Step label (tool name or `"synthesize"`).
    pub step: String,
    pub outcome: StepOutcome,
    pub duration_ms: u64,
}

/// An ordered sequence of steps for one query.
///
/// Invariants: `results.len() == current_step`, and `completed` holds exactly
/// when `current_step >= steps.len()`. [`Plan::record_step_result`] is the
/// sole mutator and is called exactly once per executed step, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub query_id: String,
    pub query_text: String,
    pub steps: Vec<PlanStep>,
    pub current_step: usize,
    pub results: Vec<StepResult>,
    pub completed: bool,
    #[serde(default)]
    pub history: Vec<HistoryTurn>,
}

impl Plan {
    pub fn new(
        query_id: impl Into<String>,
        query_text: impl Into<String>,
        steps: Vec<PlanStep>,
        history: Vec<HistoryTurn>,
    ) -> Self {
        let completed = steps.is_empty();
        Self {
            query_id: query_id.into(),
            query_text: query_text.into(),
            steps,
            current_step: 0,
            results: Vec::new(),
            completed,
            history,
        }
    }

    /// The next step to execute, or `None` once the plan is completed.
    pub fn next_step(&self) -> Option<&PlanStep> {
        if self.completed {
            return None;
        }
        self.steps.get(self.current_step)
    }

    /// Append a result and advance the cursor. The only mutation a plan
    /// undergoes after construction.
    pub fn record_step_result(&mut self, result: StepResult) {
        self.results.push(result);
        self.current_step += 1;
        if self.current_step >= self.steps.len() {
            self.completed = true;
        }
    }
}

/// Metadata carried by a retrieved chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub document_id: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub folder: Option<String>,
}

/// A retrieved span of source text with a similarity distance.
///
/// Produced by the vector store collaborator; read-only in this crate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalChunk {
    pub chunk_id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    /// Similarity distance: lower is closer.
    pub distance: f32,
}

impl RetrievalChunk {
    /// Distance converted to a relevance score in `[0, 1]`.
    pub fn relevance(&self) -> f32 {
        (1.0 - self.distance).clamp(0.0, 1.0)
    }
}

/// The judge's recommended retrieval parameters for a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalAdvice {
    pub complexity: Complexity,
    pub top_k: usize,
    pub relevance_threshold: f32,
    pub rerank: bool,
    #[serde(default)]
    pub justification: String,
}

impl RetrievalAdvice {
    /// Named sentinel used when the judge's output could not be parsed.
    pub fn fallback() -> Self {
        Self {
            complexity: Complexity::Moderate,
            top_k: 10,
            relevance_threshold: 0.4,
            rerank: true,
            justification: "advice fallback: defaults applied".to_string(),
        }
    }
}

/// Per-chunk relevance scores from the judge.
///
/// Every key references a chunk_id present in the evaluated batch; the judge
/// never fabricates identifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkEvaluation {
    pub relevance_scores: HashMap<String, f32>,
    pub needs_refinement: bool,
    #[serde(default)]
    pub justification: String,
}

impl ChunkEvaluation {
    /// Named sentinel: uniform 0.5 for every chunk actually present,
    /// no refinement requested.
    pub fn uniform(chunks: &[RetrievalChunk]) -> Self {
        Self {
            relevance_scores: chunks.iter().map(|c| (c.chunk_id.clone(), 0.5)).collect(),
            needs_refinement: false,
            justification: "evaluation fallback: uniform scores".to_string(),
        }
    }
}

/// Quality scores for a synthesized response. Scores run 0 to 10.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEvaluation {
    pub factual_accuracy: f32,
    pub completeness: f32,
    pub relevance: f32,
    pub overall_score: f32,
    pub hallucination_detected: bool,
    #[serde(default)]
    pub hallucination_details: String,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub weaknesses: Vec<String>,
    #[serde(default)]
    pub improvement_suggestions: Vec<String>,
}

impl ResponseEvaluation {
    /// Named sentinel for a total evaluation failure: fail closed with a
    /// zero score and the hallucination flag raised.
    pub fn failure(reason: &str) -> Self {
        Self {
            factual_accuracy: 0.0,
            completeness: 0.0,
            relevance: 0.0,
            overall_score: 0.0,
            hallucination_detected: true,
            hallucination_details: String::new(),
            strengths: Vec::new(),
            weaknesses: vec![format!("evaluation failed: {}", reason)],
            improvement_suggestions: Vec::new(),
        }
    }

    /// Whether this evaluation clears the given quality bar.
    pub fn meets_threshold(&self, threshold: f32) -> bool {
        self.overall_score >= threshold && !self.hallucination_detected
    }
}

/// A citable source attached to a synthesized response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub snippet: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn retrieval_step() -> PlanStep {
        PlanStep::Tool {
            tool: "retrieval".to_string(),
            input: json!({"query": "q", "top_k": 5}),
            description: "retrieve".to_string(),
        }
    }

    fn ok_result(step: &str) -> StepResult {
        StepResult {
            step: step.to_string(),
            outcome: StepOutcome::Success { output: json!({}) },
            duration_ms: 1,
        }
    }

    #[test]
    fn plan_cursor_invariants() {
        let steps = vec![
            retrieval_step(),
            PlanStep::Synthesize {
                description: "final".to_string(),
                use_history: true,
            },
        ];
        let mut plan = Plan::new("q1", "text", steps, Vec::new());

        assert!(!plan.completed);
        assert_eq!(plan.results.len(), plan.current_step);

        plan.record_step_result(ok_result("retrieval"));
        assert_eq!(plan.current_step, 1);
        assert_eq!(plan.results.len(), 1);
        assert!(!plan.completed);

        plan.record_step_result(ok_result("synthesize"));
        assert_eq!(plan.results.len(), 2);
        assert!(plan.completed);
        assert!(plan.next_step().is_none());
    }

    #[test]
    fn empty_plan_is_already_completed() {
        let plan = Plan::new("q1", "text", Vec::new(), Vec::new());
        assert!(plan.completed);
        assert!(plan.next_step().is_none());
    }

    #[test]
    fn relevance_clamps_distance() {
        let mut chunk = RetrievalChunk {
            chunk_id: "c1".to_string(),
            content: String::new(),
            metadata: ChunkMetadata::default(),
            distance: 0.25,
        };
        assert!((chunk.relevance() - 0.75).abs() < 1e-6);

        chunk.distance = 1.8;
        assert_eq!(chunk.relevance(), 0.0);
        chunk.distance = -0.5;
        assert_eq!(chunk.relevance(), 1.0);
    }

    #[test]
    fn complexity_parse_is_case_insensitive() {
        assert_eq!(Complexity::parse(" Complex "), Some(Complexity::Complex));
        assert_eq!(Complexity::parse("MODERATE"), Some(Complexity::Moderate));
        assert_eq!(Complexity::parse("unknown"), None);
    }

    #[test]
    fn evaluation_threshold_requires_no_hallucination() {
        let mut eval = ResponseEvaluation::failure("x");
        eval.overall_score = 9.5;
        assert!(!eval.meets_threshold(7.0));
        eval.hallucination_detected = false;
        assert!(eval.meets_threshold(7.0));
    }

    #[test]
    fn uniform_chunk_evaluation_covers_every_chunk() {
        let chunks = vec![
            RetrievalChunk {
                chunk_id: "a".to_string(),
                content: "x".to_string(),
                metadata: ChunkMetadata::default(),
                distance: 0.1,
            },
            RetrievalChunk {
                chunk_id: "b".to_string(),
                content: "y".to_string(),
                metadata: ChunkMetadata::default(),
                distance: 0.2,
            },
        ];
        let eval = ChunkEvaluation::uniform(&chunks);
        assert_eq!(eval.relevance_scores.len(), 2);
        assert_eq!(eval.relevance_scores["a"], 0.5);
        assert!(!eval.needs_refinement);
    }
}
