//! Response Refiner: one bounded improvement pass over an evaluated answer.
//!
//! Short-circuits when the iteration cap is exceeded or the incoming
//! evaluation already scores high enough to leave alone. On a parse
//! failure the raw model output becomes the refined response, so an
//! attempted fix is never silently discarded.

use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::extract::{self, extract_json_object};
use crate::llm::LlmProvider;
use crate::models::{ResponseEvaluation, Source};

#[derive(Debug, Clone)]
pub struct RefinementResult {
    pub refined_response: String,
    pub improvement_summary: String,
    pub execution_time_ms: u64,
    pub iteration: u32,
}

pub struct ResponseRefiner {
    llm: Arc<dyn LlmProvider>,
    config: PipelineConfig,
}

impl ResponseRefiner {
    pub fn new(llm: Arc<dyn LlmProvider>, config: PipelineConfig) -> Self {
        Self { llm, config }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn refine(
        &self,
        query: &str,
        query_id: &str,
        response: &str,
        evaluation: &ResponseEvaluation,
        context: &str,
        sources: &[Source],
        execution_result: Option<&Value>,
        iteration: u32,
    ) -> RefinementResult {
        let started = Instant::now();

        if iteration > self.config.max_refinement_iterations {
            debug!(query_id, iteration, "refinement iteration cap exceeded");
            return unchanged(response, "iteration cap exceeded", iteration, started);
        }
        if evaluation.overall_score >= self.config.refinement_skip_score {
            debug!(
                query_id,
                score = evaluation.overall_score,
                "response already scores high enough, skipping refinement"
            );
            return unchanged(response, "score already sufficient", iteration, started);
        }

        let prompt = build_prompt(query, response, evaluation, context, sources, execution_result);

        let text = match self.llm.generate(&prompt, None, None).await {
            Ok(text) => text,
            Err(e) => {
                warn!(query_id, iteration, error = %e, "refinement model call failed");
                return unchanged(
                    response,
                    &format!("model call failed: {e}"),
                    iteration,
                    started,
                );
            }
        };

        let (refined_response, improvement_summary) = match extract_json_object(&text) {
            Some(obj) => {
                let refined = extract::field_string(&obj, "refined_response", "");
                if refined.is_empty() {
                    (
                        text.clone(),
                        "model output missing refined_response, using raw text".to_string(),
                    )
                } else {
                    (
                        refined,
                        extract::field_string(&obj, "improvement_summary", ""),
                    )
                }
            }
            None => (
                text.clone(),
                "model output was not parseable JSON, using raw text".to_string(),
            ),
        };

        RefinementResult {
            refined_response,
            improvement_summary,
            execution_time_ms: started.elapsed().as_millis() as u64,
            iteration,
        }
    }
}

fn unchanged(
    response: &str,
    summary: &str,
    iteration: u32,
    started: Instant,
) -> RefinementResult {
    RefinementResult {
        refined_response: response.to_string(),
        improvement_summary: summary.to_string(),
        execution_time_ms: started.elapsed().as_millis() as u64,
        iteration,
    }
}

fn build_prompt(
    query: &str,
    response: &str,
    evaluation: &ResponseEvaluation,
    context: &str,
    sources: &[Source],
    execution_result: Option<&Value>,
) -> String {
    let evaluation_json =
        serde_json::to_string_pretty(evaluation).unwrap_or_else(|_| "{}".to_string());
    let source_listing: String = sources
        .iter()
        .enumerate()
        .map(|(i, s)| format!("[{}] {}\n", i + 1, s.title.as_deref().unwrap_or(&s.id)))
        .collect();
    let execution_section = execution_result
        .map(|v| format!("Tool results:\n{}\n\n", v))
        .unwrap_or_default();

    format!(
        "Improve the answer below using the evaluation feedback. Keep what \
         the evaluation praised, fix what it criticized, and keep bracket \
         citations like [1] pointing at the same numbered sources.\n\n\
         Question: {query}\n\n\
         Current answer:\n{response}\n\n\
         Evaluation:\n{evaluation_json}\n\n\
         Context:\n{context}\n\n\
         Sources:\n{source_listing}\n{execution_section}\
         Respond with a JSON object:\n\
         {{\"refined_response\": \"...\", \"improvement_summary\": \"...\"}}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::GenerationParams;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct ScriptedLlm {
        responses: Mutex<VecDeque<String>>,
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

    fn refiner(responses: Vec<&str>) -> ResponseRefiner {
        ResponseRefiner::new(
            Arc::new(ScriptedLlm {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            }),
            PipelineConfig::default(),
        )
    }

    fn low_evaluation() -> ResponseEvaluation {
        ResponseEvaluation {
            overall_score: 5.0,
            hallucination_detected: true,
            ..ResponseEvaluation::failure("seed")
        }
    }

    #[tokio::test]
    async fn structured_output_is_applied() {
        let refiner = refiner(vec![
            r#"{"refined_response": "Paris is the capital of France [1].", "improvement_summary": "added citation"}"#,
        ]);
        let result = refiner
            .refine("q", "q1", "Paris.", &low_evaluation(), "ctx", &[], None, 1)
            .await;
        assert_eq!(result.refined_response, "Paris is the capital of France [1].");
        assert_eq!(result.improvement_summary, "added citation");
        assert_eq!(result.iteration, 1);
    }

    #[tokio::test]
    async fn parse_failure_keeps_raw_model_output() {
        let refiner = refiner(vec!["Paris is the capital of France, with a citation [1]."]);
        let result = refiner
            .refine("q", "q1", "Paris.", &low_evaluation(), "ctx", &[], None, 1)
            .await;
        // The attempted fix survives even though it was not JSON.
        assert!(result.refined_response.contains("capital of France"));
        assert!(result.improvement_summary.contains("not parseable"));
    }

    #[tokio::test]
    async fn iteration_cap_short_circuits() {
        let refiner = refiner(vec![]);
        let result = refiner
            .refine("q", "q1", "Paris.", &low_evaluation(), "ctx", &[], None, 99)
            .await;
        assert_eq!(result.refined_response, "Paris.");
        assert!(result.improvement_summary.contains("cap"));
    }

    #[tokio::test]
    async fn high_score_short_circuits() {
        let refiner = refiner(vec![]);
        let evaluation = ResponseEvaluation {
            overall_score: 9.5,
            hallucination_detected: false,
            ..ResponseEvaluation::failure("seed")
        };
        let result = refiner
            .refine("q", "q1", "Paris.", &evaluation, "ctx", &[], None, 1)
            .await;
        assert_eq!(result.refined_response, "Paris.");
        assert!(result.improvement_summary.contains("sufficient"));
    }

    #[tokio::test]
    async fn model_error_returns_original_response() {
        let refiner = refiner(vec![]);
        let result = refiner
            .refine("q", "q1", "Paris.", &low_evaluation(), "ctx", &[], None, 1)
            .await;
        assert_eq!(result.refined_response, "Paris.");
        assert!(result.improvement_summary.contains("model call failed"));
    }
}
