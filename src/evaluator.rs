//! Response Evaluator: rubric-scores a synthesized answer.
//!
//! One model call against a fixed rubric, parsed through the layered JSON
//! extractor. Missing fields are backfilled toward caution: absent scores
//! become 0 and an absent hallucination flag counts as detected. A model
//! error returns the [`ResponseEvaluation::failure`] sentinel.

use serde_json::Value;
use std::sync::Arc;
use tracing::warn;

use crate::extract::{self, extract_json_object};
use crate::llm::LlmProvider;
use crate::models::{ResponseEvaluation, Source};

pub struct ResponseEvaluator {
    llm: Arc<dyn LlmProvider>,
}

impl ResponseEvaluator {
    pub fn new(llm: Arc<dyn LlmProvider>) -> Self {
        Self { llm }
    }

    pub async fn evaluate(
        &self,
        query: &str,
        query_id: &str,
        response: &str,
        context: &str,
        sources: &[Source],
        execution_result: Option<&Value>,
    ) -> ResponseEvaluation {
        let prompt = build_prompt(query, response, context, sources, execution_result);

        let text = match self.llm.generate(&prompt, None, None).await {
            Ok(text) => text,
            Err(e) => {
                warn!(query_id, error = %e, "evaluation model call failed");
                return ResponseEvaluation::failure(&format!("model call failed: {e}"));
            }
        };

        match extract_json_object(&text) {
            Some(obj) => parse_evaluation(&obj),
            None => {
                warn!(query_id, "evaluation output was not parseable JSON");
                ResponseEvaluation::failure("evaluation output was not parseable JSON")
            }
        }
    }
}

fn build_prompt(
    query: &str,
    response: &str,
    context: &str,
    sources: &[Source],
    execution_result: Option<&Value>,
) -> String {
    let source_listing: String = sources
        .iter()
        .enumerate()
        .map(|(i, s)| format!("[{}] {}\n", i + 1, s.title.as_deref().unwrap_or(&s.id)))
        .collect();
    let execution_section = execution_result
        .map(|v| format!("Tool results:\n{}\n\n", v))
        .unwrap_or_default();

    format!(
        "You are grading an answer against the material it was built from.\n\n\
         Question: {query}\n\n\
         Answer:\n{response}\n\n\
         Context:\n{context}\n\n\
         Sources:\n{source_listing}\n{execution_section}\
         Score each criterion from 0 to 10:\n\
         - factual_accuracy: 0-2 fabricated, 3-4 mostly wrong, 5-6 mixed, 7-8 minor slips, 9-10 fully grounded\n\
         - completeness: 0-2 ignores the question, 3-4 fragmentary, 5-6 partial, 7-8 covers the main points, 9-10 exhaustive\n\
         - relevance: 0-2 off-topic, 3-4 tangential, 5-6 drifts, 7-8 on topic, 9-10 directly responsive\n\
         - coherence: 0-2 incoherent, 3-4 disjointed, 5-6 uneven, 7-8 clear, 9-10 polished\n\
         - citation_use: 0-2 none where needed, 3-4 sparse, 5-6 inconsistent, 7-8 mostly cited, 9-10 every claim cited\n\n\
         Respond with a JSON object:\n\
         {{\"factual_accuracy\": <0-10>, \"completeness\": <0-10>, \"relevance\": <0-10>, \
         \"overall_score\": <0-10>, \"hallucination_detected\": <bool>, \
         \"hallucination_details\": \"...\", \"strengths\": [...], \"weaknesses\": [...], \
         \"improvement_suggestions\": [...]}}"
    )
}

/// Backfill policy: absent scores are 0, absent lists are empty, and an
/// absent hallucination flag counts as detected.
fn parse_evaluation(obj: &Value) -> ResponseEvaluation {
    let score = |field: &str| extract::field_f64(obj, field, 0.0).clamp(0.0, 10.0) as f32;

    ResponseEvaluation {
        factual_accuracy: score("factual_accuracy"),
        completeness: score("completeness"),
        relevance: score("relevance"),
        overall_score: score("overall_score"),
        hallucination_detected: extract::field_bool(obj, "hallucination_detected", true),
        hallucination_details: extract::field_string(obj, "hallucination_details", ""),
        strengths: extract::field_string_list(obj, "strengths"),
        weaknesses: extract::field_string_list(obj, "weaknesses"),
        improvement_suggestions: extract::field_string_list(obj, "improvement_suggestions"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::GenerationParams;
    use anyhow::Result;
    use async_trait::async_trait;
    use serde_json::json;
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

    fn evaluator(responses: Vec<&str>) -> ResponseEvaluator {
        ResponseEvaluator::new(Arc::new(ScriptedLlm {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
        }))
    }

    #[tokio::test]
    async fn well_formed_output_parses_fully() {
        let evaluator = evaluator(vec![
            r#"```json
{"factual_accuracy": 9, "completeness": 8, "relevance": 9, "overall_score": 8.5,
 "hallucination_detected": false, "strengths": ["grounded"], "weaknesses": [],
 "improvement_suggestions": ["cite more"]}
```"#,
        ]);
        let evaluation = evaluator
            .evaluate("q", "q1", "answer", "ctx", &[], None)
            .await;
        assert_eq!(evaluation.overall_score, 8.5);
        assert!(!evaluation.hallucination_detected);
        assert_eq!(evaluation.strengths, vec!["grounded"]);
    }

    #[tokio::test]
    async fn missing_fields_backfill_toward_caution() {
        let evaluator = evaluator(vec![r#"{"overall_score": 6}"#]);
        let evaluation = evaluator
            .evaluate("q", "q1", "answer", "ctx", &[], None)
            .await;
        assert_eq!(evaluation.overall_score, 6.0);
        assert_eq!(evaluation.factual_accuracy, 0.0);
        assert!(evaluation.hallucination_detected);
        assert!(evaluation.weaknesses.is_empty());
    }

    #[tokio::test]
    async fn unparseable_output_fails_closed() {
        let evaluator = evaluator(vec!["the answer seemed fine to me"]);
        let evaluation = evaluator
            .evaluate("q", "q1", "answer", "ctx", &[], None)
            .await;
        assert_eq!(evaluation.overall_score, 0.0);
        assert!(evaluation.hallucination_detected);
    }

    #[tokio::test]
    async fn model_error_fails_closed_with_reason() {
        let evaluator = evaluator(vec![]);
        let evaluation = evaluator
            .evaluate("q", "q1", "answer", "ctx", &[], None)
            .await;
        assert_eq!(evaluation.overall_score, 0.0);
        assert!(evaluation.hallucination_detected);
        assert!(evaluation
            .weaknesses
            .iter()
            .any(|w| w.contains("model call failed")));
    }

    #[test]
    fn scores_are_clamped_to_rubric_range() {
        let evaluation = parse_evaluation(&json!({
            "factual_accuracy": 42, "overall_score": -3, "hallucination_detected": false
        }));
        assert_eq!(evaluation.factual_accuracy, 10.0);
        assert_eq!(evaluation.overall_score, 0.0);
    }
}
