//! Response Quality Pipeline: synthesize, evaluate, then refine until the
//! answer clears the quality bar or the iteration cap is reached.
//!
//! The pipeline always returns the last response it produced, even when the
//! threshold is never met. Degraded quality is communicated through the
//! returned evaluation, not through an error. Every stage logs to the
//! process log when one is attached, and the final response lands there as
//! the terminal record.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::evaluator::ResponseEvaluator;
use crate::llm::{GenerationParams, LlmProvider};
use crate::models::{HistoryTurn, ResponseEvaluation, Source};
use crate::process_log::{AuditReporter, ProcessLog};
use crate::refiner::ResponseRefiner;
use crate::synthesizer::{self, ResponseSynthesizer, SynthesisRequest};

/// Input to one pipeline run. Optional fields default to absent; a missing
/// `query_id` gets a fresh UUID.
pub struct PipelineRequest<'a> {
    pub query: &'a str,
    pub context: &'a str,
    pub sources: &'a [Source],
    pub execution_result: Option<&'a Value>,
    pub conversation_context: Option<&'a [HistoryTurn]>,
    pub system_prompt: Option<&'a str>,
    pub parameters: Option<&'a GenerationParams>,
    pub query_id: Option<&'a str>,
}

impl<'a> PipelineRequest<'a> {
    pub fn new(query: &'a str, context: &'a str, sources: &'a [Source]) -> Self {
        Self {
            query,
            context,
            sources,
            execution_result: None,
            conversation_context: None,
            system_prompt: None,
            parameters: None,
            query_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub query_id: String,
    pub response: String,
    /// Sources the final response actually cites.
    pub sources: Vec<Source>,
    pub evaluation: ResponseEvaluation,
    pub refinement_iterations: u32,
    pub audit_report: Option<Value>,
    pub execution_time_ms: u64,
}

pub struct ResponseQualityPipeline {
    synthesizer: ResponseSynthesizer,
    evaluator: ResponseEvaluator,
    refiner: ResponseRefiner,
    config: PipelineConfig,
    log: Option<Arc<ProcessLog>>,
    audit: Option<Arc<dyn AuditReporter>>,
}

impl ResponseQualityPipeline {
    pub fn new(llm: Arc<dyn LlmProvider>, config: PipelineConfig) -> Self {
        Self {
            synthesizer: ResponseSynthesizer::new(llm.clone()),
            evaluator: ResponseEvaluator::new(llm.clone()),
            refiner: ResponseRefiner::new(llm, config.clone()),
            config,
            log: None,
            audit: None,
        }
    }

    pub fn with_process_log(mut self, log: Arc<ProcessLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn with_audit_reporter(mut self, audit: Arc<dyn AuditReporter>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub async fn process(&self, request: &PipelineRequest<'_>) -> PipelineResult {
        let started = Instant::now();
        let query_id = request
            .query_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Some(log) = &self.log {
            log.start_query(&query_id, request.query);
        }

        let synthesis_request = SynthesisRequest {
            query: request.query,
            query_id: &query_id,
            context: request.context,
            sources: request.sources,
            execution_result: request.execution_result,
            conversation_context: request.conversation_context,
            system_prompt: request.system_prompt,
            parameters: request.parameters,
        };
        let synthesis = self.synthesizer.synthesize(&synthesis_request).await;
        let mut response = synthesis.response;
        self.log_step(
            &query_id,
            "synthesize",
            json!({
                "response_chars": response.len(),
                "cited_sources": synthesis.sources.len(),
                "duration_ms": synthesis.execution_time_ms,
            }),
        );

        let mut evaluation = self
            .evaluate(request, &query_id, &response)
            .await;

        let mut iterations = 0u32;
        while !evaluation.meets_threshold(self.config.quality_threshold)
            && iterations < self.config.max_refinement_iterations
        {
            iterations += 1;
            let refinement = self
                .refiner
                .refine(
                    request.query,
                    &query_id,
                    &response,
                    &evaluation,
                    request.context,
                    request.sources,
                    request.execution_result,
                    iterations,
                )
                .await;
            self.log_step(
                &query_id,
                "refine",
                json!({
                    "iteration": iterations,
                    "improvement_summary": refinement.improvement_summary,
                    "duration_ms": refinement.execution_time_ms,
                }),
            );
            response = refinement.refined_response;
            evaluation = self.evaluate(request, &query_id, &response).await;
        }

        if !evaluation.meets_threshold(self.config.quality_threshold) {
            info!(
                query_id,
                score = evaluation.overall_score,
                iterations,
                "refinement exhausted below threshold, returning best effort"
            );
        }

        let sources = synthesizer::cited_sources(&response, request.sources);

        let audit_report = match &self.audit {
            Some(audit) => match audit.generate_report(&query_id, false).await {
                Ok(report) => {
                    if let Some(log) = &self.log {
                        log.attach_audit_report(&query_id, report.clone());
                    }
                    Some(report)
                }
                Err(e) => {
                    warn!(query_id, error = %e, "audit report generation failed");
                    None
                }
            },
            None => None,
        };

        if let Some(log) = &self.log {
            log.set_final_response(
                &query_id,
                &response,
                json!({
                    "final_score": evaluation.overall_score,
                    "hallucination_detected": evaluation.hallucination_detected,
                    "refinement_iterations": iterations,
                    "source_count": sources.len(),
                }),
            );
        }

        PipelineResult {
            query_id,
            response,
            sources,
            evaluation,
            refinement_iterations: iterations,
            audit_report,
            execution_time_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn evaluate(
        &self,
        request: &PipelineRequest<'_>,
        query_id: &str,
        response: &str,
    ) -> ResponseEvaluation {
        let evaluation = self
            .evaluator
            .evaluate(
                request.query,
                query_id,
                response,
                request.context,
                request.sources,
                request.execution_result,
            )
            .await;
        self.log_step(
            query_id,
            "evaluate",
            json!({
                "overall_score": evaluation.overall_score,
                "hallucination_detected": evaluation.hallucination_detected,
            }),
        );
        evaluation
    }

    fn log_step(&self, query_id: &str, step_name: &str, data: Value) {
        if let Some(log) = &self.log {
            log.log_step(query_id, step_name, data);
        }
    }
}
