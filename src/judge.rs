//! Retrieval Judge: an LLM-backed advisor over retrieved chunks.
//!
//! Four independent capabilities, each one model round-trip over a bounded
//! input with a deterministic fallback when parsing fails:
//!
//! - [`RetrievalJudge::analyze_query`]: recommend retrieval parameters
//! - [`RetrievalJudge::evaluate_chunks`]: score chunk relevance
//! - [`RetrievalJudge::refine_query`]: rewrite a query that retrieved poorly
//! - [`RetrievalJudge::optimize_context`]: reorder/trim chunks for synthesis
//!
//! Invariant across all four: the output never references a chunk_id absent
//! from the input batch. The judge maps the model's 1-based indices back
//! onto real chunks and drops anything out of range.

use anyhow::Result;
use regex::Regex;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::config::JudgeConfig;
use crate::extract::{self, extract_json_object};
use crate::llm::LlmProvider;
use crate::models::{ChunkEvaluation, Complexity, RetrievalAdvice, RetrievalChunk};

pub struct RetrievalJudge {
    llm: Arc<dyn LlmProvider>,
    config: JudgeConfig,
}

impl RetrievalJudge {
    pub fn new(llm: Arc<dyn LlmProvider>, config: JudgeConfig) -> Self {
        Self { llm, config }
    }

    /// Recommend retrieval parameters for a query.
    ///
    /// Falls back to moderate / k=10 / threshold=0.4 / rerank=true when the
    /// model call fails or its output cannot be parsed.
    pub async fn analyze_query(&self, query: &str) -> RetrievalAdvice {
        let prompt = format!(
            "Estimate how hard this search query is to answer from a document corpus \
             and recommend retrieval parameters.\n\nQuery: {query}\n\n\
             Respond with a JSON object:\n\
             {{\"complexity\": \"simple|moderate|complex\", \"top_k\": <int>, \
             \"relevance_threshold\": <0..1>, \"rerank\": <bool>, \"justification\": \"...\"}}"
        );

        let text = match self.llm.generate(&prompt, None, None).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "judge analyze_query model call failed");
                return RetrievalAdvice::fallback();
            }
        };

        let Some(obj) = extract_json_object(&text) else {
            debug!("judge analyze_query output not parseable, using fallback");
            return RetrievalAdvice::fallback();
        };

        let complexity = obj
            .get("complexity")
            .and_then(|v| v.as_str())
            .and_then(Complexity::parse)
            .unwrap_or(Complexity::Moderate);
        let top_k = extract::field_f64(&obj, "top_k", self.config.default_top_k as f64);
        let threshold = extract::field_f64(
            &obj,
            "relevance_threshold",
            self.config.default_threshold as f64,
        );

        RetrievalAdvice {
            complexity,
            top_k: (top_k as usize).clamp(1, 50),
            relevance_threshold: (threshold as f32).clamp(0.0, 1.0),
            rerank: extract::field_bool(&obj, "rerank", self.config.default_rerank),
            justification: extract::field_string(&obj, "justification", ""),
        }
    }

    /// Score each chunk's relevance to the query in `[0, 1]`.
    ///
    /// The chunk set is first reduced to a bounded sample (see
    /// [`sample_chunks`]) so the prompt fits the model's context window. On
    /// any failure every chunk actually present scores a uniform 0.5 and no
    /// refinement is requested.
    pub async fn evaluate_chunks(&self, query: &str, chunks: &[RetrievalChunk]) -> ChunkEvaluation {
        if chunks.is_empty() {
            return ChunkEvaluation::uniform(chunks);
        }

        let sample = sample_chunks(
            chunks,
            self.config.max_sample_chunks,
            self.config.sample_char_budget,
        );
        let listing = render_chunk_listing(&sample);

        let prompt = format!(
            "Score how relevant each retrieved chunk is to the query, from 0.0 (unrelated) \
             to 1.0 (directly answers it).\n\nQuery: {query}\n\nChunks:\n{listing}\n\
             Respond with a JSON object:\n\
             {{\"relevance_scores\": {{\"1\": <0..1>, \"2\": <0..1>, ...}}, \
             \"needs_refinement\": <bool>, \"justification\": \"...\"}}\n\
             Use the chunk numbers shown above as keys."
        );

        let text = match self.llm.generate(&prompt, None, None).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "judge evaluate_chunks model call failed");
                return ChunkEvaluation::uniform(chunks);
            }
        };

        let Some(obj) = extract_json_object(&text) else {
            return ChunkEvaluation::uniform(chunks);
        };
        let Some(scores) = obj.get("relevance_scores").and_then(|v| v.as_object()) else {
            return ChunkEvaluation::uniform(chunks);
        };

        // Map the model's 1-based indices back onto real chunk_ids; anything
        // out of range is dropped, never invented.
        let mut relevance_scores = std::collections::HashMap::new();
        for (key, value) in scores {
            let Ok(index) = key.trim().parse::<usize>() else {
                continue;
            };
            if index == 0 || index > sample.len() {
                continue;
            }
            let Some(score) = value.as_f64() else {
                continue;
            };
            relevance_scores.insert(
                sample[index - 1].chunk.chunk_id.clone(),
                (score as f32).clamp(0.0, 1.0),
            );
        }

        if relevance_scores.is_empty() {
            return ChunkEvaluation::uniform(chunks);
        }

        ChunkEvaluation {
            relevance_scores,
            needs_refinement: extract::field_bool(&obj, "needs_refinement", false),
            justification: extract::field_string(&obj, "justification", ""),
        }
    }

    /// Rewrite a query that retrieved poorly.
    ///
    /// Rejects rewrites that are suspiciously short (<5 chars) or long
    /// (>3× the original), which guards against the model dropping named
    /// entities; in that case the original query is returned unchanged.
    pub async fn refine_query(&self, query: &str, chunks: &[RetrievalChunk]) -> String {
        let sample = sample_chunks(
            chunks,
            self.config.max_sample_chunks,
            self.config.sample_char_budget,
        );
        let listing = render_chunk_listing(&sample);

        let prompt = format!(
            "The query below retrieved the chunks shown, but they answer it poorly. \
             Rewrite the query to retrieve better material. Keep every named entity.\n\n\
             Query: {query}\n\nChunks:\n{listing}\n\
             Respond with a JSON object: {{\"refined_query\": \"...\"}}"
        );

        let text = match self.llm.generate(&prompt, None, None).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "judge refine_query model call failed");
                return query.to_string();
            }
        };

        let candidate = extract_json_object(&text)
            .map(|obj| extract::field_string(&obj, "refined_query", ""))
            .filter(|s| !s.is_empty())
            .or_else(|| extract_embedded_query(&text))
            .unwrap_or_else(|| text.trim().to_string());

        if is_plausible_rewrite(&candidate, query) {
            candidate
        } else {
            debug!("judge refine_query rewrite rejected, keeping original");
            query.to_string()
        }
    }

    /// Reorder chunks for synthesis and drop ones the model excludes.
    ///
    /// Skipped entirely (input returned unchanged) when 3 or fewer chunks
    /// are present. Falls back to the original unmodified list when the
    /// model produces no valid indices.
    pub async fn optimize_context(
        &self,
        query: &str,
        chunks: Vec<RetrievalChunk>,
    ) -> Vec<RetrievalChunk> {
        if chunks.len() <= 3 {
            return chunks;
        }

        let sample = sample_chunks(
            &chunks,
            self.config.max_sample_chunks,
            self.config.sample_char_budget,
        );
        let listing = render_chunk_listing(&sample);

        let prompt = format!(
            "Order the chunks below from most to least useful for answering the query, \
             and list any that should be excluded entirely.\n\nQuery: {query}\n\n\
             Chunks:\n{listing}\n\
             Respond with a JSON object: {{\"ordering\": [<chunk numbers>], \
             \"exclude\": [<chunk numbers>]}}"
        );

        let text = match self.llm.generate(&prompt, None, None).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "judge optimize_context model call failed");
                return chunks;
            }
        };

        let Some(obj) = extract_json_object(&text) else {
            return chunks;
        };

        let to_indices = |key: &str| -> Vec<usize> {
            obj.get(key)
                .and_then(|v| v.as_array())
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_u64())
                        .map(|n| n as usize)
                        .filter(|&n| n >= 1 && n <= sample.len())
                        .collect()
                })
                .unwrap_or_default()
        };

        let excluded: std::collections::HashSet<usize> = to_indices("exclude").into_iter().collect();
        let mut seen = std::collections::HashSet::new();
        let ordered: Vec<RetrievalChunk> = to_indices("ordering")
            .into_iter()
            .filter(|n| !excluded.contains(n))
            .filter(|n| seen.insert(*n))
            .map(|n| sample[n - 1].chunk.clone())
            .collect();

        if ordered.is_empty() {
            return chunks;
        }
        ordered
    }
}

// ============ Bounded Sampling ============

/// A sampled chunk with its content truncated to a share of the budget.
pub(crate) struct SampledChunk {
    pub chunk: RetrievalChunk,
    pub truncated: String,
}

/// Reduce a chunk set to at most `max_chunks` (ascending by distance) and
/// truncate total content to `char_budget`, splitting the budget across
/// chunks in proportion to their length.
pub(crate) fn sample_chunks(
    chunks: &[RetrievalChunk],
    max_chunks: usize,
    char_budget: usize,
) -> Vec<SampledChunk> {
    let mut sorted: Vec<&RetrievalChunk> = chunks.iter().collect();
    sorted.sort_by(|a, b| {
        a.distance
            .partial_cmp(&b.distance)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    sorted.truncate(max_chunks);

    let total: usize = sorted.iter().map(|c| c.content.chars().count()).sum();
    sorted
        .into_iter()
        .map(|chunk| {
            let len = chunk.content.chars().count();
            let truncated = if total <= char_budget || total == 0 {
                chunk.content.clone()
            } else {
                let share = (char_budget * len / total).max(80);
                truncate_chars(&chunk.content, share)
            };
            SampledChunk {
                chunk: chunk.clone(),
                truncated,
            }
        })
        .collect()
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

fn render_chunk_listing(sample: &[SampledChunk]) -> String {
    sample
        .iter()
        .enumerate()
        .map(|(i, s)| {
            format!(
                "{}. (distance {:.3}) {}\n",
                i + 1,
                s.chunk.distance,
                s.truncated
            )
        })
        .collect()
}

// ============ Rewrite Validation ============

fn embedded_query_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)(?:refined|rewritten|new)\s+query\s*[:\-]\s*"?([^"\n]+)"?"#).unwrap())
}

/// Pattern-based extraction of a query string embedded in prose, tried
/// before giving up on an unparseable rewrite response.
fn extract_embedded_query(text: &str) -> Option<String> {
    embedded_query_re()
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
        .filter(|s| !s.is_empty())
}

fn is_plausible_rewrite(candidate: &str, original: &str) -> bool {
    let len = candidate.trim().chars().count();
    len >= 5 && len <= original.chars().count().max(5) * 3
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::GenerationParams;
    use crate::models::ChunkMetadata;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays a fixed queue of responses; errors once the queue drains.
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

    fn judge(responses: Vec<&str>) -> RetrievalJudge {
        RetrievalJudge::new(Arc::new(ScriptedLlm::new(responses)), JudgeConfig::default())
    }

    fn chunk(id: &str, content: &str, distance: f32) -> RetrievalChunk {
        RetrievalChunk {
            chunk_id: id.to_string(),
            content: content.to_string(),
            metadata: ChunkMetadata {
                document_id: format!("doc-{id}"),
                ..Default::default()
            },
            distance,
        }
    }

    #[tokio::test]
    async fn analyze_query_parses_advice() {
        let judge = judge(vec![
            r#"{"complexity": "complex", "top_k": 15, "relevance_threshold": 0.55, "rerank": false, "justification": "multi-hop"}"#,
        ]);
        let advice = judge.analyze_query("compare X and Y over time").await;
        assert_eq!(advice.complexity, Complexity::Complex);
        assert_eq!(advice.top_k, 15);
        assert!((advice.relevance_threshold - 0.55).abs() < 1e-6);
        assert!(!advice.rerank);
    }

    #[tokio::test]
    async fn analyze_query_falls_back_on_garbage_and_clamps() {
        let judge = judge(vec!["not json at all"]);
        let advice = judge.analyze_query("q").await;
        assert_eq!(advice.complexity, Complexity::Moderate);
        assert_eq!(advice.top_k, 10);
        assert!((advice.relevance_threshold - 0.4).abs() < 1e-6);
        assert!(advice.rerank);

        let judge = judge2(vec![r#"{"complexity": "simple", "top_k": 500, "relevance_threshold": 3.0}"#]);
        let advice = judge.analyze_query("q").await;
        assert_eq!(advice.top_k, 50);
        assert_eq!(advice.relevance_threshold, 1.0);
    }

    // Second constructor to avoid shadowing confusion in the test above.
    fn judge2(responses: Vec<&str>) -> RetrievalJudge {
        judge(responses)
    }

    #[tokio::test]
    async fn evaluate_chunks_maps_indices_to_ids() {
        let chunks = vec![chunk("a", "alpha", 0.1), chunk("b", "beta", 0.3)];
        let judge = judge(vec![
            r#"{"relevance_scores": {"1": 0.9, "2": 0.2, "7": 0.8}, "needs_refinement": true, "justification": "weak second"}"#,
        ]);
        let eval = judge.evaluate_chunks("q", &chunks).await;
        assert_eq!(eval.relevance_scores.len(), 2);
        assert!((eval.relevance_scores["a"] - 0.9).abs() < 1e-6);
        assert!((eval.relevance_scores["b"] - 0.2).abs() < 1e-6);
        assert!(!eval.relevance_scores.contains_key("7"));
        assert!(eval.needs_refinement);
    }

    #[tokio::test]
    async fn evaluate_chunks_uniform_fallback() {
        let chunks = vec![chunk("a", "alpha", 0.1), chunk("b", "beta", 0.3)];
        let judge = judge(vec!["the chunks look fine to me"]);
        let eval = judge.evaluate_chunks("q", &chunks).await;
        assert_eq!(eval.relevance_scores["a"], 0.5);
        assert_eq!(eval.relevance_scores["b"], 0.5);
        assert!(!eval.needs_refinement);
    }

    #[tokio::test]
    async fn refine_query_accepts_good_rewrite() {
        let judge = judge(vec![r#"{"refined_query": "capital city of France"}"#]);
        let refined = judge
            .refine_query("what is the capital of France", &[])
            .await;
        assert_eq!(refined, "capital city of France");
    }

    #[tokio::test]
    async fn refine_query_rejects_short_and_bloated_rewrites() {
        let judge = judge(vec![r#"{"refined_query": "hm"}"#]);
        let original = "what is the capital of France";
        assert_eq!(judge.refine_query(original, &[]).await, original);

        let long_json = format!(r#"{{"refined_query": "{}"}}"#, "x".repeat(500));
        let judge = judge2(vec![long_json.as_str()]);
        assert_eq!(judge.refine_query(original, &[]).await, original);
    }

    #[tokio::test]
    async fn refine_query_extracts_embedded_pattern() {
        let judge = judge(vec!["Refined query: France capital city history"]);
        let refined = judge.refine_query("capital of France", &[]).await;
        assert_eq!(refined, "France capital city history");
    }

    #[tokio::test]
    async fn optimize_context_skips_small_sets() {
        let chunks = vec![chunk("a", "x", 0.1), chunk("b", "y", 0.2)];
        // No scripted response: the judge must not even call the model.
        let judge = judge(vec![]);
        let result = judge.optimize_context("q", chunks.clone()).await;
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].chunk_id, "a");
    }

    #[tokio::test]
    async fn optimize_context_reorders_and_excludes() {
        let chunks = vec![
            chunk("a", "x", 0.1),
            chunk("b", "y", 0.2),
            chunk("c", "z", 0.3),
            chunk("d", "w", 0.4),
        ];
        let judge = judge(vec![r#"{"ordering": [3, 1, 2, 3, 9], "exclude": [2]}"#]);
        let result = judge.optimize_context("q", chunks.clone()).await;
        let ids: Vec<&str> = result.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert!(result.len() <= chunks.len());
    }

    #[tokio::test]
    async fn optimize_context_falls_back_on_invalid_indices() {
        let chunks = vec![
            chunk("a", "x", 0.1),
            chunk("b", "y", 0.2),
            chunk("c", "z", 0.3),
            chunk("d", "w", 0.4),
        ];
        let judge = judge(vec![r#"{"ordering": [9, 12], "exclude": []}"#]);
        let result = judge.optimize_context("q", chunks.clone()).await;
        assert_eq!(result.len(), 4);
        assert_eq!(result[0].chunk_id, "a");
    }

    #[test]
    fn sampling_bounds_count_and_budget() {
        let chunks: Vec<RetrievalChunk> = (0..8)
            .map(|i| chunk(&format!("c{i}"), &"word ".repeat(400), i as f32 * 0.1))
            .collect();
        let sample = sample_chunks(&chunks, 5, 1000);
        assert_eq!(sample.len(), 5);
        // Closest chunks come first
        assert_eq!(sample[0].chunk.chunk_id, "c0");
        let total: usize = sample.iter().map(|s| s.truncated.chars().count()).sum();
        assert!(total <= 1000 + sample.len() * 82); // per-chunk floor + ellipsis slack
    }
}
