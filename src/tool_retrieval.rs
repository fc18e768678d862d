//! Document retrieval tool over a [`VectorStore`], optionally judge-advised.
//!
//! With a judge attached, retrieval is adaptive: the judge recommends
//! `top_k` and a relevance threshold, scores the retrieved batch, retries
//! once with a rewritten query when the batch looks weak, and reorders the
//! surviving chunks for synthesis. Without a judge it is a plain top-k
//! lookup.

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::judge::RetrievalJudge;
use crate::models::RetrievalChunk;
use crate::tool::{Tool, ToolExample};
use crate::vector_store::VectorStore;

const DEFAULT_TOP_K: usize = 5;

pub struct RetrievalTool {
    store: Arc<dyn VectorStore>,
    judge: Option<Arc<RetrievalJudge>>,
}

impl RetrievalTool {
    pub fn new(store: Arc<dyn VectorStore>, judge: Option<Arc<RetrievalJudge>>) -> Self {
        Self { store, judge }
    }
}

#[async_trait]
impl Tool for RetrievalTool {
    fn name(&self) -> &str {
        "retrieval"
    }

    fn description(&self) -> &str {
        "Retrieve document chunks relevant to a query from the vector store"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "top_k": { "type": "integer", "default": DEFAULT_TOP_K },
                "filters": {
                    "type": "object",
                    "properties": {
                        "document_id": { "type": "string" },
                        "folder": { "type": "string" },
                        "tag": { "type": "string" }
                    }
                },
                "use_judge": { "type": "boolean", "description": "Consult the retrieval judge", "default": true }
            },
            "required": ["query"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "chunks": { "type": "array", "items": { "type": "object" } },
                "count": { "type": "integer" },
                "query_used": { "type": "string" }
            },
            "required": ["chunks", "count", "query_used"]
        })
    }

    fn examples(&self) -> Vec<ToolExample> {
        vec![ToolExample {
            description: "Plain top-k lookup".to_string(),
            input: json!({ "query": "deployment runbook", "top_k": 3 }),
            output: json!({ "chunks": [], "count": 0, "query_used": "deployment runbook" }),
        }]
    }

    async fn execute(&self, input: &Value) -> Result<Value> {
        let Some(query) = input.get("query").and_then(|v| v.as_str()) else {
            bail!("retrieval requires a 'query' string input");
        };
        let requested_k = input
            .get("top_k")
            .and_then(|v| v.as_u64())
            .map(|k| k as usize);
        let filters = input.get("filters");
        let use_judge = input
            .get("use_judge")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);

        let judge = self.judge.as_ref().filter(|_| use_judge);

        let (top_k, threshold) = match judge {
            Some(judge) => {
                let advice = judge.analyze_query(query).await;
                debug!(
                    top_k = advice.top_k,
                    threshold = advice.relevance_threshold,
                    rerank = advice.rerank,
                    "retrieval advice"
                );
                // An explicit caller top_k wins over the advice.
                (
                    requested_k.unwrap_or(advice.top_k),
                    Some((advice.relevance_threshold, advice.rerank)),
                )
            }
            None => (requested_k.unwrap_or(DEFAULT_TOP_K), None),
        };

        let mut query_used = query.to_string();
        let mut chunks = self.store.search(query, top_k, filters).await?;

        if let (Some(judge), Some((threshold, rerank))) = (judge, threshold) {
            chunks.retain(|c| c.relevance() >= threshold);

            if !chunks.is_empty() {
                let evaluation = judge.evaluate_chunks(query, &chunks).await;
                if evaluation.needs_refinement {
                    let refined = judge.refine_query(query, &chunks).await;
                    if refined != query {
                        debug!(refined = %refined, "retrying retrieval with refined query");
                        let retried = self.store.search(&refined, top_k, filters).await?;
                        if !retried.is_empty() {
                            chunks = retried;
                            chunks.retain(|c| c.relevance() >= threshold);
                            query_used = refined;
                        }
                    }
                }
            }

            if rerank {
                chunks = judge.optimize_context(&query_used, chunks).await;
            }
        }

        Ok(json!({
            "chunks": chunks_to_json(&chunks),
            "count": chunks.len(),
            "query_used": query_used,
        }))
    }
}

fn chunks_to_json(chunks: &[RetrievalChunk]) -> Vec<Value> {
    chunks
        .iter()
        .map(|c| {
            json!({
                "chunk_id": c.chunk_id,
                "content": c.content,
                "metadata": c.metadata,
                "distance": c.distance,
                "relevance": c.relevance(),
            })
        })
        .collect()
}
