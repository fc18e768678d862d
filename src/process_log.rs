//! Append-only per-query process log.
//!
//! One growing record per query id in a shared map: every pipeline stage
//! and executor step appends an entry, and the final response is recorded
//! as the terminal block. The record serializes to JSON, the only durable
//! artifact this crate deliberately produces, and feeds the optional
//! [`AuditReporter`].
//!
//! Concurrent queries never collide: each owns a distinct key, and appends
//! to a given record are serialized by the interior `RwLock`.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

/// One logged step: name, timestamp, and an opaque data payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessLogEntry {
    pub step_name: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// The terminal record for a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResponse {
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

/// The full audit trail for one query id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRecord {
    pub query_id: String,
    pub query_text: String,
    pub started_at: DateTime<Utc>,
    pub entries: Vec<ProcessLogEntry>,
    pub final_response: Option<FinalResponse>,
    pub audit_report: Option<Value>,
}

/// Shared, append-only log keyed by query id.
pub struct ProcessLog {
    records: RwLock<HashMap<String, QueryRecord>>,
}

impl ProcessLog {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Open the record for a query. Idempotent: re-starting an existing id
    /// keeps the original record.
    pub fn start_query(&self, query_id: &str, query_text: &str) {
        let mut records = self.records.write().unwrap();
        records
            .entry(query_id.to_string())
            .or_insert_with(|| QueryRecord {
                query_id: query_id.to_string(),
                query_text: query_text.to_string(),
                started_at: Utc::now(),
                entries: Vec::new(),
                final_response: None,
                audit_report: None,
            });
    }

    /// Append a step entry. Unknown query ids get a record implicitly so a
    /// missed `start_query` never loses entries.
    pub fn log_step(&self, query_id: &str, step_name: &str, data: Value) {
        let mut records = self.records.write().unwrap();
        let record = records
            .entry(query_id.to_string())
            .or_insert_with(|| QueryRecord {
                query_id: query_id.to_string(),
                query_text: String::new(),
                started_at: Utc::now(),
                entries: Vec::new(),
                final_response: None,
                audit_report: None,
            });
        record.entries.push(ProcessLogEntry {
            step_name: step_name.to_string(),
            timestamp: Utc::now(),
            data,
        });
    }

    /// Record the final response and its metadata for a query.
    pub fn set_final_response(&self, query_id: &str, text: &str, metadata: Value) {
        let mut records = self.records.write().unwrap();
        if let Some(record) = records.get_mut(query_id) {
            record.final_response = Some(FinalResponse {
                text: text.to_string(),
                timestamp: Utc::now(),
                metadata,
            });
        }
    }

    pub fn attach_audit_report(&self, query_id: &str, report: Value) {
        let mut records = self.records.write().unwrap();
        if let Some(record) = records.get_mut(query_id) {
            record.audit_report = Some(report);
        }
    }

    /// Snapshot of one query's record.
    pub fn get_record(&self, query_id: &str) -> Option<QueryRecord> {
        self.records.read().unwrap().get(query_id).cloned()
    }

    /// Serialize one query's record to JSON.
    pub fn export_json(&self, query_id: &str) -> Result<String> {
        let record = self
            .get_record(query_id)
            .ok_or_else(|| anyhow::anyhow!("no process log record for query '{}'", query_id))?;
        Ok(serde_json::to_string_pretty(&record)?)
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }
}

impl Default for ProcessLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Generates an audit report for a query from its process log record.
#[async_trait]
pub trait AuditReporter: Send + Sync {
    async fn generate_report(&self, query_id: &str, include_analysis: bool) -> Result<Value>;
}

/// Default reporter: summarizes step counts and timings straight from the
/// process log, optionally embedding every entry's data payload.
pub struct ProcessLogAuditReporter {
    log: std::sync::Arc<ProcessLog>,
}

impl ProcessLogAuditReporter {
    pub fn new(log: std::sync::Arc<ProcessLog>) -> Self {
        Self { log }
    }
}

#[async_trait]
impl AuditReporter for ProcessLogAuditReporter {
    async fn generate_report(&self, query_id: &str, include_analysis: bool) -> Result<Value> {
        let record = self
            .log
            .get_record(query_id)
            .ok_or_else(|| anyhow::anyhow!("no process log record for query '{}'", query_id))?;

        let mut step_counts: HashMap<String, usize> = HashMap::new();
        for entry in &record.entries {
            *step_counts.entry(entry.step_name.clone()).or_default() += 1;
        }

        let span_ms = record
            .entries
            .last()
            .map(|last| (last.timestamp - record.started_at).num_milliseconds())
            .unwrap_or(0);

        let mut report = serde_json::json!({
            "query_id": record.query_id,
            "query_text": record.query_text,
            "entry_count": record.entries.len(),
            "step_counts": step_counts,
            "span_ms": span_ms,
            "final_response_recorded": record.final_response.is_some(),
        });
        if include_analysis {
            report["entries"] = serde_json::to_value(&record.entries)?;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn entries_accumulate_per_query() {
        let log = ProcessLog::new();
        log.start_query("q1", "what is x");
        log.log_step("q1", "analyze", json!({"complexity": "simple"}));
        log.log_step("q1", "step_start", json!({"step": "retrieval"}));
        log.log_step("q2", "analyze", json!({}));

        let record = log.get_record("q1").unwrap();
        assert_eq!(record.entries.len(), 2);
        assert_eq!(record.query_text, "what is x");
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn final_response_is_terminal_block() {
        let log = ProcessLog::new();
        log.start_query("q1", "t");
        log.set_final_response("q1", "answer", json!({"score": 8.0}));

        let record = log.get_record("q1").unwrap();
        let final_response = record.final_response.unwrap();
        assert_eq!(final_response.text, "answer");
        assert_eq!(final_response.metadata["score"], 8.0);
    }

    #[test]
    fn export_round_trips_through_serde() {
        let log = ProcessLog::new();
        log.start_query("q1", "t");
        log.log_step("q1", "analyze", json!({"a": 1}));
        let json_text = log.export_json("q1").unwrap();
        let parsed: QueryRecord = serde_json::from_str(&json_text).unwrap();
        assert_eq!(parsed.query_id, "q1");
        assert_eq!(parsed.entries.len(), 1);

        assert!(log.export_json("missing").is_err());
    }

    #[tokio::test]
    async fn audit_reporter_summarizes_record() {
        let log = Arc::new(ProcessLog::new());
        log.start_query("q1", "t");
        log.log_step("q1", "step_start", json!({}));
        log.log_step("q1", "step_complete", json!({}));
        log.log_step("q1", "step_start", json!({}));

        let reporter = ProcessLogAuditReporter::new(log.clone());
        let report = reporter.generate_report("q1", false).await.unwrap();
        assert_eq!(report["entry_count"], 3);
        assert_eq!(report["step_counts"]["step_start"], 2);
        assert!(report.get("entries").is_none());

        let with_entries = reporter.generate_report("q1", true).await.unwrap();
        assert_eq!(with_entries["entries"].as_array().unwrap().len(), 3);

        assert!(reporter.generate_report("missing", false).await.is_err());
    }
}
