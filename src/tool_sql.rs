//! Structured-query tool: SQL over file-backed tabular sources and pooled
//! relational connections.
//!
//! File sources (`.csv`, `.json`) are materialized into a per-invocation
//! SQLite staging table named after the source file, the query's `FROM`
//! clause is rewritten to target that staging table, and a row limit is
//! injected when the query doesn't carry one. Connection-string sources go
//! through the
//! [`SqlPoolManager`], which keys one pool per connection string by a
//! sha256-derived identifier and translates named `:param` placeholders into
//! positional form.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Row};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::OnceLock;
use tracing::debug;

use crate::config::StagingConfig;
use crate::tool::{Tool, ToolExample};

// ============ Pool Manager ============

/// One pool per registered connection string, keyed by a deterministic
/// identifier derived from the string. Owned by the application context,
/// never a module-level singleton. Connections acquired from a pool are
/// returned on drop, so every exit path releases.
pub struct SqlPoolManager {
    pools: tokio::sync::RwLock<HashMap<String, SqlitePool>>,
}

impl SqlPoolManager {
    pub fn new() -> Self {
        Self {
            pools: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Deterministic identifier for a connection string.
    pub fn pool_id(connection_string: &str) -> String {
        let digest = Sha256::digest(connection_string.as_bytes());
        hex::encode(&digest[..8])
    }

    /// Return the pool for a connection string, creating it on first use.
    pub async fn get_or_connect(&self, connection_string: &str) -> Result<SqlitePool> {
        let id = Self::pool_id(connection_string);
        {
            let pools = self.pools.read().await;
            if let Some(pool) = pools.get(&id) {
                return Ok(pool.clone());
            }
        }

        let options = SqliteConnectOptions::from_str(connection_string)
            .with_context(|| format!("invalid connection string (pool {})", id))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let mut pools = self.pools.write().await;
        // Another task may have raced us here; keep the first pool.
        let entry = pools.entry(id.clone()).or_insert_with(|| pool.clone());
        debug!(pool_id = %id, "registered connection pool");
        Ok(entry.clone())
    }

    /// Look up an already-registered pool. Unknown identifiers are a
    /// programmer error and raise.
    pub async fn get(&self, pool_id: &str) -> Result<SqlitePool> {
        let pools = self.pools.read().await;
        pools
            .get(pool_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown connection identifier '{}'", pool_id))
    }

    /// Close every held pool. Called at context teardown.
    pub async fn close_all(&self) {
        let mut pools = self.pools.write().await;
        for (_, pool) in pools.drain() {
            pool.close().await;
        }
    }
}

impl Default for SqlPoolManager {
    fn default() -> Self {
        Self::new()
    }
}

// ============ Tool ============

/// Built-in structured-data capability. Registered under `"structured_query"`.
pub struct StructuredQueryTool {
    staging: StagingConfig,
    pools: Arc<SqlPoolManager>,
}

impl StructuredQueryTool {
    pub fn new(staging: StagingConfig, pools: Arc<SqlPoolManager>) -> Self {
        Self { staging, pools }
    }
}

#[async_trait]
impl Tool for StructuredQueryTool {
    fn name(&self) -> &str {
        "structured_query"
    }

    fn description(&self) -> &str {
        "Run a SQL query against a CSV/JSON file or a registered database connection"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "SQL query; FROM is rewritten for file sources" },
                "source": { "type": "string", "description": "Path to a .csv/.json file, or a connection string" },
                "params": { "type": "object", "description": "Named :param bindings" },
                "limit": { "type": "integer", "description": "Row limit injected when the query has none" }
            },
            "required": ["query", "source"]
        })
    }

    fn output_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "rows": { "type": "array", "items": { "type": "object" } },
                "row_count": { "type": "integer" },
                "columns": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["rows", "row_count", "columns"]
        })
    }

    fn examples(&self) -> Vec<ToolExample> {
        vec![ToolExample {
            description: "Filter a CSV file".to_string(),
            input: json!({
                "query": "SELECT name, age FROM people WHERE age > :min_age",
                "source": "people.csv",
                "params": { "min_age": 30 }
            }),
            output: json!({
                "rows": [{ "name": "Ada", "age": 36 }],
                "row_count": 1,
                "columns": ["name", "age"]
            }),
        }]
    }

    async fn execute(&self, input: &Value) -> Result<Value> {
        let Some(query) = input.get("query").and_then(|v| v.as_str()) else {
            bail!("structured_query requires a 'query' string input");
        };
        let Some(source) = input.get("source").and_then(|v| v.as_str()) else {
            bail!("structured_query requires a 'source' string input");
        };
        let params = input.get("params").cloned().unwrap_or(json!({}));
        let limit = input
            .get("limit")
            .and_then(|v| v.as_i64())
            .unwrap_or(self.staging.default_row_limit);

        let lower = source.to_lowercase();
        if lower.ends_with(".csv") || lower.ends_with(".json") {
            self.query_file(query, source, &params, limit).await
        } else {
            self.query_remote(query, source, &params, limit).await
        }
    }
}

impl StructuredQueryTool {
    async fn query_file(
        &self,
        query: &str,
        source: &str,
        params: &Value,
        limit: i64,
    ) -> Result<Value> {
        // Per-invocation table name: concurrent queries over same-stem
        // sources sharing a file-backed staging database never contend on
        // one table.
        let table = format!("{}_{}", staging_table_name(source), invocation_tag());
        let tabular = load_tabular_source(source)?;

        let pool = self.staging_pool().await?;
        // Single exit: the table is dropped and the pool closed whether
        // staging or the query itself failed.
        let result = stage_and_query(&pool, &table, &tabular, query, params, limit).await;
        let _ = sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", table))
            .execute(&pool)
            .await;
        pool.close().await;
        result
    }

    async fn query_remote(
        &self,
        query: &str,
        connection_string: &str,
        params: &Value,
        limit: i64,
    ) -> Result<Value> {
        let pool = self.pools.get_or_connect(connection_string).await?;
        let sql = inject_limit(query, limit);
        run_query(&pool, &sql, params, None).await
    }

    async fn staging_pool(&self) -> Result<SqlitePool> {
        let url = if self.staging.db_path == Path::new(":memory:") {
            "sqlite::memory:".to_string()
        } else {
            if let Some(parent) = self.staging.db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            format!("sqlite:{}", self.staging.db_path.display())
        };
        let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(pool)
    }
}

// ============ File Staging ============

struct TabularSource {
    columns: Vec<String>,
    /// True when every non-empty value in the column parses as a number.
    numeric: Vec<bool>,
    rows: Vec<Vec<Option<String>>>,
}

async fn stage_and_query(
    pool: &SqlitePool,
    table: &str,
    tabular: &TabularSource,
    query: &str,
    params: &Value,
    limit: i64,
) -> Result<Value> {
    materialize(pool, table, tabular).await?;
    let sql = rewrite_from_clause(query, table);
    let sql = inject_limit(&sql, limit);
    run_query(pool, &sql, params, Some(&tabular.columns)).await
}

/// Short unique suffix for one staging invocation.
fn invocation_tag() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    id[..8].to_string()
}

/// Staging table name prefix derived from the source file stem.
fn staging_table_name(source: &str) -> String {
    let stem = Path::new(source)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("source");
    let mut name: String = stem
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if name.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        name.insert_str(0, "t_");
    }
    name
}

fn sanitize_column(raw: &str) -> String {
    let mut name: String = raw
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if name.is_empty() || name.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        name.insert_str(0, "c_");
    }
    name
}

fn load_tabular_source(source: &str) -> Result<TabularSource> {
    let content = std::fs::read_to_string(source)
        .with_context(|| format!("failed to read source file: {}", source))?;
    let tabular = if source.to_lowercase().ends_with(".json") {
        parse_json_source(&content)?
    } else {
        parse_csv_source(&content)?
    };
    if tabular.columns.is_empty() {
        bail!("source '{}' has no columns", source);
    }
    Ok(tabular)
}

/// Split CSV content into records, honoring quoted fields (including
/// embedded delimiters, newlines, and `""` escapes).
fn parse_csv_records(content: &str) -> Vec<Vec<String>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if !(record.len() == 1 && record[0].is_empty()) {
                    records.push(std::mem::take(&mut record));
                } else {
                    record.clear();
                }
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    records
}

fn parse_csv_source(content: &str) -> Result<TabularSource> {
    let mut records = parse_csv_records(content).into_iter();
    let Some(header) = records.next() else {
        bail!("CSV source is empty");
    };
    let columns: Vec<String> = header.iter().map(|h| sanitize_column(h)).collect();

    let mut rows = Vec::new();
    for record in records {
        let mut row: Vec<Option<String>> = record
            .into_iter()
            .map(|v| if v.is_empty() { None } else { Some(v) })
            .collect();
        row.resize(columns.len(), None);
        row.truncate(columns.len());
        rows.push(row);
    }

    let numeric = infer_numeric(&columns, &rows);
    Ok(TabularSource {
        columns,
        numeric,
        rows,
    })
}

/// Parse a JSON source: a top-level array of flat objects. Column order is
/// first-seen key order across the array.
fn parse_json_source(content: &str) -> Result<TabularSource> {
    let value: Value = serde_json::from_str(content).context("invalid JSON source")?;
    let Some(items) = value.as_array() else {
        bail!("JSON source must be a top-level array of objects");
    };

    let mut columns: Vec<String> = Vec::new();
    for item in items {
        if let Some(obj) = item.as_object() {
            for key in obj.keys() {
                let name = sanitize_column(key);
                if !columns.contains(&name) {
                    columns.push(name);
                }
            }
        }
    }

    let mut rows = Vec::new();
    for item in items {
        let Some(obj) = item.as_object() else {
            continue;
        };
        let by_name: Map<String, Value> = obj
            .iter()
            .map(|(k, v)| (sanitize_column(k), v.clone()))
            .collect();
        let row = columns
            .iter()
            .map(|col| match by_name.get(col) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(other) => Some(other.to_string()),
            })
            .collect();
        rows.push(row);
    }

    let numeric = infer_numeric(&columns, &rows);
    Ok(TabularSource {
        columns,
        numeric,
        rows,
    })
}

fn infer_numeric(columns: &[String], rows: &[Vec<Option<String>>]) -> Vec<bool> {
    (0..columns.len())
        .map(|i| {
            let mut saw_value = false;
            for row in rows {
                if let Some(Some(v)) = row.get(i) {
                    saw_value = true;
                    if v.trim().parse::<f64>().is_err() {
                        return false;
                    }
                }
            }
            saw_value
        })
        .collect()
}

async fn materialize(pool: &SqlitePool, table: &str, source: &TabularSource) -> Result<()> {
    sqlx::query(&format!("DROP TABLE IF EXISTS \"{}\"", table))
        .execute(pool)
        .await?;

    let column_defs: Vec<String> = source
        .columns
        .iter()
        .zip(&source.numeric)
        .map(|(name, numeric)| {
            format!("\"{}\" {}", name, if *numeric { "REAL" } else { "TEXT" })
        })
        .collect();
    sqlx::query(&format!(
        "CREATE TABLE \"{}\" ({})",
        table,
        column_defs.join(", ")
    ))
    .execute(pool)
    .await?;

    let placeholders = vec!["?"; source.columns.len()].join(", ");
    let insert = format!("INSERT INTO \"{}\" VALUES ({})", table, placeholders);
    for row in &source.rows {
        let mut query = sqlx::query(&insert);
        for (value, numeric) in row.iter().zip(&source.numeric) {
            match value {
                None => query = query.bind(Option::<String>::None),
                Some(v) if *numeric => query = query.bind(v.trim().parse::<f64>().unwrap_or(0.0)),
                Some(v) => query = query.bind(v.clone()),
            }
        }
        query.execute(pool).await?;
    }
    Ok(())
}

// ============ Query Rewriting ============

fn from_clause_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)\bFROM\s+("[^"]+"|[A-Za-z_][\w.]*)"#).unwrap())
}

fn limit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bLIMIT\b").unwrap())
}

fn named_param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r":([A-Za-z_]\w*)").unwrap())
}

/// Point the first `FROM` clause at the staging table.
fn rewrite_from_clause(query: &str, table: &str) -> String {
    from_clause_re()
        .replace(query, format!("FROM \"{}\"", table).as_str())
        .into_owned()
}

/// Append `LIMIT n` when the caller's limit isn't already in the query text.
fn inject_limit(query: &str, limit: i64) -> String {
    let trimmed = query.trim().trim_end_matches(';').to_string();
    if limit_re().is_match(&trimmed) {
        trimmed
    } else {
        format!("{} LIMIT {}", trimmed, limit)
    }
}

/// Translate named `:param` placeholders into positional `?` form, returning
/// the rewritten SQL and the parameter names in positional order.
fn translate_named_params(query: &str) -> (String, Vec<String>) {
    let mut names = Vec::new();
    let sql = named_param_re()
        .replace_all(query, |caps: &regex::Captures| {
            names.push(caps[1].to_string());
            "?".to_string()
        })
        .into_owned();
    (sql, names)
}

async fn run_query(
    pool: &SqlitePool,
    sql: &str,
    params: &Value,
    source_columns: Option<&[String]>,
) -> Result<Value> {
    let (sql, names) = translate_named_params(sql);

    let mut query = sqlx::query(&sql);
    for name in &names {
        let Some(value) = params.get(name) else {
            bail!("missing value for named parameter ':{}'", name);
        };
        query = match value {
            Value::Null => query.bind(Option::<String>::None),
            Value::Bool(b) => query.bind(*b),
            Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap()),
            Value::Number(n) => query.bind(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => query.bind(s.clone()),
            other => query.bind(other.to_string()),
        };
    }

    let rows = query.fetch_all(pool).await.context("query failed")?;

    let columns: Vec<String> = match rows.first() {
        Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
        None => source_columns.map(|c| c.to_vec()).unwrap_or_default(),
    };

    let out_rows: Vec<Value> = rows
        .iter()
        .map(|row| {
            let mut obj = Map::new();
            for (i, col) in row.columns().iter().enumerate() {
                obj.insert(col.name().to_string(), column_value(row, i));
            }
            Value::Object(obj)
        })
        .collect();

    Ok(json!({
        "rows": out_rows,
        "row_count": out_rows.len(),
        "columns": columns,
    }))
}

fn column_value(row: &SqliteRow, i: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<String>, _>(i) {
        return v.map(Value::from).unwrap_or(Value::Null);
    }
    Value::Null
}
