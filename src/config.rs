use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub judge: JudgeConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub staging: StagingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Environment variable holding the API key; unset means no auth header.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: None,
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            temperature: default_temperature(),
        }
    }
}

fn default_base_url() -> String {
    "http://127.0.0.1:11434/v1".to_string()
}
fn default_model() -> String {
    "qwen3:8b".to_string()
}
fn default_timeout_secs() -> u64 {
    120
}
fn default_max_retries() -> u32 {
    3
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct JudgeConfig {
    #[serde(default = "default_judge_top_k")]
    pub default_top_k: usize,
    #[serde(default = "default_judge_threshold")]
    pub default_threshold: f32,
    #[serde(default = "default_judge_rerank")]
    pub default_rerank: bool,
    /// Upper bound on chunks sent to the model in one judge call.
    #[serde(default = "default_max_sample_chunks")]
    pub max_sample_chunks: usize,
    /// Character budget for the sampled chunk content, split proportionally.
    #[serde(default = "default_sample_char_budget")]
    pub sample_char_budget: usize,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            default_top_k: default_judge_top_k(),
            default_threshold: default_judge_threshold(),
            default_rerank: default_judge_rerank(),
            max_sample_chunks: default_max_sample_chunks(),
            sample_char_budget: default_sample_char_budget(),
        }
    }
}

fn default_judge_top_k() -> usize {
    10
}
fn default_judge_threshold() -> f32 {
    0.4
}
fn default_judge_rerank() -> bool {
    true
}
fn default_max_sample_chunks() -> usize {
    5
}
fn default_sample_char_budget() -> usize {
    4000
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Overall score (0 to 10) a response must reach to skip refinement.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f32,
    #[serde(default = "default_max_refinement_iterations")]
    pub max_refinement_iterations: u32,
    /// Incoming evaluations at or above this score short-circuit the refiner.
    #[serde(default = "default_refinement_skip_score")]
    pub refinement_skip_score: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quality_threshold: default_quality_threshold(),
            max_refinement_iterations: default_max_refinement_iterations(),
            refinement_skip_score: default_refinement_skip_score(),
        }
    }
}

fn default_quality_threshold() -> f32 {
    7.0
}
fn default_max_refinement_iterations() -> u32 {
    2
}
fn default_refinement_skip_score() -> f32 {
    9.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct StagingConfig {
    /// SQLite database used to stage file-backed tabular sources.
    /// `:memory:` keeps staging tables per-connection and ephemeral.
    #[serde(default = "default_staging_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_row_limit")]
    pub default_row_limit: i64,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            db_path: default_staging_path(),
            default_row_limit: default_row_limit(),
        }
    }
}

fn default_staging_path() -> PathBuf {
    PathBuf::from(":memory:")
}
fn default_row_limit() -> i64 {
    100
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    Ok(config)
}
