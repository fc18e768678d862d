//! # Query Harness
//!
//! A query orchestration and response-quality core for retrieval-augmented
//! answering.
//!
//! Query Harness turns a user query into an executable plan over a tool
//! registry (document retrieval, arithmetic, structured data queries), runs
//! the plan strictly in order, and pushes the assembled answer through a
//! synthesize → evaluate → refine quality loop until it clears a configured
//! bar or the iteration cap. Every model call that can fail lands on a
//! named deterministic fallback, so the core always returns a best-effort
//! answer.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌─────────┐   ┌──────────────────┐
//! │ Analyzer │──▶│ Planner │──▶│     Executor      │
//! │          │   │         │   │ tool │ tool │ ... │
//! └──────────┘   └─────────┘   └────────┬─────────┘
//!                                       │
//!            ┌────────────┐             ▼
//!            │  Registry  │◀──── tools: retrieval
//!            │            │      (judge-advised),
//!            └────────────┘      calculator, sql
//!                                       │
//!                                       ▼
//!                          ┌─────────────────────────┐
//!                          │ Quality Pipeline         │
//!                          │ synthesize→evaluate→refine│
//!                          └────────────┬────────────┘
//!                                       ▼
//!                                 Process Log
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`llm`] | Language model provider abstraction |
//! | [`extract`] | Layered JSON extraction from model output |
//! | [`vector_store`] | Vector store abstraction |
//! | [`tool`] | Tool trait and registry |
//! | [`tool_retrieval`] | Document retrieval tool |
//! | [`tool_calc`] | Arithmetic tool |
//! | [`tool_sql`] | Structured query tool |
//! | [`judge`] | LLM retrieval judge |
//! | [`analyzer`] | Query complexity analysis |
//! | [`planner`] | Plan construction |
//! | [`executor`] | Sequential plan execution |
//! | [`synthesizer`] | Cited answer synthesis |
//! | [`evaluator`] | Rubric-based response evaluation |
//! | [`refiner`] | Bounded response refinement |
//! | [`pipeline`] | Response quality pipeline |
//! | [`process_log`] | Per-query audit trail |

pub mod analyzer;
pub mod config;
pub mod evaluator;
pub mod executor;
pub mod extract;
pub mod judge;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod planner;
pub mod process_log;
pub mod refiner;
pub mod synthesizer;
pub mod tool;
pub mod tool_calc;
pub mod tool_retrieval;
pub mod tool_sql;
pub mod vector_store;
