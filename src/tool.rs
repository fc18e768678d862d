//! Tool trait and registry.
//!
//! A [`Tool`] is a capability unit the planner can schedule and the executor
//! can invoke uniformly: document retrieval, arithmetic, and structured-data
//! query are the built-ins. The [`ToolRegistry`] is built once at startup
//! and is read-mostly thereafter; it is shared across concurrent queries
//! behind an `Arc` without further locking.
//!
//! ```rust
//! use query_harness::tool::ToolRegistry;
//! use query_harness::tool_calc::CalculatorTool;
//! use std::sync::Arc;
//!
//! let mut registry = ToolRegistry::new();
//! registry.register(Arc::new(CalculatorTool::new()));
//! assert!(registry.get("calculator").is_some());
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// A worked example of invoking a tool, surfaced to the analyzer prompt
/// and to callers via [`ToolRegistry::get_tool_examples`].
#[derive(Debug, Clone, Serialize)]
pub struct ToolExample {
    pub description: String,
    pub input: Value,
    pub output: Value,
}

/// A named capability invoked by the plan executor.
///
/// `execute` must convert internal failures into `Err`; the executor wraps
/// every call in a failure boundary that turns an `Err` into an error
/// payload on the step result, so a failing tool never aborts a plan.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier used in plans (e.g. `"calculator"`).
    fn name(&self) -> &str;

    /// One-line description for agent discovery and analyzer prompts.
    fn description(&self) -> &str;

    /// JSON Schema for the input map.
    fn input_schema(&self) -> Value;

    /// JSON Schema for the success payload.
    fn output_schema(&self) -> Value;

    /// Worked examples. Defaults to none.
    fn examples(&self) -> Vec<ToolExample> {
        Vec::new()
    }

    /// Execute the tool with a JSON input map.
    async fn execute(&self, input: &Value) -> Result<Value>;
}

/// Name → tool capability map, resolved once at registry-build time.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty tool registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool under its own name. Re-registering a name replaces
    /// the previous entry.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// All registered tools, sorted by name for stable prompt rendering.
    pub fn list_tools(&self) -> Vec<Arc<dyn Tool>> {
        let mut tools: Vec<Arc<dyn Tool>> = self.tools.values().cloned().collect();
        tools.sort_by(|a, b| a.name().cmp(b.name()));
        tools
    }

    /// Worked examples for a named tool, or `None` when unregistered.
    pub fn get_tool_examples(&self, name: &str) -> Option<Vec<ToolExample>> {
        self.tools.get(name).map(|t| t.examples())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "Echo the input back"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        fn output_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
        fn examples(&self) -> Vec<ToolExample> {
            vec![ToolExample {
                description: "echo hello".to_string(),
                input: json!({"text": "hello"}),
                output: json!({"text": "hello"}),
            }]
        }
        async fn execute(&self, input: &Value) -> Result<Value> {
            Ok(input.clone())
        }
    }

    #[test]
    fn register_and_lookup() {
        let mut registry = ToolRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(EchoTool));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("echo").is_some());
        assert!(registry.get("missing").is_none());
        assert!(registry.contains("echo"));
    }

    #[test]
    fn examples_come_from_the_tool() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        let examples = registry.get_tool_examples("echo").unwrap();
        assert_eq!(examples.len(), 1);
        assert!(registry.get_tool_examples("missing").is_none());
    }

    #[test]
    fn list_is_sorted_by_name() {
        struct Named(&'static str);
        #[async_trait]
        impl Tool for Named {
            fn name(&self) -> &str {
                self.0
            }
            fn description(&self) -> &str {
                ""
            }
            fn input_schema(&self) -> Value {
                json!({})
            }
            fn output_schema(&self) -> Value {
                json!({})
            }
            async fn execute(&self, _input: &Value) -> Result<Value> {
                Ok(json!({}))
            }
        }

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Named("zeta")));
        registry.register(Arc::new(Named("alpha")));
        let tools = registry.list_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }
}
