//! Tools callable by workers from inside a run
//!
//! A tool is an `async_trait` object with a name, a JSON schema for its input
//! and a `call` method. Each [`WorkerProfile`](crate::WorkerProfile) carries the
//! [`ToolSet`] the runtime exposes to that worker.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use troupe_core::{Result, TroupeError};

/// Call-site context the runtime passes with every tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    /// Session of the run making the call
    pub session_id: String,
    /// Run making the call, if the runtime exposes it
    pub run_id: Option<String>,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            run_id: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

/// Serializable description of a tool, as shown to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// A capability a worker can invoke
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name
    fn name(&self) -> &str;

    /// One-line description shown to the model
    fn description(&self) -> &str;

    /// JSON schema of the input object
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool
    async fn call(&self, ctx: &ToolContext, input: serde_json::Value) -> Result<serde_json::Value>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

/// Ordered set of tools keyed by name
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool unless one with the same name is already present
    ///
    /// Returns whether the tool was added.
    pub fn insert(&mut self, tool: Arc<dyn Tool>) -> bool {
        if self.contains(tool.name()) {
            return false;
        }
        self.tools.push(tool);
        true
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Self {
        self.insert(tool);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name() == name)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Dispatch a call by tool name
    pub async fn call(
        &self,
        name: &str,
        ctx: &ToolContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| TroupeError::UnknownTool(name.to_string()))?;
        tool.call(ctx, input).await
    }
}

impl std::fmt::Debug for ToolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Deserialize a tool input into its typed form
///
/// Missing input (`null`) is treated as an empty object so tools whose fields
/// are all optional can be called without arguments.
pub fn parse_tool_input<T: DeserializeOwned>(tool: &str, input: serde_json::Value) -> Result<T> {
    let input = if input.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        input
    };
    serde_json::from_value(input).map_err(|e| TroupeError::ToolInput {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "Return the input unchanged"
        }

        fn input_schema(&self) -> serde_json::Value {
            json!({"type": "object"})
        }

        async fn call(&self, _ctx: &ToolContext, input: serde_json::Value) -> Result<serde_json::Value> {
            Ok(input)
        }
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct LimitInput {
        limit: Option<usize>,
    }

    #[test]
    fn test_insert_skips_duplicate_names() {
        let mut tools = ToolSet::new();
        assert!(tools.insert(Arc::new(Echo)));
        assert!(!tools.insert(Arc::new(Echo)));
        assert_eq!(tools.len(), 1);
        assert_eq!(tools.names(), vec!["echo"]);
    }

    #[tokio::test]
    async fn test_call_dispatches_by_name() {
        let tools = ToolSet::new().with_tool(Arc::new(Echo));
        let ctx = ToolContext::new("session-1");
        let out = tools.call("echo", &ctx, json!({"a": 1})).await.unwrap();
        assert_eq!(out, json!({"a": 1}));

        let err = tools.call("missing", &ctx, json!({})).await.unwrap_err();
        assert!(matches!(err, TroupeError::UnknownTool(_)));
    }

    #[test]
    fn test_parse_tool_input_null_is_empty_object() {
        let input: LimitInput = parse_tool_input("t", serde_json::Value::Null).unwrap();
        assert!(input.limit.is_none());
    }

    #[test]
    fn test_parse_tool_input_rejects_unknown_fields() {
        let err = parse_tool_input::<LimitInput>("t", json!({"limt": 3})).unwrap_err();
        assert!(matches!(err, TroupeError::ToolInput { .. }));
    }
}
