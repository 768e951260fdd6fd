//! Tool registry for managing available tools.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::tools::tool::{Tool, ToolDefinition, ToolResult};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register a tool, replacing any tool of the same name.
    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.write().await.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "Replaced an existing tool registration");
        } else {
            tracing::debug!("Registered tool: {}", name);
        }
    }

    /// Get a tool by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    /// Check if a tool exists.
    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// List all tool names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get tool definitions for LLM function calling.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .read()
            .await
            .values()
            .map(|tool| tool.definition())
            .collect()
    }

    /// Invoke a tool by name. Unknown names produce an error result.
    pub async fn execute(&self, name: &str, params: serde_json::Value) -> ToolResult {
        let Some(tool) = self.get(name).await else {
            return ToolResult::error(format!("Unknown tool: {name}"));
        };
        let result = tool.execute(params).await;
        if result.is_error {
            tracing::warn!(tool = %name, "Tool returned an error: {}", result.for_llm);
        }
        result
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
    use async_trait::async_trait;

    #[derive(Debug)]
    struct MockTool {
        name: String,
    }

    #[async_trait]
    impl Tool for MockTool {
        fn name(&self) -> &str {
            &self.name
        }
        fn description(&self) -> &str {
            "A mock tool for testing"
        }
        fn parameters_schema(&self) -> serde_json::Value {
            serde_json::json!({"type": "object", "properties": {}})
        }
        async fn execute(&self, _params: serde_json::Value) -> ToolResult {
            ToolResult::new("mock")
        }
    }

    fn mock(name: &str) -> Arc<MockTool> {
        Arc::new(MockTool {
            name: name.to_string(),
        })
    }

    #[tokio::test]
    async fn test_register_and_get() {
        let registry = ToolRegistry::new();
        registry.register(mock("test_tool")).await;
        assert!(registry.has("test_tool").await);
        assert!(!registry.has("nonexistent").await);

        let retrieved = registry.get("test_tool").await;
        assert!(retrieved.is_some());
        assert_eq!(retrieved.unwrap().name(), "test_tool");
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let registry = ToolRegistry::new();
        registry.register(mock("b")).await;
        registry.register(mock("a")).await;
        assert_eq!(registry.list().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_tool_definitions() {
        let registry = ToolRegistry::new();
        registry.register(mock("my_tool")).await;

        let defs = registry.tool_definitions().await;
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "my_tool");
        assert_eq!(defs[0].description, "A mock tool for testing");
    }

    #[tokio::test]
    async fn test_execute_known_and_unknown() {
        let registry = ToolRegistry::new();
        registry.register(mock("echo")).await;

        assert_eq!(
            registry.execute("echo", serde_json::json!({})).await,
            ToolResult::new("mock")
        );
        let missing = registry.execute("nope", serde_json::json!({})).await;
        assert!(missing.is_error);
        assert!(missing.for_llm.contains("nope"));
    }
}
