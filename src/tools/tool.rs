//! Tool trait and the result envelope every invocation returns.

use async_trait::async_trait;
use serde::Serialize;

pub use crate::error::ToolError;

/// Outcome of a tool invocation.
///
/// `for_llm` always goes back to the model. `for_user` is shown to the
/// user when present and the result is not silent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResult {
    pub for_llm: String,
    pub for_user: Option<String>,
    pub silent: bool,
    pub is_error: bool,
}

impl ToolResult {
    /// Result for the model only; the user sees nothing unless
    /// [`with_user`](Self::with_user) adds a message.
    pub fn new(for_llm: impl Into<String>) -> Self {
        Self {
            for_llm: for_llm.into(),
            for_user: None,
            silent: false,
            is_error: false,
        }
    }

    /// Result the user should not be notified about.
    pub fn silent(for_llm: impl Into<String>) -> Self {
        Self {
            silent: true,
            ..Self::new(for_llm)
        }
    }

    /// Same text for the model and the user.
    pub fn user(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            for_user: Some(content.clone()),
            ..Self::new(content)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::new(message)
        }
    }

    pub fn with_user(mut self, for_user: impl Into<String>) -> Self {
        self.for_user = Some(for_user.into());
        self
    }

    /// What the user should see, if anything.
    pub fn user_message(&self) -> Option<&str> {
        if self.silent {
            None
        } else {
            self.for_user.as_deref()
        }
    }
}

impl From<ToolError> for ToolResult {
    fn from(err: ToolError) -> Self {
        ToolResult::error(err.to_string())
    }
}

/// Name, description and parameter schema, as advertised to the model.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A capability the agent can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the parameters object.
    fn parameters_schema(&self) -> serde_json::Value;

    /// Run the tool. Failures are reported inside the result, never raised.
    async fn execute(&self, params: serde_json::Value) -> ToolResult;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Fetch a required, non-blank string parameter.
pub fn require_str<'a>(
    tool: &str,
    params: &'a serde_json::Value,
    key: &str,
) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ToolError::InvalidParameters {
            name: tool.to_string(),
            reason: format!("missing required parameter '{key}'"),
        })
}

/// Fetch an optional string parameter; blank counts as absent.
pub fn optional_str<'a>(params: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}
