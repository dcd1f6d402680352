use async_trait::async_trait;
use qaguardian_core::{Scope, ScopeSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Describes a tool's interface for MCP clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique tool name (e.g., "list_projects", "run_test")
    pub name: String,
    /// Human-readable description for the agent
    pub description: String,
    /// JSON Schema describing the expected input
    pub input_schema: Value,
    /// Scope a caller must hold. When absent the scope policy infers it
    /// from the tool name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_scope: Option<Scope>,
}

/// Result of executing a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    /// Structured result payload
    pub content: Value,
    /// Whether this result represents a tool-reported failure
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    /// The result's item list, if it has one: either a top-level array or an
    /// object carrying an `items` array.
    pub fn items(&self) -> Option<&Vec<Value>> {
        match &self.content {
            Value::Array(items) => Some(items),
            Value::Object(map) => map.get("items").and_then(Value::as_array),
            _ => None,
        }
    }
}

/// Context passed to tool execution: who is calling and which request this is.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Opaque hash identifying the calling credential
    pub key_hash: String,
    /// Scopes granted to the caller
    pub scopes: ScopeSet,
    /// JSON-RPC request id, rendered as a string
    pub request_id: String,
}

/// The primary extension point: every remote operation implements this trait.
///
/// Tools are object-safe, Send + Sync, and async.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Returns the tool's definition (name, description, JSON Schema).
    fn definition(&self) -> ToolDefinition;

    /// Execute the tool with the given JSON input.
    async fn execute(&self, input: Value, context: &ToolContext) -> Result<ToolResult, ToolError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
    /// The caller is authenticated and scoped, but this specific resource or
    /// action is forbidden to them.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),
    /// The backing API answered 404.
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Timeout after {0:?}")]
    Timeout(std::time::Duration),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl fmt::Display for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.description)
    }
}

/// Echoes its input back. Registered by the server binary as a smoke test.
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            description: "Echoes back the input message.".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "message": {
                        "type": "string",
                        "description": "The message to echo back"
                    }
                },
                "required": ["message"]
            }),
            required_scope: Some(Scope::Read),
        }
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let message = input
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing 'message' field".to_string()))?;

        Ok(ToolResult::success(serde_json::json!({ "message": message })))
    }
}
