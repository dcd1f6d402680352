//! Error types for the MCP crate.
//!
//! [`McpError::to_rpc_error`] is the one place an error kind becomes a
//! JSON-RPC code and `data` payload. Nothing in `data` may carry credentials,
//! tool payloads or lists of real resources.

use qaguardian_core::{Scope, ScopeSet, ACCEPTED_SCOPES};
use serde::Serialize;
use serde_json::json;

use crate::resources::{EXAMPLE_URIS, RESOURCE_PATTERNS, URI_FORMAT};
use crate::types::{error_codes, JsonRpcError};

/// Queue state captured when an admission wait gives up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueTimeoutInfo {
    pub max_concurrency: usize,
    pub active_count: usize,
    pub queue_length: usize,
    /// 1-based position this call held when it timed out.
    pub queue_position: usize,
    pub waited_ms: u64,
    pub retry_after_ms: u64,
}

/// Errors that can occur during MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Failed to parse JSON.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// An inbound line that cannot even be read as text.
    #[error("Parse error: {0}")]
    MalformedMessage(String),

    /// Transport I/O error.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The request envelope is not valid JSON-RPC.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The requested method is not supported.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Invalid parameters for a method.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The requested tool was not found in the registry.
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    /// No API key was supplied and the server requires one.
    #[error("Authentication required")]
    AuthenticationRequired,

    /// A key was supplied but is unknown or malformed.
    #[error("Invalid API key")]
    InvalidApiKey,

    /// The identity lacks the scope the tool requires.
    #[error("Insufficient scope: '{tool}' requires '{}'", .required.granting_token())]
    InsufficientScope {
        tool: String,
        required: Scope,
        granted: ScopeSet,
    },

    /// The tool refused this specific resource or action.
    #[error("Permission denied: {0}")]
    ToolPermissionDenied(String),

    /// The backing API reported the target as missing.
    #[error("Resource not found")]
    NotFound { uri: Option<String> },

    /// A resource URI that does not follow the documented grammar.
    #[error("Invalid resource URI format: {uri}")]
    InvalidResourceUri { uri: String, reason: String },

    /// A well-formed URI matching none of the documented patterns.
    #[error("Unknown resource pattern: {uri}")]
    UnknownResource { uri: String },

    /// The call waited in the admission queue for too long.
    #[error("Request queue timeout: concurrency limit of {} reached", .0.max_concurrency)]
    QueueTimeout(QueueTimeoutInfo),

    /// The call was abandoned because its client went away.
    #[error("Request cancelled: client disconnected")]
    Cancelled,

    /// No live or resumable session has this id.
    #[error("Session not found: {0}")]
    SessionNotFound(String),
}

impl McpError {
    /// Convert to a JSON-RPC error object.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        let (code, data) = match self {
            McpError::JsonParse(_) | McpError::MalformedMessage(_) => (error_codes::PARSE_ERROR, None),
            McpError::InvalidRequest(_) => (error_codes::INVALID_REQUEST, None),
            McpError::MethodNotFound(_) => (error_codes::METHOD_NOT_FOUND, None),
            McpError::InvalidParams(_) | McpError::ToolNotFound(_) => (error_codes::INVALID_PARAMS, None),
            McpError::AuthenticationRequired => (
                error_codes::AUTHENTICATION_REQUIRED,
                Some(json!({
                    "hint": "Supply an API key in the Authorization header (Bearer) or X-API-Key header",
                    "retryable": false,
                })),
            ),
            McpError::InvalidApiKey => (
                error_codes::AUTHENTICATION_REQUIRED,
                Some(json!({ "retryable": false })),
            ),
            McpError::InsufficientScope { required, granted, .. } => (
                error_codes::INSUFFICIENT_SCOPE,
                Some(json!({
                    "requiredScope": required.as_str(),
                    "requiredToken": required.granting_token(),
                    "grantedScopes": granted.to_strings(),
                    "acceptedScopes": ACCEPTED_SCOPES,
                    "note": "'mcp' and 'admin' imply all other scopes",
                    "retryable": false,
                })),
            ),
            McpError::ToolPermissionDenied(_) => (
                error_codes::TOOL_PERMISSION_DENIED,
                Some(json!({ "retryable": false })),
            ),
            McpError::NotFound { uri } => (
                error_codes::AUTHENTICATION_REQUIRED,
                uri.as_ref().map(|uri| json!({ "uri": uri })),
            ),
            McpError::InvalidResourceUri { uri, reason } => (
                error_codes::INVALID_PARAMS,
                Some(json!({
                    "uri": uri,
                    "reason": reason,
                    "expectedFormat": URI_FORMAT,
                    "examples": EXAMPLE_URIS,
                })),
            ),
            McpError::UnknownResource { uri } => (
                error_codes::INVALID_PARAMS,
                Some(json!({
                    "uri": uri,
                    "availablePatterns": RESOURCE_PATTERNS,
                })),
            ),
            McpError::QueueTimeout(info) => {
                let mut data = json!(info);
                data["retryable"] = json!(true);
                (error_codes::QUEUE_TIMEOUT, Some(data))
            }
            _ => (error_codes::INTERNAL_ERROR, None),
        };
        JsonRpcError {
            code,
            message: self.to_string(),
            data,
        }
    }
}
