//! Tool abstraction for the QA Guardian MCP server.
//!
//! The domain tools themselves live outside this workspace; this crate only
//! defines the seam they plug into and how their required scope is decided.

pub mod permission;
pub mod registry;
pub mod tool;

pub use permission::{infer_scope, ScopePolicy};
pub use registry::{RegistryError, ToolRegistry};
pub use tool::{EchoTool, Tool, ToolContext, ToolDefinition, ToolError, ToolResult};
