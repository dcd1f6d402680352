//! Shared building blocks for the QA Guardian MCP server: configuration,
//! the scope model, and configuration errors.

pub mod config;
pub mod error;
pub mod scope;

pub use config::Config;
pub use error::ConfigError;
pub use scope::{GrantedScope, Scope, ScopeSet, ACCEPTED_SCOPES};
