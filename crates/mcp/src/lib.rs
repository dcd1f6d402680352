//! MCP request-admission and session core for QA Guardian.
//!
//! Every inbound JSON-RPC message, whether it arrives over stdio or over the
//! SSE/POST pair, goes through the same [`Dispatcher`] pipeline.
//!
//! # Architecture
//!
//! - **types**: JSON-RPC 2.0 and MCP protocol types
//! - **auth**: API key resolution and scope checks
//! - **idempotency**: `_idempotencyKey` result cache
//! - **admission**: per-identity concurrency limit with a FIFO queue
//! - **stream**: chunked delivery of large results
//! - **session**: SSE session lifecycle, resume and replay
//! - **resources**: `qaguardian://` URI catalog
//! - **dispatcher**: the pipeline tying the above together
//! - **transport** / **server**: line-oriented transports and the stdio loop
//! - **sse**: the HTTP router
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use qaguardian_core::Config;
//! use qaguardian_mcp::{Dispatcher, McpServer, StaticKeyResolver, StdioTransport};
//! use qaguardian_tool_runtime::ToolRegistry;
//!
//! # async fn example() {
//! let config = Config::from_env().unwrap();
//! let resolver = Arc::new(StaticKeyResolver::from_config(&config.auth));
//! let dispatcher = Dispatcher::from_config(ToolRegistry::new(), &config, resolver);
//! let server = McpServer::new(Arc::new(dispatcher));
//! server.run(StdioTransport::new()).await.unwrap();
//! # }
//! ```

pub mod admission;
pub mod auth;
pub mod dispatcher;
pub mod error;
pub mod idempotency;
pub mod resources;
pub mod server;
pub mod session;
pub mod sse;
pub mod stream;
pub mod transport;
pub mod types;

pub use admission::{AdmissionController, AdmissionPermit, AdmissionSnapshot, AdmissionStats};
pub use auth::{AuthGate, Identity, KeyRecord, KeyResolver, StaticKeyResolver};
pub use dispatcher::{Dispatcher, RequestContext};
pub use error::{McpError, QueueTimeoutInfo};
pub use idempotency::IdempotencyCache;
pub use resources::{ResourceHandler, ResourceTarget};
pub use server::McpServer;
pub use session::{SessionManager, SessionState};
pub use sse::SseState;
pub use stream::{Notifier, StreamCoordinator};
pub use transport::{ChannelTransport, LineSource, McpTransport, StdioTransport};
pub use types::*;
