use std::time::Duration;

use clap::{Parser, ValueEnum};
use qaguardian_core::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Newline-delimited JSON-RPC over stdin/stdout
    Stdio,
    /// `GET /sse` event stream plus `POST /message`
    Sse,
}

/// MCP server for the QA Guardian test-management API.
///
/// Every option falls back to its environment variable, then to the
/// profile-aware config loaded from the environment and `.env`.
#[derive(Parser, Debug)]
#[command(name = "qaguardian-mcp", version, about = "MCP server for QA Guardian")]
pub struct CliArgs {
    /// Transport to serve on
    #[arg(long, value_enum, env = "MCP_TRANSPORT", default_value = "stdio")]
    pub transport: Transport,

    /// Config profile; `{PROFILE}_{KEY}` variables win over plain ones
    #[arg(long, env = "QAG_PROFILE")]
    pub profile: Option<String>,

    /// Bind address for the SSE transport
    #[arg(long)]
    pub host: Option<String>,

    /// Port for the SSE transport
    #[arg(long)]
    pub port: Option<u16>,

    /// API key used when a request carries none
    #[arg(long)]
    pub api_key: Option<String>,

    /// Reject calls that carry no API key
    #[arg(long)]
    pub require_auth: bool,

    /// Concurrent tool calls allowed per API key
    #[arg(long)]
    pub max_concurrency: Option<usize>,

    /// Item count at which results are streamed in chunks
    #[arg(long)]
    pub stream_threshold: Option<usize>,

    /// Items per stream chunk
    #[arg(long)]
    pub stream_chunk_size: Option<usize>,

    /// How long a call may wait for a concurrency slot
    #[arg(long)]
    pub queue_timeout_ms: Option<u64>,
}

impl CliArgs {
    /// Overlay explicit flags on top of the loaded config.
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(key) = &self.api_key {
            config.auth.api_key = Some(key.clone());
        }
        if self.require_auth {
            config.auth.require_auth = true;
        }
        if let Some(max) = self.max_concurrency {
            config.admission.max_concurrency = max;
        }
        if let Some(threshold) = self.stream_threshold {
            config.streaming.threshold = threshold;
        }
        if let Some(size) = self.stream_chunk_size {
            config.streaming.chunk_size = size;
        }
        if let Some(ms) = self.queue_timeout_ms {
            config.admission.queue_timeout = Duration::from_millis(ms);
        }
    }
}
