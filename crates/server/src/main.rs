mod cli;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use qaguardian_core::config::{load_dotenv, Config};
use qaguardian_mcp::sse::{self, SseState};
use qaguardian_mcp::{Dispatcher, McpServer, SessionManager, StaticKeyResolver, StdioTransport};
use qaguardian_tool_runtime::{EchoTool, ToolRegistry};

use crate::cli::{CliArgs, Transport};

fn load_config(args: &CliArgs) -> Result<Config> {
    load_dotenv();
    let mut config = match &args.profile {
        Some(profile) => Config::from_lookup(profile, &|key: &str| std::env::var(key).ok()),
        None => Config::from_env(),
    }
    .context("failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("invalid configuration after applying flags")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the stdio protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    let config = load_config(&args)?;
    config.log_summary();

    let mut registry = ToolRegistry::new();
    registry.register(EchoTool).context("failed to register echo tool")?;

    let resolver = Arc::new(StaticKeyResolver::from_config(&config.auth));
    info!(keys = resolver.len(), "API keys loaded");
    let dispatcher = Arc::new(Dispatcher::from_config(registry, &config, resolver));

    match args.transport {
        Transport::Stdio => {
            info!("Serving MCP over stdio");
            McpServer::new(dispatcher)
                .with_api_key(config.auth.api_key.clone())
                .run(StdioTransport::new())
                .await
                .context("stdio transport failed")?;
        }
        Transport::Sse => {
            let sessions = Arc::new(SessionManager::new(config.session.clone()));
            let state = Arc::new(SseState::new(dispatcher, sessions, config.auth.api_key.clone()));
            sse::serve(state, &config.server)
                .await
                .context("SSE transport failed")?;
        }
    }

    info!("Server stopped");
    Ok(())
}
