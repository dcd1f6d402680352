//! Line-oriented MCP server loop (stdio and in-memory transports).
//!
//! Every inbound line runs as its own task so a call parked in the admission
//! queue does not hold up the lines behind it. All output goes through one
//! writer task, which keeps each line atomic and keeps a stream's chunk
//! notifications ahead of its final response.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

use crate::dispatcher::{Dispatcher, RequestContext};
use crate::error::McpError;
use crate::stream::Notifier;
use crate::transport::{McpTransport, MessageSink, MessageSource};
use crate::types::{JsonRpcNotification, JsonRpcResponse, RpcId};

const OUTBOUND_CAPACITY: usize = 256;

/// MCP server that drives a [`Dispatcher`] over a split transport.
pub struct McpServer {
    dispatcher: Arc<Dispatcher>,
    api_key: Option<String>,
}

impl McpServer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            api_key: None,
        }
    }

    /// Key every request on this transport is made with. Stdio has no
    /// headers, so the key comes from configuration.
    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key;
        self
    }

    /// Serve until the transport's inbound side closes.
    ///
    /// On close, calls still waiting for admission are dropped without a
    /// response, admitted calls finish, and the writer drains before this
    /// returns.
    pub async fn run<T: McpTransport>(&self, transport: T) -> Result<(), McpError> {
        tracing::info!(server = %self.dispatcher.server_name(), "MCP server starting");
        let (mut source, sink) = transport.split();

        let (out_tx, out_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(write_loop(sink, out_rx));

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = RequestContext {
            api_key: self.api_key.clone(),
            session_id: None,
            cancel: Some(cancel_rx),
        };

        let mut tasks = JoinSet::new();
        loop {
            while let Some(done) = tasks.try_join_next() {
                log_task_result(done);
            }

            let line = match source.receive().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    tracing::info!("Transport closed, shutting down");
                    break;
                }
                Err(e @ McpError::MalformedMessage(_)) => {
                    tracing::warn!(error = %e, "Unreadable message");
                    let response = JsonRpcResponse::from_error(RpcId::Number(0), e.to_rpc_error());
                    match serde_json::to_string(&response) {
                        Ok(json) if out_tx.send(json.clone()).await.is_ok() => {}
                        _ => tracing::warn!("Failed to answer unreadable message"),
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Transport read failed, shutting down");
                    break;
                }
            };
            tracing::debug!(message = %line, "Received message");

            let dispatcher = Arc::clone(&self.dispatcher);
            let ctx = ctx.clone();
            let out = out_tx.clone();
            tasks.spawn(async move {
                let notifier = WriterNotifier(out.clone());
                if let Some(response) = dispatcher.handle_message(&line, &ctx, &notifier).await {
                    match serde_json::to_string(&response) {
                        Ok(json) => {
                            if out.send(json).await.is_err() {
                                tracing::warn!("Writer gone, response dropped");
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to serialize response"),
                    }
                }
            });
        }

        let _ = cancel_tx.send(true);
        while let Some(done) = tasks.join_next().await {
            log_task_result(done);
        }
        drop(out_tx);

        writer
            .await
            .map_err(|e| McpError::Transport(std::io::Error::other(e)))?
    }
}

async fn write_loop<S: MessageSink>(mut sink: S, mut rx: mpsc::Receiver<String>) -> Result<(), McpError> {
    while let Some(line) = rx.recv().await {
        sink.send(&line).await?;
    }
    Ok(())
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::warn!(error = %e, "Request task failed");
    }
}

/// Sends notifications through the shared writer.
struct WriterNotifier(mpsc::Sender<String>);

#[async_trait]
impl Notifier for WriterNotifier {
    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        let json = serde_json::to_string(&notification)?;
        self.0
            .send(json)
            .await
            .map_err(|e| McpError::Transport(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticKeyResolver;
    use crate::transport::{ChannelSink, ChannelTransport, LineSource};
    use crate::types::*;
    use qaguardian_core::Config;
    use qaguardian_tool_runtime::{EchoTool, ToolRegistry};

    fn server() -> McpServer {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        let config = Config::from_lookup("", &|_: &str| None).unwrap();
        let dispatcher = Dispatcher::from_config(registry, &config, Arc::new(StaticKeyResolver::new()));
        McpServer::new(Arc::new(dispatcher))
    }

    #[tokio::test]
    async fn test_server_run_with_channel_transport() {
        let (mut client_side, server_side) = ChannelTransport::pair();
        let server = server();
        let server_handle = tokio::spawn(async move { server.run(server_side).await });

        let init_req = JsonRpcRequest::new(
            RpcId::Number(1),
            "initialize",
            Some(serde_json::json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": "test"}
            })),
        );
        client_side
            .send(&serde_json::to_string(&init_req).unwrap())
            .await
            .unwrap();
        let resp: JsonRpcResponse = serde_json::from_str(&client_side.receive().await.unwrap().unwrap()).unwrap();
        assert!(resp.error.is_none());

        let call_req = JsonRpcRequest::new(
            RpcId::Number(2),
            "tools/call",
            Some(serde_json::json!({
                "name": "echo",
                "arguments": {"message": "via transport"}
            })),
        );
        client_side
            .send(&serde_json::to_string(&call_req).unwrap())
            .await
            .unwrap();
        let resp: JsonRpcResponse = serde_json::from_str(&client_side.receive().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp.id, RpcId::Number(2));
        let result: CallToolResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.structured_content.unwrap()["message"], "via transport");

        drop(client_side);
        server_handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_blank_and_garbage_lines() {
        let (mut client_side, server_side) = ChannelTransport::pair();
        let server = server();
        let server_handle = tokio::spawn(async move { server.run(server_side).await });

        client_side.send("not json").await.unwrap();
        let resp: JsonRpcResponse = serde_json::from_str(&client_side.receive().await.unwrap().unwrap()).unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::PARSE_ERROR);

        drop(client_side);
        server_handle.await.unwrap().unwrap();
    }

    /// Fixed input bytes in, responses out through a channel.
    struct BytesTransport {
        source: LineSource<&'static [u8]>,
        sink: ChannelSink,
    }

    impl McpTransport for BytesTransport {
        type Source = LineSource<&'static [u8]>;
        type Sink = ChannelSink;

        fn split(self) -> (Self::Source, Self::Sink) {
            (self.source, self.sink)
        }
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_answered_and_reading_continues() {
        let (mut client_side, server_side) = ChannelTransport::pair();
        let (_, sink) = server_side.split();
        let input: &'static [u8] =
            b"\xc3\x28 broken\n{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"tools/call\",\"params\":{\"name\":\"echo\",\"arguments\":{\"message\":\"still here\"}}}\n";
        let transport = BytesTransport {
            source: LineSource::new(input),
            sink,
        };

        server().run(transport).await.unwrap();

        let mut responses = Vec::new();
        while let Some(line) = client_side.receive().await.unwrap() {
            responses.push(serde_json::from_str::<JsonRpcResponse>(&line).unwrap());
        }
        assert_eq!(responses.len(), 2);
        let parse_error = responses.iter().find(|r| r.id == RpcId::Number(0)).unwrap();
        assert_eq!(parse_error.error.as_ref().unwrap().code, error_codes::PARSE_ERROR);
        let echoed = responses.iter().find(|r| r.id == RpcId::Number(2)).unwrap();
        assert_eq!(echoed.result.as_ref().unwrap()["structuredContent"]["message"], "still here");
    }
}
