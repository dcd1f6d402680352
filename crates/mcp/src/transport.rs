//! MCP transport layer.
//!
//! A transport is split into an inbound [`MessageSource`] and an outbound
//! [`MessageSink`] so the server can keep reading requests while earlier
//! calls are still writing responses and stream notifications. The SSE
//! transport lives in [`crate::sse`] and does not go through these traits.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::error::McpError;

/// Inbound half: yields one JSON-RPC message per call.
#[async_trait]
pub trait MessageSource: Send {
    /// Read the next JSON-RPC message line from the transport.
    /// Returns `None` when the transport is closed.
    async fn receive(&mut self) -> Result<Option<String>, McpError>;
}

/// Outbound half: writes one JSON-RPC message per call.
#[async_trait]
pub trait MessageSink: Send {
    /// Write a JSON-RPC message line to the transport.
    async fn send(&mut self, message: &str) -> Result<(), McpError>;
}

/// A bidirectional line-oriented transport that can be split into halves.
pub trait McpTransport: Send {
    type Source: MessageSource + 'static;
    type Sink: MessageSink + 'static;

    fn split(self) -> (Self::Source, Self::Sink);
}

/// Stdio-based transport using newline-delimited JSON.
///
/// Reads from stdin, writes to stdout. Each message is a single JSON
/// object terminated by a newline character.
pub struct StdioTransport {
    reader: StdinSource,
    writer: StdoutSink,
}

/// Newline-delimited messages from any buffered reader.
pub struct LineSource<R> {
    reader: R,
}

impl<R: AsyncBufRead + Unpin + Send> LineSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

pub type StdinSource = LineSource<BufReader<tokio::io::Stdin>>;

pub struct StdoutSink {
    writer: tokio::io::Stdout,
}

impl StdioTransport {
    /// Create a new stdio transport.
    pub fn new() -> Self {
        Self {
            reader: LineSource::new(BufReader::new(tokio::io::stdin())),
            writer: StdoutSink {
                writer: tokio::io::stdout(),
            },
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl McpTransport for StdioTransport {
    type Source = StdinSource;
    type Sink = StdoutSink;

    fn split(self) -> (StdinSource, StdoutSink) {
        (self.reader, self.writer)
    }
}

/// A line that is not UTF-8 is reported as [`McpError::MalformedMessage`]
/// and reading can continue with the next line.
#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> MessageSource for LineSource<R> {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            let bytes_read = self.reader.read_until(b'\n', &mut buf).await?;
            if bytes_read == 0 {
                return Ok(None); // EOF
            }
            let line = String::from_utf8(std::mem::take(&mut buf))
                .map_err(|e| McpError::MalformedMessage(format!("line is not valid UTF-8: {}", e.utf8_error())))?;
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                return Ok(Some(trimmed.to_string()));
            }
        }
    }
}

#[async_trait]
impl MessageSink for StdoutSink {
    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        self.writer.write_all(message.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// In-memory transport for testing, backed by channel pairs.
pub struct ChannelTransport {
    rx: ChannelSource,
    tx: ChannelSink,
}

pub struct ChannelSource(mpsc::Receiver<String>);

pub struct ChannelSink(mpsc::Sender<String>);

impl ChannelTransport {
    /// Create a pair of connected transports for testing.
    ///
    /// Messages sent on one transport are received by the other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::channel(64);
        let (tx_b, rx_a) = mpsc::channel(64);
        (
            Self { rx: ChannelSource(rx_a), tx: ChannelSink(tx_a) },
            Self { rx: ChannelSource(rx_b), tx: ChannelSink(tx_b) },
        )
    }

    pub async fn receive(&mut self) -> Result<Option<String>, McpError> {
        self.rx.receive().await
    }

    pub async fn send(&mut self, message: &str) -> Result<(), McpError> {
        self.tx.send(message).await
    }
}

impl McpTransport for ChannelTransport {
    type Source = ChannelSource;
    type Sink = ChannelSink;

    fn split(self) -> (ChannelSource, ChannelSink) {
        (self.rx, self.tx)
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn receive(&mut self) -> Result<Option<String>, McpError> {
        Ok(self.0.recv().await)
    }
}

#[async_trait]
impl MessageSink for ChannelSink {
    async fn send(&mut self, message: &str) -> Result<(), McpError> {
        self.0
            .send(message.to_string())
            .await
            .map_err(|e| McpError::Transport(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_pair() {
        let (mut a, mut b) = ChannelTransport::pair();

        a.send("hello from a").await.unwrap();
        let msg = b.receive().await.unwrap();
        assert_eq!(msg, Some("hello from a".to_string()));

        b.send("hello from b").await.unwrap();
        let msg = a.receive().await.unwrap();
        assert_eq!(msg, Some("hello from b".to_string()));
    }

    #[tokio::test]
    async fn test_channel_transport_closed() {
        let (mut a, b) = ChannelTransport::pair();
        drop(b);
        let result = a.receive().await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn test_split_halves_work_independently() {
        let (mut client, server) = ChannelTransport::pair();
        let (mut source, mut sink) = server.split();

        client.send("ping").await.unwrap();
        assert_eq!(source.receive().await.unwrap().as_deref(), Some("ping"));

        sink.send("pong").await.unwrap();
        assert_eq!(client.receive().await.unwrap().as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_send_after_peer_dropped_is_transport_error() {
        let (a, b) = ChannelTransport::pair();
        let (_source, mut sink) = a.split();
        drop(b);
        let err = sink.send("late").await.unwrap_err();
        assert!(matches!(err, McpError::Transport(_)));
    }

    #[tokio::test]
    async fn test_line_source_survives_invalid_utf8() {
        let input: &'static [u8] = b"{\"a\":1}\n\xff\xfe\n\n  {\"b\":2}  \n";
        let mut source = LineSource::new(input);

        assert_eq!(source.receive().await.unwrap().as_deref(), Some(r#"{"a":1}"#));
        let err = source.receive().await.unwrap_err();
        assert!(matches!(err, McpError::MalformedMessage(_)));
        assert_eq!(source.receive().await.unwrap().as_deref(), Some(r#"{"b":2}"#));
        assert_eq!(source.receive().await.unwrap(), None);
    }
}
