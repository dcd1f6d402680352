//! Chunked delivery of large tool results.
//!
//! A result whose item list reaches the threshold (or a call that sets
//! `_stream: true`) is sent as a run of [`STREAM_CHUNK_METHOD`] notifications
//! before the final response, which then only carries a summary.

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::McpError;
use crate::types::{JsonRpcNotification, RpcId, StreamChunk, StreamSummary, STREAM_CHUNK_METHOD};

/// Out-of-band channel back to the client that issued a request.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one notification. Returns once it has been handed to the
    /// transport, so successive calls are delivered in order.
    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Direct,
    Chunked,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamCoordinator {
    threshold: usize,
    chunk_size: usize,
}

impl StreamCoordinator {
    pub fn new(threshold: usize, chunk_size: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Pick a delivery mode. Results without an item list are always direct.
    pub fn decide(&self, explicit: Option<bool>, item_count: Option<usize>) -> Delivery {
        match (explicit, item_count) {
            (Some(false), _) | (_, None) => Delivery::Direct,
            (Some(true), Some(_)) => Delivery::Chunked,
            (None, Some(n)) if n >= self.threshold => Delivery::Chunked,
            (None, Some(_)) => Delivery::Direct,
        }
    }

    pub fn job(&self, request_id: RpcId, items: Vec<Value>) -> StreamJob {
        StreamJob::new(request_id, items, self.chunk_size)
    }
}

/// One streamed result, consumed chunk by chunk.
#[derive(Debug)]
pub struct StreamJob {
    stream_id: String,
    request_id: RpcId,
    items: std::vec::IntoIter<Value>,
    chunk_size: usize,
    total_items: usize,
    total_chunks: usize,
    chunk_index: usize,
    delivered: usize,
}

impl StreamJob {
    fn new(request_id: RpcId, items: Vec<Value>, chunk_size: usize) -> Self {
        let total_items = items.len();
        Self {
            stream_id: Uuid::new_v4().to_string(),
            request_id,
            items: items.into_iter(),
            chunk_size,
            total_items,
            total_chunks: total_items.div_ceil(chunk_size),
            chunk_index: 0,
            delivered: 0,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    pub fn summary(&self) -> StreamSummary {
        StreamSummary {
            stream_id: self.stream_id.clone(),
            total_chunks: self.total_chunks,
            total_items: self.total_items,
        }
    }

    /// Send every remaining chunk through `notifier`, one at a time.
    pub async fn emit(mut self, notifier: &dyn Notifier) -> Result<StreamSummary, McpError> {
        let summary = self.summary();
        tracing::info!(
            stream_id = %summary.stream_id,
            total_items = summary.total_items,
            total_chunks = summary.total_chunks,
            "Streaming result"
        );
        for chunk in self.by_ref() {
            let params = serde_json::to_value(&chunk)?;
            notifier
                .notify(JsonRpcNotification::new(STREAM_CHUNK_METHOD, Some(params)))
                .await?;
        }
        tracing::debug!(stream_id = %summary.stream_id, "Stream complete");
        Ok(summary)
    }
}

impl Iterator for StreamJob {
    type Item = StreamChunk;

    fn next(&mut self) -> Option<StreamChunk> {
        let items: Vec<Value> = self.items.by_ref().take(self.chunk_size).collect();
        if items.is_empty() {
            return None;
        }
        self.delivered += items.len();
        let chunk = StreamChunk {
            stream_id: self.stream_id.clone(),
            chunk_index: self.chunk_index,
            total_chunks: self.total_chunks,
            progress: (self.delivered * 100 / self.total_items) as u8,
            items,
            request_id: self.request_id.clone(),
        };
        self.chunk_index += 1;
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<JsonRpcNotification>>);

    #[async_trait]
    impl Notifier for Recorder {
        async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
            self.0.lock().unwrap().push(notification);
            Ok(())
        }
    }

    fn items(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({ "id": i })).collect()
    }

    #[test]
    fn test_decide() {
        let c = StreamCoordinator::new(5, 3);
        assert_eq!(c.decide(None, Some(4)), Delivery::Direct);
        assert_eq!(c.decide(None, Some(5)), Delivery::Chunked);
        assert_eq!(c.decide(Some(false), Some(500)), Delivery::Direct);
        assert_eq!(c.decide(Some(true), Some(1)), Delivery::Chunked);
        assert_eq!(c.decide(Some(true), None), Delivery::Direct);
    }

    #[test]
    fn test_chunk_count_and_progress() {
        let c = StreamCoordinator::new(5, 3);
        let chunks: Vec<StreamChunk> = c.job(RpcId::Number(1), items(7)).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.iter().map(|c| c.items.len()).collect::<Vec<_>>(), vec![3, 3, 1]);
        assert_eq!(chunks.iter().map(|c| c.chunk_index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(chunks.iter().all(|c| c.total_chunks == 3));
        assert_eq!(chunks.last().unwrap().progress, 100);
        assert!(chunks[0].progress < chunks[1].progress);
    }

    #[test]
    fn test_empty_result_has_no_chunks() {
        let job = StreamCoordinator::new(5, 3).job(RpcId::Number(1), Vec::new());
        assert_eq!(job.total_chunks(), 0);
        assert_eq!(job.count(), 0);
    }

    #[tokio::test]
    async fn test_emit_in_order() {
        let recorder = Recorder::default();
        let job = StreamCoordinator::new(5, 2).job(RpcId::String("r".into()), items(5));
        let stream_id = job.stream_id().to_string();
        let summary = job.emit(&recorder).await.unwrap();
        assert_eq!(summary.total_chunks, 3);
        assert_eq!(summary.total_items, 5);

        let sent = recorder.0.into_inner().unwrap();
        assert_eq!(sent.len(), 3);
        for (i, n) in sent.iter().enumerate() {
            assert_eq!(n.method, STREAM_CHUNK_METHOD);
            let params = n.params.as_ref().unwrap();
            assert_eq!(params["chunkIndex"], i);
            assert_eq!(params["streamId"], stream_id.as_str());
            assert_eq!(params["requestId"], "r");
        }
    }
}
