mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::*;
use qaguardian_mcp::{CallToolResult, JsonRpcNotification, McpError, Notifier, RequestContext, STREAM_CHUNK_METHOD};
use serde_json::{json, Value};
use tokio::sync::mpsc;

async fn list(count: u64, extra: Value) -> (CallToolResult, Vec<JsonRpcNotification>) {
    let dispatcher = dispatcher(
        vec![Arc::new(ListTool::default())],
        &[("STREAM_THRESHOLD", "5"), ("STREAM_CHUNK_SIZE", "3")],
    );
    let mut params = json!({"arguments": {"count": count}});
    if let (Some(target), Value::Object(extra)) = (params.as_object_mut(), extra) {
        target.extend(extra);
    }
    let notifier = RecordingNotifier::default();
    let response = dispatcher
        .handle_request(&call(1, "list_test_cases", params), &RequestContext::default(), &notifier)
        .await
        .unwrap();
    let result = serde_json::from_value(response.result.unwrap()).unwrap();
    (result, notifier.take())
}

#[tokio::test]
async fn large_result_is_chunked_in_order() {
    let (result, chunks) = list(10, json!({})).await;

    assert_eq!(chunks.len(), 4); // ceil(10 / 3)
    let summary = result.streamed.expect("final response marks the stream");
    assert_eq!(summary.total_chunks, 4);
    assert_eq!(summary.total_items, 10);
    assert!(result.structured_content.is_none());

    let mut items = 0;
    for (index, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.method, STREAM_CHUNK_METHOD);
        let params = chunk.params.as_ref().unwrap();
        assert_eq!(params["chunkIndex"], index);
        assert_eq!(params["totalChunks"], 4);
        assert_eq!(params["streamId"], summary.stream_id.as_str());
        assert_eq!(params["requestId"], 1);
        items += params["items"].as_array().unwrap().len();
    }
    assert_eq!(items, 10);
    assert_eq!(chunks.last().unwrap().params.as_ref().unwrap()["progress"], 100);
}

#[tokio::test]
async fn small_result_is_direct() {
    let (result, chunks) = list(4, json!({})).await;
    assert!(chunks.is_empty());
    assert!(result.streamed.is_none());
    assert_eq!(result.structured_content.unwrap()["items"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn explicit_flag_overrides_threshold() {
    let (result, chunks) = list(50, json!({"_stream": false})).await;
    assert!(chunks.is_empty());
    assert!(result.streamed.is_none());

    let (result, chunks) = list(2, json!({"_stream": true})).await;
    assert_eq!(chunks.len(), 1);
    assert_eq!(result.streamed.unwrap().total_items, 2);
}

/// Logs notification methods in the order they are written.
struct OrderedSink {
    tx: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Notifier for OrderedSink {
    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        tokio::task::yield_now().await;
        let _ = self.tx.send(notification.method);
        Ok(())
    }
}

#[tokio::test]
async fn final_response_follows_last_chunk() {
    let dispatcher = dispatcher(
        vec![Arc::new(ListTool::default())],
        &[("STREAM_THRESHOLD", "5"), ("STREAM_CHUNK_SIZE", "3")],
    );
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sink = OrderedSink { tx: tx.clone() };
    let response = dispatcher
        .handle_request(
            &call(7, "list_test_cases", json!({"arguments": {"count": 7}})),
            &RequestContext::default(),
            &sink,
        )
        .await
        .unwrap();
    tx.send("response".to_string()).unwrap();
    drop(tx);
    drop(sink);

    let mut log = Vec::new();
    while let Some(entry) = rx.recv().await {
        log.push(entry);
    }
    assert_eq!(log.len(), 4);
    assert_eq!(log.last().map(String::as_str), Some("response"));
    assert!(response.result.is_some());
}
