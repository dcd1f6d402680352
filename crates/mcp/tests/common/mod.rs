#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use qaguardian_core::{Config, ScopeSet};
use qaguardian_mcp::{Dispatcher, JsonRpcNotification, JsonRpcRequest, KeyRecord, McpError, Notifier, RpcId, StaticKeyResolver};
use qaguardian_tool_runtime::{Tool, ToolContext, ToolDefinition, ToolError, ToolRegistry, ToolResult};
use serde_json::{json, Value};

pub fn definition(name: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: format!("test tool {name}"),
        input_schema: json!({"type": "object"}),
        required_scope: None,
    }
}

/// Sleeps, and records how many executions overlap.
#[derive(Default)]
pub struct SlowTool {
    pub delay: Duration,
    pub running: AtomicUsize,
    pub peak: AtomicUsize,
    pub completed: AtomicUsize,
    pub order: Mutex<Vec<i64>>,
}

impl SlowTool {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn definition(&self) -> ToolDefinition {
        definition("run_slow_suite")
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        if let Some(n) = input.get("n").and_then(Value::as_i64) {
            self.order.lock().unwrap().push(n);
        }
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(ToolResult::success(json!({"status": "passed"})))
    }
}

/// Returns `count` items, and counts its executions.
#[derive(Default)]
pub struct ListTool {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Tool for ListTool {
    fn definition(&self) -> ToolDefinition {
        definition("list_test_cases")
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let count = input.get("count").and_then(Value::as_u64).unwrap_or(0);
        let items: Vec<Value> = (0..count).map(|i| json!({"id": i, "name": format!("case-{i}")})).collect();
        Ok(ToolResult::success(json!({ "items": items, "total": count })))
    }
}

/// Mutating tool that counts executions; takes a little time so duplicate
/// calls overlap.
#[derive(Default)]
pub struct CreateTool {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Tool for CreateTool {
    fn definition(&self) -> ToolDefinition {
        definition("create_project")
    }

    async fn execute(&self, input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(ToolResult::success(json!({ "id": n, "name": input["name"] })))
    }
}

/// Always refuses on the resource level.
pub struct ArchivedProjectTool;

#[async_trait]
impl Tool for ArchivedProjectTool {
    fn definition(&self) -> ToolDefinition {
        definition("get_archived_project")
    }

    async fn execute(&self, _input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        Err(ToolError::PermissionDenied("project is archived".into()))
    }
}

/// The backing API answers 404.
pub struct MissingRunTool;

#[async_trait]
impl Tool for MissingRunTool {
    fn definition(&self) -> ToolDefinition {
        definition("get_run")
    }

    async fn execute(&self, _input: Value, _context: &ToolContext) -> Result<ToolResult, ToolError> {
        Err(ToolError::NotFound("run 404".into()))
    }
}

pub fn config(vars: &[(&str, &str)]) -> Config {
    let vars: Vec<(String, String)> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Config::from_lookup("", &move |key: &str| {
        vars.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone())
    })
    .unwrap()
}

pub fn registry(tools: Vec<Arc<dyn Tool>>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register_arc(tool).unwrap();
    }
    registry
}

pub fn dispatcher(tools: Vec<Arc<dyn Tool>>, vars: &[(&str, &str)]) -> Arc<Dispatcher> {
    let config = config(vars);
    let resolver = Arc::new(StaticKeyResolver::from_config(&config.auth));
    Arc::new(Dispatcher::from_config(registry(tools), &config, resolver))
}

pub fn key_record(scopes: &str) -> KeyRecord {
    KeyRecord {
        scopes: ScopeSet::parse(scopes).unwrap(),
        max_concurrency: None,
    }
}

pub fn call(id: i64, tool: &str, params: Value) -> JsonRpcRequest {
    let mut body = json!({ "name": tool });
    if let (Value::Object(target), Value::Object(extra)) = (&mut body, params) {
        target.extend(extra);
    }
    JsonRpcRequest::new(RpcId::Number(id), "tools/call", Some(body))
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<JsonRpcNotification>>,
}

impl RecordingNotifier {
    pub fn take(&self) -> Vec<JsonRpcNotification> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        self.sent.lock().unwrap().push(notification);
        Ok(())
    }
}
