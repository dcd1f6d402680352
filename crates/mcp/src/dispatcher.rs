//! Request dispatcher.
//!
//! Takes one JSON-RPC message from any transport and runs it through the
//! admission pipeline: auth gate, idempotency lookup, admission, tool
//! execution, stream coordination, idempotency store, release.

use std::sync::Arc;

use qaguardian_core::{Config, Scope};
use qaguardian_tool_runtime::{ScopePolicy, ToolContext, ToolError, ToolRegistry, ToolResult};
use serde_json::{json, Map, Value};
use tokio::sync::watch;

use crate::admission::AdmissionController;
use crate::auth::{AuthGate, Identity, KeyResolver};
use crate::error::McpError;
use crate::idempotency::{fingerprint, IdempotencyCache, Lookup};
use crate::resources::{self, NoResources, ResourceHandler};
use crate::stream::{Delivery, Notifier, StreamCoordinator};
use crate::types::*;

/// Per-request facts supplied by the transport.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub api_key: Option<String>,
    /// SSE session the request arrived on, if any.
    pub session_id: Option<String>,
    /// Flips to `true` when the client is gone.
    pub cancel: Option<watch::Receiver<bool>>,
}

pub struct Dispatcher {
    registry: ToolRegistry,
    policy: ScopePolicy,
    auth: AuthGate,
    idempotency: IdempotencyCache,
    admission: Arc<AdmissionController>,
    streams: StreamCoordinator,
    resources: Arc<dyn ResourceHandler>,
    server_name: String,
    server_version: String,
}

impl Dispatcher {
    pub fn new(
        registry: ToolRegistry,
        auth: AuthGate,
        idempotency: IdempotencyCache,
        admission: AdmissionController,
        streams: StreamCoordinator,
    ) -> Self {
        Self {
            registry,
            policy: ScopePolicy::new(),
            auth,
            idempotency,
            admission: Arc::new(admission),
            streams,
            resources: Arc::new(NoResources),
            server_name: "qaguardian-mcp".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Wire every component from configuration.
    pub fn from_config(registry: ToolRegistry, config: &Config, resolver: Arc<dyn KeyResolver>) -> Self {
        let auth = AuthGate::new(config.auth.require_auth, resolver, config.admission.max_concurrency)
            .with_anonymous_scopes(config.auth.anonymous_scopes.clone());
        Self::new(
            registry,
            auth,
            IdempotencyCache::new(config.idempotency.ttl, config.idempotency.capacity),
            AdmissionController::new(config.admission.queue_timeout),
            StreamCoordinator::new(config.streaming.threshold, config.streaming.chunk_size),
        )
    }

    pub fn with_scope_policy(mut self, policy: ScopePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_resources(mut self, handler: Arc<dyn ResourceHandler>) -> Self {
        self.resources = handler;
        self
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    pub fn idempotency(&self) -> &IdempotencyCache {
        &self.idempotency
    }

    /// Handle one raw message. Returns the response to send back, or `None`
    /// for notifications and for calls abandoned because the client left.
    pub async fn handle_message(
        &self,
        line: &str,
        ctx: &RequestContext,
        notifier: &dyn Notifier,
    ) -> Option<JsonRpcResponse> {
        let raw: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse JSON");
                return Some(JsonRpcResponse::from_error(
                    RpcId::Number(0),
                    McpError::JsonParse(e).to_rpc_error(),
                ));
            }
        };

        if raw.get("id").is_none() {
            match serde_json::from_value::<JsonRpcNotification>(raw) {
                Ok(notif) => self.handle_notification(&notif),
                Err(e) => tracing::debug!(error = %e, "Ignoring malformed notification"),
            }
            return None;
        }

        let id = raw
            .get("id")
            .and_then(|v| serde_json::from_value::<RpcId>(v.clone()).ok())
            .unwrap_or(RpcId::Number(0));
        match serde_json::from_value::<JsonRpcRequest>(raw) {
            Ok(request) => self.handle_request(&request, ctx, notifier).await,
            Err(e) => {
                tracing::warn!(error = %e, "Invalid JSON-RPC request");
                Some(JsonRpcResponse::from_error(
                    id,
                    McpError::InvalidRequest(e.to_string()).to_rpc_error(),
                ))
            }
        }
    }

    /// Handle a parsed request.
    pub async fn handle_request(
        &self,
        request: &JsonRpcRequest,
        ctx: &RequestContext,
        notifier: &dyn Notifier,
    ) -> Option<JsonRpcResponse> {
        let id = request.id.clone();
        let params = request.params.as_ref();

        let outcome = match request.method.as_str() {
            "initialize" => self.initialize(),
            "ping" => Ok(json!({})),
            "tools/list" => self.list_tools(ctx).await,
            "tools/call" => self.call_tool(&id, params, ctx, notifier).await,
            "resources/list" => self.list_resources(ctx).await,
            "resources/templates/list" => self.list_templates(ctx).await,
            "resources/read" => self.read_resource(params, ctx).await,
            method => {
                tracing::warn!(method = %method, "Unknown method");
                Err(McpError::MethodNotFound(method.to_string()))
            }
        };

        match outcome {
            Ok(result) => Some(JsonRpcResponse::success(id, result)),
            Err(McpError::Cancelled) => {
                tracing::info!(id = %id, "Request abandoned: client disconnected");
                None
            }
            Err(e) => Some(JsonRpcResponse::from_error(id, e.to_rpc_error())),
        }
    }

    fn handle_notification(&self, notif: &JsonRpcNotification) {
        match notif.method.as_str() {
            "notifications/initialized" => tracing::info!("Client confirmed initialization"),
            "notifications/cancelled" => {
                let request_id = notif.params.as_ref().and_then(|p| p.get("requestId")).cloned();
                tracing::debug!(request_id = ?request_id, "Client cancelled a request");
            }
            method => tracing::debug!(method = %method, "Unknown notification, ignoring"),
        }
    }

    fn initialize(&self) -> Result<Value, McpError> {
        tracing::info!("Handling initialize");
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: false }),
                resources: Some(ResourcesCapability::default()),
            },
            server_info: ServerInfo {
                name: self.server_name.clone(),
                version: Some(self.server_version.clone()),
            },
        };
        Ok(serde_json::to_value(result)?)
    }

    async fn list_tools(&self, ctx: &RequestContext) -> Result<Value, McpError> {
        self.auth.authenticate(ctx.api_key.as_deref()).await?;
        let tools: Vec<ToolInfo> = self.registry.list().into_iter().map(ToolInfo::from).collect();
        Ok(serde_json::to_value(ListToolsResult { tools })?)
    }

    async fn call_tool(
        &self,
        id: &RpcId,
        params: Option<&Value>,
        ctx: &RequestContext,
        notifier: &dyn Notifier,
    ) -> Result<Value, McpError> {
        let params = params.ok_or_else(|| McpError::InvalidParams("missing params".to_string()))?;
        let call: CallToolParams =
            serde_json::from_value(params.clone()).map_err(|e| McpError::InvalidParams(e.to_string()))?;
        let (arguments, token, stream_flag) = split_extensions(call);
        let name = arguments.tool;

        let identity = self.auth.authenticate(ctx.api_key.as_deref()).await?;
        let tool = self
            .registry
            .get(&name)
            .ok_or_else(|| McpError::ToolNotFound(name.clone()))?;
        let required = self.policy.scope_for(&tool.definition());
        self.auth.authorize(&identity, &name, required)?;

        let reservation = match &token {
            Some(token) => {
                let fp = fingerprint(&name, &arguments.value);
                match self.idempotency.lookup_or_reserve(&identity.key_hash, token, &fp).await {
                    Lookup::Hit(cached) => return Ok(cached),
                    Lookup::Miss(reservation) => Some(reservation),
                }
            }
            None => None,
        };

        let permit = self.admission.admit(&identity, ctx.cancel.clone()).await?;

        tracing::debug!(tool = %name, key = %identity.short_hash(), "Executing tool");
        let tool_ctx = tool_context(&identity, id);
        let result = match tool.execute(arguments.value, &tool_ctx).await {
            Ok(result) => result,
            Err(ToolError::PermissionDenied(msg)) => return Err(McpError::ToolPermissionDenied(msg)),
            Err(ToolError::NotFound(_)) => return Err(McpError::NotFound { uri: None }),
            Err(ToolError::InvalidInput(msg)) => return Err(McpError::InvalidParams(msg)),
            Err(e) => {
                tracing::warn!(tool = %name, error = %e, "Tool execution failed");
                ToolResult {
                    content: Value::String(e.to_string()),
                    is_error: true,
                }
            }
        };

        let response = self.deliver(id, result, stream_flag, notifier).await?;
        let value = serde_json::to_value(&response)?;
        if let Some(reservation) = reservation {
            if !response.is_error {
                reservation.store(value.clone());
            }
        }
        drop(permit);
        Ok(value)
    }

    /// Turn a tool result into the final response, streaming its items first
    /// when the coordinator says so.
    async fn deliver(
        &self,
        id: &RpcId,
        result: ToolResult,
        stream_flag: Option<bool>,
        notifier: &dyn Notifier,
    ) -> Result<CallToolResult, McpError> {
        let delivery = if result.is_error {
            Delivery::Direct
        } else {
            self.streams.decide(stream_flag, result.items().map(Vec::len))
        };

        if delivery == Delivery::Chunked {
            if let Some(items) = result.items() {
                let job = self.streams.job(id.clone(), items.clone());
                let summary = job.emit(notifier).await?;
                return Ok(CallToolResult {
                    content: vec![ToolContent::Text {
                        text: format!(
                            "Streamed {} items in {} chunks (stream {})",
                            summary.total_items, summary.total_chunks, summary.stream_id
                        ),
                    }],
                    structured_content: None,
                    is_error: false,
                    streamed: Some(summary),
                    cached: None,
                });
            }
        }

        let (text, structured) = match result.content {
            Value::String(text) => (text, None),
            other => (other.to_string(), Some(other)),
        };
        Ok(CallToolResult {
            content: vec![ToolContent::Text { text }],
            structured_content: structured,
            is_error: result.is_error,
            streamed: None,
            cached: None,
        })
    }

    async fn list_resources(&self, ctx: &RequestContext) -> Result<Value, McpError> {
        let identity = self.auth.authenticate(ctx.api_key.as_deref()).await?;
        self.auth.authorize(&identity, "resources/list", Scope::Read)?;
        let resources = self.resources.list(&tool_context(&identity, &RpcId::Number(0))).await?;
        Ok(json!({ "resources": resources }))
    }

    async fn list_templates(&self, ctx: &RequestContext) -> Result<Value, McpError> {
        self.auth.authenticate(ctx.api_key.as_deref()).await?;
        Ok(json!({ "resourceTemplates": resources::templates() }))
    }

    async fn read_resource(&self, params: Option<&Value>, ctx: &RequestContext) -> Result<Value, McpError> {
        let params = params.ok_or_else(|| McpError::InvalidParams("missing params".to_string()))?;
        let read: ReadResourceParams =
            serde_json::from_value(params.clone()).map_err(|e| McpError::InvalidParams(e.to_string()))?;

        let identity = self.auth.authenticate(ctx.api_key.as_deref()).await?;
        self.auth.authorize(&identity, "resources/read", Scope::Read)?;
        let target = resources::parse(&read.uri)?;

        let contents = self
            .resources
            .read(&read.uri, &target, &tool_context(&identity, &RpcId::Number(0)))
            .await?
            .ok_or(McpError::NotFound { uri: Some(read.uri.clone()) })?;
        Ok(serde_json::to_value(ReadResourceResult { contents: vec![contents] })?)
    }
}

struct CallArguments {
    tool: String,
    value: Value,
}

/// Pull `_idempotencyKey` / `_stream` from either the params object or the
/// arguments object. Params-level values win. The arguments handed to the
/// tool never contain them.
fn split_extensions(call: CallToolParams) -> (CallArguments, Option<String>, Option<bool>) {
    let mut token = call.idempotency_key;
    let mut stream = call.stream;
    let value = match call.arguments {
        Value::Object(mut map) => {
            let nested_token = map.remove(IDEMPOTENCY_KEY_PARAM);
            let nested_stream = map.remove(STREAM_PARAM);
            if token.is_none() {
                token = nested_token.and_then(|v| v.as_str().map(str::to_string));
            }
            if stream.is_none() {
                stream = nested_stream.and_then(|v| v.as_bool());
            }
            Value::Object(map)
        }
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    let token = token.filter(|t| !t.is_empty());
    (CallArguments { tool: call.name, value }, token, stream)
}

fn tool_context(identity: &Identity, id: &RpcId) -> ToolContext {
    ToolContext {
        key_hash: identity.key_hash.clone(),
        scopes: identity.scopes.clone(),
        request_id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticKeyResolver;
    use async_trait::async_trait;
    use qaguardian_tool_runtime::EchoTool;

    struct Silent;

    #[async_trait]
    impl Notifier for Silent {
        async fn notify(&self, _notification: JsonRpcNotification) -> Result<(), McpError> {
            Ok(())
        }
    }

    fn dispatcher() -> Dispatcher {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).unwrap();
        let config = Config::from_lookup("", &|_: &str| None).unwrap();
        Dispatcher::from_config(registry, &config, Arc::new(StaticKeyResolver::new()))
    }

    async fn call(d: &Dispatcher, line: &str) -> Option<JsonRpcResponse> {
        d.handle_message(line, &RequestContext::default(), &Silent).await
    }

    #[test]
    fn test_split_extensions_from_arguments() {
        let call: CallToolParams = serde_json::from_value(json!({
            "name": "t",
            "arguments": {"x": 1, "_idempotencyKey": "k", "_stream": false}
        }))
        .unwrap();
        let (args, token, stream) = split_extensions(call);
        assert_eq!(args.value, json!({"x": 1}));
        assert_eq!(token.as_deref(), Some("k"));
        assert_eq!(stream, Some(false));
    }

    #[test]
    fn test_split_extensions_params_level_wins() {
        let call: CallToolParams = serde_json::from_value(json!({
            "name": "t",
            "arguments": {"_idempotencyKey": "inner"},
            "_idempotencyKey": "outer"
        }))
        .unwrap();
        let (args, token, _) = split_extensions(call);
        assert_eq!(args.value, json!({}));
        assert_eq!(token.as_deref(), Some("outer"));
    }

    #[tokio::test]
    async fn test_initialize() {
        let d = dispatcher();
        let resp = call(
            &d,
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{"protocolVersion":"2024-11-05","capabilities":{},"clientInfo":{"name":"t"}}}"#,
        )
        .await
        .unwrap();
        let result: InitializeResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.protocol_version, PROTOCOL_VERSION);
        assert_eq!(result.server_info.name, "qaguardian-mcp");
        assert!(result.capabilities.resources.is_some());
    }

    #[tokio::test]
    async fn test_echo_call() {
        let d = dispatcher();
        let resp = call(
            &d,
            r#"{"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"echo","arguments":{"message":"hi"}}}"#,
        )
        .await
        .unwrap();
        let result: CallToolResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert!(!result.is_error);
        assert_eq!(result.structured_content, Some(json!({"message": "hi"})));
    }

    #[tokio::test]
    async fn test_invalid_input_is_invalid_params() {
        let d = dispatcher();
        let resp = call(
            &d,
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"echo","arguments":{}}}"#,
        )
        .await
        .unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_parse_error_and_unknown_method() {
        let d = dispatcher();
        let resp = call(&d, "{not json").await.unwrap();
        assert_eq!(resp.error.unwrap().code, error_codes::PARSE_ERROR);

        let resp = call(&d, r#"{"jsonrpc":"2.0","id":"x","method":"nope"}"#).await.unwrap();
        assert_eq!(resp.id, RpcId::String("x".into()));
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_invalid_request_keeps_id() {
        let d = dispatcher();
        let resp = call(&d, r#"{"jsonrpc":"2.0","id":9}"#).await.unwrap();
        assert_eq!(resp.id, RpcId::Number(9));
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let d = dispatcher();
        assert!(call(&d, r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).await.is_none());
        assert!(call(&d, r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":1}}"#)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_templates_and_missing_resource() {
        let d = dispatcher();
        let resp = call(&d, r#"{"jsonrpc":"2.0","id":1,"method":"resources/templates/list"}"#).await.unwrap();
        assert_eq!(resp.result.unwrap()["resourceTemplates"].as_array().unwrap().len(), 7);

        let resp = call(
            &d,
            r#"{"jsonrpc":"2.0","id":2,"method":"resources/read","params":{"uri":"qaguardian://projects/1"}}"#,
        )
        .await
        .unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, error_codes::AUTHENTICATION_REQUIRED);
        assert_eq!(err.message, "Resource not found");
    }
}
