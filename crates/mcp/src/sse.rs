//! SSE transport: `GET /sse` event stream plus `POST /message` requests.
//!
//! Responses go back synchronously in the POST body. Everything out of band
//! (stream chunks, pings, session lifecycle events) goes over the session's
//! event stream. A POST whose client hangs up drops the handler future,
//! which takes a queued call out of the admission queue.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use qaguardian_core::config::ServerConfig;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use crate::admission::AdmissionStats;
use crate::dispatcher::{Dispatcher, RequestContext};
use crate::error::McpError;
use crate::session::{SessionCounts, SessionManager};
use crate::stream::Notifier;
use crate::types::{JsonRpcNotification, PROTOCOL_VERSION};

const API_KEY_HEADER: &str = "x-api-key";
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

/// Shared state behind the SSE router.
pub struct SseState {
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionManager>,
    /// Used when a POST carries no key of its own.
    pub default_api_key: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl SseState {
    pub fn new(dispatcher: Arc<Dispatcher>, sessions: Arc<SessionManager>, default_api_key: Option<String>) -> Self {
        Self {
            dispatcher,
            sessions,
            default_api_key,
            started_at: Utc::now(),
        }
    }
}

/// Build the SSE router.
pub fn router(state: Arc<SseState>, cors_origin: &str) -> Router {
    Router::new()
        .route("/", get(server_identity))
        .route("/health", get(health))
        .route("/sse", get(sse_connect))
        .route("/message", post(post_message))
        .layer(cors_layer(cors_origin))
        .with_state(state)
}

/// Bind, run keep-alive and cache maintenance, and serve until Ctrl-C.
pub async fn serve(state: Arc<SseState>, config: &ServerConfig) -> Result<(), McpError> {
    let keepalive = state.sessions.spawn_keepalive();
    let maintenance = {
        let dispatcher = Arc::clone(&state.dispatcher);
        let period = state.sessions.config().ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let purged = dispatcher.idempotency().purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "Expired idempotency records purged");
                }
            }
        })
    };

    let app = router(state, &config.cors_origin);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "SSE transport listening");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await;

    keepalive.abort();
    maintenance.abort();
    result.map_err(McpError::Transport)
}

fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        return CorsLayer::permissive();
    }
    match HeaderValue::from_str(origin) {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(_) => {
            tracing::warn!(origin = %origin, "Invalid CORS origin, cross-origin requests disabled");
            CorsLayer::new()
        }
    }
}

/// `Authorization: Bearer <key>` first, then `X-API-Key`.
fn api_key_from(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let header_key = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()).map(str::trim);
    bearer
        .or(header_key)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    transport: &'static str,
    uptime_secs: i64,
    sessions: SessionCounts,
    admission: AdmissionStats,
}

async fn health(State(state): State<Arc<SseState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        transport: "sse",
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        sessions: state.sessions.counts(),
        admission: state.dispatcher.admission().stats(),
    })
}

async fn server_identity(State(state): State<Arc<SseState>>) -> Json<serde_json::Value> {
    Json(json!({
        "name": state.dispatcher.server_name(),
        "version": state.dispatcher.server_version(),
        "protocolVersion": PROTOCOL_VERSION,
        "transport": "sse",
        "endpoints": {
            "sse": "/sse",
            "message": "/message?sessionId={sessionId}",
            "health": "/health",
        },
    }))
}

#[derive(Deserialize)]
struct ConnectQuery {
    #[serde(rename = "lastSessionId")]
    last_session_id: Option<String>,
}

/// Marks the session disconnected when the HTTP stream is dropped.
struct StreamGuard {
    sessions: Arc<SessionManager>,
    session_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.sessions.mark_disconnected(&self.session_id);
    }
}

async fn sse_connect(
    State(state): State<Arc<SseState>>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let last_event_id = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let conn = state.sessions.connect(query.last_session_id.as_deref(), last_event_id);

    let guard = StreamGuard {
        sessions: Arc::clone(&state.sessions),
        session_id: conn.session_id,
    };
    let stream = UnboundedReceiverStream::new(conn.events).map(move |event| {
        guard.sessions.mark_delivered(&guard.session_id, event.id);
        Ok::<_, Infallible>(
            Event::default()
                .id(event.id.to_string())
                .event(event.event)
                .data(event.data),
        )
    });
    Sse::new(stream)
}

#[derive(Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// Routes notifications to a session, following it across resumes.
struct SessionNotifier {
    sessions: Arc<SessionManager>,
    session_id: String,
}

#[async_trait]
impl Notifier for SessionNotifier {
    async fn notify(&self, notification: JsonRpcNotification) -> Result<(), McpError> {
        let json = serde_json::to_string(&notification)?;
        self.sessions.send_message(&self.session_id, json)
    }
}

async fn post_message(
    State(state): State<Arc<SseState>>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(session_id) = state.sessions.resolve(&query.session_id) else {
        tracing::debug!(session_id = %query.session_id, "POST for unknown session");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Session not found", "sessionId": query.session_id })),
        )
            .into_response();
    };
    state.sessions.touch(&session_id);

    let ctx = RequestContext {
        api_key: api_key_from(&headers).or_else(|| state.default_api_key.clone()),
        session_id: Some(session_id.clone()),
        // A queued call is cancelled by this handler being dropped when the
        // POST client hangs up. Losing the event stream does not cancel it,
        // since the session may be resumed and receive the result.
        cancel: None,
    };
    let notifier = SessionNotifier {
        sessions: Arc::clone(&state.sessions),
        session_id,
    };

    match state.dispatcher.handle_message(&body, &ctx, &notifier).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_preferred_over_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-bearer"));
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("from-header"));
        assert_eq!(api_key_from(&headers).as_deref(), Some("from-bearer"));
    }

    #[test]
    fn test_api_key_header_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, HeaderValue::from_static("k-1"));
        assert_eq!(api_key_from(&headers).as_deref(), Some("k-1"));

        let mut basic = HeaderMap::new();
        basic.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(api_key_from(&basic).is_none());
        assert!(api_key_from(&HeaderMap::new()).is_none());
    }
}
