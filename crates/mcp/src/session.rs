//! SSE session manager.
//!
//! A session moves connecting → active → disconnected → expired. A
//! disconnected session keeps its id and its replay buffer for the resume
//! window; a client reconnecting with `lastSessionId` inside that window gets
//! a fresh session, a `reconnected` event naming both ids, and every buffered
//! event it had not pulled yet. Expired sessions stay around as forwarding
//! entries for the same window so late responses and POSTs addressed to the
//! old id reach the new one.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use qaguardian_core::config::SessionConfig;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::McpError;

pub const EVENT_ENDPOINT: &str = "endpoint";
pub const EVENT_RECONNECTED: &str = "reconnected";
pub const EVENT_WELCOME: &str = "welcome";
pub const EVENT_PING: &str = "ping";
pub const EVENT_MESSAGE: &str = "message";

/// Upper bound on replaced-by hops followed when resolving an id.
const MAX_FORWARD_HOPS: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Disconnected { since: Instant },
    Expired { at: Instant },
}

impl SessionState {
    fn is_live(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Active)
    }
}

/// One SSE event as written to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEvent {
    /// Per-session sequence number, sent as the SSE `id`.
    pub id: u64,
    pub event: String,
    pub data: String,
}

/// The receiving end handed to the HTTP layer on connect.
pub struct Connection {
    pub session_id: String,
    pub previous_session_id: Option<String>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCounts {
    pub connecting: usize,
    pub active: usize,
    pub disconnected: usize,
    pub expired: usize,
}

struct SessionEntry {
    created_at: DateTime<Utc>,
    last_activity: Instant,
    state: SessionState,
    previous_session: Option<String>,
    replaced_by: Option<String>,
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
    /// Replayable events, oldest first.
    buffer: VecDeque<SessionEvent>,
    next_event_id: u64,
    last_delivered: u64,
}

impl SessionEntry {
    fn new(previous_session: Option<String>, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            created_at: Utc::now(),
            last_activity: Instant::now(),
            state: SessionState::Connecting,
            previous_session,
            replaced_by: None,
            tx: Some(tx),
            buffer: VecDeque::new(),
            next_event_id: 1,
            last_delivered: 0,
        }
    }
}

pub struct SessionManager {
    config: SessionConfig,
    sessions: Mutex<HashMap<String, SessionEntry>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a session, resuming `last_session_id` when it is still within
    /// the resume window. `last_event_id` is the last event the client saw
    /// and narrows what gets replayed.
    pub fn connect(&self, last_session_id: Option<&str>, last_event_id: Option<u64>) -> Connection {
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = Uuid::new_v4().to_string();
        let mut sessions = self.lock();

        let mut replay = Vec::new();
        let mut previous = None;
        if let Some(prev_id) = last_session_id {
            if let Some(prev) = sessions.get_mut(prev_id).filter(|s| self.resumable(s)) {
                let from = last_event_id.unwrap_or(prev.last_delivered);
                replay = prev.buffer.drain(..).filter(|e| e.id > from).collect();
                prev.state = SessionState::Expired { at: Instant::now() };
                prev.replaced_by = Some(session_id.clone());
                prev.tx = None;
                previous = Some(prev_id.to_string());
                tracing::info!(
                    session_id = %prev_id,
                    new_session_id = %session_id,
                    replayed = replay.len(),
                    "Session resumed"
                );
            } else {
                tracing::info!(session_id = %prev_id, "Resume requested for unknown or expired session");
            }
        }

        let mut entry = SessionEntry::new(previous.clone(), tx);
        let endpoint = endpoint_for(&session_id);
        match &previous {
            Some(prev_id) => {
                let data = json!({
                    "previousSessionId": prev_id,
                    "newSessionId": session_id,
                    "endpoint": endpoint,
                });
                push(&mut entry, EVENT_RECONNECTED, data.to_string(), false, self.config.buffer_size);
            }
            None => {
                push(&mut entry, EVENT_ENDPOINT, endpoint, false, self.config.buffer_size);
                tracing::info!(session_id = %session_id, "Session created");
            }
        }
        let welcome = json!({
            "sessionId": session_id,
            "connectionTimeout": self.config.connection_timeout.as_millis() as u64,
            "pingInterval": self.config.ping_interval.as_millis() as u64,
            "resumeWindow": self.config.resume_window.as_millis() as u64,
        });
        push(&mut entry, EVENT_WELCOME, welcome.to_string(), false, self.config.buffer_size);
        for event in replay {
            push(&mut entry, &event.event, event.data, true, self.config.buffer_size);
        }

        sessions.insert(session_id.clone(), entry);
        Connection {
            session_id,
            previous_session_id: previous,
            events: rx,
        }
    }

    /// Follow replaced-by links to the session that currently answers for
    /// `session_id`. `None` if there is no such session any more.
    pub fn resolve(&self, session_id: &str) -> Option<String> {
        let sessions = self.lock();
        resolve_in(&sessions, session_id).map(str::to_string)
    }

    pub fn state(&self, session_id: &str) -> Option<SessionState> {
        self.lock().get(session_id).map(|s| s.state)
    }

    pub fn previous_session(&self, session_id: &str) -> Option<String> {
        self.lock().get(session_id).and_then(|s| s.previous_session.clone())
    }

    /// Queue a replayable `message` event. A disconnected session only
    /// buffers it.
    pub fn send_message(&self, session_id: &str, data: String) -> Result<(), McpError> {
        let buffer_size = self.config.buffer_size;
        let mut sessions = self.lock();
        let target = resolve_in(&sessions, session_id)
            .map(str::to_string)
            .ok_or_else(|| McpError::SessionNotFound(session_id.to_string()))?;
        let Some(entry) = sessions.get_mut(&target) else {
            return Err(McpError::SessionNotFound(session_id.to_string()));
        };
        if !push(entry, EVENT_MESSAGE, data, true, buffer_size) && entry.state.is_live() {
            entry.state = SessionState::Disconnected { since: Instant::now() };
            entry.tx = None;
            tracing::info!(session_id = %target, "Session disconnected: write failed");
        }
        Ok(())
    }

    /// Record client activity on a session (or its successor).
    pub fn touch(&self, session_id: &str) {
        let mut sessions = self.lock();
        if let Some(target) = resolve_in(&sessions, session_id).map(str::to_string) {
            if let Some(entry) = sessions.get_mut(&target) {
                entry.last_activity = Instant::now();
            }
        }
    }

    /// The HTTP stream handed `event_id` to the client. Server-sent events
    /// are not client activity and leave the idle timer alone.
    pub fn mark_delivered(&self, session_id: &str, event_id: u64) {
        let mut sessions = self.lock();
        if let Some(entry) = sessions.get_mut(session_id) {
            entry.last_delivered = entry.last_delivered.max(event_id);
            if entry.state == SessionState::Connecting {
                entry.state = SessionState::Active;
                tracing::debug!(session_id = %session_id, "Session active");
            }
        }
    }

    /// The SSE connection went away. The session stays resumable.
    pub fn mark_disconnected(&self, session_id: &str) {
        let mut sessions = self.lock();
        if let Some(entry) = sessions.get_mut(session_id) {
            if entry.state.is_live() {
                entry.state = SessionState::Disconnected { since: Instant::now() };
                entry.tx = None;
                tracing::info!(
                    session_id = %session_id,
                    age_secs = (Utc::now() - entry.created_at).num_seconds(),
                    "Session disconnected"
                );
            }
        }
    }

    /// Send a ping to every live session.
    pub fn ping_all(&self) {
        let buffer_size = self.config.buffer_size;
        let data = json!({ "timestamp": Utc::now().to_rfc3339() }).to_string();
        let mut sessions = self.lock();
        for (id, entry) in sessions.iter_mut().filter(|(_, s)| s.state.is_live()) {
            if !push(entry, EVENT_PING, data.clone(), false, buffer_size) {
                entry.state = SessionState::Disconnected { since: Instant::now() };
                entry.tx = None;
                tracing::info!(session_id = %id, "Session disconnected: ping failed");
            }
        }
    }

    /// Disconnect idle sessions and drop those past the resume window.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut sessions = self.lock();
        let mut gone = Vec::new();
        for (id, entry) in sessions.iter_mut() {
            match entry.state {
                SessionState::Connecting | SessionState::Active
                    if now.duration_since(entry.last_activity) > self.config.connection_timeout =>
                {
                    entry.state = SessionState::Disconnected { since: now };
                    entry.tx = None;
                    tracing::info!(session_id = %id, "Session disconnected: inactivity timeout");
                }
                SessionState::Disconnected { since } if now.duration_since(since) > self.config.resume_window => {
                    tracing::info!(session_id = %id, "Session expired");
                    gone.push(id.clone());
                }
                SessionState::Expired { at } if now.duration_since(at) > self.config.resume_window => {
                    gone.push(id.clone());
                }
                _ => {}
            }
        }
        for id in gone {
            sessions.remove(&id);
        }
    }

    pub fn counts(&self) -> SessionCounts {
        let sessions = self.lock();
        let mut counts = SessionCounts::default();
        for entry in sessions.values() {
            match entry.state {
                SessionState::Connecting => counts.connecting += 1,
                SessionState::Active => counts.active += 1,
                SessionState::Disconnected { .. } => counts.disconnected += 1,
                SessionState::Expired { .. } => counts.expired += 1,
            }
        }
        counts
    }

    /// Ping and sweep every `ping_interval` until the manager is dropped.
    pub fn spawn_keepalive(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.config.ping_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                manager.ping_all();
                manager.sweep();
            }
        })
    }

    fn resumable(&self, entry: &SessionEntry) -> bool {
        match entry.state {
            SessionState::Connecting | SessionState::Active => true,
            SessionState::Disconnected { since } => since.elapsed() <= self.config.resume_window,
            SessionState::Expired { .. } => false,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub fn endpoint_for(session_id: &str) -> String {
    format!("/message?sessionId={session_id}")
}

fn resolve_in<'a>(sessions: &'a HashMap<String, SessionEntry>, session_id: &'a str) -> Option<&'a str> {
    let mut current = session_id;
    for _ in 0..MAX_FORWARD_HOPS {
        let (key, entry) = sessions.get_key_value(current)?;
        match (&entry.state, &entry.replaced_by) {
            (SessionState::Expired { .. }, Some(next)) => current = next,
            (SessionState::Expired { .. }, None) => return None,
            _ => return Some(key.as_str()),
        }
    }
    None
}

/// Number and queue an event. Returns false if the live channel is closed.
fn push(entry: &mut SessionEntry, event: &str, data: String, replayable: bool, buffer_size: usize) -> bool {
    let event = SessionEvent {
        id: entry.next_event_id,
        event: event.to_string(),
        data,
    };
    entry.next_event_id += 1;
    if replayable {
        if entry.buffer.len() >= buffer_size.max(1) {
            entry.buffer.pop_front();
        }
        entry.buffer.push_back(event.clone());
    }
    match &entry.tx {
        Some(tx) => tx.send(event).is_ok(),
        None => true,
    }
}
