//! Idempotency cache for `tools/call`.
//!
//! Records are keyed by (identity, token, fingerprint). The identity part
//! keeps two credentials that happen to pick the same token from ever seeing
//! each other's results. A call that misses holds a [`Reservation`]; an
//! identical call arriving meanwhile parks on it and reuses the result
//! instead of executing twice.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::types::{CachedMarker, IDEMPOTENCY_KEY_PARAM, STREAM_PARAM};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    identity: String,
    token: String,
    fingerprint: String,
}

struct Record {
    response: Value,
    stored_at: DateTime<Utc>,
    expires_at: Instant,
    hits: u64,
}

/// Someone is executing this call right now. The sender side lives in their
/// [`Reservation`] and closes when it completes or is abandoned.
struct InFlight {
    reservation: u64,
    done: watch::Receiver<()>,
}

/// Finished records are subject to LRU eviction; in-flight calls are not, so
/// a full cache can never orphan a parked duplicate.
struct Entries {
    ready: LruCache<CacheKey, Record>,
    in_flight: HashMap<CacheKey, InFlight>,
}

/// Outcome of [`IdempotencyCache::lookup_or_reserve`].
pub enum Lookup<'a> {
    /// A stored response, already annotated with the `cached` marker.
    Hit(Value),
    /// Execute the call and hand the response to the reservation.
    Miss(Reservation<'a>),
}

pub struct IdempotencyCache {
    ttl: Duration,
    entries: Mutex<Entries>,
    next_reservation: AtomicU64,
}

impl IdempotencyCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ttl,
            entries: Mutex::new(Entries {
                ready: LruCache::new(capacity),
                in_flight: HashMap::new(),
            }),
            next_reservation: AtomicU64::new(1),
        }
    }

    /// Return the cached response for this call, or reserve the right to
    /// produce it. Waits while an identical call is in flight.
    pub async fn lookup_or_reserve(&self, identity: &str, token: &str, fingerprint: &str) -> Lookup<'_> {
        let key = CacheKey {
            identity: identity.to_string(),
            token: token.to_string(),
            fingerprint: fingerprint.to_string(),
        };

        loop {
            let mut in_flight = {
                let mut entries = self.lock();
                let now = Instant::now();

                let expired = match entries.ready.get_mut(&key) {
                    Some(record) if record.expires_at > now => {
                        record.hits += 1;
                        tracing::info!(token = %token, hits = record.hits, "Idempotency cache hit");
                        return Lookup::Hit(annotate(record, token));
                    }
                    Some(_) => true,
                    None => false,
                };
                if expired {
                    entries.ready.pop(&key);
                }

                match entries.in_flight.get(&key) {
                    Some(pending) => pending.done.clone(),
                    None => {
                        let id = self.next_reservation.fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = watch::channel(());
                        entries.in_flight.insert(key.clone(), InFlight { reservation: id, done: rx });
                        return Lookup::Miss(Reservation {
                            cache: self,
                            key,
                            id,
                            _done: tx,
                            completed: false,
                        });
                    }
                }
            };

            tracing::debug!(token = %token, "Waiting for identical in-flight call");
            // Resolves with Err once the owning reservation is gone.
            let _ = in_flight.changed().await;
        }
    }

    /// Drop every expired record.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.lock();
        let now = Instant::now();
        let expired: Vec<CacheKey> = entries
            .ready
            .iter()
            .filter(|(_, record)| record.expires_at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.ready.pop(key);
        }
        expired.len()
    }

    /// Stored records plus calls in flight.
    pub fn len(&self) -> usize {
        let entries = self.lock();
        entries.ready.len() + entries.in_flight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn complete(&self, key: &CacheKey, id: u64, response: Value) {
        let mut entries = self.lock();
        if !take_if_ours(&mut entries.in_flight, key, id) {
            return;
        }
        entries.ready.put(
            key.clone(),
            Record {
                response,
                stored_at: Utc::now(),
                expires_at: Instant::now() + self.ttl,
                hits: 0,
            },
        );
    }

    fn abandon(&self, key: &CacheKey, id: u64) {
        let mut entries = self.lock();
        take_if_ours(&mut entries.in_flight, key, id);
    }
}

fn take_if_ours(in_flight: &mut HashMap<CacheKey, InFlight>, key: &CacheKey, id: u64) -> bool {
    let ours = in_flight.get(key).is_some_and(|p| p.reservation == id);
    if ours {
        in_flight.remove(key);
    }
    ours
}

fn annotate(record: &Record, token: &str) -> Value {
    let mut response = record.response.clone();
    let marker = CachedMarker {
        idempotency_key: token.to_string(),
        hits: record.hits,
        stored_at: record.stored_at.to_rfc3339(),
    };
    if let (Value::Object(map), Ok(marker)) = (&mut response, serde_json::to_value(marker)) {
        map.insert("cached".to_string(), marker);
    }
    response
}

/// The right to store a response for one (identity, token, fingerprint).
///
/// Dropping it without calling [`Reservation::store`] releases the slot so a
/// waiting duplicate executes on its own.
pub struct Reservation<'a> {
    cache: &'a IdempotencyCache,
    key: CacheKey,
    id: u64,
    _done: watch::Sender<()>,
    completed: bool,
}

impl Reservation<'_> {
    pub fn store(mut self, response: Value) {
        self.cache.complete(&self.key, self.id, response);
        self.completed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.cache.abandon(&self.key, self.id);
        }
    }
}

/// Deterministic hash of a tool name and its arguments.
///
/// Object keys are sorted, top-level request extensions are ignored and
/// integral floats are written as integers, so `{"b":1.0,"a":2}` and
/// `{"a":2,"b":1}` fingerprint the same.
pub fn fingerprint(tool: &str, arguments: &Value) -> String {
    let mut canonical = String::new();
    match arguments {
        Value::Object(map) => {
            let filtered: serde_json::Map<String, Value> = map
                .iter()
                .filter(|(k, _)| k.as_str() != IDEMPOTENCY_KEY_PARAM && k.as_str() != STREAM_PARAM)
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            write_canonical(&Value::Object(filtered), &mut canonical);
        }
        other => write_canonical(other, &mut canonical),
    }

    let mut hasher = Sha256::new();
    hasher.update(tool.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => match n.as_f64() {
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                out.push_str(&(f as i64).to_string())
            }
            _ => out.push_str(&n.to_string()),
        },
        Value::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
    }
}
