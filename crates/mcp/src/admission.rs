//! Per-identity admission control.
//!
//! Each identity gets `max_concurrency` slots. A call that finds every slot
//! taken waits at the tail of that identity's FIFO queue for at most
//! `queue_timeout`. Releasing a slot hands it straight to the oldest waiter
//! under the same lock, so the active count never dips and re-rises and no
//! later arrival can overtake the queue.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::auth::Identity;
use crate::error::{McpError, QueueTimeoutInfo};

/// Floor for the retry hint returned with a queue timeout.
const MIN_RETRY_AFTER_MS: u64 = 1_000;

struct Waiter {
    id: u64,
    tx: oneshot::Sender<()>,
}

struct IdentityState {
    max: usize,
    active: usize,
    waiters: VecDeque<Waiter>,
}

impl IdentityState {
    fn position_of(&self, id: u64) -> Option<usize> {
        self.waiters.iter().position(|w| w.id == id)
    }
}

#[derive(Default)]
struct Counters {
    admitted: AtomicU64,
    queued: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
}

/// Live view of one identity's slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionSnapshot {
    pub max_concurrency: usize,
    pub active: usize,
    pub queued: usize,
}

/// Process-wide admission counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStats {
    pub admitted: u64,
    pub queued: u64,
    pub timed_out: u64,
    pub cancelled: u64,
    pub identities: usize,
    pub active: usize,
    pub waiting: usize,
}

pub struct AdmissionController {
    queue_timeout: Duration,
    identities: Mutex<HashMap<String, IdentityState>>,
    counters: Counters,
    next_waiter: AtomicU64,
}

impl AdmissionController {
    pub fn new(queue_timeout: Duration) -> Self {
        Self {
            queue_timeout,
            identities: Mutex::new(HashMap::new()),
            counters: Counters::default(),
            next_waiter: AtomicU64::new(1),
        }
    }

    /// Wait for a slot. `cancel` flipping to `true` abandons the wait without
    /// consuming a slot. Dropping the returned future does the same.
    pub async fn admit(
        self: &Arc<Self>,
        identity: &Identity,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<AdmissionPermit, McpError> {
        let key = identity.key_hash.clone();
        let max = identity.max_concurrency.max(1);

        let (id, rx) = {
            let mut identities = self.lock();
            let state = identities.entry(key.clone()).or_insert_with(|| IdentityState {
                max,
                active: 0,
                waiters: VecDeque::new(),
            });
            state.max = max;

            if state.active < state.max && state.waiters.is_empty() {
                state.active += 1;
                self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                return Ok(self.permit(key));
            }

            let id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter { id, tx });
            self.counters.queued.fetch_add(1, Ordering::Relaxed);
            tracing::info!(
                key = %identity.short_hash(),
                active = state.active,
                max_concurrency = state.max,
                queue_len = state.waiters.len(),
                position = state.waiters.len(),
                "Call queued: concurrency limit reached"
            );
            (id, rx)
        };

        let mut ticket = QueueTicket {
            controller: self,
            key,
            id,
            rx,
            settled: false,
        };
        let started = Instant::now();

        let outcome = match cancel {
            Some(mut cancel) => {
                tokio::select! {
                    res = tokio::time::timeout(self.queue_timeout, &mut ticket.rx) => Some(res),
                    _ = cancelled(&mut cancel) => None,
                }
            }
            None => Some(tokio::time::timeout(self.queue_timeout, &mut ticket.rx).await),
        };
        let waited_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Some(Ok(Ok(()))) => {
                ticket.settled = true;
                self.counters.admitted.fetch_add(1, Ordering::Relaxed);
                tracing::info!(waited_ms, "Call dequeued and admitted");
                Ok(self.permit(ticket.key.clone()))
            }
            Some(Ok(Err(_))) => Err(McpError::Cancelled),
            Some(Err(_elapsed)) => ticket.expire(waited_ms),
            // The ticket's drop removes the waiter.
            None => Err(McpError::Cancelled),
        }
    }

    /// Slots for one identity, if it has any activity.
    pub fn snapshot(&self, key_hash: &str) -> Option<AdmissionSnapshot> {
        let identities = self.lock();
        identities.get(key_hash).map(|s| AdmissionSnapshot {
            max_concurrency: s.max,
            active: s.active,
            queued: s.waiters.len(),
        })
    }

    pub fn stats(&self) -> AdmissionStats {
        let identities = self.lock();
        AdmissionStats {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            identities: identities.len(),
            active: identities.values().map(|s| s.active).sum(),
            waiting: identities.values().map(|s| s.waiters.len()).sum(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, IdentityState>> {
        self.identities.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn permit(self: &Arc<Self>, key: String) -> AdmissionPermit {
        AdmissionPermit {
            controller: Arc::clone(self),
            key,
        }
    }

    /// Give one slot back: to the oldest live waiter, else to the pool.
    fn release(&self, key: &str) {
        let mut identities = self.lock();
        let Some(state) = identities.get_mut(key) else {
            return;
        };

        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(()).is_ok() {
                tracing::debug!(queue_len = state.waiters.len(), "Slot handed to next queued call");
                return;
            }
        }

        state.active = state.active.saturating_sub(1);
        if state.active == 0 && state.waiters.is_empty() {
            identities.remove(key);
        }
    }
}

/// Resolves once the flag reads `true`. Never resolves if the sender is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// A queued call's place in line. Dropping an unsettled ticket removes the
/// waiter, or returns the slot if it was handed over concurrently.
struct QueueTicket<'a> {
    controller: &'a Arc<AdmissionController>,
    key: String,
    id: u64,
    rx: oneshot::Receiver<()>,
    settled: bool,
}

impl QueueTicket<'_> {
    fn expire(mut self, waited_ms: u64) -> Result<AdmissionPermit, McpError> {
        let controller = self.controller;
        let mut identities = controller.lock();
        let Some(state) = identities.get_mut(&self.key) else {
            return Err(McpError::Cancelled);
        };

        let Some(index) = state.position_of(self.id) else {
            drop(identities);
            // The slot arrived between the deadline and taking the lock.
            if self.rx.try_recv().is_ok() {
                self.settled = true;
                controller.counters.admitted.fetch_add(1, Ordering::Relaxed);
                return Ok(controller.permit(self.key.clone()));
            }
            return Err(McpError::Cancelled);
        };

        let info = QueueTimeoutInfo {
            max_concurrency: state.max,
            active_count: state.active,
            queue_length: state.waiters.len(),
            queue_position: index + 1,
            waited_ms,
            retry_after_ms: retry_after(index + 1, controller.queue_timeout),
        };
        state.waiters.remove(index);
        self.settled = true;
        controller.counters.timed_out.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            queue_position = info.queue_position,
            queue_len = info.queue_length,
            active = info.active_count,
            waited_ms,
            "Queue timeout: call abandoned"
        );
        Err(McpError::QueueTimeout(info))
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut identities = self.controller.lock();
        if let Some(state) = identities.get_mut(&self.key) {
            if let Some(index) = state.position_of(self.id) {
                state.waiters.remove(index);
                self.controller.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                tracing::info!(queue_len = state.waiters.len(), "Queued call cancelled");
                return;
            }
        }
        drop(identities);
        if self.rx.try_recv().is_ok() {
            self.controller.release(&self.key);
        }
    }
}

fn retry_after(position: usize, queue_timeout: Duration) -> u64 {
    let ceiling = queue_timeout.as_millis() as u64;
    (MIN_RETRY_AFTER_MS * position as u64).min(ceiling.max(MIN_RETRY_AFTER_MS))
}

/// One admitted slot. Dropping it releases the slot.
pub struct AdmissionPermit {
    controller: Arc<AdmissionController>,
    key: String,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.controller.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qaguardian_core::ScopeSet;
    use std::sync::atomic::AtomicUsize;

    fn identity(key: &str, max: usize) -> Identity {
        Identity {
            key_hash: key.to_string(),
            scopes: ScopeSet::full(),
            max_concurrency: max,
        }
    }

    #[tokio::test]
    async fn test_admits_up_to_limit_then_queues() {
        let controller = Arc::new(AdmissionController::new(Duration::from_secs(30)));
        let id = identity("k", 2);
        let first = controller.admit(&id, None).await.unwrap();
        let _second = controller.admit(&id, None).await.unwrap();

        let queued = {
            let controller = controller.clone();
            let id = id.clone();
            tokio::spawn(async move { controller.admit(&id, None).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(
            controller.snapshot("k"),
            Some(AdmissionSnapshot { max_concurrency: 2, active: 2, queued: 1 })
        );

        drop(first);
        let _third = queued.await.unwrap().unwrap();
        let snap = controller.snapshot("k").unwrap();
        assert_eq!(snap.active, 2);
        assert_eq!(snap.queued, 0);
    }

    #[tokio::test]
    async fn test_identities_do_not_share_slots() {
        let controller = Arc::new(AdmissionController::new(Duration::from_millis(10)));
        let _a = controller.admit(&identity("a", 1), None).await.unwrap();
        assert!(controller.admit(&identity("b", 1), None).await.is_ok());
    }

    #[tokio::test]
    async fn test_fifo_handoff() {
        let controller = Arc::new(AdmissionController::new(Duration::from_secs(30)));
        let id = identity("k", 1);
        let holder = controller.admit(&id, None).await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        for n in 0..4 {
            let controller = controller.clone();
            let id = id.clone();
            let order_tx = order_tx.clone();
            tokio::spawn(async move {
                let permit = controller.admit(&id, None).await.unwrap();
                order_tx.send(n).unwrap();
                tokio::task::yield_now().await;
                drop(permit);
            });
            // Make arrival order deterministic.
            tokio::task::yield_now().await;
        }
        drop(order_tx);
        drop(holder);

        let mut order = Vec::new();
        while let Some(n) = order_rx.recv().await {
            order.push(n);
        }
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_timeout_reports_position() {
        let controller = Arc::new(AdmissionController::new(Duration::from_secs(30)));
        let id = identity("k", 1);
        let _holder = controller.admit(&id, None).await.unwrap();

        let ahead = {
            let controller = controller.clone();
            let id = id.clone();
            tokio::spawn(async move { controller.admit(&id, None).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;

        let err = controller.admit(&id, None).await.err().unwrap();
        let McpError::QueueTimeout(info) = err else {
            panic!("expected queue timeout");
        };
        // The first waiter timed out at the same instant and may or may not
        // have left the queue already.
        assert!(info.queue_position == 1 || info.queue_position == 2);
        assert_eq!(info.max_concurrency, 1);
        assert_eq!(info.active_count, 1);
        assert!(info.waited_ms >= 30_000);
        assert!(info.retry_after_ms >= MIN_RETRY_AFTER_MS);

        assert!(matches!(ahead.await.unwrap(), Err(McpError::QueueTimeout(_))));
        assert_eq!(controller.stats().timed_out, 2);
        assert_eq!(controller.snapshot("k").unwrap().queued, 0);
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_queue_without_slot() {
        let controller = Arc::new(AdmissionController::new(Duration::from_secs(30)));
        let id = identity("k", 1);
        let holder = controller.admit(&id, None).await.unwrap();

        let abandoned = {
            let controller = controller.clone();
            let id = id.clone();
            tokio::spawn(async move { controller.admit(&id, None).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert_eq!(controller.snapshot("k").unwrap().queued, 1);

        abandoned.abort();
        let _ = abandoned.await;
        assert_eq!(controller.snapshot("k").unwrap().queued, 0);
        assert_eq!(controller.stats().cancelled, 1);

        drop(holder);
        assert!(controller.snapshot("k").is_none());
    }

    #[tokio::test]
    async fn test_cancel_signal_abandons_wait() {
        let controller = Arc::new(AdmissionController::new(Duration::from_secs(30)));
        let id = identity("k", 1);
        let _holder = controller.admit(&id, None).await.unwrap();

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let waiting = {
            let controller = controller.clone();
            let id = id.clone();
            tokio::spawn(async move { controller.admit(&id, Some(cancel_rx)).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        cancel_tx.send(true).unwrap();

        assert!(matches!(waiting.await.unwrap(), Err(McpError::Cancelled)));
        let snap = controller.snapshot("k").unwrap();
        assert_eq!(snap.active, 1);
        assert_eq!(snap.queued, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_active_never_exceeds_limit() {
        let controller = Arc::new(AdmissionController::new(Duration::from_secs(30)));
        let id = identity("k", 5);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..20 {
            let (controller, id, running, peak) = (controller.clone(), id.clone(), running.clone(), peak.clone());
            handles.push(tokio::spawn(async move {
                let _permit = controller.admit(&id, None).await.unwrap();
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 5);
        assert_eq!(controller.stats().admitted, 20);
    }
}
