//! Correlation registry: in-flight calls keyed by correlation id.
//!
//! ## Lifecycle
//!
//! An entry is created by [`CorrelationRegistry::register`] and removed by exactly one of:
//! - [`CorrelationRegistry::resolve`] (response arrived), which fills the entry's slot
//! - expiry, observed by [`PendingCall::wait`] or swept by
//!   [`CorrelationRegistry::expire_overdue`]
//! - dropping the [`PendingCall`] without waiting
//!
//! ## Concurrency
//!
//! All mutations happen under one mutex. `resolve` fills the slot *while holding the
//! lock*, so a waiter that times out, takes the lock and finds its entry gone knows the
//! slot is already filled (resolve won) or was abandoned by expiry (expiry won). The
//! loser of the race sees the entry absent and does nothing.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, mpsc};
use std::time::{Duration, Instant};

use tracing::debug;

use courier_core::CorrelationId;
use courier_messaging::ResponseEnvelope;

use super::error::RpcError;

/// Longest wait a deadline is allowed to represent. Larger timeouts saturate here.
pub const LONGEST_WAIT: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

#[derive(Debug)]
struct Slot {
    tx: mpsc::SyncSender<ResponseEnvelope>,
    deadline: Instant,
}

/// Tracks in-flight calls and hands each response to the caller waiting for it.
#[derive(Debug, Default)]
pub struct CorrelationRegistry {
    pending: Mutex<HashMap<CorrelationId, Slot>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // Every critical section leaves the map consistent, so a poisoned lock is still
    // safe to use.
    fn lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, Slot>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a call that will wait at most `timeout` for its response.
    ///
    /// Timeouts beyond [`LONGEST_WAIT`] (including `Duration::MAX`) are clamped.
    pub fn register(
        &self,
        correlation_id: CorrelationId,
        timeout: Duration,
    ) -> Result<PendingCall<'_>, RpcError> {
        let started = Instant::now();
        let deadline = started + timeout.min(LONGEST_WAIT);
        let (tx, rx) = mpsc::sync_channel(1);

        let mut pending = self.lock();
        if pending.contains_key(&correlation_id) {
            return Err(RpcError::DuplicateCorrelationId(correlation_id));
        }
        pending.insert(correlation_id, Slot { tx, deadline });

        Ok(PendingCall {
            registry: self,
            correlation_id,
            started,
            deadline,
            rx,
            settled: false,
        })
    }

    /// Deliver a response to its waiter.
    ///
    /// Returns `false` (and does nothing else) when no call is pending for the id:
    /// a late response after timeout, a duplicate, or a stranger. Nobody is waiting,
    /// so this is never an error.
    pub fn resolve(&self, response: ResponseEnvelope) -> bool {
        let correlation_id = response.correlation_id();
        let mut pending = self.lock();

        let Some(slot) = pending.remove(&correlation_id) else {
            debug!(%correlation_id, "discarding response with no pending call");
            return false;
        };

        if Instant::now() >= slot.deadline {
            // Deadline already passed: expiry wins even though the waiter has not
            // woken up yet. Dropping the sender wakes it.
            debug!(%correlation_id, "discarding response that arrived after the deadline");
            return false;
        }

        // Capacity 1 and a single send per slot: this never blocks.
        let _ = slot.tx.try_send(response);
        true
    }

    /// Remove every entry whose deadline has passed. Returns how many were removed.
    pub fn expire_overdue(&self) -> usize {
        let now = Instant::now();
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|_, slot| slot.deadline > now);
        before - pending.len()
    }

    /// Number of calls currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.lock().contains_key(correlation_id)
    }
}

/// Handle to one registered call. Consumed by [`PendingCall::wait`]; dropping it
/// unregisters the call.
#[derive(Debug)]
pub struct PendingCall<'a> {
    registry: &'a CorrelationRegistry,
    correlation_id: CorrelationId,
    started: Instant,
    deadline: Instant,
    rx: mpsc::Receiver<ResponseEnvelope>,
    settled: bool,
}

impl PendingCall<'_> {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Block until the response arrives or the deadline passes.
    ///
    /// Produces exactly one outcome; on timeout the entry is gone afterwards.
    pub fn wait(mut self) -> Result<ResponseEnvelope, RpcError> {
        let remaining = self.deadline.saturating_duration_since(Instant::now());
        let first = self.rx.recv_timeout(remaining);
        self.settled = true;

        if let Ok(response) = first {
            return Ok(response);
        }

        let removed_by_us = self.registry.lock().remove(&self.correlation_id).is_some();
        if !removed_by_us {
            // Entry already gone: either resolve filled the slot before we took the
            // lock, or expiry abandoned it (slot empty).
            if let Ok(response) = self.rx.try_recv() {
                return Ok(response);
            }
        }

        // Expiry only ever drops a slot at or after its deadline, so this is never early.
        Err(RpcError::TimedOut {
            correlation_id: self.correlation_id,
            waited: self.started.elapsed(),
        })
    }
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.registry.lock().remove(&self.correlation_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    use serde_json::json;

    fn response_for(id: CorrelationId, text: &str) -> ResponseEnvelope {
        ResponseEnvelope::succeeded(id, json!(text))
    }

    #[test]
    fn resolve_before_deadline_delivers_and_removes_entry() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let call = registry.register(id, Duration::from_secs(2)).unwrap();

        assert!(registry.resolve(response_for(id, "HELLO")));
        assert_eq!(registry.pending_count(), 0);

        let response = call.wait().unwrap();
        assert_eq!(response.result(), &json!("HELLO"));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let _first = registry.register(id, Duration::from_secs(1)).unwrap();

        let err = registry.register(id, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, RpcError::DuplicateCorrelationId(dup) if dup == id));
        assert_eq!(registry.pending_count(), 1);
    }

    #[test]
    fn unknown_response_is_a_no_op() {
        let registry = CorrelationRegistry::new();
        let other = CorrelationId::new();
        let _call = registry.register(other, Duration::from_secs(1)).unwrap();

        assert!(!registry.resolve(response_for(CorrelationId::new(), "stray")));
        assert!(registry.is_pending(&other));
    }

    #[test]
    fn timeout_removes_entry_and_late_response_is_discarded() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let timeout = Duration::from_millis(50);
        let call = registry.register(id, timeout).unwrap();

        let started = Instant::now();
        let err = call.wait().unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.is_timeout());
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500));
        assert!(!registry.is_pending(&id));

        assert!(!registry.resolve(response_for(id, "too late")));
    }

    #[test]
    fn dropping_pending_call_unregisters() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        drop(registry.register(id, Duration::from_secs(10)).unwrap());

        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn unbounded_timeout_saturates_instead_of_overflowing() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let call = registry.register(id, Duration::MAX).unwrap();

        assert!(registry.is_pending(&id));
        assert!(call.deadline() > Instant::now() + Duration::from_secs(60 * 60 * 24 * 365));
        assert_eq!(registry.expire_overdue(), 0);

        drop(call);
        assert_eq!(registry.pending_count(), 0);

        let call = registry.register(id, Duration::MAX).unwrap();
        assert!(registry.resolve(response_for(id, "eventually")));
        assert_eq!(call.wait().unwrap().result(), &json!("eventually"));
    }

    #[test]
    fn sweep_expires_overdue_entries_and_waiter_times_out() {
        let registry = Arc::new(CorrelationRegistry::new());
        let id = CorrelationId::new();
        let timeout = Duration::from_millis(30);

        let r = registry.clone();
        let waiter = thread::spawn(move || {
            let call = r.register(id, timeout).unwrap();
            let started = Instant::now();
            (call.wait(), started.elapsed())
        });

        // Let the deadline pass, then sweep.
        thread::sleep(Duration::from_millis(60));
        registry.expire_overdue();

        let (outcome, elapsed) = waiter.join().unwrap();
        assert!(outcome.unwrap_err().is_timeout());
        assert!(elapsed >= timeout);
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn resolve_after_deadline_loses_to_expiry() {
        let registry = CorrelationRegistry::new();
        let id = CorrelationId::new();
        let call = registry.register(id, Duration::from_millis(10)).unwrap();

        thread::sleep(Duration::from_millis(30));
        assert!(!registry.resolve(response_for(id, "late")));
        assert!(call.wait().unwrap_err().is_timeout());
    }

    #[test]
    fn resolve_and_expiry_race_yields_exactly_one_outcome() {
        let registry = Arc::new(CorrelationRegistry::new());

        for _ in 0..200 {
            let id = CorrelationId::new();
            let timeout = Duration::from_millis(2);
            let call = registry.register(id, timeout).unwrap();

            let r = registry.clone();
            let resolver = thread::spawn(move || {
                thread::sleep(Duration::from_millis(2));
                r.resolve(response_for(id, "maybe"))
            });

            let outcome = call.wait();
            let resolver_won = resolver.join().unwrap();

            match outcome {
                Ok(resp) => {
                    assert!(resolver_won);
                    assert_eq!(resp.correlation_id(), id);
                }
                Err(err) => {
                    assert!(err.is_timeout());
                    assert!(!resolver_won);
                }
            }
            assert!(!registry.is_pending(&id));
        }
    }
}
