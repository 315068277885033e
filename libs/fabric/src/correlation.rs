//! Correlation of replies with pending requests
//!
//! ```text
//! send():     register(id) ─────────────┐
//! inbound:    accept(id, reply)         ├─► PendingRequest (Waiting → Fulfilled)
//! receive():  wait(id, timeout, cancel) ┘        │
//!                                                ▼
//!                         Reply | Timeout | Cancelled | Err(Transport)
//!                         entry removed from the table on every branch
//! ```
//!
//! Registration is get-or-add, so whichever of the sender and the inbound
//! reply gets there first creates the entry and the other one joins it.
//! An entry only a reply has touched is unclaimed; `sweep` drops those once
//! they are old, and never touches an entry a caller registered.
//! Each entry resolves once: the first transition out of `Waiting` wins and
//! later attempts are discarded.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::CorrelationId;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Stand-in deadline for timeouts too large to add to an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Lifecycle of a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Waiting,
    Fulfilled,
    TimedOut,
    Cancelled,
    Failed,
}

/// Expected results of waiting for a reply
///
/// Timeouts and cancellations are ordinary values so callers can retry
/// without matching on errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Reply(T),
    Timeout,
    Cancelled,
}

impl<T> Outcome<T> {
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Reply(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn reply(self) -> Option<T> {
        match self {
            Self::Reply(value) => Some(value),
            _ => None,
        }
    }

    /// Turn timeout and cancellation into errors
    pub fn into_reply(self) -> Result<T> {
        match self {
            Self::Reply(value) => Ok(value),
            Self::Timeout => Err(Error::Timeout),
            Self::Cancelled => Err(Error::Cancelled),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Reply(value) => Outcome::Reply(f(value)),
            Self::Timeout => Outcome::Timeout,
            Self::Cancelled => Outcome::Cancelled,
        }
    }
}

enum Resolution<T> {
    Reply(T),
    Failed(Error),
    Cancelled,
}

struct Slot<T> {
    state: PendingState,
    resolution: Option<Resolution<T>>,
}

/// A request awaiting its reply
pub struct PendingRequest<T> {
    correlation_id: CorrelationId,
    registered_at: Instant,
    slot: Mutex<Slot<T>>,
    signal: Notify,
    waiters: AtomicUsize,
    claimed: AtomicBool,
}

impl<T> PendingRequest<T> {
    fn new(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            registered_at: Instant::now(),
            slot: Mutex::new(Slot {
                state: PendingState::Waiting,
                resolution: None,
            }),
            signal: Notify::new(),
            waiters: AtomicUsize::new(0),
            claimed: AtomicBool::new(false),
        }
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    pub fn state(&self) -> PendingState {
        self.slot.lock().state
    }

    /// Time since the entry was created
    pub fn age(&self) -> Duration {
        self.registered_at.elapsed()
    }

    /// Whether a caller registered this entry, as opposed to only a reply
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }

    fn resolve(&self, resolution: Resolution<T>) -> bool {
        {
            let mut slot = self.slot.lock();
            if slot.state != PendingState::Waiting {
                return false;
            }
            slot.state = match resolution {
                Resolution::Reply(_) => PendingState::Fulfilled,
                Resolution::Failed(_) => PendingState::Failed,
                Resolution::Cancelled => PendingState::Cancelled,
            };
            slot.resolution = Some(resolution);
        }
        // notify_one keeps a permit when nobody is waiting yet.
        self.signal.notify_one();
        true
    }

    fn take(&self) -> Option<Result<Outcome<T>>> {
        match self.slot.lock().resolution.take()? {
            Resolution::Reply(value) => Some(Ok(Outcome::Reply(value))),
            Resolution::Failed(error) => Some(Err(error)),
            Resolution::Cancelled => Some(Ok(Outcome::Cancelled)),
        }
    }

    /// Move to `TimedOut`/`Cancelled` unless a resolution got there first
    fn expire(&self, state: PendingState) -> Result<Outcome<T>> {
        let mut slot = self.slot.lock();
        if slot.state == PendingState::Waiting {
            slot.state = state;
            return Ok(match state {
                PendingState::Cancelled => Outcome::Cancelled,
                _ => Outcome::Timeout,
            });
        }
        match slot.resolution.take() {
            Some(Resolution::Reply(value)) => Ok(Outcome::Reply(value)),
            Some(Resolution::Failed(error)) => Err(error),
            Some(Resolution::Cancelled) => Ok(Outcome::Cancelled),
            None => Err(Error::InvalidState(format!(
                "reply for {} already claimed by another receiver",
                self.correlation_id
            ))),
        }
    }
}

/// Map from correlation id to pending request
pub struct CorrelationTable<T> {
    entries: DashMap<CorrelationId, Arc<PendingRequest<T>>>,
}

impl<T> Default for CorrelationTable<T> {
    fn default() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl<T> CorrelationTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the entry for `id` on behalf of a caller
    ///
    /// Concurrent calls with the same id return the same instance. The entry
    /// is claimed and stays until a wait on it ends or it is removed.
    pub fn register(&self, id: CorrelationId) -> Arc<PendingRequest<T>> {
        let pending = self.entry(id);
        pending.claimed.store(true, Ordering::SeqCst);
        pending
    }

    /// Deliver an inbound reply, creating an unclaimed entry if none exists
    ///
    /// Returns false when the entry was already resolved.
    pub fn accept(&self, id: CorrelationId, value: T) -> bool {
        self.entry(id).resolve(Resolution::Reply(value))
    }

    fn entry(&self, id: CorrelationId) -> Arc<PendingRequest<T>> {
        self.entries
            .entry(id)
            .or_insert_with(|| Arc::new(PendingRequest::new(id)))
            .clone()
    }

    pub fn get(&self, id: &CorrelationId) -> Option<Arc<PendingRequest<T>>> {
        self.entries.get(id).map(|entry| entry.clone())
    }

    pub fn contains(&self, id: &CorrelationId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Deliver a reply
    ///
    /// Returns false when `id` is unknown or already resolved; the value is
    /// dropped in that case.
    pub fn fulfill(&self, id: CorrelationId, value: T) -> bool {
        match self.get(&id) {
            Some(pending) => pending.resolve(Resolution::Reply(value)),
            None => {
                trace!(correlation_id = %id, "reply for unknown id dropped");
                false
            }
        }
    }

    /// Resolve a waiting entry with an error
    pub fn fail(&self, id: CorrelationId, error: Error) -> bool {
        self.get(&id)
            .map(|pending| pending.resolve(Resolution::Failed(error)))
            .unwrap_or(false)
    }

    /// Fail every waiting entry with a transport error
    pub fn fail_all(&self, destination: &str, reason: &str) -> usize {
        self.pending()
            .iter()
            .filter(|p| p.resolve(Resolution::Failed(Error::transport(destination, reason))))
            .count()
    }

    /// Cancel every waiting entry
    pub fn cancel_all(&self) -> usize {
        self.pending()
            .iter()
            .filter(|p| p.resolve(Resolution::Cancelled))
            .count()
    }

    /// Drop an entry without resolving it
    pub fn remove(&self, id: &CorrelationId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Remove unclaimed entries older than `max_age`
    ///
    /// These are replies no caller registered, such as a late reply for a
    /// request whose wait already ended. Claimed entries are left alone.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, p| {
            p.is_claimed() || p.waiters.load(Ordering::SeqCst) > 0 || p.age() <= max_age
        });
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "swept unclaimed correlation entries");
        }
        removed
    }

    /// Wait for the reply to `id`
    ///
    /// The timeout runs from the moment the entry was registered, not from
    /// this call. The entry is removed from the table before this returns,
    /// whatever the outcome, and also if the returned future is dropped.
    pub async fn wait(
        &self,
        id: CorrelationId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Outcome<T>> {
        let pending = self.register(id);
        let _guard = WaitGuard::new(self, pending.clone());
        let deadline = pending
            .registered_at
            .checked_add(timeout)
            .unwrap_or_else(|| Instant::now() + FAR_FUTURE);

        loop {
            if let Some(resolved) = pending.take() {
                return resolved;
            }

            tokio::select! {
                biased;
                _ = pending.signal.notified() => {}
                _ = cancel.cancelled() => return pending.expire(PendingState::Cancelled),
                _ = tokio::time::sleep_until(deadline) => {
                    return pending.expire(PendingState::TimedOut);
                }
            }
        }
    }

    fn pending(&self) -> Vec<Arc<PendingRequest<T>>> {
        self.entries.iter().map(|entry| entry.value().clone()).collect()
    }
}

/// Marks an entry as awaited and removes it when the wait ends
struct WaitGuard<'a, T> {
    table: &'a CorrelationTable<T>,
    pending: Arc<PendingRequest<T>>,
}

impl<'a, T> WaitGuard<'a, T> {
    fn new(table: &'a CorrelationTable<T>, pending: Arc<PendingRequest<T>>) -> Self {
        pending.waiters.fetch_add(1, Ordering::SeqCst);
        Self { table, pending }
    }
}

impl<T> Drop for WaitGuard<'_, T> {
    fn drop(&mut self) {
        self.pending.waiters.fetch_sub(1, Ordering::SeqCst);
        let id = self.pending.correlation_id;
        self.table
            .entries
            .remove_if(&id, |_, entry| Arc::ptr_eq(entry, &self.pending));
    }
}
