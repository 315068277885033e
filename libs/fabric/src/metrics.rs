//! Counters for the observability collaborator

use std::sync::atomic::{AtomicU64, Ordering};

pub(crate) fn incr(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Client-side counters
#[derive(Debug, Default)]
pub struct ClientMetrics {
    /// Requests published to at least one destination.
    pub requests_sent: AtomicU64,
    /// Replies handed back to a caller.
    pub replies_received: AtomicU64,
    pub timeouts: AtomicU64,
    pub cancellations: AtomicU64,
    /// Failed publishes, per destination, and failed subscriptions.
    pub transport_errors: AtomicU64,
    /// Inbound envelopes that could not be decoded.
    pub malformed: AtomicU64,
    /// Highest number of requests in flight at once.
    pub peak_in_flight: AtomicU64,
}

/// Point-in-time copy of [`ClientMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientMetricsSnapshot {
    pub requests_sent: u64,
    pub replies_received: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub transport_errors: u64,
    pub malformed: u64,
    pub peak_in_flight: u64,
    pub in_flight: u64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_in_flight(&self, in_flight: usize) {
        self.peak_in_flight
            .fetch_max(in_flight as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, in_flight: usize) -> ClientMetricsSnapshot {
        ClientMetricsSnapshot {
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            replies_received: self.replies_received.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            peak_in_flight: self.peak_in_flight.load(Ordering::Relaxed),
            in_flight: in_flight as u64,
        }
    }
}

/// Listener-side counters
#[derive(Debug, Default)]
pub struct ListenerMetrics {
    pub envelopes_received: AtomicU64,
    pub requests: AtomicU64,
    pub responses: AtomicU64,
    pub malformed: AtomicU64,
}

impl ListenerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelopes_received(&self) -> u64 {
        self.envelopes_received.load(Ordering::Relaxed)
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn responses(&self) -> u64 {
        self.responses.load(Ordering::Relaxed)
    }

    pub fn malformed(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }
}
