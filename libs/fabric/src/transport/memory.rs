//! In-process broker implementing the transport contract
//!
//! Destinations are namespaced by route. A message published to a
//! destination with no subscriber waits in a backlog until one attaches;
//! otherwise it goes to exactly one subscriber, chosen round-robin. Each
//! subscription drains its messages on its own tokio task.
//!
//! A destination disappears once its last subscriber leaves and nothing is
//! queued on it. Transient destinations go further: they are deleted with
//! their backlog when the last subscriber leaves, and publishes to them are
//! dropped for [`TOMBSTONE_TTL`] afterwards.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::transport::{Connection, MessageHandler, Subscription, Transport};

/// How long a deleted transient destination keeps swallowing publishes
pub const TOMBSTONE_TTL: Duration = Duration::from_secs(30);

/// Shared in-process broker; clones talk to the same destinations
#[derive(Clone, Default)]
pub struct MemoryTransport {
    broker: Arc<Broker>,
}

#[derive(Default)]
struct Broker {
    destinations: DashMap<String, Arc<Destination>>,
    tombstones: DashMap<String, Instant>,
    faults: DashMap<String, String>,
    opened: AtomicUsize,
    next_subscriber: AtomicU64,
}

struct Destination {
    key: String,
    name: String,
    state: Mutex<DestinationState>,
}

#[derive(Default)]
struct DestinationState {
    backlog: VecDeque<Vec<u8>>,
    subscribers: Vec<Subscriber>,
    cursor: usize,
    transient: bool,
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

enum Delivery {
    Message(Vec<u8>),
    Failure(Error),
}

fn destination_key(route: &str, name: &str) -> String {
    format!("{route}/{name}")
}

impl Broker {
    fn new_destination(key: &str, name: &str) -> Arc<Destination> {
        Arc::new(Destination {
            key: key.to_string(),
            name: name.to_string(),
            state: Mutex::new(DestinationState::default()),
        })
    }

    fn existing(&self, route: &str, name: &str) -> Option<Arc<Destination>> {
        self.destinations
            .get(&destination_key(route, name))
            .map(|d| d.clone())
    }

    /// Deliver while holding the map entry, so the destination cannot be
    /// removed between lookup and delivery
    fn publish(&self, route: &str, name: &str, bytes: Vec<u8>) {
        let key = destination_key(route, name);
        if let Some(at) = self.tombstones.get(&key).map(|t| *t) {
            if at.elapsed() < TOMBSTONE_TTL {
                trace!(destination = %key, "publish to deleted transient destination dropped");
                return;
            }
            self.tombstones.remove(&key);
        }

        let entry = self
            .destinations
            .entry(key.clone())
            .or_insert_with(|| Self::new_destination(&key, name));
        entry.deliver(bytes);
    }

    fn attach(
        &self,
        route: &str,
        name: &str,
        transient: bool,
        tx: mpsc::UnboundedSender<Delivery>,
    ) -> (Arc<Destination>, u64) {
        let key = destination_key(route, name);
        self.tombstones.remove(&key);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let entry = self
            .destinations
            .entry(key.clone())
            .or_insert_with(|| Self::new_destination(&key, name));
        {
            let mut state = entry.state.lock();
            state.transient |= transient;
            while let Some(bytes) = state.backlog.pop_front() {
                let _ = tx.send(Delivery::Message(bytes));
            }
            state.subscribers.push(Subscriber { id, tx });
        }
        (entry.value().clone(), id)
    }

    fn detach(&self, destination: &Arc<Destination>, id: u64) {
        let transient = {
            let mut state = destination.state.lock();
            state.subscribers.retain(|s| s.id != id);
            if !state.subscribers.is_empty() {
                return;
            }
            state.transient
        };

        // Re-checked under the map entry in case a subscriber attached since
        let removed = self
            .destinations
            .remove_if(&destination.key, |_, current| {
                if !Arc::ptr_eq(current, destination) {
                    return false;
                }
                let mut state = current.state.lock();
                if !state.subscribers.is_empty() {
                    return false;
                }
                if transient {
                    state.backlog.clear();
                }
                state.backlog.is_empty()
            })
            .is_some();

        if removed && transient {
            self.tombstones.insert(destination.key.clone(), Instant::now());
            self.tombstones.retain(|_, at| at.elapsed() < TOMBSTONE_TTL);
            debug!(destination = %destination.key, "transient destination deleted");
        }
    }
}

impl Destination {
    fn deliver(&self, mut bytes: Vec<u8>) {
        let mut state = self.state.lock();
        while !state.subscribers.is_empty() {
            let idx = state.cursor % state.subscribers.len();
            state.cursor = state.cursor.wrapping_add(1);
            match state.subscribers[idx].tx.send(Delivery::Message(bytes)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    // Pump task is gone; drop the subscriber and try the next one.
                    state.subscribers.remove(idx);
                    bytes = match returned {
                        Delivery::Message(b) => b,
                        Delivery::Failure(_) => return,
                    };
                }
            }
        }
        state.backlog.push_back(bytes);
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish to `destination` fail, on any route
    pub fn fail_destination(&self, destination: impl Into<String>, reason: impl Into<String>) {
        self.broker.faults.insert(destination.into(), reason.into());
    }

    /// Undo [`MemoryTransport::fail_destination`]
    pub fn heal_destination(&self, destination: &str) {
        self.broker.faults.remove(destination);
    }

    /// Report a subscription failure to every subscriber of `destination`
    pub fn fail_subscribers(&self, destination: &str, reason: &str) {
        for entry in self.broker.destinations.iter() {
            if entry.name != destination {
                continue;
            }
            let state = entry.state.lock();
            for sub in &state.subscribers {
                let _ = sub
                    .tx
                    .send(Delivery::Failure(Error::transport(destination, reason)));
            }
        }
    }

    /// Number of connections opened so far
    pub fn open_count(&self) -> usize {
        self.broker.opened.load(Ordering::SeqCst)
    }

    /// Messages waiting for a subscriber
    pub fn backlog_len(&self, route: &str, destination: &str) -> usize {
        self.broker
            .existing(route, destination)
            .map(|d| d.state.lock().backlog.len())
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self, route: &str, destination: &str) -> usize {
        self.broker
            .existing(route, destination)
            .map(|d| d.state.lock().subscribers.len())
            .unwrap_or(0)
    }

    /// Destinations currently held by the broker, across all routes
    pub fn destination_count(&self) -> usize {
        self.broker.destinations.len()
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, route: &str) -> Result<Box<dyn Connection>> {
        self.broker.opened.fetch_add(1, Ordering::SeqCst);
        debug!(route, "memory connection opened");
        Ok(Box::new(MemoryConnection {
            route: route.to_string(),
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Connection to one route of a [`MemoryTransport`]
pub struct MemoryConnection {
    route: String,
    broker: Arc<Broker>,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub fn route(&self) -> &str {
        &self.route
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl MemoryConnection {
    fn attach(
        &self,
        destination: &str,
        handler: Arc<dyn MessageHandler>,
        transient: bool,
    ) -> Result<Box<dyn Subscription>> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (target, id) = self.broker.attach(&self.route, destination, transient, tx);
        let active = Arc::new(AtomicBool::new(true));

        let pump_active = active.clone();
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                if !pump_active.load(Ordering::SeqCst) {
                    break;
                }
                match delivery {
                    Delivery::Message(bytes) => handler.on_message(bytes),
                    Delivery::Failure(error) => handler.on_error(error),
                }
            }
        });

        debug!(route = %self.route, destination, subscriber = id, transient, "subscribed");
        Ok(Box::new(MemorySubscription {
            broker: self.broker.clone(),
            destination: target,
            id,
            active,
        }))
    }
}

#[async_trait::async_trait]
impl Connection for MemoryConnection {
    async fn publish(&self, destination: &str, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if let Some(reason) = self.broker.faults.get(destination) {
            return Err(Error::transport(destination, reason.value()));
        }

        trace!(route = %self.route, destination, len = bytes.len(), "publish");
        self.broker.publish(&self.route, destination, bytes.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        destination: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn Subscription>> {
        self.attach(destination, handler, false)
    }

    async fn subscribe_transient(
        &self,
        destination: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn Subscription>> {
        self.attach(destination, handler, true)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        debug!(route = %self.route, "memory connection closed");
        Ok(())
    }
}

/// Subscription handle; dropping it detaches the subscriber as well
pub struct MemorySubscription {
    broker: Arc<Broker>,
    destination: Arc<Destination>,
    id: u64,
    active: Arc<AtomicBool>,
}

impl MemorySubscription {
    fn detach(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.broker.detach(&self.destination, self.id);
        }
    }
}

#[async_trait::async_trait]
impl Subscription for MemorySubscription {
    fn destination(&self) -> &str {
        &self.destination.name
    }

    async fn unsubscribe(&mut self) -> Result<()> {
        self.detach();
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.detach();
    }
}
