//! In-process keyed FIFO queue
//!
//! Holds at most one value per id. Consumers either take whatever is at the
//! head of the FIFO or wait for one specific id, which is how an in-process
//! request/response pair works without a broker: requests go through
//! `dequeue_any`, replies through `dequeue_by_id`.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Upper bound on how long `dequeue_any` sleeps between checks
pub const POLL_SLICE: Duration = Duration::from_millis(50);

pub struct InMemoryQueue<K, V> {
    state: Mutex<QueueState<K, V>>,
    available: Notify,
}

struct QueueState<K, V> {
    order: VecDeque<K>,
    values: HashMap<K, V>,
    waiters: HashMap<K, IdWaiters>,
}

/// Signal shared by every `dequeue_by_id` call parked on one id
///
/// Lives exactly as long as at least one of those calls, so a parked
/// waiter always holds the signal the next `enqueue` will fire.
struct IdWaiters {
    signal: Arc<Notify>,
    count: usize,
}

impl<K: Eq + Hash, V> QueueState<K, V> {
    /// Remove `id` from the values and the FIFO together
    fn take(&mut self, id: &K) -> Option<V> {
        let value = self.values.remove(id)?;
        if let Some(pos) = self.order.iter().position(|k| k == id) {
            self.order.remove(pos);
        }
        Some(value)
    }
}

impl<K, V> Default for InMemoryQueue<K, V> {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                order: VecDeque::new(),
                values: HashMap::new(),
                waiters: HashMap::new(),
            }),
            available: Notify::new(),
        }
    }
}

impl<K, V> InMemoryQueue<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `value` under `id`
    ///
    /// Returns false, leaving the queued value untouched, if `id` is
    /// already queued.
    pub fn enqueue(&self, id: K, value: V) -> bool {
        let signal = {
            let mut state = self.state.lock();
            if state.values.contains_key(&id) {
                return false;
            }
            state.order.push_back(id.clone());
            let signal = state.waiters.get(&id).map(|w| w.signal.clone());
            state.values.insert(id, value);
            signal
        };
        self.available.notify_one();
        if let Some(signal) = signal {
            signal.notify_one();
        }
        true
    }

    /// Take the oldest entry without waiting
    pub fn try_dequeue(&self) -> Option<(K, V)> {
        let mut state = self.state.lock();
        while let Some(id) = state.order.pop_front() {
            if let Some(value) = state.values.remove(&id) {
                return Some((id, value));
            }
        }
        None
    }

    /// Wait for the oldest entry
    ///
    /// Returns `None` once `cancel` fires.
    pub async fn dequeue_any(&self, cancel: &CancellationToken) -> Option<(K, V)> {
        loop {
            if let Some(item) = self.try_dequeue() {
                return Some(item);
            }
            if cancel.is_cancelled() {
                return None;
            }
            tokio::select! {
                _ = self.available.notified() => {}
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(POLL_SLICE) => {}
            }
        }
    }

    /// Take the value queued under `id` without waiting
    pub fn try_dequeue_by_id(&self, id: &K) -> Option<V> {
        self.state.lock().take(id)
    }

    /// Wait up to `timeout` for a value under `id`
    ///
    /// Other ids keep their FIFO positions. Several callers may wait on the
    /// same id; each enqueued value goes to one of them. Returns `None` on
    /// timeout or cancellation.
    pub async fn dequeue_by_id(
        &self,
        id: &K,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<V> {
        let deadline = Instant::now().checked_add(timeout);
        let signal = {
            let mut state = self.state.lock();
            if let Some(value) = state.take(id) {
                return Some(value);
            }
            let waiters = state.waiters.entry(id.clone()).or_insert_with(|| IdWaiters {
                signal: Arc::new(Notify::new()),
                count: 0,
            });
            waiters.count += 1;
            waiters.signal.clone()
        };
        let _parked = ParkedWaiter { queue: self, id };

        loop {
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = signal.notified() => {}
                _ = cancel.cancelled() => return None,
                _ = expired => return None,
            }
            if let Some(value) = self.try_dequeue_by_id(id) {
                return Some(value);
            }
        }
    }

    pub fn contains(&self, id: &K) -> bool {
        self.state.lock().values.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Unregisters a `dequeue_by_id` call however it ends
struct ParkedWaiter<'a, K: Eq + Hash, V> {
    queue: &'a InMemoryQueue<K, V>,
    id: &'a K,
}

impl<K: Eq + Hash, V> Drop for ParkedWaiter<'_, K, V> {
    fn drop(&mut self) {
        let mut guard = self.queue.state.lock();
        let state = &mut *guard;
        let Some(waiters) = state.waiters.get_mut(self.id) else {
            return;
        };
        waiters.count -= 1;
        if waiters.count == 0 {
            state.waiters.remove(self.id);
        } else if state.values.contains_key(self.id) {
            // This caller may have swallowed the wakeup meant for the value.
            waiters.signal.notify_one();
        }
    }
}
