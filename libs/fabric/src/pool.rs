//! Per-destination pools of outbound connections
//!
//! Connections open lazily on first checkout and go back to their pool when
//! the checkout handle drops. A semaphore per destination enforces the
//! ceiling, so a checkout at the ceiling waits for a return (or fails with
//! `PoolExhausted` once the configured checkout timeout passes).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use courier_core::ConnectionDescriptor;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{DeliveryFailure, Error, Result};
use crate::transport::{Connection, Transport};

/// Pool of outbound connections keyed by destination
pub struct SenderPool {
    transport: Arc<dyn Transport>,
    config: PoolConfig,
    entries: DashMap<String, Arc<PoolEntry>>,
    closed: Arc<AtomicBool>,
}

struct PoolEntry {
    descriptor: ConnectionDescriptor,
    idle: Mutex<Vec<Box<dyn Connection>>>,
    permits: Arc<Semaphore>,
    live: AtomicUsize,
}

impl SenderPool {
    pub fn new(transport: Arc<dyn Transport>, config: PoolConfig) -> Self {
        Self {
            transport,
            config,
            entries: DashMap::new(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn entry(&self, descriptor: &ConnectionDescriptor) -> Arc<PoolEntry> {
        let ceiling = self.config.max_connections.clamp(1, Semaphore::MAX_PERMITS);
        self.entries
            .entry(descriptor.key().to_string())
            .or_insert_with(|| {
                Arc::new(PoolEntry {
                    descriptor: descriptor.clone(),
                    idle: Mutex::new(Vec::new()),
                    permits: Arc::new(Semaphore::new(ceiling)),
                    live: AtomicUsize::new(0),
                })
            })
            .clone()
    }

    /// Take exclusive use of a connection to `descriptor`'s route
    pub async fn checkout(&self, descriptor: &ConnectionDescriptor) -> Result<PooledConnection> {
        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }

        let entry = self.entry(descriptor);
        let acquire = entry.permits.clone().acquire_owned();
        let permit = match self.config.checkout_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, acquire).await.map_err(|_| {
                Error::PoolExhausted {
                    destination: descriptor.key().to_string(),
                    ceiling: self.config.max_connections,
                }
            })?,
            None => acquire.await,
        }
        .map_err(|_| Error::ShutDown)?;

        if self.is_shut_down() {
            return Err(Error::ShutDown);
        }

        let reused = entry.idle.lock().pop();
        let connection = match reused {
            Some(connection) => connection,
            None => {
                let connection = self.transport.open(descriptor.route()).await?;
                let live = entry.live.fetch_add(1, Ordering::SeqCst) + 1;
                debug!(destination = %descriptor, live, "opened pooled connection");
                connection
            }
        };

        Ok(PooledConnection {
            connection: Some(connection),
            entry,
            closed: self.closed.clone(),
            _permit: permit,
        })
    }

    /// Publish `bytes` to every destination
    ///
    /// Delivery is best effort: each destination succeeds or fails on its
    /// own and the report says which ones failed.
    pub async fn publish(
        &self,
        bytes: &[u8],
        destinations: &[ConnectionDescriptor],
    ) -> PublishReport {
        let deliveries = destinations.iter().map(|destination| async move {
            let result = self.publish_one(destination, bytes).await;
            DeliveryResult {
                destination: destination.clone(),
                result,
            }
        });

        PublishReport {
            deliveries: join_all(deliveries).await,
        }
    }

    async fn publish_one(&self, destination: &ConnectionDescriptor, bytes: &[u8]) -> Result<()> {
        let connection = self
            .checkout(destination)
            .await
            .map_err(|e| as_transport_error(destination, e))?;

        match connection.publish(destination.name(), bytes).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(
                    destination = %destination,
                    error = %e,
                    "publish failed, discarding connection"
                );
                connection.discard();
                Err(as_transport_error(destination, e))
            }
        }
    }

    /// Close every pooled connection and forget all destinations
    ///
    /// Connections checked out at this point are not interrupted; they are
    /// closed when their holder drops them.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let entries: Vec<Arc<PoolEntry>> =
            self.entries.iter().map(|e| e.value().clone()).collect();
        self.entries.clear();

        let mut closed = 0usize;
        for entry in entries {
            entry.permits.close();
            let idle = std::mem::take(&mut *entry.idle.lock());
            for connection in idle {
                if let Err(e) = connection.close().await {
                    warn!(
                        destination = %entry.descriptor,
                        error = %e,
                        "error closing pooled connection"
                    );
                }
                entry.live.fetch_sub(1, Ordering::SeqCst);
                closed += 1;
            }
        }
        info!(closed, "sender pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Connections currently open for `descriptor`, idle or checked out
    pub fn live_connections(&self, descriptor: &ConnectionDescriptor) -> usize {
        self.entries
            .get(descriptor.key())
            .map(|e| e.live.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn idle_connections(&self, descriptor: &ConnectionDescriptor) -> usize {
        self.entries
            .get(descriptor.key())
            .map(|e| e.idle.lock().len())
            .unwrap_or(0)
    }
}

fn as_transport_error(destination: &ConnectionDescriptor, error: Error) -> Error {
    match error {
        e @ Error::Transport { .. } => e,
        e => Error::transport(destination.key(), e),
    }
}

/// Exclusive handle on a pooled connection
///
/// Returned to the pool on drop. After pool shutdown the connection is
/// closed instead.
pub struct PooledConnection {
    connection: Option<Box<dyn Connection>>,
    entry: Arc<PoolEntry>,
    closed: Arc<AtomicBool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    pub async fn publish(&self, destination: &str, bytes: &[u8]) -> Result<()> {
        match &self.connection {
            Some(connection) => connection.publish(destination, bytes).await,
            None => Err(Error::ConnectionClosed),
        }
    }

    /// Close the connection instead of returning it to the pool
    pub fn discard(mut self) {
        if let Some(connection) = self.connection.take() {
            self.entry.live.fetch_sub(1, Ordering::SeqCst);
            close_in_background(connection);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        if self.closed.load(Ordering::SeqCst) {
            self.entry.live.fetch_sub(1, Ordering::SeqCst);
            close_in_background(connection);
        } else {
            self.entry.idle.lock().push(connection);
        }
    }
}

fn close_in_background(connection: Box<dyn Connection>) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(async move {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "error closing discarded connection");
            }
        });
    }
}

/// Result of publishing to one destination
#[derive(Debug)]
pub struct DeliveryResult {
    pub destination: ConnectionDescriptor,
    pub result: Result<()>,
}

/// Per-destination results of a fan-out publish
#[derive(Debug, Default)]
pub struct PublishReport {
    pub deliveries: Vec<DeliveryResult>,
}

impl PublishReport {
    /// Every destination accepted the message
    pub fn is_success(&self) -> bool {
        self.deliveries.iter().all(|d| d.result.is_ok())
    }

    /// At least one destination was targeted and none accepted the message
    pub fn all_failed(&self) -> bool {
        !self.deliveries.is_empty() && self.deliveries.iter().all(|d| d.result.is_err())
    }

    pub fn succeeded(&self) -> usize {
        self.deliveries.iter().filter(|d| d.result.is_ok()).count()
    }

    pub fn failures(&self) -> Vec<DeliveryFailure> {
        self.deliveries
            .iter()
            .filter_map(|d| match &d.result {
                Ok(()) => None,
                Err(e) => Some(DeliveryFailure {
                    destination: d.destination.key().to_string(),
                    reason: e.to_string(),
                }),
            })
            .collect()
    }
}
