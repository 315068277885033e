//! Request/response client over any transport
//!
//! `send()` publishes a request envelope to every configured sender and
//! returns its correlation id straight away; `receive()` waits for the
//! matching reply. How replies come back is fixed at construction:
//!
//! - [`ReplyMode::Shared`]: one subscription on the receiver destination for
//!   the client's lifetime, every reply routed by correlation id.
//! - [`ReplyMode::PerRequest`]: each `receive()` subscribes to
//!   `<receiver>_<correlation id>` and tears that subscription down when it
//!   returns.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use courier_core::ConnectionDescriptor;
//! use courier_fabric::{ClientConfig, MemoryTransport, RequestResponseClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> courier_fabric::Result<()> {
//! let config = ClientConfig::builder()
//!     .sender(ConnectionDescriptor::new("mem://local", "requests"))
//!     .receiver(ConnectionDescriptor::new("mem://local", "replies"))
//!     .build();
//! let client = RequestResponseClient::connect(config, Arc::new(MemoryTransport::new())).await?;
//!
//! let sent = client.send(b"ping").await?;
//! let outcome = client
//!     .receive(sent.correlation_id, Duration::from_secs(5), &CancellationToken::new())
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{ConnectionDescriptor, CorrelationId};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{BincodeCodec, Codec};
use crate::config::{ClientConfig, ReplyMode};
use crate::correlation::{CorrelationTable, Outcome};
use crate::envelope;
use crate::error::{DeliveryFailure, Error, Result};
use crate::metrics::{self, ClientMetrics, ClientMetricsSnapshot};
use crate::pool::{PublishReport, SenderPool};
use crate::transport::{Connection, MessageHandler, Subscription, Transport};

/// Shortest interval between sweeps of replies no caller registered
const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(100);

/// Sends requests and waits for correlated replies
pub struct RequestResponseClient<C = BincodeCodec> {
    config: ClientConfig,
    table: Arc<CorrelationTable<Vec<u8>>>,
    pool: SenderPool,
    replies: ReplyStrategy,
    metrics: Arc<ClientMetrics>,
    codec: C,
    shutdown: CancellationToken,
}

enum ReplyStrategy {
    /// No receiver: requests are fire-and-forget
    Unconfigured,
    Shared(SharedReplies),
    PerRequest(PerRequestReplies),
}

struct SharedReplies {
    destination: ConnectionDescriptor,
    connection: Arc<dyn Connection>,
    subscription: Mutex<Option<Box<dyn Subscription>>>,
    active: AtomicBool,
}

struct PerRequestReplies {
    base: ConnectionDescriptor,
    connection: Arc<dyn Connection>,
}

/// A request that reached at least one destination
#[derive(Debug)]
pub struct Dispatched {
    pub correlation_id: CorrelationId,
    pub report: PublishReport,
}

impl Dispatched {
    /// Destinations that did not accept the request
    pub fn failures(&self) -> Vec<DeliveryFailure> {
        self.report.failures()
    }

    pub fn is_partial(&self) -> bool {
        !self.report.is_success()
    }
}

impl RequestResponseClient<BincodeCodec> {
    /// Connect with the default bincode payload codec
    pub async fn connect(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::connect_with_codec(config, transport, BincodeCodec::default()).await
    }
}

impl<C: Codec> RequestResponseClient<C> {
    /// Connect, opening the reply connection and, in shared mode, the reply
    /// subscription
    pub async fn connect_with_codec(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        codec: C,
    ) -> Result<Self> {
        config.validate()?;

        let table = Arc::new(CorrelationTable::new());
        let metrics = Arc::new(ClientMetrics::new());
        let shutdown = CancellationToken::new();

        let replies = match &config.receiver {
            None => ReplyStrategy::Unconfigured,
            Some(receiver) => {
                let connection: Arc<dyn Connection> =
                    Arc::from(transport.open(receiver.route()).await?);

                let strategy = match config.reply_mode {
                    ReplyMode::Shared => {
                        let handler = Arc::new(SharedReplyHandler {
                            destination: receiver.key().to_string(),
                            table: table.clone(),
                            metrics: metrics.clone(),
                        });
                        let subscribed = connection.subscribe(receiver.name(), handler).await;
                        let subscription = match subscribed {
                            Ok(subscription) => subscription,
                            Err(e) => {
                                let _ = connection.close().await;
                                return Err(e);
                            }
                        };
                        ReplyStrategy::Shared(SharedReplies {
                            destination: receiver.clone(),
                            connection,
                            subscription: Mutex::new(Some(subscription)),
                            active: AtomicBool::new(true),
                        })
                    }
                    ReplyMode::PerRequest => ReplyStrategy::PerRequest(PerRequestReplies {
                        base: receiver.clone(),
                        connection,
                    }),
                };

                spawn_sweeper(table.clone(), config.timeout(), shutdown.clone());
                strategy
            }
        };

        info!(
            senders = config.senders.len(),
            receiver = ?config.receiver.as_ref().map(|r| r.key().to_string()),
            mode = ?config.reply_mode,
            "request/response client connected"
        );

        Ok(Self {
            pool: SenderPool::new(transport, config.pool.clone()),
            config,
            table,
            replies,
            metrics,
            codec,
            shutdown,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn reply_mode(&self) -> ReplyMode {
        self.config.reply_mode
    }

    pub fn sender_pool(&self) -> &SenderPool {
        &self.pool
    }

    /// Requests registered and not yet received
    pub fn in_flight(&self) -> usize {
        self.table.len()
    }

    pub fn is_pending(&self, id: &CorrelationId) -> bool {
        self.table.contains(id)
    }

    pub fn metrics(&self) -> ClientMetricsSnapshot {
        self.metrics.snapshot(self.table.len())
    }

    /// Reply destination name carried by a request with this id
    fn reply_name_for(&self, id: CorrelationId) -> String {
        match &self.replies {
            ReplyStrategy::Unconfigured => String::new(),
            ReplyStrategy::Shared(shared) => shared.destination.name().to_string(),
            ReplyStrategy::PerRequest(per) => per_request_destination(&per.base, id),
        }
    }

    /// Publish a request to every sender without waiting for the reply
    ///
    /// The pending entry is registered before publishing, so a reply that
    /// beats this call back is kept. Fails only if no destination accepted
    /// the request; partial failures are listed in the returned report.
    pub async fn send(&self, payload: &[u8]) -> Result<Dispatched> {
        if self.config.senders.is_empty() {
            return Err(Error::NoSenderConfigured);
        }
        if self.shutdown.is_cancelled() {
            return Err(Error::ShutDown);
        }

        let id = CorrelationId::new();
        let reply_name = self.reply_name_for(id);
        let bytes = envelope::encode(id, &reply_name, payload)?;

        let expects_reply = !matches!(self.replies, ReplyStrategy::Unconfigured);
        if expects_reply {
            self.table.register(id);
            self.metrics.record_in_flight(self.table.len());
        }

        let report = self.pool.publish(&bytes, &self.config.senders).await;
        for failure in report.failures() {
            metrics::incr(&self.metrics.transport_errors);
            warn!(
                correlation_id = %id,
                destination = %failure.destination,
                reason = %failure.reason,
                "request not delivered"
            );
        }

        if report.all_failed() {
            self.table.remove(&id);
            return Err(Error::Publish {
                failures: report.failures(),
            });
        }

        metrics::incr(&self.metrics.requests_sent);
        debug!(correlation_id = %id, reply_to = %reply_name, "request sent");
        Ok(Dispatched {
            correlation_id: id,
            report,
        })
    }

    /// Wait for the reply to `id`
    ///
    /// `timeout` counts from when the request was registered. Whatever the
    /// outcome, `id` is no longer tracked once this returns.
    pub async fn receive(
        &self,
        id: CorrelationId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Outcome<Vec<u8>>> {
        let result = match &self.replies {
            ReplyStrategy::Unconfigured => {
                self.table.remove(&id);
                Err(Error::NoReceiverConfigured)
            }
            ReplyStrategy::Shared(shared) => {
                if shared.active.load(Ordering::SeqCst) {
                    self.table.wait(id, timeout, cancel).await
                } else {
                    self.table.remove(&id);
                    Err(Error::NoReceiverConfigured)
                }
            }
            ReplyStrategy::PerRequest(per) => {
                self.receive_dedicated(per, id, timeout, cancel).await
            }
        };

        self.record(id, &result);
        result
    }

    async fn receive_dedicated(
        &self,
        per: &PerRequestReplies,
        id: CorrelationId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Outcome<Vec<u8>>> {
        let destination = per_request_destination(&per.base, id);
        self.table.register(id);

        let handler = Arc::new(DedicatedReplyHandler {
            correlation_id: id,
            destination: destination.clone(),
            table: self.table.clone(),
            metrics: self.metrics.clone(),
        });
        let subscribed = per
            .connection
            .subscribe_transient(&destination, handler)
            .await;
        let subscription = match subscribed {
            Ok(subscription) => subscription,
            Err(e) => {
                self.table.remove(&id);
                return Err(match e {
                    e @ Error::Transport { .. } => e,
                    e => Error::transport(&destination, e),
                });
            }
        };

        let mut guard = SubscriptionGuard(Some(subscription));
        let result = self.table.wait(id, timeout, cancel).await;
        guard.release().await;
        result
    }

    fn record(&self, id: CorrelationId, result: &Result<Outcome<Vec<u8>>>) {
        match result {
            Ok(Outcome::Reply(_)) => metrics::incr(&self.metrics.replies_received),
            Ok(Outcome::Timeout) => {
                metrics::incr(&self.metrics.timeouts);
                debug!(correlation_id = %id, "request timed out");
            }
            Ok(Outcome::Cancelled) => metrics::incr(&self.metrics.cancellations),
            Err(e) if e.is_transport() => {
                metrics::incr(&self.metrics.transport_errors);
                warn!(correlation_id = %id, error = %e, "receive failed");
            }
            Err(_) => {}
        }
    }

    /// Send and wait in one call
    pub async fn request(
        &self,
        payload: &[u8],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Outcome<Vec<u8>>> {
        let sent = self.send(payload).await?;
        self.receive(sent.correlation_id, timeout, cancel).await
    }

    /// Typed request using the client's payload codec and configured timeout
    pub async fn call<Req, Res>(
        &self,
        request: &Req,
        cancel: &CancellationToken,
    ) -> Result<Outcome<Res>>
    where
        Req: Serialize,
        Res: for<'de> Deserialize<'de>,
    {
        let payload = self.codec.encode(request)?;
        let outcome = self.request(&payload, self.config.timeout(), cancel).await?;
        Ok(match outcome {
            Outcome::Reply(bytes) => Outcome::Reply(self.codec.decode(&bytes)?),
            Outcome::Timeout => Outcome::Timeout,
            Outcome::Cancelled => Outcome::Cancelled,
        })
    }

    /// Stop receiving, cancel everything still waiting and close the pool
    ///
    /// Calling this again does nothing.
    pub async fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let connection = match &self.replies {
            ReplyStrategy::Unconfigured => None,
            ReplyStrategy::Shared(shared) => {
                shared.active.store(false, Ordering::SeqCst);
                if let Some(mut subscription) = shared.subscription.lock().await.take() {
                    if let Err(e) = subscription.unsubscribe().await {
                        warn!(destination = %shared.destination, error = %e, "unsubscribe failed");
                    }
                }
                Some(&shared.connection)
            }
            ReplyStrategy::PerRequest(per) => Some(&per.connection),
        };

        let cancelled = self.table.cancel_all();
        self.pool.shutdown().await;

        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!(error = %e, "closing reply connection failed");
            }
        }
        info!(cancelled, "request/response client closed");
    }
}

impl<C> Drop for RequestResponseClient<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn per_request_destination(base: &ConnectionDescriptor, id: CorrelationId) -> String {
    format!("{}_{}", base.name(), id)
}

/// Periodically drop replies that arrived for requests no caller tracks
///
/// Requests this client sent stay in the table until `receive` collects
/// them, however long that takes.
fn spawn_sweeper(
    table: Arc<CorrelationTable<Vec<u8>>>,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    let period = timeout.max(MIN_SWEEP_PERIOD);
    let max_age = period.saturating_mul(2);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    table.sweep(max_age);
                }
            }
        }
    });
}

/// Unsubscribes when released, or in the background if dropped first
struct SubscriptionGuard(Option<Box<dyn Subscription>>);

impl SubscriptionGuard {
    async fn release(&mut self) {
        if let Some(mut subscription) = self.0.take() {
            if let Err(e) = subscription.unsubscribe().await {
                warn!(
                    destination = subscription.destination(),
                    error = %e,
                    "reply unsubscribe failed"
                );
            }
        }
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let Some(mut subscription) = self.0.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = subscription.unsubscribe().await;
            });
        }
    }
}

/// Routes every reply on the shared subscription by correlation id
struct SharedReplyHandler {
    destination: String,
    table: Arc<CorrelationTable<Vec<u8>>>,
    metrics: Arc<ClientMetrics>,
}

impl MessageHandler for SharedReplyHandler {
    fn on_message(&self, message: Vec<u8>) {
        let envelope = match envelope::decode(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::incr(&self.metrics.malformed);
                warn!(destination = %self.destination, error = %e, "dropping undecodable reply");
                return;
            }
        };

        let id = envelope.correlation_id;
        if !self.table.accept(id, envelope.payload.to_vec()) {
            debug!(correlation_id = %id, "reply for already resolved request dropped");
        }
    }

    fn on_error(&self, error: Error) {
        metrics::incr(&self.metrics.transport_errors);
        let failed = self.table.fail_all(&self.destination, &error.to_string());
        warn!(destination = %self.destination, error = %error, failed, "reply subscription failed");
    }
}

/// Handles the reply destination of a single request
struct DedicatedReplyHandler {
    correlation_id: CorrelationId,
    destination: String,
    table: Arc<CorrelationTable<Vec<u8>>>,
    metrics: Arc<ClientMetrics>,
}

impl MessageHandler for DedicatedReplyHandler {
    fn on_message(&self, message: Vec<u8>) {
        let envelope = match envelope::decode(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::incr(&self.metrics.malformed);
                warn!(destination = %self.destination, error = %e, "dropping undecodable reply");
                return;
            }
        };

        if envelope.correlation_id != self.correlation_id {
            warn!(
                destination = %self.destination,
                expected = %self.correlation_id,
                got = %envelope.correlation_id,
                "reply with foreign correlation id ignored"
            );
            return;
        }

        self.table.accept(self.correlation_id, envelope.payload.to_vec());
    }

    fn on_error(&self, error: Error) {
        self.table.fail(self.correlation_id, error);
    }
}
