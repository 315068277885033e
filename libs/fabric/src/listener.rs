//! Server-side subscription lifecycle
//!
//! A [`Listener`] subscribes to one destination, decodes every envelope it
//! receives and hands it to an injected [`ListenerEvents`] implementation.
//! What happens next (dispatch, building a reply) belongs to that
//! implementation; requests carry a [`Replier`] for sending the reply.
//!
//! ```text
//! Created ──start()──► Started ──stop()──► Stopped
//!    └──────────────stop()───────────────────┘
//! ```

use std::sync::Arc;

use courier_core::{ConnectionDescriptor, CorrelationId};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ListenerConfig, ListenerRole};
use crate::envelope;
use crate::error::{Error, Result};
use crate::metrics::{self, ListenerMetrics};
use crate::transport::{Connection, MessageHandler, Subscription, Transport};

/// A request envelope delivered to a request server
pub struct InboundRequest {
    pub correlation_id: CorrelationId,
    pub reply_name: String,
    pub payload: Vec<u8>,
    replier: Replier,
}

impl InboundRequest {
    /// Handle for replying later, possibly from another task
    pub fn replier(&self) -> Replier {
        self.replier.clone()
    }

    /// Publish the reply to this request's reply destination
    pub async fn reply(&self, payload: &[u8]) -> Result<()> {
        self.replier.reply(payload).await
    }
}

/// A response envelope delivered to a response server
#[derive(Debug, Clone)]
pub struct InboundResponse {
    pub correlation_id: CorrelationId,
    pub reply_name: String,
    pub payload: Vec<u8>,
}

/// Sends the reply for one request over the listener's connection
#[derive(Clone)]
pub struct Replier {
    connection: Arc<dyn Connection>,
    correlation_id: CorrelationId,
    reply_name: String,
}

impl Replier {
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Publish `(correlation_id, "", payload)` to the reply destination
    pub async fn reply(&self, payload: &[u8]) -> Result<()> {
        if self.reply_name.is_empty() {
            return Err(Error::NoReplyDestination);
        }
        let bytes = envelope::encode(self.correlation_id, "", payload)?;
        self.connection.publish(&self.reply_name, &bytes).await
    }
}

/// Events raised by a listener, one per decoded envelope
///
/// Called on the transport's delivery task; long work should be spawned.
pub trait ListenerEvents: Send + Sync + 'static {
    fn request_received(&self, _request: InboundRequest) {}

    fn response_received(&self, _response: InboundResponse) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Started,
    Stopped,
}

/// Consumes one destination and raises request or response events
pub struct Listener {
    config: ListenerConfig,
    transport: Arc<dyn Transport>,
    events: Arc<dyn ListenerEvents>,
    metrics: Arc<ListenerMetrics>,
    inner: Mutex<ListenerInner>,
}

struct ListenerInner {
    state: ListenerState,
    connection: Option<Arc<dyn Connection>>,
    subscription: Option<Box<dyn Subscription>>,
}

impl Listener {
    pub fn new(
        config: ListenerConfig,
        transport: Arc<dyn Transport>,
        events: Arc<dyn ListenerEvents>,
    ) -> Self {
        Self {
            config,
            transport,
            events,
            metrics: Arc::new(ListenerMetrics::new()),
            inner: Mutex::new(ListenerInner {
                state: ListenerState::Created,
                connection: None,
                subscription: None,
            }),
        }
    }

    pub fn destination(&self) -> &ConnectionDescriptor {
        &self.config.destination
    }

    pub fn role(&self) -> ListenerRole {
        self.config.role
    }

    pub fn metrics(&self) -> &ListenerMetrics {
        &self.metrics
    }

    pub async fn state(&self) -> ListenerState {
        self.inner.lock().await.state
    }

    /// Open a connection and start consuming
    ///
    /// A listener starts once; later calls fail with `InvalidState`.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state != ListenerState::Created {
            return Err(Error::InvalidState(format!(
                "listener on {} cannot start from {:?}",
                self.config.destination, inner.state
            )));
        }
        self.config.destination.validate()?;

        let destination = &self.config.destination;
        let connection: Arc<dyn Connection> =
            Arc::from(self.transport.open(destination.route()).await?);

        let dispatch = Arc::new(Dispatch {
            role: self.config.role,
            destination: destination.key().to_string(),
            connection: connection.clone(),
            events: self.events.clone(),
            metrics: self.metrics.clone(),
        });

        let subscription = match connection.subscribe(destination.name(), dispatch).await {
            Ok(subscription) => subscription,
            Err(e) => {
                if let Err(close_err) = connection.close().await {
                    debug!(
                        destination = %destination,
                        error = %close_err,
                        "close after failed subscribe"
                    );
                }
                return Err(e);
            }
        };

        inner.connection = Some(connection);
        inner.subscription = Some(subscription);
        inner.state = ListenerState::Started;
        info!(destination = %destination, role = ?self.config.role, "listener started");
        Ok(())
    }

    /// Unsubscribe and release the connection
    ///
    /// Safe from any state and on repeated calls. Failures while tearing
    /// down are logged, never returned.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state == ListenerState::Stopped {
            return;
        }
        inner.state = ListenerState::Stopped;

        if let Some(mut subscription) = inner.subscription.take() {
            if let Err(e) = subscription.unsubscribe().await {
                warn!(destination = %self.config.destination, error = %e, "unsubscribe failed");
            }
        }
        if let Some(connection) = inner.connection.take() {
            if let Err(e) = connection.close().await {
                warn!(
                    destination = %self.config.destination,
                    error = %e,
                    "closing listener connection failed"
                );
            }
        }
        info!(destination = %self.config.destination, "listener stopped");
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let subscription = inner.subscription.take();
        let connection = inner.connection.take();
        if subscription.is_none() && connection.is_none() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Some(mut subscription) = subscription {
                    let _ = subscription.unsubscribe().await;
                }
                if let Some(connection) = connection {
                    let _ = connection.close().await;
                }
            });
        }
    }
}

struct Dispatch {
    role: ListenerRole,
    destination: String,
    connection: Arc<dyn Connection>,
    events: Arc<dyn ListenerEvents>,
    metrics: Arc<ListenerMetrics>,
}

impl MessageHandler for Dispatch {
    fn on_message(&self, message: Vec<u8>) {
        metrics::incr(&self.metrics.envelopes_received);

        let envelope = match envelope::decode(&message) {
            Ok(envelope) => envelope,
            Err(e) => {
                metrics::incr(&self.metrics.malformed);
                warn!(destination = %self.destination, error = %e, "dropping undecodable envelope");
                return;
            }
        };

        debug!(
            destination = %self.destination,
            correlation_id = %envelope.correlation_id,
            "envelope received"
        );

        match self.role {
            ListenerRole::RequestServer => {
                metrics::incr(&self.metrics.requests);
                self.events.request_received(InboundRequest {
                    correlation_id: envelope.correlation_id,
                    reply_name: envelope.reply_name.to_string(),
                    payload: envelope.payload.to_vec(),
                    replier: Replier {
                        connection: self.connection.clone(),
                        correlation_id: envelope.correlation_id,
                        reply_name: envelope.reply_name.to_string(),
                    },
                });
            }
            ListenerRole::ResponseServer => {
                metrics::incr(&self.metrics.responses);
                self.events.response_received(InboundResponse {
                    correlation_id: envelope.correlation_id,
                    reply_name: envelope.reply_name.to_string(),
                    payload: envelope.payload.to_vec(),
                });
            }
        }
    }

    fn on_error(&self, error: Error) {
        // The subscription stays up; the transport decides whether to retry.
        warn!(destination = %self.destination, error = %error, "listener subscription error");
    }
}
