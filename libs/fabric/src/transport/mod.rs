use std::sync::Arc;

use crate::error::{Error, Result};

pub mod memory;

pub use self::memory::{MemoryConnection, MemorySubscription, MemoryTransport, TOMBSTONE_TTL};

/// Entry point of a transport plugin
///
/// Broker clients and in-process queues both implement this; the rest of
/// the crate never looks behind the trait object.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open a connection to a transport address
    async fn open(&self, route: &str) -> Result<Box<dyn Connection>>;
}

/// One open connection to a transport address
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    /// Publish bytes to a named destination
    async fn publish(&self, destination: &str, bytes: &[u8]) -> Result<()>;

    /// Start delivering messages from a named destination to `handler`
    async fn subscribe(
        &self,
        destination: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn Subscription>>;

    /// Subscribe to a destination that lives only as long as its consumers
    ///
    /// Once the last subscription ends, the destination and anything queued
    /// on it may be discarded. Transports without such destinations fall
    /// back to a plain subscription.
    async fn subscribe_transient(
        &self,
        destination: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn Subscription>> {
        self.subscribe(destination, handler).await
    }

    /// Close the connection
    async fn close(&self) -> Result<()>;
}

/// A live subscription
#[async_trait::async_trait]
pub trait Subscription: Send + Sync {
    /// Destination this subscription consumes from
    fn destination(&self) -> &str;

    /// Stop delivery. Calling this more than once is a no-op.
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Callback interface invoked by a transport for each delivered message
///
/// Runs on a transport-owned task, so implementations must not block.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, message: Vec<u8>);

    /// Called when the subscription itself fails
    fn on_error(&self, _error: Error) {}
}

impl<F> MessageHandler for F
where
    F: Fn(Vec<u8>) + Send + Sync + 'static,
{
    fn on_message(&self, message: Vec<u8>) {
        self(message)
    }
}
