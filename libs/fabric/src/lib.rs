//! Courier Fabric - Request/response correlation over queue transports
//!
//! Publishes request envelopes to named destinations and matches the
//! replies that come back, whatever carries them: a broker client or the
//! in-process [`MemoryTransport`].
//!
//! - [`envelope`]: binary framing `[id:16][name_len:4 LE][name][payload]`
//! - [`correlation`]: pending requests keyed by correlation id
//! - [`pool`]: per-destination pools of outbound connections
//! - [`client`]: sends requests and awaits replies, shared or per-request
//!   reply subscriptions
//! - [`listener`]: server-side consumer raising request/response events
//! - [`queue`]: keyed FIFO for broker-less request/response in one process
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use courier_core::ConnectionDescriptor;
//! use courier_fabric::{
//!     ClientConfig, InboundRequest, Listener, ListenerConfig, ListenerEvents, ListenerRole,
//!     MemoryTransport, RequestResponseClient,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! struct Echo;
//!
//! impl ListenerEvents for Echo {
//!     fn request_received(&self, request: InboundRequest) {
//!         tokio::spawn(async move {
//!             let _ = request.reply(&request.payload).await;
//!         });
//!     }
//! }
//!
//! # async fn example() -> courier_fabric::Result<()> {
//! let transport = Arc::new(MemoryTransport::new());
//!
//! let listener = Listener::new(
//!     ListenerConfig {
//!         destination: ConnectionDescriptor::new("mem://local", "echo"),
//!         role: ListenerRole::RequestServer,
//!     },
//!     transport.clone(),
//!     Arc::new(Echo),
//! );
//! listener.start().await?;
//!
//! let config = ClientConfig::builder()
//!     .sender(ConnectionDescriptor::new("mem://local", "echo"))
//!     .receiver(ConnectionDescriptor::new("mem://local", "echo-replies"))
//!     .build();
//! let client = RequestResponseClient::connect(config, transport).await?;
//!
//! let reply = client
//!     .request(b"hello", Duration::from_secs(5), &CancellationToken::new())
//!     .await?
//!     .into_reply()?;
//! assert_eq!(reply, b"hello");
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod correlation;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod transport;

// Re-exports for convenience
pub use client::{Dispatched, RequestResponseClient};
pub use config::{ClientConfig, ListenerConfig, ListenerRole, PoolConfig, ReplyMode};
pub use correlation::{CorrelationTable, Outcome, PendingRequest, PendingState};
pub use envelope::Envelope;
pub use error::{DeliveryFailure, Error, Result};
pub use listener::{
    InboundRequest, InboundResponse, Listener, ListenerEvents, ListenerState, Replier,
};
pub use pool::{PublishReport, SenderPool};
pub use queue::InMemoryQueue;
pub use transport::{Connection, MemoryTransport, MessageHandler, Subscription, Transport};
