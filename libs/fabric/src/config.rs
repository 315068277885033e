//! Client and listener configuration
//!
//! Loading and per-environment selection happen outside this crate; these
//! structs only describe the result, deserializable from any serde format.

use std::time::Duration;

use courier_core::ConnectionDescriptor;
use serde::Deserialize;

use crate::error::{Error, Result};

/// How replies find their way back to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// One long-lived subscription, demultiplexed by correlation id
    #[default]
    Shared,
    /// A reply destination `<receiver>_<correlation id>` per request
    PerRequest,
}

/// Request/response client settings
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Every request is published to all of these
    #[serde(default)]
    pub senders: Vec<ConnectionDescriptor>,
    /// Reply destination (shared mode) or base name (per-request mode)
    #[serde(default)]
    pub receiver: Option<ConnectionDescriptor>,
    #[serde(default)]
    pub reply_mode: ReplyMode,
    /// Default wait for `request()`, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub pool: PoolConfig,
}

/// Sender pool settings, applied per destination
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Ceiling on connections per destination
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long a checkout may wait at the ceiling before failing.
    /// Waits indefinitely when unset.
    #[serde(default)]
    pub checkout_timeout_ms: Option<u64>,
}

/// Which event a listener raises for inbound envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerRole {
    RequestServer,
    ResponseServer,
}

/// Listener settings
#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    pub destination: ConnectionDescriptor,
    pub role: ListenerRole,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_connections() -> usize {
    16
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            checkout_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    pub fn checkout_timeout(&self) -> Option<Duration> {
        self.checkout_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            senders: Vec::new(),
            receiver: None,
            reply_mode: ReplyMode::default(),
            timeout_ms: default_timeout_ms(),
            pool: PoolConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Check descriptors and pool limits
    ///
    /// Missing senders or receiver are not errors here; they surface when
    /// the client is asked to send or receive.
    pub fn validate(&self) -> Result<()> {
        for sender in &self.senders {
            sender.validate()?;
        }
        if let Some(receiver) = &self.receiver {
            receiver.validate()?;
        }
        if self.pool.max_connections == 0 {
            return Err(Error::InvalidState(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`ClientConfig`]
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a destination every request is published to
    pub fn sender(mut self, descriptor: ConnectionDescriptor) -> Self {
        self.config.senders.push(descriptor);
        self
    }

    /// Set the reply destination
    pub fn receiver(mut self, descriptor: ConnectionDescriptor) -> Self {
        self.config.receiver = Some(descriptor);
        self
    }

    pub fn reply_mode(mut self, mode: ReplyMode) -> Self {
        self.config.reply_mode = mode;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.config.pool.max_connections = max;
        self
    }

    pub fn checkout_timeout(mut self, timeout: Duration) -> Self {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.config.pool.checkout_timeout_ms = Some(millis);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
