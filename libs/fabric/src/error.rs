use std::fmt;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No sender destination configured")]
    NoSenderConfigured,

    #[error("No receiver destination configured")]
    NoReceiverConfigured,

    #[error("Request carries no reply destination")]
    NoReplyDestination,

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Transport error on {destination}: {reason}")]
    Transport { destination: String, reason: String },

    #[error("Publish failed on every destination: {}", format_failures(.failures))]
    Publish { failures: Vec<DeliveryFailure> },

    #[error("Request timed out")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,

    #[error("Connection pool for {destination} exhausted ({ceiling} connections)")]
    PoolExhausted { destination: String, ceiling: usize },

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Shut down")]
    ShutDown,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error(transparent)]
    Core(#[from] courier_core::Error),
}

impl Error {
    pub fn transport(destination: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Transport {
            destination: destination.into(),
            reason: reason.to_string(),
        }
    }

    /// True for errors caused by missing senders, receivers or reply routes
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::NoSenderConfigured | Self::NoReceiverConfigured | Self::NoReplyDestination
        )
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Publish { .. } | Self::ConnectionClosed
        )
    }
}

/// A destination a publish could not reach
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub destination: String,
    pub reason: String,
}

fn format_failures(failures: &[DeliveryFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{} ({})", f.destination, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, Error>;
