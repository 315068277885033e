//! Courier Core - Identity types shared by every courier library
//!
//! Provides the correlation id that links a request to its reply and the
//! descriptor that names a destination on a transport.

pub mod descriptor;
pub mod error;
pub mod id;

pub use descriptor::ConnectionDescriptor;
pub use error::{Error, Result};
pub use id::CorrelationId;
