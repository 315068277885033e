use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::{Error, Result};

/// Bincode codec for binary payloads
///
/// Uses the same fixed-width integer layout as `bincode::serialize`. An
/// optional size limit rejects payloads that would decode into more than
/// `limit` bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeCodec {
    limit: Option<u64>,
}

impl BincodeCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse to encode or decode values larger than `limit` bytes
    pub fn with_limit(limit: u64) -> Self {
        Self { limit: Some(limit) }
    }
}

impl Codec for BincodeCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let options = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes();
        match self.limit {
            Some(limit) => options.with_limit(limit).serialize(value),
            None => options.serialize(value),
        }
        .map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8]) -> Result<T> {
        let options = bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .allow_trailing_bytes();
        match self.limit {
            Some(limit) => options.with_limit(limit).deserialize(bytes),
            None => options.deserialize(bytes),
        }
        .map_err(|e| Error::Codec(e.to_string()))
    }
}
