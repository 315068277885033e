//! Binary framing of (correlation id, reply name, payload)
//!
//! Wire layout, no padding:
//!
//! ```text
//! [correlation_id: 16 bytes]
//! [name_len: 4 bytes (u32, little-endian)]
//! [name: name_len bytes (UTF-8)]
//! [payload: remaining bytes]
//! ```
//!
//! The fixed header lets a receiver route by correlation id before any
//! payload deserializer runs. The payload is opaque to this layer.

use courier_core::CorrelationId;

use crate::error::{Error, Result};

/// 16 (correlation id) + 4 (name length)
pub const HEADER_SIZE: usize = CorrelationId::LEN + 4;

/// Borrowed view of one envelope
///
/// Decoding never copies: `reply_name` and `payload` point into the
/// buffer that was decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope<'a> {
    pub correlation_id: CorrelationId,
    pub reply_name: &'a str,
    pub payload: &'a [u8],
}

impl<'a> Envelope<'a> {
    pub fn new(correlation_id: CorrelationId, reply_name: &'a str, payload: &'a [u8]) -> Self {
        Self {
            correlation_id,
            reply_name,
            payload,
        }
    }

    /// Size of the encoded form
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.reply_name.len() + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self.correlation_id, self.reply_name, self.payload)
    }

    pub fn decode(bytes: &'a [u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Encode an envelope into one contiguous buffer
///
/// Fails only if `reply_name` does not fit the 32-bit length field.
pub fn encode(
    correlation_id: CorrelationId,
    reply_name: &str,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let name_len = u32::try_from(reply_name.len()).map_err(|_| {
        Error::MalformedEnvelope(format!("reply name of {} bytes", reply_name.len()))
    })?;

    let mut buf = Vec::with_capacity(HEADER_SIZE + reply_name.len() + payload.len());
    buf.extend_from_slice(correlation_id.as_bytes());
    buf.extend_from_slice(&name_len.to_le_bytes());
    buf.extend_from_slice(reply_name.as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode an envelope without copying its name or payload
pub fn decode(bytes: &[u8]) -> Result<Envelope<'_>> {
    let too_short = || {
        Error::MalformedEnvelope(format!(
            "need at least {} bytes, have {}",
            HEADER_SIZE,
            bytes.len()
        ))
    };
    let (id, rest) = bytes
        .split_first_chunk::<{ CorrelationId::LEN }>()
        .ok_or_else(too_short)?;
    let (len, rest) = rest.split_first_chunk::<4>().ok_or_else(too_short)?;

    let correlation_id = CorrelationId::from_bytes(*id);
    let name_len = u32::from_le_bytes(*len) as usize;
    if name_len > rest.len() {
        return Err(Error::MalformedEnvelope(format!(
            "declared name length {} overruns the {} remaining bytes",
            name_len,
            rest.len()
        )));
    }

    let (name_bytes, payload) = rest.split_at(name_len);
    let reply_name = std::str::from_utf8(name_bytes)
        .map_err(|e| Error::MalformedEnvelope(format!("reply name is not UTF-8: {e}")))?;

    Ok(Envelope {
        correlation_id,
        reply_name,
        payload,
    })
}
