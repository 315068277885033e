use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// 128-bit identifier linking a request envelope to its reply
///
/// Backed by a random (v4) UUID. The wire form is the 16 raw bytes in
/// big-endian order, the text form is the lowercase hyphenated UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Size of the wire form in bytes
    pub const LEN: usize = 16;

    /// Allocate a new, globally unique id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The all-zero id, never produced by [`CorrelationId::new`]
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Read an id from the first 16 bytes of a slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Uuid::from_slice(bytes)
            .map(Self)
            .map_err(|e| Error::InvalidCorrelationId(e.to_string()))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for CorrelationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::InvalidCorrelationId(format!("{s:?}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn new_ids_are_unique() {
        let ids: HashSet<_> = (0..1000).map(|_| CorrelationId::new()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn bytes_roundtrip() {
        let id = CorrelationId::new();
        let back = CorrelationId::from_slice(id.as_bytes()).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn from_slice_rejects_short_input() {
        let err = CorrelationId::from_slice(&[1, 2, 3]).unwrap_err();
        assert!(matches!(err, Error::InvalidCorrelationId(_)));
    }

    #[test]
    fn text_form_is_lowercase_hyphenated() {
        let id = CorrelationId::from_bytes([0xAB; 16]);
        assert_eq!(id.to_string(), "abababab-abab-abab-abab-abababababab");
        assert_eq!(id.to_string().parse::<CorrelationId>().unwrap(), id);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("not-an-id".parse::<CorrelationId>().is_err());
    }

    #[test]
    fn serde_uses_text_form() {
        let id = CorrelationId::from_bytes([0x01; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"01010101-0101-0101-0101-010101010101\"");
    }
}
