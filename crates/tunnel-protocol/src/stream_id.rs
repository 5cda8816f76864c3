//! 16-byte stream identifiers, generated by whichever side opens the stream.

use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Identifies one logical stream (request/response, raw TCP, or WebSocket)
/// within a transport connection. Never reused within the connection's
/// lifetime (the 128-bit random space makes collision negligible).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct StreamId([u8; 16]);

impl StreamId {
    /// Generate a fresh, random stream ID.
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self)
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> Self {
        id.to_string()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed stream id {0:?}: expected 32 hex characters")]
pub struct ParseStreamIdError(String);

impl TryFrom<String> for StreamId {
    type Error = ParseStreamIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.len() != 32 {
            return Err(ParseStreamIdError(value));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in value.as_bytes().chunks(2).enumerate() {
            let hex_pair = std::str::from_utf8(chunk).map_err(|_| ParseStreamIdError(value.clone()))?;
            bytes[i] = u8::from_str_radix(hex_pair, 16).map_err(|_| ParseStreamIdError(value.clone()))?;
        }
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_string() {
        let id = StreamId::new();
        let s = id.to_string();
        let parsed: StreamId = s.clone().try_into().unwrap();
        assert_eq!(id, parsed);
        assert_eq!(s.len(), 32);
    }

    #[test]
    fn two_fresh_ids_differ() {
        assert_ne!(StreamId::new(), StreamId::new());
    }

    #[test]
    fn rejects_short_string() {
        let result: Result<StreamId, _> = "abcd".to_string().try_into();
        assert!(result.is_err());
    }
}
