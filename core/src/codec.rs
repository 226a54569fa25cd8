//! Canonical binary serialization
//!
//! Block and transaction hashes are computed over serialized bytes, so the
//! codec must be deterministic and identical across nodes: bincode's default
//! configuration (fixed-width little-endian integers, length-prefixed
//! sequences, fields in declaration order) gives exactly that. Malformed
//! bytes always surface as [`CodecError`]; nothing is silently truncated.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("malformed bytes: {0}")]
    Decode(String),
}

/// Serialize a value into its canonical byte representation.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    bincode::serialize(value).map_err(|err| CodecError::Encode(err.to_string()))
}

/// Decode a value previously produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    bincode::deserialize(bytes).map_err(|err| CodecError::Decode(err.to_string()))
}
