//! JSON wire encoding for envelopes.
//!
//! Decode failures are a distinct type because the consuming loops treat them
//! differently from every other error: the message is acknowledged and
//! dropped, since nobody can be identified to receive an error.

use serde::Serialize;
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("envelope is not valid UTF-8")]
    NotUtf8,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to encode envelope: {0}")]
pub struct EncodeError(#[from] serde_json::Error);

/// Serialize an envelope to its wire bytes.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Parse wire bytes into an envelope.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    let text = std::str::from_utf8(bytes).map_err(|_| DecodeError::NotUtf8)?;
    Ok(serde_json::from_str(text)?)
}
