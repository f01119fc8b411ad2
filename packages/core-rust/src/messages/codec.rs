//! MessagePack encoding of [`Message`] frames.
//!
//! Uses named (map-style) encoding so fields can be added without breaking
//! older peers.

use super::Message;

/// Errors from encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encodes a message into a MessagePack frame.
///
/// # Errors
///
/// Returns `CodecError::Encode` if serialization fails.
pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Decodes a MessagePack frame into a message.
///
/// # Errors
///
/// Returns `CodecError::Decode` for malformed frames or unknown type codes.
pub fn decode(bytes: &[u8]) -> Result<Message, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}
