//! Signaling wire codec
//!
//! Messages travel as JSON objects in a single transport datagram. Decoding
//! happens once, at the transport boundary; everything past it matches on
//! [`SignalingMessage`].

use bytes::Bytes;

use crate::error::{Error, Result};

use super::message::SignalingMessage;

/// Largest accepted signaling payload in bytes
pub const MAX_SIGNALING_MESSAGE_SIZE: usize = 4 * 1024;

/// Serialize a message for the wire
pub fn encode(message: &SignalingMessage) -> Result<Bytes> {
    let payload = serde_json::to_vec(message).map_err(Error::Encode)?;
    Ok(Bytes::from(payload))
}

/// Parse a message received from the wire
pub fn decode(payload: &[u8]) -> Result<SignalingMessage> {
    if payload.len() > MAX_SIGNALING_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge(payload.len()));
    }
    Ok(serde_json::from_slice(payload)?)
}
