//! Error types
//!
//! Most overlay failures are not errors: stale leaves are no-ops, handshake
//! timeouts close the tentative channel, and lost signaling heals through
//! later leave reports. What remains is codec failures, use of a terminated
//! coordinator or node, and a vanished transport.

/// Result alias for overlay operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for overlay operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Payload is not a valid signaling message
    #[error("Malformed signaling message: {0}")]
    Decode(#[from] serde_json::Error),

    /// Message could not be serialized
    #[error("Failed to encode signaling message: {0}")]
    Encode(#[source] serde_json::Error),

    /// Payload exceeds the signaling size limit
    #[error("Signaling message too large: {0} bytes")]
    MessageTooLarge(usize),

    /// The coordinator was shut down; a fresh instance is required
    #[error("Coordinator has been shut down")]
    CoordinatorClosed,

    /// The node left the overlay; a fresh instance is required
    #[error("Node has left the overlay")]
    NodeLeft,

    /// The transport dropped its command or event channel
    #[error("Transport closed")]
    TransportClosed,
}
