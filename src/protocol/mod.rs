//! Overlay signaling protocol
//!
//! Three message kinds travel over short-lived control channels, separate
//! from the media path:
//!
//! ```text
//!   viewer ── JoinRequest ─────────────► origin
//!   origin ── AssignNeighbor{P, role} ─► parent   (parent then calls P)
//!   origin ── AssignNeighbor{-, role} ─► parent   (slot emptied)
//!   parent ── LeaveNotification{C} ────► origin   (child C vanished)
//!   viewer ── LeaveNotification{self} ─► origin   (leaving / orphaned)
//! ```
//!
//! A channel is opened per message and may be closed as soon as the message
//! is handled. Only per-channel delivery order is assumed.

pub mod codec;
pub mod message;

pub use codec::{decode, encode, MAX_SIGNALING_MESSAGE_SIZE};
pub use message::{Role, SignalingMessage};
