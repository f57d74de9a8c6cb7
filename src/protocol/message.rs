//! Signaling message types
//!
//! Tags and field names match the browser clients' wire format so both can sit
//! on the same overlay:
//!
//! | Variant             | Wire form                                        |
//! |---------------------|--------------------------------------------------|
//! | `JoinRequest`       | `{"type":"connectToStream"}`                     |
//! | `AssignNeighbor`    | `{"type":"newPeerLeaf","peerId":..,"leaf":..}`   |
//! | `LeaveNotification` | `{"type":"peerDisconnected","peerId":..}`        |
//!
//! An assignment whose `peerId` is `null` releases the slot.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::registry::PeerId;

/// Downstream slot of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Left,
    Right,
}

impl Role {
    /// Both slots, left first
    pub const ALL: [Role; 2] = [Role::Left, Role::Right];
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Left => f.write_str("left"),
            Role::Right => f.write_str("right"),
        }
    }
}

/// Control message exchanged between overlay peers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    /// Sender wants to join the tree
    #[serde(rename = "connectToStream")]
    JoinRequest,

    /// Receiver must feed `target_peer` through its `role` slot, or stop
    /// feeding that slot when there is no target
    #[serde(rename = "newPeerLeaf")]
    AssignNeighbor {
        #[serde(rename = "peerId")]
        target_peer: Option<PeerId>,
        #[serde(rename = "leaf")]
        role: Role,
    },

    /// `peer_id` has left or should be considered absent
    #[serde(rename = "peerDisconnected")]
    LeaveNotification {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
}

impl SignalingMessage {
    /// Build an assignment
    pub fn assign(target_peer: PeerId, role: Role) -> Self {
        SignalingMessage::AssignNeighbor {
            target_peer: Some(target_peer),
            role,
        }
    }

    /// Build a slot release
    pub fn release(role: Role) -> Self {
        SignalingMessage::AssignNeighbor {
            target_peer: None,
            role,
        }
    }

    /// Build a leave notification
    pub fn leave(peer_id: PeerId) -> Self {
        SignalingMessage::LeaveNotification { peer_id }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::JoinRequest => "join_request",
            SignalingMessage::AssignNeighbor { .. } => "assign_neighbor",
            SignalingMessage::LeaveNotification { .. } => "leave_notification",
        }
    }
}
