//! Membership slot state
//!
//! Per-peer lifecycle as seen by the coordinator:
//!
//! ```text
//!   (absent) ── channel opened ──► Pending ── JoinRequest ──► Connected
//!                                     │                         │
//!                       timeout / channel closed         leave / root call lost
//!                                     ▼                         ▼
//!                                 (absent)                 Disconnected
//! ```
//!
//! Only `Connected` peers own a tree node and a registry record.

use std::collections::HashMap;
use std::time::Instant;

use crate::registry::PeerId;
use crate::transport::ChannelId;

/// Lifecycle phase of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    /// A control channel is open but no join request arrived yet
    Pending,
    /// Member of the tree
    Connected,
    /// Not (or no longer) a member
    Disconnected,
}

/// A tentative join awaiting its request
#[derive(Debug, Clone)]
pub struct PendingJoin {
    /// Peer that opened the channel
    pub peer: PeerId,
    /// When the channel opened
    pub opened_at: Instant,
}

/// Tentative joins keyed by control channel
#[derive(Debug, Default)]
pub struct PendingJoins {
    channels: HashMap<ChannelId, PendingJoin>,
}

impl PendingJoins {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly opened channel
    pub fn open(&mut self, channel: ChannelId, peer: PeerId) {
        self.channels.insert(
            channel,
            PendingJoin {
                peer,
                opened_at: Instant::now(),
            },
        );
    }

    /// Stop tracking a channel, returning what was pending on it
    pub fn resolve(&mut self, channel: ChannelId) -> Option<PendingJoin> {
        self.channels.remove(&channel)
    }

    /// Check whether `peer` has any channel pending
    pub fn has_peer(&self, peer: &PeerId) -> bool {
        self.channels.values().any(|pending| &pending.peer == peer)
    }

    /// Drain every pending channel
    pub fn drain(&mut self) -> Vec<ChannelId> {
        self.channels.drain().map(|(channel, _)| channel).collect()
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
