//! Membership registry implementation
//!
//! Id-indexed view of the overlay members, kept in lock-step with the tree by
//! the coordinator.

use std::collections::HashMap;

use super::entry::{PeerId, PeerRecord};

/// Id → record index of overlay members
#[derive(Debug, Default)]
pub struct MembershipRegistry {
    peers: HashMap<PeerId, PeerRecord>,
}

impl MembershipRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a record, returning the one it replaces
    pub fn register(&mut self, record: PeerRecord) -> Option<PeerRecord> {
        let previous = self.peers.insert(record.id.clone(), record);

        tracing::trace!(
            members = self.peers.len(),
            replaced = previous.is_some(),
            "Peer registered"
        );
        previous
    }

    /// Unregister a peer
    ///
    /// Unknown ids are ignored and return `None`.
    pub fn unregister(&mut self, id: &PeerId) -> Option<PeerRecord> {
        let removed = self.peers.remove(id);
        if removed.is_some() {
            tracing::trace!(peer = %id, members = self.peers.len(), "Peer unregistered");
        }
        removed
    }

    /// Look up a record
    pub fn get(&self, id: &PeerId) -> Option<&PeerRecord> {
        self.peers.get(id)
    }

    /// Check if a peer is registered
    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Number of registered peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Check if no peer is registered
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Registered records, in no particular order
    pub fn records(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
