//! Overlay node configuration

use std::time::Duration;

use crate::registry::PeerId;

/// Overlay node configuration options
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address of the origin coordinator
    pub coordinator: PeerId,

    /// How long an orphaned node waits for a new upstream before giving up
    pub orphan_grace: Duration,

    /// Rejoin instead of leaving when the grace period expires
    pub rejoin_on_orphan: bool,

    /// Capacity of the node event queue
    pub event_capacity: usize,
}

impl NodeConfig {
    /// Create a config for a node joining through `coordinator`
    pub fn new(coordinator: impl Into<PeerId>) -> Self {
        Self {
            coordinator: coordinator.into(),
            orphan_grace: Duration::from_secs(5),
            rejoin_on_orphan: true,
            event_capacity: 256,
        }
    }

    /// Set the orphan grace period
    pub fn orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    /// Choose between rejoining and leaving after the grace period
    pub fn rejoin_on_orphan(mut self, rejoin: bool) -> Self {
        self.rejoin_on_orphan = rejoin;
        self
    }

    /// Set the event queue capacity (at least 1)
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}
