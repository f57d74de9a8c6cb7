//! Coordinator configuration

use std::time::Duration;

use crate::registry::JoinOrder;

/// Coordinator configuration options
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Time a tentative channel has to deliver its join request
    pub join_timeout: Duration,

    /// Tree ordering policy over join stamps
    pub order: JoinOrder,

    /// Capacity of the handle → service request queue
    pub command_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            join_timeout: Duration::from_secs(10),
            order: JoinOrder::NewestFirst,
            command_capacity: 64,
        }
    }
}

impl CoordinatorConfig {
    /// Set the handshake timeout
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.join_timeout = timeout;
        self
    }

    /// Set the tree ordering policy
    pub fn order(mut self, order: JoinOrder) -> Self {
        self.order = order;
        self
    }

    /// Set the request queue capacity (at least 1)
    pub fn command_capacity(mut self, capacity: usize) -> Self {
        self.command_capacity = capacity.max(1);
        self
    }
}
