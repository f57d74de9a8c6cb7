//! Statistics for overlay coordinators and nodes

use std::time::{Duration, Instant};

/// Coordinator-wide statistics
#[derive(Debug, Clone)]
pub struct CoordinatorStats {
    /// When the coordinator started
    pub started_at: Instant,
    /// Joins accepted, including re-entrant rejoins
    pub joins: u64,
    /// Members removed
    pub leaves: u64,
    /// Leave reports ignored (unknown peer or unauthorized reporter)
    pub stale_leaves: u64,
    /// Tentative channels closed without a join request
    pub handshake_timeouts: u64,
    /// Assignments and slot releases sent
    pub assignments_sent: u64,
    /// Leave notices sent to children of departed members
    pub departures_announced: u64,
    /// Direct calls placed to a root
    pub root_calls: u64,
    /// Current members
    pub members: u64,
}

impl CoordinatorStats {
    /// Create new stats tracker
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            joins: 0,
            leaves: 0,
            stale_leaves: 0,
            handshake_timeouts: 0,
            assignments_sent: 0,
            departures_announced: 0,
            root_calls: 0,
            members: 0,
        }
    }

    /// Time since the coordinator started
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Mean assignments per membership change
    pub fn assignments_per_change(&self) -> f64 {
        let changes = self.joins + self.leaves;
        if changes > 0 {
            self.assignments_sent as f64 / changes as f64
        } else {
            0.0
        }
    }
}

impl Default for CoordinatorStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-node statistics
#[derive(Debug, Clone, Default)]
pub struct NodeStats {
    /// Assignments received (including slot releases)
    pub assignments: u64,
    /// Calls placed to children
    pub forwards: u64,
    /// Times a new upstream was accepted
    pub upstream_changes: u64,
    /// Times the upstream was lost (call closed or departure announced)
    pub upstream_losses: u64,
    /// Children reported to the coordinator as gone
    pub children_reported: u64,
    /// Upstream departures announced by the coordinator
    pub departures_heard: u64,
    /// Orphan grace periods that expired
    pub orphan_expiries: u64,
}

impl NodeStats {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_stats_new() {
        let stats = CoordinatorStats::new();
        assert_eq!(stats.joins, 0);
        assert_eq!(stats.leaves, 0);
        assert_eq!(stats.stale_leaves, 0);
        assert_eq!(stats.members, 0);
        assert_eq!(stats.assignments_per_change(), 0.0);
    }

    #[test]
    fn test_assignments_per_change() {
        let mut stats = CoordinatorStats::new();
        stats.joins = 3;
        stats.leaves = 1;
        stats.assignments_sent = 6;

        assert_eq!(stats.assignments_per_change(), 1.5);
    }

    #[test]
    fn test_uptime_counts_from_start() {
        let mut stats = CoordinatorStats::new();
        if let Some(earlier) = Instant::now().checked_sub(Duration::from_secs(2)) {
            stats.started_at = earlier;
            assert!(stats.uptime() >= Duration::from_secs(2));
        }
    }

    #[test]
    fn test_node_stats_new() {
        let stats = NodeStats::new();
        assert_eq!(stats.forwards, 0);
        assert_eq!(stats.upstream_losses, 0);
        assert_eq!(stats.children_reported, 0);
    }
}
