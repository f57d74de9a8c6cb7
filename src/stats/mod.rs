//! Overlay counters
//!
//! Plain snapshots: the coordinator and nodes update them in place and hand
//! out clones on request.

pub mod metrics;

pub use metrics::{CoordinatorStats, NodeStats};
