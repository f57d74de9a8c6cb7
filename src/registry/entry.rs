//! Peer identity and membership records

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::tree::{Comparator, Identity};

/// Opaque transport address of a peer
///
/// Cheap to clone; compared and hashed by content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(Arc<str>);

impl PeerId {
    /// Create a peer id
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The address as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(Arc::from(id))
    }
}

/// Monotonic join timestamp in microseconds since the coordinator started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JoinStamp(pub u64);

/// Issues strictly increasing [`JoinStamp`]s
#[derive(Debug)]
pub struct JoinClock {
    origin: Instant,
    last: Option<u64>,
}

impl JoinClock {
    /// Start a clock at the current instant
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last: None,
        }
    }

    /// Next stamp, never equal to a previous one
    pub fn next_stamp(&mut self) -> JoinStamp {
        let elapsed = self.origin.elapsed().as_micros() as u64;
        let stamp = match self.last {
            Some(last) if elapsed <= last => last + 1,
            _ => elapsed,
        };
        self.last = Some(stamp);
        JoinStamp(stamp)
    }
}

impl Default for JoinClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Tree ordering policy over join stamps
///
/// Decides which side of the tree newcomers drift toward. Rebalancing, not
/// the order alone, picks the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinOrder {
    /// Reversed stamp order: recent joiners sort first
    #[default]
    NewestFirst,
    /// Ascending stamp order
    OldestFirst,
}

impl Comparator<JoinStamp> for JoinOrder {
    fn compare(&self, a: &JoinStamp, b: &JoinStamp) -> Ordering {
        match self {
            JoinOrder::NewestFirst => b.cmp(a),
            JoinOrder::OldestFirst => a.cmp(b),
        }
    }
}

/// A member of the overlay
///
/// Immutable once created; a rejoining peer gets a fresh record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Peer address
    pub id: PeerId,
    /// When the peer joined (tree key)
    pub joined_at: JoinStamp,
}

impl PeerRecord {
    /// Create a record
    pub fn new(id: PeerId, joined_at: JoinStamp) -> Self {
        Self { id, joined_at }
    }
}

impl Identity for PeerRecord {
    type Id = PeerId;

    fn identity(&self) -> PeerId {
        self.id.clone()
    }
}
