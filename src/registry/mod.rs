//! Overlay membership
//!
//! Peers are identified by their transport address ([`PeerId`]) and keyed in
//! the overlay tree by the [`JoinStamp`] they received on joining. The
//! [`MembershipRegistry`] resolves ids to records in O(1), which is all a
//! leave notification carries.
//!
//! # Lock-step with the tree
//!
//! ```text
//!   join:  tree.insert(stamp, record) ──► registry.register(record)
//!   leave: tree.delete(stamp)         ──► registry.unregister(id)
//! ```
//!
//! Every registered id has exactly one tree node and every tree node is
//! registered. The coordinator is the only writer of both.

pub mod entry;
pub mod store;

pub use entry::{JoinClock, JoinOrder, JoinStamp, PeerId, PeerRecord};
pub use store::MembershipRegistry;
