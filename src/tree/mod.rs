//! Ordered balanced tree with structural change notification
//!
//! The overlay keeps its members in an AVL tree. Each mutation reports the
//! child links it rewrites, and the [`ChangeCollector`] folds those reports
//! into one [`ChangeBatch`] per settled mutation.
//!
//! # Event flow
//!
//! ```text
//!   insert_with / delete_with
//!            │
//!            ▼
//!   ┌──────────────────┐  LeftChanged / RightChanged / RootChanged
//!   │     AvlTree      │ ─────────────────────────────────────────┐
//!   │ recurse, rotate  │                                          │
//!   └──────────────────┘  Settled                                 ▼
//!            │ ─────────────────────────────────────────► ChangeCollector
//!            ▼                                                     │
//!         returns                                   take_settled() │
//!                                                                  ▼
//!                                                             ChangeBatch
//! ```
//!
//! Observers see every event before the mutating call returns, so a caller
//! can never look at the tree with deltas still outstanding.

pub mod avl;
pub mod batch;
pub mod compare;
pub mod events;

pub use avl::{AvlTree, InvariantViolation, Iter};
pub use batch::{ChangeBatch, ChangeCollector, EdgeChange, Identity, Topology};
pub use compare::{Comparator, NaturalOrder, ReversedOrder};
pub use events::{OwnedTreeEvent, TreeEvent, TreeObserver};
