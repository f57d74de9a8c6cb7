//! Origin-side overlay coordinator
//!
//! The coordinator is the only writer of the tree and the registry. Viewers
//! reach it over short-lived control channels; it answers by telling parents
//! which children to feed and by calling the root itself.
//!
//! ```text
//!   TransportEvent ──► CoordinatorService ──► Coordinator::on_*()
//!                          ▲      │                    │
//!          handshake timer │      │ TransportCommand   ▼
//!                          │      ◄──────────── Vec<CoordinatorAction>
//!                          └──────┘
//! ```
//!
//! [`Coordinator`] is synchronous and deterministic, which makes whole-overlay
//! simulations cheap to test. [`CoordinatorService`] adds the async shell.

pub mod config;
pub mod engine;
pub mod service;
pub mod state;

pub use config::CoordinatorConfig;
pub use engine::{Coordinator, CoordinatorAction};
pub use service::{CoordinatorHandle, CoordinatorService};
pub use state::{PeerPhase, PendingJoin, PendingJoins};
