//! Viewer-side overlay node
//!
//! A node has at most one upstream peer and two downstream slots:
//!
//! ```text
//!                upstream (parent or origin)
//!                     │ inbound call
//!                     ▼
//!               ┌───────────┐
//!               │   node    │◄── AssignNeighbor{child, role} from origin
//!               └───────────┘
//!      outbound call │     │ outbound call
//!                    ▼     ▼
//!                  left   right
//! ```
//!
//! Assignments made before a stream is available are latched and honoured
//! once media arrives. Losing the upstream, either because its call closed or
//! because the origin announced its departure, orphans the node: it drops its
//! stream and hangs up its children until a new upstream calls or the grace
//! period runs out.

pub mod config;
pub mod service;
pub mod state;

pub use config::NodeConfig;
pub use service::{NodeEvent, NodeHandle, NodeService, NodeSnapshot};
pub use state::{NodeAction, NodePhase, OverlayNode};
