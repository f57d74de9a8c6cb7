//! Peer-to-peer live stream distribution over a self-balancing tree
//!
//! An origin coordinator keeps viewers in an AVL tree keyed by join time.
//! Every tree node relays the stream to at most two children, so each viewer
//! sits O(log n) hops from the origin and upload cost per peer stays bounded.
//!
//! ```text
//!            origin ─── direct call ───► root
//!                                      ╱      ╲
//!                                   left      right
//!                                  ╱    ╲    ╱    ╲
//!                                 …      …  …      …
//! ```
//!
//! Joins and leaves rebalance the tree; the rotations are collected into one
//! change batch per mutation and only the parents whose child links changed
//! are told to re-wire.
//!
//! # Example
//! ```no_run
//! use treecast::coordinator::{CoordinatorConfig, CoordinatorService};
//! use treecast::node::{NodeConfig, NodeService};
//! use treecast::transport::{memory::MemoryNetwork, MediaStream};
//! use treecast::PeerId;
//!
//! # async fn example() -> treecast::error::Result<()> {
//! let network = MemoryNetwork::new();
//!
//! let origin = network.attach(PeerId::from("origin"), 64).await;
//! let (coordinator, control) = CoordinatorService::new(CoordinatorConfig::default(), origin);
//! tokio::spawn(coordinator.run());
//! control.set_media(Some(MediaStream::new("camera"))).await?;
//!
//! let transport = network.attach(PeerId::from("viewer-1"), 64).await;
//! let (node, handle, mut events) =
//!     NodeService::new(PeerId::from("viewer-1"), NodeConfig::new("origin"), transport);
//! tokio::spawn(node.run());
//!
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! handle.leave().await?;
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod error;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod stats;
pub mod transport;
pub mod tree;

pub use coordinator::{Coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorService};
pub use error::{Error, Result};
pub use node::{NodeConfig, NodeEvent, NodeHandle, NodeService, OverlayNode};
pub use protocol::{Role, SignalingMessage};
pub use registry::{JoinOrder, PeerId};
pub use transport::{MediaStream, Transport};
