//! # Horizon Replication Graph
//!
//! Server-side interest management for Horizon. Every network tick the graph
//! decides, per client connection, which replicated objects are candidates,
//! orders them by a priority score and hands them to the transport until the
//! connection's bandwidth is used up.
//!
//! ## Core Features
//!
//! - **Interest Nodes**: spatial grid, round-robin buckets, dormancy lists,
//!   always-relevant and owner-relevant lists, distance/direction driven frequency
//! - **Prioritization**: distance, starvation, dormancy and force-update weighting
//! - **Fast-Shared Lane**: one pre-serialized payload per object per frame,
//!   shared by every connection
//! - **Dormancy**: dormant objects cost nothing until flushed or woken
//! - **Streamed Regions**: objects in regions a client has not loaded stay hidden
//!
//! The graph never serializes object state or touches sockets. It talks to a
//! [`ReplicationTransport`] for channels and bandwidth and a
//! [`ReplicationWorld`] for locations and per-frame hooks.
//!
//! ## Quick Start Example
//!
//! ```rust,ignore
//! use horizon_repgraph::*;
//!
//! let mut graph = ReplicationGraph::new(GraphConfig::default(), world, transport)?;
//! graph.set_class_settings(
//!     "Pawn",
//!     graph.class_template().with_routing(RoutingPolicy::Spatialize(SpatialMode::Dynamic)),
//! );
//!
//! let player = graph.add_connection(NetViewer::at(Vec3::zero()));
//! graph.register_object(ObjectDescriptor::new(NetObjectId(1), "Pawn").at(Vec3::new(500.0, 0.0, 0.0)))?;
//!
//! loop {
//!     graph.set_viewer(player, NetViewer::at(world_position_of_player()))?;
//!     if let Some(stats) = graph.tick(1.0 / 30.0) {
//!         tracing::trace!("sent {} objects", stats.sends);
//!     }
//! }
//! ```

// Core modules
pub mod config;
pub mod connection;
pub mod error;
pub mod graph;
pub mod info;
pub mod nodes;
pub mod prioritize;
pub mod settings;
pub mod stats;
pub mod transport;
pub mod types;

pub(crate) mod fast_shared;
pub(crate) mod replicate;

#[cfg(test)]
mod tests;

pub use config::{presets, ConfigValidationError, GraphConfig, GraphConfigBuilder};
pub use connection::{ConnectionManager, PendingDestruction};
pub use error::{GraphError, GraphResult};
pub use graph::ReplicationGraph;
pub use info::{ConnectionReplicationInfo, GlobalReplicationInfo, ObjectDescriptor};
pub use nodes::InterestNode;
pub use settings::{ClassReplicationSettings, RoutingPolicy, SpatialMode};
pub use stats::{GraphStats, TickStats};
pub use transport::{FastSharedBuild, ReplicationTransport, ReplicationWorld, SharedBunch};
pub use types::*;
