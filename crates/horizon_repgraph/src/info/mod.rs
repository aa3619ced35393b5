//! Replication metadata.
//!
//! [`ObjectInfoMap`] holds one [`GlobalReplicationInfo`] per registered object.
//! Each connection owns a [`ConnectionInfoMap`] of lazily created
//! [`ConnectionReplicationInfo`] entries for the objects it has touched.

pub mod connection;
pub mod global;

pub use connection::{ConnectionInfoMap, ConnectionReplicationInfo};
pub use global::{FastSharedState, GlobalReplicationInfo, ObjectDescriptor, ObjectInfoMap};
