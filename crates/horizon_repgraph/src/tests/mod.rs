//! Scenario tests for the replication graph.
//!
//! These drive a [`crate::ReplicationGraph`] end to end through recording
//! collaborators:
//! - Default-lane pipeline (gather, prioritize, send, cleanup)
//! - Dormancy routing, flushes and destruction notices
//! - Spatial grid membership and boundaries
//! - Fast-shared lane and frequency scheduling

#[cfg(test)]
pub mod support;

#[cfg(test)]
pub mod pipeline_test;

#[cfg(test)]
pub mod dormancy_test;
