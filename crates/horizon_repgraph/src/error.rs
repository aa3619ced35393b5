//! Error types for graph operations.
//!
//! None of these abort a tick. Public operations report them so callers can
//! react, and the graph has already logged and skipped the offending object.

use crate::config::ConfigValidationError;
use crate::types::{ConnectionHandle, NetObjectId, NodeKey};

/// Errors surfaced by [`crate::ReplicationGraph`] operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    #[error("Object {0} is not registered")]
    ObjectNotRegistered(NetObjectId),
    #[error("Object {0} is already registered")]
    AlreadyRegistered(NetObjectId),
    #[error("Object {0} is not eligible for replication: {1}")]
    IneligibleObject(NetObjectId, String),
    #[error("Connection {0:?} not found")]
    ConnectionNotFound(ConnectionHandle),
    #[error("Interest node {0:?} not found")]
    NodeNotFound(NodeKey),
    #[error("Interest node {0:?} is built in and cannot be removed")]
    BuiltInNode(NodeKey),
    #[error("Unknown replication class: {0}")]
    UnknownClass(String),
    #[error("Verification failed: {0}")]
    Verification(String),
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigValidationError),
}

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;
