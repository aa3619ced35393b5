//! Collaborator interfaces.
//!
//! The graph never serializes object state or touches sockets. It asks the
//! transport to open, use and close channels and asks the world for locations
//! and hooks. Both traits are synchronous; an async transport must buffer
//! behind them.

use crate::types::{ChannelId, CloseReason, ConnectionHandle, Frame, NetObjectId, Vec3};

/// A pre-serialized fast-path payload shared by every connection in a frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SharedBunch {
    pub data: Vec<u8>,
}

impl SharedBunch {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn bits(&self) -> i64 {
        (self.data.len() as i64) * 8
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Result of asking the world for a fast-path payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastSharedBuild {
    /// Fresh payload for this frame.
    New(Vec<u8>),
    /// Nothing changed since the previous payload.
    Unchanged,
    /// The object cannot produce a payload right now.
    Unavailable,
}

/// Channel and bandwidth operations for one server's connections.
pub trait ReplicationTransport {
    /// Opens a channel for `object` on `connection`, `None` on failure.
    fn open_channel(&mut self, connection: ConnectionHandle, object: NetObjectId) -> Option<ChannelId>;

    /// Serializes and queues the object's state, returning the bits written.
    fn replicate(&mut self, connection: ConnectionHandle, channel: ChannelId, object: NetObjectId) -> i64;

    fn close_channel(&mut self, connection: ConnectionHandle, channel: ChannelId, reason: CloseReason);

    fn is_closing(&self, connection: ConnectionHandle, channel: ChannelId) -> bool;

    /// Bits queued but not yet sent on the connection.
    fn outstanding_bits(&self, connection: ConnectionHandle) -> i64;

    /// True once outstanding bits exceed the connection's ready threshold.
    fn is_saturated(&self, connection: ConnectionHandle) -> bool;

    /// Told once per tick when a connection ran out of budget.
    fn notify_saturated(&mut self, _connection: ConnectionHandle) {}

    /// Whether the client acknowledged the channel's initial spawn.
    fn spawn_acked(&self, _connection: ConnectionHandle, _channel: ChannelId) -> bool {
        true
    }

    /// Returns bits to the connection's send budget.
    fn refund_queued_bits(&mut self, _connection: ConnectionHandle, _bits: i64) {}

    /// Begins closing a channel into dormancy. Returns true if the channel
    /// became fully dormant immediately.
    fn start_becoming_dormant(&mut self, _connection: ConnectionHandle, _channel: ChannelId) -> bool {
        false
    }

    /// Sends a shared fast-path payload. Not counted against the default budget.
    fn send_fast_shared(&mut self, connection: ConnectionHandle, channel: ChannelId, bunch: &SharedBunch) -> i64;

    /// Tells the client an object it may know about is gone.
    fn send_destruction(&mut self, connection: ConnectionHandle, object: NetObjectId, reason: CloseReason) -> i64;
}

/// Read access to the simulation plus per-frame hooks.
pub trait ReplicationWorld {
    fn location(&self, object: NetObjectId) -> Option<Vec3>;

    /// Objects that are not fully initialized are skipped by dormancy flushes.
    fn is_initialized(&self, _object: NetObjectId) -> bool {
        true
    }

    /// Runs at most once per frame per object, before its first send.
    fn pre_replication(&mut self, _object: NetObjectId, _frame: Frame) {}

    fn build_fast_shared(&mut self, _object: NetObjectId, _frame: Frame) -> FastSharedBuild {
        FastSharedBuild::Unavailable
    }
}
