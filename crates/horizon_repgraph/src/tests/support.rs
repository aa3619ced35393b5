//! Recording collaborators shared by the scenario tests.

use crate::config::{presets, GraphConfig};
use crate::graph::ReplicationGraph;
use crate::transport::{FastSharedBuild, ReplicationTransport, ReplicationWorld, SharedBunch};
use crate::types::{ChannelId, CloseReason, ConnectionHandle, Frame, NetObjectId, Vec3};
use std::collections::{HashMap, HashSet};

pub const BITS_PER_SEND: i64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sent {
    pub connection: ConnectionHandle,
    pub channel: ChannelId,
    pub object: NetObjectId,
}

/// Transport that records everything and saturates on a bit budget.
#[derive(Debug, Default)]
pub struct MockTransport {
    next_channel: u64,
    pub opened: Vec<(ConnectionHandle, NetObjectId, ChannelId)>,
    pub sends: Vec<Sent>,
    pub closed: Vec<(ConnectionHandle, ChannelId, CloseReason)>,
    pub destructions: Vec<(ConnectionHandle, NetObjectId, CloseReason)>,
    pub fast_shared: Vec<(ConnectionHandle, ChannelId, usize)>,
    pub saturation_notices: usize,
    pub refunded_bits: i64,
    /// Outstanding bits at which a connection counts as saturated
    pub budget_bits: Option<i64>,
    pub outstanding: HashMap<ConnectionHandle, i64>,
    pub fail_opens: HashSet<NetObjectId>,
    pub closing: HashSet<ChannelId>,
    pub dormant_immediately: bool,
    pub spawns_unacked: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(bits: i64) -> Self {
        Self {
            budget_bits: Some(bits),
            ..Self::default()
        }
    }

    pub fn sent_to(&self, connection: ConnectionHandle) -> Vec<NetObjectId> {
        self.sends
            .iter()
            .filter(|sent| sent.connection == connection)
            .map(|sent| sent.object)
            .collect()
    }

    pub fn channel_of(&self, connection: ConnectionHandle, object: NetObjectId) -> Option<ChannelId> {
        self.opened
            .iter()
            .rev()
            .find(|(c, o, _)| *c == connection && *o == object)
            .map(|(_, _, channel)| *channel)
    }

    /// Forgets the records of the previous tick and empties send queues.
    pub fn clear(&mut self) {
        self.sends.clear();
        self.closed.clear();
        self.destructions.clear();
        self.fast_shared.clear();
        self.outstanding.clear();
        self.saturation_notices = 0;
    }
}

impl ReplicationTransport for MockTransport {
    fn open_channel(&mut self, connection: ConnectionHandle, object: NetObjectId) -> Option<ChannelId> {
        if self.fail_opens.contains(&object) {
            return None;
        }
        self.next_channel += 1;
        let channel = ChannelId(self.next_channel);
        self.opened.push((connection, object, channel));
        Some(channel)
    }

    fn replicate(&mut self, connection: ConnectionHandle, channel: ChannelId, object: NetObjectId) -> i64 {
        self.sends.push(Sent {
            connection,
            channel,
            object,
        });
        *self.outstanding.entry(connection).or_default() += BITS_PER_SEND;
        BITS_PER_SEND
    }

    fn close_channel(&mut self, connection: ConnectionHandle, channel: ChannelId, reason: CloseReason) {
        self.closed.push((connection, channel, reason));
    }

    fn is_closing(&self, _connection: ConnectionHandle, channel: ChannelId) -> bool {
        self.closing.contains(&channel)
    }

    fn outstanding_bits(&self, connection: ConnectionHandle) -> i64 {
        self.outstanding.get(&connection).copied().unwrap_or(0)
    }

    fn is_saturated(&self, connection: ConnectionHandle) -> bool {
        self.budget_bits
            .is_some_and(|budget| self.outstanding_bits(connection) >= budget)
    }

    fn notify_saturated(&mut self, _connection: ConnectionHandle) {
        self.saturation_notices += 1;
    }

    fn spawn_acked(&self, _connection: ConnectionHandle, _channel: ChannelId) -> bool {
        !self.spawns_unacked
    }

    fn refund_queued_bits(&mut self, connection: ConnectionHandle, bits: i64) {
        self.refunded_bits += bits;
        *self.outstanding.entry(connection).or_default() -= bits;
    }

    fn start_becoming_dormant(&mut self, _connection: ConnectionHandle, _channel: ChannelId) -> bool {
        self.dormant_immediately
    }

    fn send_fast_shared(&mut self, connection: ConnectionHandle, channel: ChannelId, bunch: &SharedBunch) -> i64 {
        self.fast_shared.push((connection, channel, bunch.data.len()));
        bunch.bits()
    }

    fn send_destruction(&mut self, connection: ConnectionHandle, object: NetObjectId, reason: CloseReason) -> i64 {
        self.destructions.push((connection, object, reason));
        64
    }
}

/// World with settable locations and counted hooks.
#[derive(Debug, Default)]
pub struct MockWorld {
    pub locations: HashMap<NetObjectId, Vec3>,
    pub uninitialized: HashSet<NetObjectId>,
    pub pre_replications: Vec<(NetObjectId, Frame)>,
    pub fast_shared_builds: HashMap<NetObjectId, u32>,
    /// Objects that produce a fast-shared payload
    pub payloads: HashMap<NetObjectId, Vec<u8>>,
    /// Objects whose payload did not change since the last build
    pub unchanged: HashSet<NetObjectId>,
}

impl MockWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builds_of(&self, object: NetObjectId) -> u32 {
        self.fast_shared_builds.get(&object).copied().unwrap_or(0)
    }
}

impl ReplicationWorld for MockWorld {
    fn location(&self, object: NetObjectId) -> Option<Vec3> {
        self.locations.get(&object).copied()
    }

    fn is_initialized(&self, object: NetObjectId) -> bool {
        !self.uninitialized.contains(&object)
    }

    fn pre_replication(&mut self, object: NetObjectId, frame: Frame) {
        self.pre_replications.push((object, frame));
    }

    fn build_fast_shared(&mut self, object: NetObjectId, _frame: Frame) -> FastSharedBuild {
        *self.fast_shared_builds.entry(object).or_default() += 1;
        if self.unchanged.contains(&object) {
            return FastSharedBuild::Unchanged;
        }
        match self.payloads.get(&object) {
            Some(data) => FastSharedBuild::New(data.clone()),
            None => FastSharedBuild::Unavailable,
        }
    }
}

pub type TestGraph = ReplicationGraph<MockWorld, MockTransport>;

/// 1000-unit cells from the origin, 2000 cull distance and a single bucket
/// so moving objects are candidates every frame.
pub fn test_config() -> GraphConfig {
    let mut config = presets::testing();
    config.frequency_buckets.num_buckets = 1;
    config
}

pub fn graph_with(config: GraphConfig, transport: MockTransport) -> TestGraph {
    ReplicationGraph::new(config, MockWorld::new(), transport).expect("test config is valid")
}

pub fn graph() -> TestGraph {
    graph_with(test_config(), MockTransport::new())
}

/// Ticks once at the configured rate and returns the frame's stats.
pub fn tick(graph: &mut TestGraph) -> crate::stats::TickStats {
    graph.tick(1.0 / 30.0).expect("graph is neither paused nor throttled")
}
