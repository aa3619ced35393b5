//! Simulated world and transport driving the replication graph.
//!
//! The host has no game behind it, so objects wander inside the configured
//! region and each client drains its send queue at a fixed byte rate. This
//! is enough to put the graph under realistic load: moving viewers, moving
//! and dormant objects, saturation and channel churn.

use crate::config::{AppConfig, RegionSettings};
use horizon_repgraph::{
    ChannelId, CloseReason, ConnectionHandle, FastSharedBuild, Frame, GraphResult, GraphStats, NetDormancy,
    NetObjectId, NetViewer, ObjectDescriptor, ReplicationGraph, ReplicationTransport, ReplicationWorld,
    RoutingPolicy, SharedBunch, SpatialMode, TickStats, Vec3,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, trace};

/// Bits for the first send on a channel, which carries the full spawn.
const SPAWN_BITS: i64 = 640;
/// Bits for a property update.
const UPDATE_BITS: i64 = 160;
const DESTRUCTION_BITS: i64 = 48;
/// Ticks between random dormancy flushes of a prop.
const PROP_FLUSH_INTERVAL: u32 = 15;

/// What a simulated object is and how it moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Tree,
    Prop,
    Drone,
    Pawn,
    GameState,
}

impl ObjectKind {
    pub fn class(self) -> &'static str {
        match self {
            ObjectKind::Tree => "Tree",
            ObjectKind::Prop => "Prop",
            ObjectKind::Drone => "Drone",
            ObjectKind::Pawn => "Pawn",
            ObjectKind::GameState => "GameState",
        }
    }

    fn speed(self) -> f64 {
        match self {
            ObjectKind::Drone => 1_200.0,
            ObjectKind::Pawn => 600.0,
            _ => 0.0,
        }
    }
}

#[derive(Debug, Clone)]
struct SimObject {
    kind: ObjectKind,
    position: Vec3,
    velocity: Vec3,
    move_target: Vec3,
}

/// Object positions plus the hooks the graph calls into.
#[derive(Debug)]
pub struct SimWorld {
    objects: HashMap<NetObjectId, SimObject>,
    region: RegionSettings,
    rng: StdRng,
    pre_replications: u64,
}

impl SimWorld {
    pub fn new(region: RegionSettings, seed: u64) -> Self {
        Self {
            objects: HashMap::new(),
            region,
            rng: StdRng::seed_from_u64(seed),
            pre_replications: 0,
        }
    }

    fn random_point(&mut self) -> Vec3 {
        let region = &self.region;
        let z = if region.max_z > region.min_z {
            self.rng.gen_range(region.min_z..region.max_z)
        } else {
            region.min_z
        };
        Vec3::new(
            self.rng.gen_range(region.min_x..region.max_x),
            self.rng.gen_range(region.min_y..region.max_y),
            z,
        )
    }

    /// Ground-level point for things that walk.
    fn random_ground_point(&mut self) -> Vec3 {
        let mut point = self.random_point();
        point.z = self.region.min_z;
        point
    }

    pub fn spawn(&mut self, id: NetObjectId, kind: ObjectKind) -> Vec3 {
        let position = match kind {
            ObjectKind::Pawn | ObjectKind::Tree | ObjectKind::Prop => self.random_ground_point(),
            ObjectKind::Drone => self.random_point(),
            ObjectKind::GameState => Vec3::zero(),
        };
        self.objects.insert(
            id,
            SimObject {
                kind,
                position,
                velocity: Vec3::zero(),
                move_target: position,
            },
        );
        position
    }

    pub fn despawn(&mut self, id: NetObjectId) {
        self.objects.remove(&id);
    }

    pub fn position(&self, id: NetObjectId) -> Option<Vec3> {
        self.objects.get(&id).map(|object| object.position)
    }

    pub fn velocity(&self, id: NetObjectId) -> Option<Vec3> {
        self.objects.get(&id).map(|object| object.velocity)
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn pre_replications(&self) -> u64 {
        self.pre_replications
    }

    /// Moves every mobile object toward its target, picking a new target on
    /// arrival.
    pub fn step(&mut self, delta_seconds: f64) {
        let mut needs_target = Vec::new();
        for (id, object) in &mut self.objects {
            let speed = object.kind.speed();
            if speed <= 0.0 {
                continue;
            }

            let to_target = object.move_target - object.position;
            let distance = to_target.length();
            let step = speed * delta_seconds;
            if distance <= step {
                object.position = object.move_target;
                needs_target.push(*id);
                continue;
            }

            object.velocity = to_target.normalized() * speed;
            object.position = object.position + object.velocity * delta_seconds;
        }

        // Sorted so the same seed always produces the same paths.
        needs_target.sort();
        for id in needs_target {
            let Some(kind) = self.objects.get(&id).map(|object| object.kind) else {
                continue;
            };
            let target = if kind == ObjectKind::Pawn {
                self.random_ground_point()
            } else {
                self.random_point()
            };
            if let Some(object) = self.objects.get_mut(&id) {
                object.move_target = target;
            }
        }
    }
}

impl ReplicationWorld for SimWorld {
    fn location(&self, object: NetObjectId) -> Option<Vec3> {
        self.position(object)
    }

    fn pre_replication(&mut self, _object: NetObjectId, _frame: Frame) {
        self.pre_replications += 1;
    }

    fn build_fast_shared(&mut self, object: NetObjectId, _frame: Frame) -> FastSharedBuild {
        let Some(state) = self.objects.get(&object) else {
            return FastSharedBuild::Unavailable;
        };
        if state.kind != ObjectKind::Drone {
            return FastSharedBuild::Unavailable;
        }

        let mut data = Vec::with_capacity(24);
        for value in [state.position.x, state.position.y, state.position.z] {
            data.extend_from_slice(&(value as f32).to_le_bytes());
        }
        for value in [state.velocity.x, state.velocity.y] {
            data.extend_from_slice(&(value as f32).to_le_bytes());
        }
        FastSharedBuild::New(data)
    }
}

#[derive(Debug, Default)]
struct SimClient {
    queued_bits: i64,
    /// Channels whose spawn is still in flight
    unacked: HashSet<ChannelId>,
}

/// Per-client send queues drained at a fixed rate.
#[derive(Debug)]
pub struct SimTransport {
    clients: HashMap<ConnectionHandle, SimClient>,
    channels: HashMap<ChannelId, (ConnectionHandle, NetObjectId)>,
    next_channel: u64,
    /// Queue depth at which a client counts as saturated
    ready_threshold_bits: i64,
    drain_bits_per_second: f64,
    pub fast_shared_bits: i64,
    pub destructions_sent: u64,
    pub channels_closed: u64,
}

impl SimTransport {
    pub fn new(client_rate_bytes_per_sec: u64, tick_rate: f64) -> Self {
        let drain_bits_per_second = client_rate_bytes_per_sec as f64 * 8.0;
        Self {
            clients: HashMap::new(),
            channels: HashMap::new(),
            next_channel: 0,
            ready_threshold_bits: (drain_bits_per_second / tick_rate.max(1.0)).ceil() as i64,
            drain_bits_per_second,
            fast_shared_bits: 0,
            destructions_sent: 0,
            channels_closed: 0,
        }
    }

    pub fn connect(&mut self, connection: ConnectionHandle) {
        self.clients.entry(connection).or_default();
    }

    pub fn disconnect(&mut self, connection: ConnectionHandle) {
        self.clients.remove(&connection);
        self.channels.retain(|_, (owner, _)| *owner != connection);
    }

    pub fn open_channels(&self) -> usize {
        self.channels.len()
    }

    /// Sends queued bits and acknowledges spawns that have left the queue.
    pub fn drain(&mut self, delta_seconds: f64) {
        let budget = (self.drain_bits_per_second * delta_seconds) as i64;
        for client in self.clients.values_mut() {
            client.queued_bits = (client.queued_bits - budget).max(0);
            if client.queued_bits == 0 {
                client.unacked.clear();
            }
        }
    }

    fn queue(&mut self, connection: ConnectionHandle, bits: i64) {
        if let Some(client) = self.clients.get_mut(&connection) {
            client.queued_bits += bits;
        }
    }
}

impl ReplicationTransport for SimTransport {
    fn open_channel(&mut self, connection: ConnectionHandle, object: NetObjectId) -> Option<ChannelId> {
        let client = self.clients.get_mut(&connection)?;
        self.next_channel += 1;
        let channel = ChannelId(self.next_channel);
        client.unacked.insert(channel);
        self.channels.insert(channel, (connection, object));
        Some(channel)
    }

    fn replicate(&mut self, connection: ConnectionHandle, channel: ChannelId, object: NetObjectId) -> i64 {
        let spawning = self
            .clients
            .get(&connection)
            .is_some_and(|client| client.unacked.contains(&channel));
        let bits = if spawning { SPAWN_BITS } else { UPDATE_BITS };
        trace!("📤 {} -> {:?} on {:?}: {} bits", object, connection, channel, bits);
        self.queue(connection, bits);
        bits
    }

    fn close_channel(&mut self, connection: ConnectionHandle, channel: ChannelId, reason: CloseReason) {
        trace!("🔒 Closing {:?} on {:?} ({:?})", channel, connection, reason);
        self.channels.remove(&channel);
        if let Some(client) = self.clients.get_mut(&connection) {
            client.unacked.remove(&channel);
        }
        self.channels_closed += 1;
    }

    fn is_closing(&self, _connection: ConnectionHandle, channel: ChannelId) -> bool {
        !self.channels.contains_key(&channel)
    }

    fn outstanding_bits(&self, connection: ConnectionHandle) -> i64 {
        self.clients.get(&connection).map_or(0, |client| client.queued_bits)
    }

    fn is_saturated(&self, connection: ConnectionHandle) -> bool {
        self.outstanding_bits(connection) >= self.ready_threshold_bits
    }

    fn spawn_acked(&self, connection: ConnectionHandle, channel: ChannelId) -> bool {
        self.clients
            .get(&connection)
            .is_some_and(|client| !client.unacked.contains(&channel))
    }

    fn refund_queued_bits(&mut self, connection: ConnectionHandle, bits: i64) {
        self.queue(connection, -bits);
    }

    fn start_becoming_dormant(&mut self, connection: ConnectionHandle, channel: ChannelId) -> bool {
        // Dormancy completes once nothing is in flight for the channel.
        let settled = self.spawn_acked(connection, channel);
        if settled {
            self.channels.remove(&channel);
        }
        settled
    }

    fn send_fast_shared(&mut self, _connection: ConnectionHandle, _channel: ChannelId, bunch: &SharedBunch) -> i64 {
        let bits = bunch.bits();
        self.fast_shared_bits += bits;
        bits
    }

    fn send_destruction(&mut self, connection: ConnectionHandle, _object: NetObjectId, _reason: CloseReason) -> i64 {
        self.destructions_sent += 1;
        self.queue(connection, DESTRUCTION_BITS);
        DESTRUCTION_BITS
    }
}

#[derive(Debug, Clone, Copy)]
struct SimClientState {
    connection: ConnectionHandle,
    pawn: NetObjectId,
}

/// A replication graph plus the world and clients feeding it.
pub struct Simulation {
    graph: ReplicationGraph<SimWorld, SimTransport>,
    clients: Vec<SimClientState>,
    props: Vec<NetObjectId>,
    rng: StdRng,
    next_id: u64,
}

impl Simulation {
    /// Builds the graph, registers the object classes and populates the world.
    pub fn new(config: &AppConfig) -> GraphResult<Self> {
        let tick_rate = config.replication.general.server_tick_rate;
        let world = SimWorld::new(config.server.region.clone(), config.server.seed);
        let transport = SimTransport::new(config.server.client_rate_bytes_per_sec, tick_rate);
        let mut graph = ReplicationGraph::new(config.replication.clone(), world, transport)?;
        register_classes(&mut graph);

        let mut simulation = Self {
            graph,
            clients: Vec::new(),
            props: Vec::new(),
            rng: StdRng::seed_from_u64(config.server.seed.wrapping_add(1)),
            next_id: 1,
        };

        simulation.spawn(ObjectKind::GameState)?;
        for index in 0..config.server.simulated_objects {
            let kind = match index % 20 {
                0..=7 => ObjectKind::Tree,
                8..=13 => ObjectKind::Prop,
                _ => ObjectKind::Drone,
            };
            let id = simulation.spawn(kind)?;
            if kind == ObjectKind::Prop {
                simulation.props.push(id);
            }
        }
        for _ in 0..config.server.simulated_clients {
            simulation.connect_client()?;
        }

        info!(
            "🌍 Simulation ready: {} objects, {} clients",
            simulation.graph.object_count(),
            simulation.clients.len()
        );
        Ok(simulation)
    }

    fn allocate_id(&mut self) -> NetObjectId {
        let id = NetObjectId(self.next_id);
        self.next_id += 1;
        id
    }

    fn spawn(&mut self, kind: ObjectKind) -> GraphResult<NetObjectId> {
        let id = self.allocate_id();
        let position = self.graph.world_mut().spawn(id, kind);
        let mut descriptor = ObjectDescriptor::new(id, kind.class()).at(position);
        if kind == ObjectKind::Prop {
            descriptor = descriptor.with_dormancy(NetDormancy::DormantAll);
        }
        self.graph.register_object(descriptor)?;
        Ok(id)
    }

    /// Adds a client with its own pawn as the viewer.
    pub fn connect_client(&mut self) -> GraphResult<ConnectionHandle> {
        let pawn = self.allocate_id();
        let position = self.graph.world_mut().spawn(pawn, ObjectKind::Pawn);
        let connection = self
            .graph
            .add_connection(NetViewer::at(position).with_viewer(pawn).with_view_target(pawn));
        self.graph.transport_mut().connect(connection);
        self.graph
            .register_object(ObjectDescriptor::new(pawn, ObjectKind::Pawn.class()).at(position).owned_by(connection))?;
        self.clients.push(SimClientState { connection, pawn });
        debug!("🔌 Client {:?} joined with pawn {}", connection, pawn);
        Ok(connection)
    }

    /// Removes the most recently connected client and its pawn.
    pub fn disconnect_client(&mut self) -> GraphResult<Option<ConnectionHandle>> {
        let Some(client) = self.clients.pop() else {
            return Ok(None);
        };
        self.graph.unregister_object(client.pawn)?;
        self.graph.world_mut().despawn(client.pawn);
        self.graph.remove_connection(client.connection)?;
        self.graph.transport_mut().disconnect(client.connection);
        debug!("👋 Client {:?} left", client.connection);
        Ok(Some(client.connection))
    }

    /// Advances the world, moves every viewer onto its pawn and ticks the graph.
    pub fn step(&mut self, delta_seconds: f64) -> Option<TickStats> {
        self.graph.world_mut().step(delta_seconds);
        self.graph.transport_mut().drain(delta_seconds);

        for client in &self.clients {
            let world = self.graph.world();
            let Some(position) = world.position(client.pawn) else {
                continue;
            };
            let facing = world.velocity(client.pawn).map(|v| v.normalized()).unwrap_or(Vec3::new(1.0, 0.0, 0.0));
            let viewer = NetViewer::at(position)
                .facing(facing)
                .with_viewer(client.pawn)
                .with_view_target(client.pawn);
            if let Err(e) = self.graph.set_viewer(client.connection, viewer) {
                debug!("Viewer update for {:?} failed: {}", client.connection, e);
            }
        }

        if self.graph.frame() % PROP_FLUSH_INTERVAL == 0 && !self.props.is_empty() {
            let prop = self.props[self.rng.gen_range(0..self.props.len())];
            if let Err(e) = self.graph.flush_dormancy(prop) {
                debug!("Flush of {} failed: {}", prop, e);
            }
        }

        self.graph.tick(delta_seconds)
    }

    pub fn stats(&self) -> &GraphStats {
        self.graph.stats()
    }

    pub fn graph(&self) -> &ReplicationGraph<SimWorld, SimTransport> {
        &self.graph
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

fn register_classes(graph: &mut ReplicationGraph<SimWorld, SimTransport>) {
    let template = graph.class_template();
    graph.set_class_settings(
        ObjectKind::Tree.class(),
        template.clone().with_routing(RoutingPolicy::Spatialize(SpatialMode::Static)),
    );
    graph.set_class_settings(
        ObjectKind::Prop.class(),
        template.clone().with_routing(RoutingPolicy::Spatialize(SpatialMode::Dormancy)),
    );
    graph.set_class_settings(
        ObjectKind::Drone.class(),
        template
            .clone()
            .with_routing(RoutingPolicy::Spatialize(SpatialMode::Dynamic))
            .with_fast_shared(true),
    );
    graph.set_class_settings(
        ObjectKind::Pawn.class(),
        template.clone().with_routing(RoutingPolicy::Spatialize(SpatialMode::Dynamic)),
    );
    graph.set_class_settings(
        ObjectKind::GameState.class(),
        template.with_routing(RoutingPolicy::RelevantAllConnections).with_period(10),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.server.simulated_objects = 60;
        config.server.simulated_clients = 3;
        config.server.region = RegionSettings {
            min_x: -5_000.0,
            max_x: 5_000.0,
            min_y: -5_000.0,
            max_y: 5_000.0,
            min_z: 0.0,
            max_z: 500.0,
        };
        config.replication.grid.cell_size = 2_000.0;
        config.replication.grid.spatial_bias = (-5_000.0, -5_000.0);
        config
    }

    #[test]
    fn test_population() {
        let simulation = Simulation::new(&small_config()).unwrap();
        // Objects, one game state and a pawn per client.
        assert_eq!(simulation.graph().object_count(), 60 + 1 + 3);
        assert_eq!(simulation.graph().connection_count(), 3);
        assert_eq!(simulation.graph().world().object_count(), 64);
    }

    #[test]
    fn test_ticks_replicate_to_every_client() {
        let mut simulation = Simulation::new(&small_config()).unwrap();
        let mut sends = 0;
        for _ in 0..30 {
            if let Some(stats) = simulation.step(1.0 / 30.0) {
                sends += stats.sends;
            }
        }
        assert!(sends > 0);
        assert_eq!(simulation.stats().ticks, 30);
        assert!(simulation.graph().transport().open_channels() > 0);
        assert!(simulation.graph().world().pre_replications() > 0);
    }

    #[test]
    fn test_same_seed_same_traffic() {
        let run = || {
            let mut simulation = Simulation::new(&small_config()).unwrap();
            for _ in 0..20 {
                simulation.step(1.0 / 30.0);
            }
            simulation.stats().totals.bits_written
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_disconnect_removes_pawn_and_connection() {
        let mut simulation = Simulation::new(&small_config()).unwrap();
        simulation.step(1.0 / 30.0);

        let removed = simulation.disconnect_client().unwrap();
        assert!(removed.is_some());
        assert_eq!(simulation.client_count(), 2);
        assert_eq!(simulation.graph().connection_count(), 2);
        assert_eq!(simulation.graph().object_count(), 63);
        assert!(simulation.step(1.0 / 30.0).is_some());
    }

    #[test]
    fn test_slow_client_saturates() {
        let mut config = small_config();
        config.server.client_rate_bytes_per_sec = 200;
        let mut simulation = Simulation::new(&config).unwrap();
        let mut saturations = 0;
        for _ in 0..10 {
            if let Some(stats) = simulation.step(1.0 / 30.0) {
                saturations += stats.saturations;
            }
        }
        assert!(saturations > 0);
    }

    #[test]
    fn test_world_moves_drones_toward_targets() {
        let mut world = SimWorld::new(small_config().server.region, 7);
        let id = NetObjectId(1);
        let start = world.spawn(id, ObjectKind::Drone);
        // Arrival on the first step picks a target; the second step moves.
        world.step(0.1);
        world.step(0.1);
        assert_ne!(world.position(id), Some(start));
        assert!(matches!(world.build_fast_shared(id, 1), FastSharedBuild::New(data) if data.len() == 20));
    }
}
