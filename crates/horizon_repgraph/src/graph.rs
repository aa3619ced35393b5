//! The replication graph.
//!
//! [`ReplicationGraph`] owns the object registry, the global interest nodes,
//! every connection's state and the two collaborators. Application code
//! talks to it with [`NetObjectId`]s; each call either applies immediately
//! (per-connection flags, frame stamps) or queues a node event that is
//! applied during the next Prepare so nodes are never mutated mid-gather.
//!
//! One call to [`ReplicationGraph::tick`] runs Prepare once, then for each
//! connection in registration order: Gather, the frequency-scheduled sends,
//! Prioritize, the default lane, the fast-shared lane and Cleanup.

use crate::config::GraphConfig;
use crate::connection::{ConnectionManager, PendingDestruction};
use crate::error::{GraphError, GraphResult};
use crate::fast_shared::replicate_fast_shared_lists;
use crate::info::{GlobalReplicationInfo, ObjectDescriptor, ObjectInfoMap};
use crate::nodes::{
    AlwaysRelevantNode, GatherContext, GridSpatialization2D, InterestNode, NodeObject, PrepareContext,
    RegionPartitionedNode,
};
use crate::prioritize::{prioritize, PrioritizedItem};
use crate::replicate::{replicate_prioritized, replicate_scheduled, SendContext};
use crate::settings::{ClassReplicationSettings, ClassSettingsRegistry, RoutingPolicy, SpatialMode};
use crate::stats::{GraphStats, TickStats};
use crate::transport::{ReplicationTransport, ReplicationWorld};
use crate::types::{
    CloseReason, ConnectionHandle, Frame, NetDormancy, NetObjectId, NetViewer, NodeKey, ObjectHandle, RegionName, Vec3,
};
use slotmap::SlotMap;
use std::collections::HashSet;
use tracing::{debug, info, trace, warn};

/// Node-side work queued by application calls and applied in Prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeEvent {
    DormancyChanged { handle: ObjectHandle, was_dormant: bool, now_dormant: bool },
    DormancyFlush { handle: ObjectHandle },
    CullDistanceChanged { handle: ObjectHandle },
}

impl NodeEvent {
    fn handle(&self) -> ObjectHandle {
        match *self {
            NodeEvent::DormancyChanged { handle, .. }
            | NodeEvent::DormancyFlush { handle }
            | NodeEvent::CullDistanceChanged { handle } => handle,
        }
    }
}

pub struct ReplicationGraph<W: ReplicationWorld, T: ReplicationTransport> {
    config: GraphConfig,
    classes: ClassSettingsRegistry,
    objects: ObjectInfoMap,
    nodes: SlotMap<NodeKey, InterestNode>,
    node_order: Vec<NodeKey>,
    grid_node: NodeKey,
    relevant_all_node: NodeKey,
    always_relevant_classes_node: Option<NodeKey>,
    connections: SlotMap<ConnectionHandle, ConnectionManager>,
    connection_order: Vec<ConnectionHandle>,
    events: Vec<NodeEvent>,
    frame: Frame,
    time_accumulator: f64,
    discovery_max_bits: i64,
    stats: GraphStats,
    prioritized: Vec<PrioritizedItem>,
    world: W,
    transport: T,
}

impl<W: ReplicationWorld, T: ReplicationTransport> ReplicationGraph<W, T> {
    /// Builds the default topology: a spatial grid and a list for objects
    /// relevant to every connection.
    pub fn new(config: GraphConfig, world: W, transport: T) -> GraphResult<Self> {
        config.validate()?;

        let mut nodes = SlotMap::with_key();
        let grid_node = nodes.insert(InterestNode::Grid(GridSpatialization2D::new(
            &config.grid,
            &config.frequency_buckets,
            &config.dormancy,
        )));
        let relevant_all_node = nodes.insert(InterestNode::RegionPartitioned(RegionPartitionedNode::new()));

        let mut graph = Self {
            classes: ClassSettingsRegistry::new(&config.class_defaults),
            objects: ObjectInfoMap::new(),
            nodes,
            node_order: vec![grid_node, relevant_all_node],
            grid_node,
            relevant_all_node,
            always_relevant_classes_node: None,
            connections: SlotMap::with_key(),
            connection_order: Vec::new(),
            events: Vec::new(),
            frame: 1,
            time_accumulator: 0.0,
            discovery_max_bits: 0,
            stats: GraphStats::default(),
            prioritized: Vec::new(),
            world,
            transport,
            config,
        };
        graph.set_discovery_budget(graph.config.general.discovery_budget_bytes_per_sec);

        info!(
            "🕸️ Replication graph ready: {} Hz, grid cell {:.0}, fast-shared {}",
            graph.config.general.server_tick_rate,
            graph.config.grid.cell_size,
            if graph.config.fast_shared.enabled { "on" } else { "off" }
        );
        Ok(graph)
    }

    // -- accessors ----------------------------------------------------------

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// The frame the next tick will run as. Starts at 1.
    pub fn frame(&self) -> Frame {
        self.frame
    }

    pub fn stats(&self) -> &GraphStats {
        &self.stats
    }

    pub fn world(&self) -> &W {
        &self.world
    }

    pub fn world_mut(&mut self) -> &mut W {
        &mut self.world
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn is_registered(&self, id: NetObjectId) -> bool {
        self.objects.handle_of(id).is_some()
    }

    pub fn handle_of(&self, id: NetObjectId) -> Option<ObjectHandle> {
        self.objects.handle_of(id)
    }

    pub fn object_info(&self, id: NetObjectId) -> Option<&GlobalReplicationInfo> {
        self.objects.handle_of(id).and_then(|handle| self.objects.get(handle))
    }

    pub fn connection(&self, connection: ConnectionHandle) -> Option<&ConnectionManager> {
        self.connections.get(connection)
    }

    /// Connections in registration order.
    pub fn connections(&self) -> impl Iterator<Item = &ConnectionManager> {
        self.connection_order.iter().filter_map(|handle| self.connections.get(*handle))
    }

    pub fn connection_count(&self) -> usize {
        self.connection_order.len()
    }

    pub fn grid_node(&self) -> NodeKey {
        self.grid_node
    }

    pub fn relevant_all_node(&self) -> NodeKey {
        self.relevant_all_node
    }

    pub fn grid(&self) -> Option<&GridSpatialization2D> {
        self.nodes.get(self.grid_node).and_then(InterestNode::as_grid)
    }

    pub fn global_node(&self, key: NodeKey) -> Option<&InterestNode> {
        self.nodes.get(key)
    }

    pub fn set_paused(&mut self, paused: bool) {
        if self.config.general.paused != paused {
            info!("⏯️ Replication {}", if paused { "paused" } else { "resumed" });
        }
        self.config.general.paused = paused;
    }

    pub fn is_paused(&self) -> bool {
        self.config.general.paused
    }

    // -- class settings -----------------------------------------------------

    /// Settings for objects of `class` registered from now on.
    pub fn set_class_settings(&mut self, class: impl Into<String>, settings: ClassReplicationSettings) {
        let class = class.into();
        debug!("Class {} routes via {:?}", class, settings.routing);
        self.classes.set(class, settings);
    }

    pub fn class_settings(&self, class: &str) -> GraphResult<&ClassReplicationSettings> {
        if self.classes.contains(class) {
            Ok(self.classes.get(class))
        } else {
            Err(GraphError::UnknownClass(class.to_string()))
        }
    }

    /// A settings value seeded from the configured class defaults.
    pub fn class_template(&self) -> ClassReplicationSettings {
        self.classes.template()
    }

    /// Offers every routed object of `class` to every connection. The list
    /// is rebuilt each Prepare.
    pub fn add_always_relevant_class(&mut self, class: impl Into<String>) {
        let class = class.into();
        if let Some(InterestNode::AlwaysRelevant(node)) =
            self.always_relevant_classes_node.and_then(|key| self.nodes.get_mut(key))
        {
            node.add_class(class);
            return;
        }
        let key = self.nodes.insert(InterestNode::AlwaysRelevant(AlwaysRelevantNode::with_classes([class])));
        self.node_order.push(key);
        self.always_relevant_classes_node = Some(key);
    }

    // -- global nodes -------------------------------------------------------

    /// Adds a node gathered for every connection. Objects reach it through
    /// [`RoutingPolicy::Node`].
    pub fn add_global_node(&mut self, node: InterestNode) -> NodeKey {
        debug!("Added global {} node", node.kind());
        let key = self.nodes.insert(node);
        self.node_order.push(key);
        key
    }

    pub fn remove_global_node(&mut self, key: NodeKey) -> GraphResult<InterestNode> {
        if key == self.grid_node || key == self.relevant_all_node {
            return Err(GraphError::BuiltInNode(key));
        }
        let node = self.nodes.remove(key).ok_or(GraphError::NodeNotFound(key))?;
        self.node_order.retain(|k| *k != key);
        if self.always_relevant_classes_node == Some(key) {
            self.always_relevant_classes_node = None;
        }
        Ok(node)
    }

    // -- connections --------------------------------------------------------

    pub fn add_connection(&mut self, viewer: NetViewer) -> ConnectionHandle {
        let handle = self.connections.insert_with_key(|handle| ConnectionManager::new(handle, viewer));
        self.connection_order.push(handle);
        info!("🔗 Connection {:?} added ({} total)", handle, self.connection_order.len());
        handle
    }

    pub fn remove_connection(&mut self, connection: ConnectionHandle) -> GraphResult<()> {
        self.connections
            .remove(connection)
            .ok_or(GraphError::ConnectionNotFound(connection))?;
        self.connection_order.retain(|handle| *handle != connection);
        for node in self.nodes.values_mut() {
            node.remove_connection(connection);
        }
        info!("🔌 Connection {:?} removed ({} left)", connection, self.connection_order.len());
        Ok(())
    }

    fn connection_mut(&mut self, connection: ConnectionHandle) -> GraphResult<&mut ConnectionManager> {
        self.connections
            .get_mut(connection)
            .ok_or(GraphError::ConnectionNotFound(connection))
    }

    pub fn set_viewer(&mut self, connection: ConnectionHandle, viewer: NetViewer) -> GraphResult<()> {
        self.connection_mut(connection)?.set_primary_viewer(viewer);
        Ok(())
    }

    /// Adds a split-screen viewer to the connection.
    pub fn add_child_viewer(&mut self, connection: ConnectionHandle, viewer: NetViewer) -> GraphResult<()> {
        self.connection_mut(connection)?.add_child_viewer(viewer);
        Ok(())
    }

    pub fn remove_child_viewers(&mut self, connection: ConnectionHandle) -> GraphResult<()> {
        self.connection_mut(connection)?.remove_child_viewers();
        Ok(())
    }

    pub fn add_connection_node(&mut self, connection: ConnectionHandle, node: InterestNode) -> GraphResult<NodeKey> {
        Ok(self.connection_mut(connection)?.add_node(node))
    }

    pub fn remove_connection_node(&mut self, connection: ConnectionHandle, key: NodeKey) -> GraphResult<InterestNode> {
        self.connection_mut(connection)?
            .remove_node(key)
            .ok_or(GraphError::NodeNotFound(key))
    }

    /// Adds an object to one of the connection's own nodes.
    pub fn add_to_connection_node(&mut self, connection: ConnectionHandle, key: NodeKey, id: NetObjectId) -> GraphResult<()> {
        let handle = self.objects.handle_of(id).ok_or(GraphError::ObjectNotRegistered(id))?;
        let info = self.objects.get(handle).ok_or(GraphError::ObjectNotRegistered(id))?;
        let object = NodeObject {
            handle,
            info,
            initialized: self.world.is_initialized(id),
        };
        let verify = self.config.general.verification;
        let manager = self
            .connections
            .get_mut(connection)
            .ok_or(GraphError::ConnectionNotFound(connection))?;
        manager
            .node_mut(key)
            .ok_or(GraphError::NodeNotFound(key))?
            .add_object(object, verify);
        Ok(())
    }

    /// Replaces the set of regions the client has loaded.
    ///
    /// Dormant-on-all objects of a newly visible region are woken on this
    /// connection, and dormancy mirrors restore what they dropped for it.
    pub fn set_client_visible_regions<I, S>(&mut self, connection: ConnectionHandle, regions: I) -> GraphResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<RegionName>,
    {
        let manager = self
            .connections
            .get_mut(connection)
            .ok_or(GraphError::ConnectionNotFound(connection))?;
        let regions: HashSet<RegionName> = regions.into_iter().map(Into::into).collect();
        let mut added: Vec<RegionName> = regions.difference(&manager.visible_regions).cloned().collect();
        added.sort();
        manager.visible_regions = regions;
        let ConnectionManager {
            destruction_infos,
            visible_regions,
            ..
        } = &mut *manager;
        destruction_infos.retain(|destruction| destruction.region.as_ref().map_or(true, |r| visible_regions.contains(r)));

        for region in &added {
            debug!("🗺️ {:?} loaded region {}", connection, region);
            for node in self.nodes.values_mut() {
                node.on_region_visible(connection, region);
            }
            for node in manager.nodes.values_mut() {
                node.on_region_visible(connection, region);
            }
            for (handle, info) in manager.infos.iter_mut() {
                let Some(global) = self.objects.get(handle) else {
                    continue;
                };
                if global.dormancy == NetDormancy::DormantAll && global.region.as_ref() == Some(region) {
                    info.dormant_on_connection = false;
                }
            }
        }
        Ok(())
    }

    // -- registration -------------------------------------------------------

    /// Registers an object and routes it into the nodes its class asks for.
    ///
    /// Registering an id again with the same class returns the existing
    /// handle. Level-placed objects that start dormant are held back until
    /// their first flush.
    pub fn register_object(&mut self, descriptor: ObjectDescriptor) -> GraphResult<ObjectHandle> {
        let id = descriptor.id;
        if let Some(existing) = self.objects.handle_of(id) {
            let same_class = self.objects.get(existing).is_some_and(|info| info.class == descriptor.class);
            if same_class {
                debug!("{} registered twice, keeping the first registration", id);
                return Ok(existing);
            }
            warn!("⚠️ {} is already registered with a different class", id);
            return Err(GraphError::AlreadyRegistered(id));
        }

        let location = descriptor.location;
        if !(location.x.is_finite() && location.y.is_finite() && location.z.is_finite()) {
            warn!("⚠️ Refusing to register {} at a non-finite location", id);
            return Err(GraphError::IneligibleObject(id, "non-finite location".to_string()));
        }

        let settings = self.classes.get(&descriptor.class).clone();
        if let RoutingPolicy::Node(key) = settings.routing {
            if !self.nodes.contains_key(key) {
                warn!("⚠️ {} routes to missing node {:?}", id, key);
                return Err(GraphError::NodeNotFound(key));
            }
        }
        if settings.cull_distance < 0.0 {
            warn!("⚠️ Class {} has a negative cull distance, {} will never be relevant", descriptor.class, id);
        }

        let handle = self.objects.insert(GlobalReplicationInfo::new(&descriptor, settings));
        if descriptor.dormancy == NetDormancy::Initial && descriptor.net_startup {
            debug!("💤 {} placed dormant, waiting for its first flush", id);
            return Ok(handle);
        }

        self.route_object(handle);
        debug!("➕ Registered {} ({})", id, descriptor.class);
        Ok(handle)
    }

    fn route_object(&mut self, handle: ObjectHandle) {
        let Some(info) = self.objects.get(handle) else {
            return;
        };
        let object = NodeObject {
            handle,
            info,
            initialized: self.world.is_initialized(info.id),
        };
        let verify = self.config.general.verification;

        match info.settings.routing {
            RoutingPolicy::NotRouted => {}
            RoutingPolicy::RelevantAllConnections => {
                if let Some(node) = self.nodes.get_mut(self.relevant_all_node) {
                    node.add_object(object, verify);
                }
            }
            RoutingPolicy::RelevantOwnerConnection => {
                match info.owner.and_then(|owner| self.connections.get_mut(owner)) {
                    Some(manager) => manager.add_owned_object(object, verify),
                    None => warn!("⚠️ {} is owner-relevant but has no live owner connection", info.id),
                }
            }
            RoutingPolicy::Spatialize(_) => {
                if let Some(node) = self.nodes.get_mut(self.grid_node) {
                    node.add_object(object, verify);
                }
            }
            RoutingPolicy::Node(key) => match self.nodes.get_mut(key) {
                Some(node) => node.add_object(object, verify),
                None => warn!("⚠️ {} routes to missing node {:?}", info.id, key),
            },
        }

        if let Some(info) = self.objects.get_mut(handle) {
            info.routed = true;
        }
    }

    /// Removes the object from every global node and its owner's node.
    fn unroute_object(&mut self, handle: ObjectHandle) {
        let Some(info) = self.objects.get(handle) else {
            return;
        };
        let object = NodeObject {
            handle,
            info,
            initialized: true,
        };
        for node in self.nodes.values_mut() {
            node.remove_object(object);
        }
        if let Some(manager) = info.owner.and_then(|owner| self.connections.get_mut(owner)) {
            manager.remove_owned_object(object);
        }
        if let Some(info) = self.objects.get_mut(handle) {
            info.routed = false;
        }
    }

    /// Removes every trace of the object.
    ///
    /// Open channels are closed. Level-placed objects the client holds
    /// without a channel get a destruction notice instead.
    pub fn unregister_object(&mut self, id: NetObjectId) -> GraphResult<()> {
        let handle = self.objects.handle_of(id).ok_or(GraphError::ObjectNotRegistered(id))?;
        let routed = self.objects.get(handle).is_some_and(|info| info.routed && !info.torn_off);
        if routed {
            self.unroute_object(handle);
        }

        let Some(info) = self.objects.get(handle) else {
            return Err(GraphError::ObjectNotRegistered(id));
        };
        let object = NodeObject {
            handle,
            info,
            initialized: true,
        };
        for connection in &self.connection_order {
            let Some(manager) = self.connections.get_mut(*connection) else {
                continue;
            };
            match manager.infos.get(handle).and_then(|conn_info| conn_info.channel) {
                Some(channel) => self.transport.close_channel(*connection, channel, CloseReason::Destroyed),
                None if info.net_startup && manager.is_region_visible(info.region.as_deref()) => {
                    manager.queue_destruction(PendingDestruction {
                        id,
                        location: info.world_location,
                        region: info.region.clone(),
                    });
                }
                None => {}
            }
            manager.remove_object(object);
        }

        let owners = info.dependent_of.clone();
        let dependents = info.dependents.clone();
        for owner in owners {
            if let Some(owner) = self.objects.get_mut(owner) {
                owner.dependents.retain(|h| *h != handle);
            }
        }
        for dependent in dependents {
            if let Some(dependent) = self.objects.get_mut(dependent) {
                dependent.dependent_of.retain(|h| *h != handle);
            }
        }

        self.events.retain(|event| event.handle() != handle);
        self.objects.remove(handle);
        debug!("➖ Unregistered {}", id);
        Ok(())
    }

    // -- object notifications ----------------------------------------------

    /// The object replicates on every connection at its next readiness check.
    pub fn force_update(&mut self, id: NetObjectId) -> GraphResult<()> {
        let frame = self.frame;
        let info = self.global_mut(id)?;
        info.force_update_frame = frame;
        trace!("⏩ Force update of {} at frame {}", id, frame);
        Ok(())
    }

    /// Records a new dormancy state.
    ///
    /// Waking up clears every connection's dormant flag right away; the node
    /// migration runs in the next Prepare.
    pub fn notify_dormancy_changed(&mut self, id: NetObjectId, dormancy: NetDormancy) -> GraphResult<()> {
        let handle = self.objects.handle_of(id).ok_or(GraphError::ObjectNotRegistered(id))?;
        let info = self.objects.get_mut(handle).ok_or(GraphError::ObjectNotRegistered(id))?;
        let was_dormant = info.wants_dormant;
        let now_dormant = dormancy.wants_dormant();
        info.dormancy = dormancy;
        info.wants_dormant = now_dormant;
        let routed = info.routed;
        let torn_off = info.torn_off;

        if was_dormant == now_dormant {
            return Ok(());
        }
        debug!("💤 {} dormancy {} -> {}", id, was_dormant, now_dormant);

        if was_dormant && !now_dormant {
            for manager in self.connections.values_mut() {
                if let Some(conn_info) = manager.infos.get_mut(handle) {
                    conn_info.dormant_on_connection = false;
                }
            }
        }

        if routed {
            self.events.push(NodeEvent::DormancyChanged {
                handle,
                was_dormant,
                now_dormant,
            });
        } else if !now_dormant && !torn_off {
            self.route_object(handle);
        }
        Ok(())
    }

    /// Gives a dormant object one more send on every connection.
    ///
    /// At most once per frame. Does nothing for objects that are not
    /// dormant. The first flush of a level-placed dormant object routes it.
    pub fn flush_dormancy(&mut self, id: NetObjectId) -> GraphResult<()> {
        let handle = self.objects.handle_of(id).ok_or(GraphError::ObjectNotRegistered(id))?;
        if !self.world.is_initialized(id) {
            debug!("{} flushed before it finished initializing, ignoring", id);
            return Ok(());
        }
        let frame = self.frame;
        let info = self.objects.get_mut(handle).ok_or(GraphError::ObjectNotRegistered(id))?;
        if !info.wants_dormant || info.last_flush_dormancy_frame == frame {
            return Ok(());
        }
        info.last_flush_dormancy_frame = frame;

        if !info.routed && !info.torn_off {
            if info.dormancy == NetDormancy::Initial {
                info.dormancy = NetDormancy::DormantAll;
            }
            debug!("💤 First flush of level-placed {}, routing it", id);
            self.route_object(handle);
            return Ok(());
        }

        for manager in self.connections.values_mut() {
            if let Some(conn_info) = manager.infos.get_mut(handle) {
                conn_info.dormant_on_connection = false;
            }
        }
        self.events.push(NodeEvent::DormancyFlush { handle });
        trace!("💤 Flushed {}", id);
        Ok(())
    }

    /// Sends the object one final time to every connection that knows it,
    /// then closes those channels.
    pub fn notify_tear_off(&mut self, id: NetObjectId) -> GraphResult<()> {
        let handle = self.objects.handle_of(id).ok_or(GraphError::ObjectNotRegistered(id))?;
        let (routed, torn_off) = self
            .objects
            .get(handle)
            .map(|info| (info.routed, info.torn_off))
            .ok_or(GraphError::ObjectNotRegistered(id))?;
        if torn_off {
            return Ok(());
        }
        if routed {
            self.unroute_object(handle);
        }
        if let Some(info) = self.objects.get_mut(handle) {
            info.torn_off = true;
        }

        for manager in self.connections.values_mut() {
            let Some(conn_info) = manager.infos.get_mut(handle) else {
                continue;
            };
            conn_info.tear_off = true;
            conn_info.next_rep_frame = 0;
            let tear_off_frame = conn_info.last_rep_frame;
            manager.notify_tear_off(handle, tear_off_frame);
        }
        debug!("🪓 {} torn off", id);
        Ok(())
    }

    /// Sets the bit budget for traffic to clients that have not yet
    /// acknowledged an object's spawn. 0 disables it.
    pub fn set_discovery_budget(&mut self, bytes_per_sec: u32) {
        self.config.general.discovery_budget_bytes_per_sec = bytes_per_sec;
        if bytes_per_sec == 0 {
            self.discovery_max_bits = 0;
            return;
        }
        self.discovery_max_bits = (bytes_per_sec as f64 * 8.0 / self.config.general.server_tick_rate) as i64;
        info!(
            "🔭 Discovery budget {} B/s ({} bits per tick)",
            bytes_per_sec, self.discovery_max_bits
        );
    }

    pub fn discovery_max_bits_per_frame(&self) -> i64 {
        self.discovery_max_bits
    }

    /// Changes one object's cull distance. Statically placed objects are
    /// re-spatialized on the next Prepare.
    pub fn set_cull_distance(&mut self, id: NetObjectId, cull_distance: f64) -> GraphResult<()> {
        if cull_distance < 0.0 {
            warn!("⚠️ Negative cull distance for {}, it will never be relevant", id);
        }
        let handle = self.objects.handle_of(id).ok_or(GraphError::ObjectNotRegistered(id))?;
        let info = self.objects.get_mut(handle).ok_or(GraphError::ObjectNotRegistered(id))?;
        info.settings.cull_distance = cull_distance;
        let squared = info.settings.cull_distance_squared();
        let routed = info.routed;

        for manager in self.connections.values_mut() {
            if let Some(conn_info) = manager.infos.get_mut(handle) {
                // Zero means the connection made it always relevant.
                if conn_info.cull_distance_squared() > 0.0 {
                    conn_info.set_cull_distance_squared(squared);
                }
            }
        }
        if routed {
            self.events.push(NodeEvent::CullDistanceChanged { handle });
        }
        Ok(())
    }

    /// Pushes a new location for the object. Locations are also pulled from
    /// the world every Prepare for everything that is not statically placed.
    pub fn set_location(&mut self, id: NetObjectId, location: Vec3) -> GraphResult<()> {
        self.global_mut(id)?.world_location = location;
        Ok(())
    }

    /// `dependent` is sent right after `owner` whenever it is ready, and its
    /// channel stays open as long as the owner's.
    pub fn add_dependent(&mut self, owner: NetObjectId, dependent: NetObjectId) -> GraphResult<()> {
        if owner == dependent {
            return Err(GraphError::IneligibleObject(dependent, "cannot depend on itself".to_string()));
        }
        let owner_handle = self.objects.handle_of(owner).ok_or(GraphError::ObjectNotRegistered(owner))?;
        let dependent_handle = self.objects.handle_of(dependent).ok_or(GraphError::ObjectNotRegistered(dependent))?;

        if let Some(info) = self.objects.get_mut(owner_handle) {
            if !info.dependents.contains(&dependent_handle) {
                info.dependents.push(dependent_handle);
            }
        }
        if let Some(info) = self.objects.get_mut(dependent_handle) {
            if !info.dependent_of.contains(&owner_handle) {
                info.dependent_of.push(owner_handle);
            }
        }
        Ok(())
    }

    pub fn remove_dependent(&mut self, owner: NetObjectId, dependent: NetObjectId) -> GraphResult<()> {
        let owner_handle = self.objects.handle_of(owner).ok_or(GraphError::ObjectNotRegistered(owner))?;
        let dependent_handle = self.objects.handle_of(dependent).ok_or(GraphError::ObjectNotRegistered(dependent))?;
        if let Some(info) = self.objects.get_mut(owner_handle) {
            info.dependents.retain(|h| *h != dependent_handle);
        }
        if let Some(info) = self.objects.get_mut(dependent_handle) {
            info.dependent_of.retain(|h| *h != owner_handle);
        }
        Ok(())
    }

    /// The transport closed the object's channel on its own. Frame counters
    /// restart; dormancy and cull overrides survive.
    pub fn notify_channel_closed(&mut self, connection: ConnectionHandle, id: NetObjectId) -> GraphResult<()> {
        let handle = self.objects.handle_of(id).ok_or(GraphError::ObjectNotRegistered(id))?;
        let manager = self.connection_mut(connection)?;
        if let Some(info) = manager.infos.get_mut(handle) {
            info.reset_frame_counters();
        }
        Ok(())
    }

    /// The object's channel on `connection` finished closing into dormancy.
    pub fn notify_fully_dormant(&mut self, connection: ConnectionHandle, id: NetObjectId) -> GraphResult<()> {
        let handle = self.objects.handle_of(id).ok_or(GraphError::ObjectNotRegistered(id))?;
        let global = self.objects.get(handle).ok_or(GraphError::ObjectNotRegistered(id))?;
        let manager = self
            .connections
            .get_mut(connection)
            .ok_or(GraphError::ConnectionNotFound(connection))?;
        if let Some(info) = manager.infos.find_or_add(handle, global) {
            info.dormant_on_connection = true;
            trace!("💤 {} fully dormant on {:?}", id, connection);
        }
        Ok(())
    }

    fn global_mut(&mut self, id: NetObjectId) -> GraphResult<&mut GlobalReplicationInfo> {
        let handle = self.objects.handle_of(id).ok_or(GraphError::ObjectNotRegistered(id))?;
        self.objects.get_mut(handle).ok_or(GraphError::ObjectNotRegistered(id))
    }

    /// Checks that a routed object sits in at least one node. Meant for
    /// verification runs and tests.
    pub fn verify_membership(&self, id: NetObjectId) -> GraphResult<()> {
        let handle = self.objects.handle_of(id).ok_or(GraphError::ObjectNotRegistered(id))?;
        let info = self.objects.get(handle).ok_or(GraphError::ObjectNotRegistered(id))?;
        let in_global = self.nodes.values().any(|node| node.contains(handle));
        let in_connection = self
            .connections
            .values()
            .any(|manager| manager.nodes.values().any(|node| node.contains(handle)));

        let expects_node = info.routed
            && !info.torn_off
            && match info.settings.routing {
                RoutingPolicy::NotRouted => false,
                RoutingPolicy::RelevantOwnerConnection => info.owner.is_some_and(|owner| self.connections.contains_key(owner)),
                _ => true,
            };
        if expects_node && !(in_global || in_connection) {
            return Err(GraphError::Verification(format!("{} is routed but no node holds it", id)));
        }
        if !info.routed && in_global {
            return Err(GraphError::Verification(format!("{} is not routed but a node holds it", id)));
        }
        Ok(())
    }

    /// Whether any node, global or per connection, holds the object.
    pub fn is_in_any_node(&self, handle: ObjectHandle) -> bool {
        self.nodes.values().any(|node| node.contains(handle))
            || self
                .connections
                .values()
                .any(|manager| manager.nodes.values().any(|node| node.contains(handle)))
    }

    // -- tick ---------------------------------------------------------------

    /// Runs one replication frame.
    ///
    /// Returns `None` when paused or when the configured update rate says
    /// this call should be skipped.
    pub fn tick(&mut self, delta_seconds: f64) -> Option<TickStats> {
        if self.config.general.paused {
            self.stats.record_skipped();
            return None;
        }

        let target = self.config.general.target_updates_per_second;
        if target > 0.0 {
            let interval = 1.0 / target;
            self.time_accumulator += delta_seconds;
            if self.time_accumulator < interval {
                self.stats.record_skipped();
                return None;
            }
            self.time_accumulator = (self.time_accumulator - interval).min(interval);
        }

        let mut tick = TickStats::new(self.frame);
        self.prepare(&mut tick);

        let order = self.connection_order.clone();
        for connection in order {
            self.replicate_connection(connection, &mut tick);
        }

        tick.connections = self.connection_order.len();
        self.stats.objects = self.objects.len();
        self.stats.connections = self.connection_order.len();
        self.stats.record(tick.clone());
        self.frame += 1;
        Some(tick)
    }

    fn prepare(&mut self, tick: &mut TickStats) {
        let static_mode = RoutingPolicy::Spatialize(SpatialMode::Static);
        for (_, info) in self.objects.iter_mut() {
            if !info.routed || info.torn_off || info.settings.routing == static_mode {
                continue;
            }
            if let Some(location) = self.world.location(info.id) {
                info.world_location = location;
            }
        }

        let verify = self.config.general.verification;
        for event in std::mem::take(&mut self.events) {
            let handle = event.handle();
            let Some(info) = self.objects.get(handle) else {
                continue;
            };
            let object = NodeObject {
                handle,
                info,
                initialized: self.world.is_initialized(info.id),
            };
            match event {
                NodeEvent::DormancyChanged {
                    was_dormant,
                    now_dormant,
                    ..
                } => {
                    for node in self.nodes.values_mut() {
                        node.on_dormancy_changed(object, was_dormant, now_dormant);
                    }
                }
                NodeEvent::DormancyFlush { .. } => {
                    let region = info.region.as_deref();
                    for node in self.nodes.values_mut() {
                        node.on_dormancy_flush(handle, region, verify);
                    }
                    for manager in self.connections.values_mut() {
                        for node in manager.nodes.values_mut() {
                            node.on_dormancy_flush(handle, region, false);
                        }
                    }
                }
                NodeEvent::CullDistanceChanged { .. } => {
                    for node in self.nodes.values_mut() {
                        node.on_cull_distance_changed(object);
                    }
                }
            }
        }

        let ctx = PrepareContext {
            objects: &self.objects,
            world: &self.world,
            frame: self.frame,
        };
        for key in &self.node_order {
            let Some(node) = self.nodes.get_mut(*key) else {
                continue;
            };
            if node.needs_prepare() && node.prepare(&ctx) {
                tick.grid_rebuilds += 1;
            }
        }
    }

    fn replicate_connection(&mut self, connection: ConnectionHandle, tick: &mut TickStats) {
        let frame = self.frame;
        let Self {
            config,
            objects,
            nodes,
            node_order,
            connections,
            world,
            transport,
            discovery_max_bits,
            prioritized,
            ..
        } = self;

        let Some(manager) = connections.get_mut(connection) else {
            return;
        };
        if manager.viewers.is_empty() {
            trace!("{:?} has no viewers, skipping", connection);
            return;
        }
        manager.begin_frame();

        {
            let ConnectionManager {
                viewers,
                last_gather_locations,
                infos,
                visible_regions,
                nodes: local_nodes,
                node_order: local_order,
                dormant_destructions,
                gathered,
                ..
            } = &mut *manager;

            let mut ctx = GatherContext {
                connection,
                viewers: viewers.as_slice(),
                frame,
                objects: &*objects,
                infos,
                visible_regions: &*visible_regions,
                last_gather_locations: last_gather_locations.as_slice(),
                config: &*config,
                dormant_destructions,
            };
            for key in node_order.iter() {
                if let Some(node) = nodes.get_mut(*key) {
                    node.gather(&mut ctx, gathered);
                }
            }
            for key in local_order.iter() {
                if let Some(node) = local_nodes.get_mut(*key) {
                    node.gather(&mut ctx, gathered);
                }
            }
        }
        tick.candidates += manager.gathered.candidate_count();

        let ConnectionManager {
            viewers,
            infos,
            gathered,
            discovery_queued_bits,
            ..
        } = &mut *manager;

        if !gathered.scheduled.is_empty() {
            let mut send = SendContext {
                connection,
                frame,
                objects: &mut *objects,
                infos: &mut *infos,
                world: &mut *world,
                transport: &mut *transport,
                config: &*config,
                discovery_max_bits: *discovery_max_bits,
                discovery_queued_bits: &mut *discovery_queued_bits,
                stats: &mut *tick,
            };
            for batch in &gathered.scheduled {
                replicate_scheduled(&mut send, batch);
            }
        }

        let outcome = prioritize(&gathered.default, objects, infos, viewers, frame, config, prioritized);
        tick.scored += outcome.scored;
        tick.culled += outcome.culled;

        {
            let mut send = SendContext {
                connection,
                frame,
                objects: &mut *objects,
                infos: &mut *infos,
                world: &mut *world,
                transport: &mut *transport,
                config: &*config,
                discovery_max_bits: *discovery_max_bits,
                discovery_queued_bits: &mut *discovery_queued_bits,
                stats: &mut *tick,
            };
            replicate_prioritized(&mut send, prioritized);
            if !gathered.fast_shared.is_empty() {
                replicate_fast_shared_lists(&mut send, &gathered.fast_shared, viewers);
            }
        }

        Self::cleanup_connection(manager, connection, frame, objects, transport, config, tick);
        manager.record_gather_locations();
    }

    /// Closes channels past their close frame and sends destruction notices.
    fn cleanup_connection(
        manager: &mut ConnectionManager,
        connection: ConnectionHandle,
        frame: Frame,
        objects: &ObjectInfoMap,
        transport: &mut T,
        config: &GraphConfig,
        tick: &mut TickStats,
    ) {
        for (handle, info) in manager.infos.iter_mut() {
            let Some(channel) = info.channel else {
                continue;
            };
            let close_frame = info.channel_close_frame();
            if close_frame == 0 || close_frame > frame {
                continue;
            }
            if transport.is_closing(connection, channel) {
                continue;
            }
            trace!("📪 Closing idle channel of {:?} on {:?}", handle, connection);
            transport.close_channel(connection, channel, CloseReason::Relevancy);
            info.reset_frame_counters();
            tick.channel_closes += 1;
        }

        let max_distance = config.general.destruction_info_max_distance;
        let max_distance_squared = max_distance * max_distance;
        let viewers = &manager.viewers;
        let visible_regions = &manager.visible_regions;
        let mut index = manager.destruction_infos.len();
        while index > 0 {
            index -= 1;
            let destruction = &manager.destruction_infos[index];
            if let Some(region) = destruction.region.as_ref() {
                if !visible_regions.contains(region) {
                    manager.destruction_infos.swap_remove(index);
                    continue;
                }
            }
            let nearest = viewers
                .iter()
                .map(|viewer| destruction.location.distance_squared_2d(viewer.location))
                .fold(f64::MAX, f64::min);
            if nearest < max_distance_squared {
                transport.send_destruction(connection, destruction.id, CloseReason::Destroyed);
                tick.destruction_infos_sent += 1;
                manager.destruction_infos.swap_remove(index);
            }
        }

        for handle in manager.dormant_destructions.drain(..) {
            if let Some(global) = objects.get(handle) {
                transport.send_destruction(connection, global.id, CloseReason::Relevancy);
                tick.destruction_infos_sent += 1;
            }
        }
    }
}
