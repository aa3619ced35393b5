//! Per-connection replication state.
//!
//! A [`ConnectionManager`] owns everything the graph keeps for one client:
//! its viewers, its per-object info map, the regions it has loaded, its local
//! interest nodes and the destruction notices waiting to be sent.

use crate::info::ConnectionInfoMap;
use crate::nodes::{
    AlwaysRelevantForConnectionNode, GatheredLists, InterestNode, NodeObject, TearOffForConnectionNode,
};
use crate::types::{ConnectionHandle, Frame, NetObjectId, NetViewer, NodeKey, ObjectHandle, RegionName, Vec3};
use slotmap::SlotMap;
use std::collections::HashSet;
use tracing::{debug, warn};

/// A destruction notice for an object the client may still hold.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDestruction {
    pub id: NetObjectId,
    pub location: Vec3,
    pub region: Option<RegionName>,
}

#[derive(Debug)]
pub struct ConnectionManager {
    handle: ConnectionHandle,
    pub(crate) viewers: Vec<NetViewer>,
    pub(crate) last_gather_locations: Vec<Vec3>,
    pub(crate) infos: ConnectionInfoMap,
    pub(crate) visible_regions: HashSet<RegionName>,
    pub(crate) nodes: SlotMap<NodeKey, InterestNode>,
    pub(crate) node_order: Vec<NodeKey>,
    tear_off_node: NodeKey,
    owner_node: NodeKey,
    pub(crate) destruction_infos: Vec<PendingDestruction>,
    pub(crate) dormant_destructions: Vec<ObjectHandle>,
    pub(crate) discovery_queued_bits: i64,
    /// Reused gather buffer
    pub(crate) gathered: GatheredLists,
}

impl ConnectionManager {
    pub(crate) fn new(handle: ConnectionHandle, viewer: NetViewer) -> Self {
        let mut nodes = SlotMap::with_key();
        let tear_off_node = nodes.insert(InterestNode::TearOffForConnection(TearOffForConnectionNode::new()));
        let owner_node = nodes.insert(InterestNode::AlwaysRelevantForConnection(AlwaysRelevantForConnectionNode::new()));
        Self {
            handle,
            viewers: vec![viewer],
            last_gather_locations: vec![viewer.location],
            infos: ConnectionInfoMap::new(),
            visible_regions: HashSet::new(),
            nodes,
            node_order: vec![tear_off_node, owner_node],
            tear_off_node,
            owner_node,
            destruction_infos: Vec::new(),
            dormant_destructions: Vec::new(),
            discovery_queued_bits: 0,
            gathered: GatheredLists::default(),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn viewers(&self) -> &[NetViewer] {
        &self.viewers
    }

    /// The first viewer is the connection's own; the rest are split-screen children.
    pub fn primary_viewer(&self) -> Option<&NetViewer> {
        self.viewers.first()
    }

    pub(crate) fn set_primary_viewer(&mut self, viewer: NetViewer) {
        match self.viewers.first_mut() {
            Some(primary) => *primary = viewer,
            None => self.viewers.push(viewer),
        }
    }

    pub(crate) fn add_child_viewer(&mut self, viewer: NetViewer) {
        self.viewers.push(viewer);
    }

    pub(crate) fn remove_child_viewers(&mut self) {
        self.viewers.truncate(1);
    }

    pub fn infos(&self) -> &ConnectionInfoMap {
        &self.infos
    }

    pub fn visible_regions(&self) -> &HashSet<RegionName> {
        &self.visible_regions
    }

    pub fn is_region_visible(&self, region: Option<&str>) -> bool {
        region.map_or(true, |region| self.visible_regions.contains(region))
    }

    pub fn pending_destructions(&self) -> &[PendingDestruction] {
        &self.destruction_infos
    }

    pub fn node(&self, key: NodeKey) -> Option<&InterestNode> {
        self.nodes.get(key)
    }

    pub(crate) fn node_mut(&mut self, key: NodeKey) -> Option<&mut InterestNode> {
        self.nodes.get_mut(key)
    }

    pub(crate) fn add_node(&mut self, node: InterestNode) -> NodeKey {
        let key = self.nodes.insert(node);
        self.node_order.push(key);
        key
    }

    pub(crate) fn remove_node(&mut self, key: NodeKey) -> Option<InterestNode> {
        if key == self.tear_off_node || key == self.owner_node {
            warn!("⚠️ Built-in connection nodes cannot be removed from {:?}", self.handle);
            return None;
        }
        self.node_order.retain(|k| *k != key);
        self.nodes.remove(key)
    }

    pub(crate) fn add_owned_object(&mut self, object: NodeObject<'_>, verify: bool) {
        if let Some(node) = self.nodes.get_mut(self.owner_node) {
            node.add_object(object, verify);
        }
    }

    pub(crate) fn remove_owned_object(&mut self, object: NodeObject<'_>) -> bool {
        self.nodes
            .get_mut(self.owner_node)
            .is_some_and(|node| node.remove_object(object))
    }

    pub(crate) fn notify_tear_off(&mut self, handle: ObjectHandle, tear_off_frame: Frame) {
        if let Some(node) = self.nodes.get_mut(self.tear_off_node).and_then(InterestNode::as_tear_off_mut) {
            node.notify_tear_off(handle, tear_off_frame);
        }
    }

    /// Drops the object from every local node and forgets its info.
    pub(crate) fn remove_object(&mut self, object: NodeObject<'_>) {
        for node in self.nodes.values_mut() {
            node.remove_object(object);
        }
        self.infos.remove(object.handle);
        self.dormant_destructions.retain(|handle| *handle != object.handle);
    }

    /// Records the locations gathered this tick for next tick's cell-change checks.
    pub(crate) fn record_gather_locations(&mut self) {
        self.last_gather_locations.clear();
        self.last_gather_locations.extend(self.viewers.iter().map(|viewer| viewer.location));
    }

    pub(crate) fn queue_destruction(&mut self, destruction: PendingDestruction) {
        debug!("💀 Queued destruction of {} for {:?}", destruction.id, self.handle);
        self.destruction_infos.push(destruction);
    }

    pub(crate) fn begin_frame(&mut self) {
        self.discovery_queued_bits = 0;
        self.gathered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{GlobalReplicationInfo, ObjectDescriptor, ObjectInfoMap};
    use crate::settings::ClassReplicationSettings;

    fn manager() -> ConnectionManager {
        let mut handles: SlotMap<ConnectionHandle, ()> = SlotMap::with_key();
        ConnectionManager::new(handles.insert(()), NetViewer::at(Vec3::new(1.0, 2.0, 3.0)))
    }

    #[test]
    fn test_builtin_nodes_are_permanent() {
        let mut manager = manager();
        assert_eq!(manager.node_order.len(), 2);
        let tear_off = manager.tear_off_node;
        assert!(manager.remove_node(tear_off).is_none());
        assert!(manager.node(tear_off).is_some());
    }

    #[test]
    fn test_persistent_world_is_always_visible() {
        let mut manager = manager();
        assert!(manager.is_region_visible(None));
        assert!(!manager.is_region_visible(Some("Harbor")));
        manager.visible_regions.insert("Harbor".to_string());
        assert!(manager.is_region_visible(Some("Harbor")));
    }

    #[test]
    fn test_remove_object_clears_local_state() {
        let mut manager = manager();
        let mut objects = ObjectInfoMap::new();
        let handle = objects.insert(GlobalReplicationInfo::new(
            &ObjectDescriptor::new(NetObjectId(5), "Pawn"),
            ClassReplicationSettings::default(),
        ));
        let info = objects.get(handle).expect("inserted");
        let object = NodeObject { handle, info, initialized: true };

        manager.add_owned_object(object, true);
        manager.notify_tear_off(handle, 0);
        manager.infos.find_or_add(handle, info);
        manager.dormant_destructions.push(handle);

        manager.remove_object(object);
        assert!(manager.nodes.values().all(|node| !node.contains(handle)));
        assert!(!manager.infos.contains(handle));
        assert!(manager.dormant_destructions.is_empty());
    }

    #[test]
    fn test_child_viewers() {
        let mut manager = manager();
        manager.add_child_viewer(NetViewer::at(Vec3::zero()));
        assert_eq!(manager.viewers().len(), 2);
        manager.record_gather_locations();
        assert_eq!(manager.last_gather_locations, vec![Vec3::new(1.0, 2.0, 3.0), Vec3::zero()]);
        manager.remove_child_viewers();
        assert_eq!(manager.viewers().len(), 1);
    }
}
