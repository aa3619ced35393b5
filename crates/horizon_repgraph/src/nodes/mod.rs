//! Interest nodes.
//!
//! A node answers one question for one connection per tick: which objects are
//! candidates right now. Nodes are a closed set of kinds wrapped in
//! [`InterestNode`]; the graph dispatches through it and never needs to know
//! which kind it is talking to.
//!
//! Gathering writes into [`GatheredLists`]. Default-lane handles are scored
//! and sorted by the prioritizer, fast-shared lists are walked round-robin and
//! scheduled batches (from [`DynamicSpatialFrequencyNode`]) carry their own
//! ordering and budget.

pub mod actor_list;
pub mod buckets;
pub mod dormancy;
pub mod dynamic_frequency;
pub mod grid;
pub mod relevant;

pub use actor_list::{ActorListNode, RegionLists, RegionPartitionedNode, RepList};
pub use buckets::FrequencyBucketsNode;
pub use dormancy::{ConnectionDormancyNode, DormancyNode};
pub use dynamic_frequency::DynamicSpatialFrequencyNode;
pub use grid::{CellRect, GridCellNode, GridSpatialization2D};
pub use relevant::{AlwaysRelevantForConnectionNode, AlwaysRelevantNode, TearOffForConnectionNode};

use crate::config::GraphConfig;
use crate::info::{ConnectionInfoMap, GlobalReplicationInfo, ObjectInfoMap};
use crate::transport::ReplicationWorld;
use crate::types::{ConnectionHandle, Frame, NetViewer, ObjectHandle, RegionName, Vec3};
use std::collections::HashSet;
use tracing::warn;

/// An object as handed to a node on add, remove or change.
#[derive(Debug, Clone, Copy)]
pub struct NodeObject<'a> {
    pub handle: ObjectHandle,
    pub info: &'a GlobalReplicationInfo,
    /// The world reports the object fully initialized
    pub initialized: bool,
}

/// Everything a node may read or touch while gathering for one connection.
pub struct GatherContext<'a> {
    pub connection: ConnectionHandle,
    pub viewers: &'a [NetViewer],
    pub frame: Frame,
    pub objects: &'a ObjectInfoMap,
    pub infos: &'a mut ConnectionInfoMap,
    pub visible_regions: &'a HashSet<RegionName>,
    /// Viewer locations from the previous gather, index-aligned with `viewers`
    pub last_gather_locations: &'a [Vec3],
    pub config: &'a GraphConfig,
    /// Dormant objects the client should destroy, sent during cleanup
    pub dormant_destructions: &'a mut Vec<ObjectHandle>,
}

impl GatherContext<'_> {
    pub fn is_region_visible(&self, region: &str) -> bool {
        self.visible_regions.contains(region)
    }
}

/// One entry of a frequency-scheduled batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledItem {
    pub handle: ObjectHandle,
    /// Negative when overdue
    pub frames_till_replicate: i64,
    pub enable_fast_path: bool,
    pub replicates_every_frame: bool,
}

/// Pre-ordered candidates with their own bit budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledBatch {
    pub items: Vec<ScheduledItem>,
    /// On-time items that may be pushed to the next frame
    pub load_balance_quota: i32,
    pub max_bits: i64,
}

/// Output collector for one connection's gather.
#[derive(Debug, Clone, Default)]
pub struct GatheredLists {
    pub default: Vec<ObjectHandle>,
    pub fast_shared: Vec<Vec<ObjectHandle>>,
    pub scheduled: Vec<ScheduledBatch>,
}

impl GatheredLists {
    pub fn clear(&mut self) {
        self.default.clear();
        self.fast_shared.clear();
        self.scheduled.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.default.is_empty() && self.fast_shared.is_empty() && self.scheduled.is_empty()
    }

    /// Total handles gathered across every lane, duplicates included.
    pub fn candidate_count(&self) -> usize {
        self.default.len()
            + self.fast_shared.iter().map(Vec::len).sum::<usize>()
            + self.scheduled.iter().map(|batch| batch.items.len()).sum::<usize>()
    }
}

/// Read-only view handed to nodes during Prepare.
pub struct PrepareContext<'a> {
    pub objects: &'a ObjectInfoMap,
    pub world: &'a dyn ReplicationWorld,
    pub frame: Frame,
}

/// Every kind of interest node.
#[derive(Debug, Clone)]
pub enum InterestNode {
    ActorList(ActorListNode),
    RegionPartitioned(RegionPartitionedNode),
    FrequencyBuckets(FrequencyBucketsNode),
    GridCell(GridCellNode),
    Dormancy(DormancyNode),
    ConnectionDormancy(ConnectionDormancyNode),
    Grid(GridSpatialization2D),
    AlwaysRelevant(AlwaysRelevantNode),
    AlwaysRelevantForConnection(AlwaysRelevantForConnectionNode),
    TearOffForConnection(TearOffForConnectionNode),
    DynamicSpatialFrequency(DynamicSpatialFrequencyNode),
}

impl InterestNode {
    pub fn kind(&self) -> &'static str {
        match self {
            InterestNode::ActorList(_) => "actor_list",
            InterestNode::RegionPartitioned(_) => "region_partitioned",
            InterestNode::FrequencyBuckets(_) => "frequency_buckets",
            InterestNode::GridCell(_) => "grid_cell",
            InterestNode::Dormancy(_) => "dormancy",
            InterestNode::ConnectionDormancy(_) => "connection_dormancy",
            InterestNode::Grid(_) => "grid",
            InterestNode::AlwaysRelevant(_) => "always_relevant",
            InterestNode::AlwaysRelevantForConnection(_) => "always_relevant_for_connection",
            InterestNode::TearOffForConnection(_) => "tear_off_for_connection",
            InterestNode::DynamicSpatialFrequency(_) => "dynamic_spatial_frequency",
        }
    }

    pub fn gather(&mut self, ctx: &mut GatherContext<'_>, out: &mut GatheredLists) {
        match self {
            InterestNode::ActorList(node) => node.gather(&mut out.default),
            InterestNode::RegionPartitioned(node) => node.gather(ctx, &mut out.default),
            InterestNode::FrequencyBuckets(node) => node.gather(ctx, out),
            InterestNode::GridCell(node) => node.gather(ctx, out),
            InterestNode::Dormancy(node) => node.gather(ctx, out),
            InterestNode::ConnectionDormancy(node) => node.gather(ctx, out),
            InterestNode::Grid(node) => node.gather(ctx, out),
            InterestNode::AlwaysRelevant(node) => node.gather(out),
            InterestNode::AlwaysRelevantForConnection(node) => node.gather(ctx, out),
            InterestNode::TearOffForConnection(node) => node.gather(ctx, out),
            InterestNode::DynamicSpatialFrequency(node) => node.gather(ctx, out),
        }
    }

    pub fn add_object(&mut self, object: NodeObject<'_>, verify: bool) {
        let handle = object.handle;
        let region = object.info.region.as_deref();
        match self {
            InterestNode::ActorList(node) => node.add_object(handle, verify),
            InterestNode::RegionPartitioned(node) => node.add_object(handle, region, verify),
            InterestNode::FrequencyBuckets(node) => node.add_object(handle, region, verify),
            InterestNode::GridCell(node) => node.add_object(object, verify),
            InterestNode::Dormancy(node) => node.add_object(handle, region, verify),
            InterestNode::ConnectionDormancy(node) => node.add_object(handle, region, verify),
            InterestNode::Grid(node) => node.add_object(object, verify),
            InterestNode::AlwaysRelevantForConnection(node) => node.add_object(handle, verify),
            InterestNode::DynamicSpatialFrequency(node) => node.add_object(object, verify),
            InterestNode::AlwaysRelevant(_) | InterestNode::TearOffForConnection(_) => {
                warn!("⚠️ {} node does not take explicit adds ({})", self.kind(), object.info.id);
            }
        }
    }

    pub fn remove_object(&mut self, object: NodeObject<'_>) -> bool {
        let handle = object.handle;
        let region = object.info.region.as_deref();
        match self {
            InterestNode::ActorList(node) => node.remove_object(handle),
            InterestNode::RegionPartitioned(node) => node.remove_object(handle, region),
            InterestNode::FrequencyBuckets(node) => node.remove_object(handle, region),
            InterestNode::GridCell(node) => node.remove_object(object),
            InterestNode::Dormancy(node) => node.remove_object(handle, region),
            InterestNode::ConnectionDormancy(node) => node.remove_object(handle, region),
            InterestNode::Grid(node) => node.remove_object(object),
            InterestNode::AlwaysRelevant(node) => node.remove_object(handle),
            InterestNode::AlwaysRelevantForConnection(node) => node.remove_object(handle),
            InterestNode::TearOffForConnection(node) => node.remove_object(handle),
            InterestNode::DynamicSpatialFrequency(node) => node.remove_object(object),
        }
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        match self {
            InterestNode::ActorList(node) => node.contains(handle),
            InterestNode::RegionPartitioned(node) => node.contains(handle),
            InterestNode::FrequencyBuckets(node) => node.contains(handle),
            InterestNode::GridCell(node) => node.contains(handle),
            InterestNode::Dormancy(node) => node.contains(handle),
            InterestNode::ConnectionDormancy(node) => node.contains(handle),
            InterestNode::Grid(node) => node.contains(handle) || node.in_any_cell(handle),
            InterestNode::AlwaysRelevant(node) => node.contains(handle),
            InterestNode::AlwaysRelevantForConnection(node) => node.contains(handle),
            InterestNode::TearOffForConnection(node) => node.contains(handle),
            InterestNode::DynamicSpatialFrequency(node) => node.contains(handle),
        }
    }

    pub fn reset_all(&mut self) {
        match self {
            InterestNode::ActorList(node) => node.reset_all(),
            InterestNode::RegionPartitioned(node) => node.reset_all(),
            InterestNode::FrequencyBuckets(node) => node.reset_all(),
            InterestNode::GridCell(node) => node.reset_all(),
            InterestNode::Dormancy(node) => node.reset_all(),
            InterestNode::ConnectionDormancy(node) => node.reset_all(),
            InterestNode::Grid(node) => node.reset_all(),
            InterestNode::AlwaysRelevant(node) => node.reset_all(),
            InterestNode::AlwaysRelevantForConnection(node) => node.reset_all(),
            InterestNode::TearOffForConnection(node) => node.reset_all(),
            InterestNode::DynamicSpatialFrequency(node) => node.reset_all(),
        }
    }

    pub fn needs_prepare(&self) -> bool {
        matches!(self, InterestNode::Grid(_) | InterestNode::AlwaysRelevant(_))
    }

    /// Runs pre-tick bookkeeping. Returns true when the node rebuilt itself.
    pub fn prepare(&mut self, ctx: &PrepareContext<'_>) -> bool {
        match self {
            InterestNode::Grid(node) => node.prepare(ctx),
            InterestNode::AlwaysRelevant(node) => {
                node.prepare(ctx);
                false
            }
            _ => false,
        }
    }

    pub fn on_dormancy_changed(&mut self, object: NodeObject<'_>, was_dormant: bool, now_dormant: bool) {
        if let InterestNode::Grid(node) = self {
            node.on_dormancy_changed(object, was_dormant, now_dormant);
        }
    }

    pub fn on_dormancy_flush(&mut self, handle: ObjectHandle, region: Option<&str>, verify: bool) {
        match self {
            InterestNode::Grid(node) => node.on_dormancy_flush(handle, region, verify),
            InterestNode::GridCell(node) => node.on_dormancy_flush(handle, region, verify),
            InterestNode::Dormancy(node) => node.on_dormancy_flush(handle, region, verify),
            InterestNode::ConnectionDormancy(node) => {
                if node.contains(handle) || verify {
                    node.notify_flush(handle, region);
                }
            }
            _ => {}
        }
    }

    pub fn on_cull_distance_changed(&mut self, object: NodeObject<'_>) {
        if let InterestNode::Grid(node) = self {
            node.on_cull_distance_changed(object);
        }
    }

    pub fn on_region_visible(&mut self, connection: ConnectionHandle, region: &str) {
        match self {
            InterestNode::Grid(node) => node.on_region_visible(connection, region),
            InterestNode::GridCell(node) => node.on_region_visible(connection, region),
            InterestNode::Dormancy(node) => node.on_region_visible(connection, region),
            InterestNode::ConnectionDormancy(node) => node.on_region_visible(region),
            _ => {}
        }
    }

    /// Drops any per-connection state a global node keeps for `connection`.
    pub fn remove_connection(&mut self, connection: ConnectionHandle) {
        match self {
            InterestNode::Grid(node) => node.remove_connection(connection),
            InterestNode::GridCell(node) => node.remove_connection(connection),
            InterestNode::Dormancy(node) => node.remove_connection(connection),
            _ => {}
        }
    }

    pub fn as_grid(&self) -> Option<&GridSpatialization2D> {
        match self {
            InterestNode::Grid(node) => Some(node),
            _ => None,
        }
    }

    pub fn as_tear_off_mut(&mut self) -> Option<&mut TearOffForConnectionNode> {
        match self {
            InterestNode::TearOffForConnection(node) => Some(node),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::ObjectDescriptor;
    use crate::settings::ClassReplicationSettings;
    use crate::types::NetObjectId;

    #[test]
    fn test_dispatch_add_remove_contains() {
        let mut objects = ObjectInfoMap::new();
        let handle = objects.insert(GlobalReplicationInfo::new(
            &ObjectDescriptor::new(NetObjectId(1), "Crate").in_region("Harbor"),
            ClassReplicationSettings::default(),
        ));
        let info = objects.get(handle).expect("inserted");
        let object = NodeObject { handle, info, initialized: true };

        let mut nodes = vec![
            InterestNode::ActorList(ActorListNode::new()),
            InterestNode::RegionPartitioned(RegionPartitionedNode::new()),
            InterestNode::FrequencyBuckets(FrequencyBucketsNode::new(&Default::default())),
            InterestNode::Dormancy(DormancyNode::new(&Default::default())),
            InterestNode::AlwaysRelevantForConnection(AlwaysRelevantForConnectionNode::new()),
        ];
        for node in &mut nodes {
            node.add_object(object, true);
            assert!(node.contains(handle), "{} should hold the object", node.kind());
            assert!(node.remove_object(object));
            assert!(!node.contains(handle), "{} should be empty", node.kind());
        }
    }

    #[test]
    fn test_only_grid_and_always_relevant_prepare() {
        assert!(InterestNode::AlwaysRelevant(AlwaysRelevantNode::new()).needs_prepare());
        assert!(!InterestNode::ActorList(ActorListNode::new()).needs_prepare());
        assert!(!InterestNode::TearOffForConnection(TearOffForConnectionNode::new()).needs_prepare());
    }
}
