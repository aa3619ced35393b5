//! Per-object replication metadata shared by every connection.

use crate::settings::ClassReplicationSettings;
use crate::transport::SharedBunch;
use crate::types::{ConnectionHandle, Frame, NetDormancy, NetObjectId, ObjectHandle, RegionName, Vec3};
use slotmap::SlotMap;
use smallvec::SmallVec;
use std::collections::HashMap;

/// What the application tells the graph about a new object.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDescriptor {
    pub id: NetObjectId,
    pub class: String,
    pub location: Vec3,
    pub dormancy: NetDormancy,
    /// Streamed region the object lives in, `None` for the persistent world
    pub region: Option<RegionName>,
    /// Connection that owns the object, for owner-relevant routing
    pub owner: Option<ConnectionHandle>,
    /// Placed in the level rather than spawned at runtime
    pub net_startup: bool,
}

impl ObjectDescriptor {
    pub fn new(id: NetObjectId, class: impl Into<String>) -> Self {
        Self {
            id,
            class: class.into(),
            location: Vec3::zero(),
            dormancy: NetDormancy::Awake,
            region: None,
            owner: None,
            net_startup: false,
        }
    }

    pub fn at(mut self, location: Vec3) -> Self {
        self.location = location;
        self
    }

    pub fn with_dormancy(mut self, dormancy: NetDormancy) -> Self {
        self.dormancy = dormancy;
        self
    }

    pub fn in_region(mut self, region: impl Into<RegionName>) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn owned_by(mut self, owner: ConnectionHandle) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn net_startup(mut self) -> Self {
        self.net_startup = true;
        self
    }
}

/// Frame-stamped cache of an object's shared fast-path payload.
#[derive(Debug, Clone, Default)]
pub struct FastSharedState {
    pub last_attempt_build_frame: Frame,
    pub last_bunch_build_frame: Frame,
    pub bunch: SharedBunch,
}

#[derive(Debug, Clone)]
pub struct GlobalReplicationInfo {
    pub id: NetObjectId,
    pub class: String,
    pub settings: ClassReplicationSettings,
    pub world_location: Vec3,
    pub region: Option<RegionName>,
    pub owner: Option<ConnectionHandle>,
    pub net_startup: bool,
    pub dormancy: NetDormancy,
    pub wants_dormant: bool,
    /// Placed into interest nodes. Initially dormant level objects wait for their first flush.
    pub routed: bool,
    pub torn_off: bool,
    pub force_update_frame: Frame,
    pub last_pre_replication_frame: Frame,
    pub last_flush_dormancy_frame: Frame,
    /// Objects replicated right after this one
    pub dependents: SmallVec<[ObjectHandle; 4]>,
    /// Objects this one is a dependent of
    pub dependent_of: SmallVec<[ObjectHandle; 2]>,
    pub fast_shared: Option<FastSharedState>,
}

impl GlobalReplicationInfo {
    pub fn new(descriptor: &ObjectDescriptor, settings: ClassReplicationSettings) -> Self {
        let fast_shared = settings.fast_shared.then(FastSharedState::default);
        Self {
            id: descriptor.id,
            class: descriptor.class.clone(),
            world_location: descriptor.location,
            region: descriptor.region.clone(),
            owner: descriptor.owner,
            net_startup: descriptor.net_startup,
            dormancy: descriptor.dormancy,
            wants_dormant: descriptor.dormancy.wants_dormant(),
            routed: false,
            torn_off: false,
            force_update_frame: 0,
            last_pre_replication_frame: 0,
            last_flush_dormancy_frame: 0,
            dependents: SmallVec::new(),
            dependent_of: SmallVec::new(),
            fast_shared,
            settings,
        }
    }

    pub fn cull_distance_squared(&self) -> f64 {
        self.settings.cull_distance_squared()
    }
}

/// Registry of every object known to the graph.
#[derive(Debug, Default)]
pub struct ObjectInfoMap {
    infos: SlotMap<ObjectHandle, GlobalReplicationInfo>,
    by_id: HashMap<NetObjectId, ObjectHandle>,
}

impl ObjectInfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, info: GlobalReplicationInfo) -> ObjectHandle {
        let id = info.id;
        let handle = self.infos.insert(info);
        self.by_id.insert(id, handle);
        handle
    }

    pub fn remove(&mut self, handle: ObjectHandle) -> Option<GlobalReplicationInfo> {
        let info = self.infos.remove(handle)?;
        self.by_id.remove(&info.id);
        Some(info)
    }

    pub fn handle_of(&self, id: NetObjectId) -> Option<ObjectHandle> {
        self.by_id.get(&id).copied()
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&GlobalReplicationInfo> {
        self.infos.get(handle)
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut GlobalReplicationInfo> {
        self.infos.get_mut(handle)
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.infos.contains_key(handle)
    }

    pub fn id_of(&self, handle: ObjectHandle) -> Option<NetObjectId> {
        self.infos.get(handle).map(|info| info.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectHandle, &GlobalReplicationInfo)> {
        self.infos.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ObjectHandle, &mut GlobalReplicationInfo)> {
        self.infos.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_lookup_by_id() {
        let mut map = ObjectInfoMap::new();
        let descriptor = ObjectDescriptor::new(NetObjectId(7), "Pawn").with_dormancy(NetDormancy::DormantAll);
        let handle = map.insert(GlobalReplicationInfo::new(&descriptor, ClassReplicationSettings::default()));

        assert_eq!(map.handle_of(NetObjectId(7)), Some(handle));
        let info = map.get(handle).expect("inserted");
        assert!(info.wants_dormant);
        assert!(info.fast_shared.is_none());

        map.remove(handle);
        assert!(map.handle_of(NetObjectId(7)).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_fast_shared_state_follows_class() {
        let settings = ClassReplicationSettings::default().with_fast_shared(true);
        let info = GlobalReplicationInfo::new(&ObjectDescriptor::new(NetObjectId(1), "Pawn"), settings);
        assert!(info.fast_shared.is_some());
    }
}
