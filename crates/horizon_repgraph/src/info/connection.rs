//! Per-(object, connection) replication metadata.

use super::global::GlobalReplicationInfo;
use crate::types::{ChannelId, Frame, ObjectHandle};
use slotmap::SecondaryMap;

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionReplicationInfo {
    pub channel: Option<ChannelId>,
    pub last_rep_frame: Frame,
    pub next_rep_frame: Frame,
    pub replication_period_frames: u32,
    pub fast_path_last_rep_frame: Frame,
    pub fast_path_next_rep_frame: Frame,
    pub fast_path_period_frames: u32,
    /// Frame at which an idle channel is closed. Only ever raised.
    channel_close_frame: Frame,
    pub dormant_on_connection: bool,
    pub tear_off: bool,
    /// Already collected by a grid dormant-destruction pass this gather
    pub grid_already_dormant: bool,
    cull_distance_squared: f64,
}

impl ConnectionReplicationInfo {
    pub fn new(global: &GlobalReplicationInfo) -> Self {
        Self {
            channel: None,
            last_rep_frame: 0,
            next_rep_frame: 0,
            replication_period_frames: global.settings.replication_period_frames,
            fast_path_last_rep_frame: 0,
            fast_path_next_rep_frame: 0,
            fast_path_period_frames: 1,
            channel_close_frame: 0,
            dormant_on_connection: false,
            tear_off: false,
            grid_already_dormant: false,
            cull_distance_squared: global.cull_distance_squared(),
        }
    }

    pub fn cull_distance_squared(&self) -> f64 {
        self.cull_distance_squared
    }

    pub fn cull_distance(&self) -> f64 {
        self.cull_distance_squared.sqrt()
    }

    pub fn set_cull_distance_squared(&mut self, value: f64) {
        self.cull_distance_squared = value;
    }

    pub fn channel_close_frame(&self) -> Frame {
        self.channel_close_frame
    }

    /// Raises the close frame; never lowers it.
    pub fn raise_channel_close_frame(&mut self, frame: Frame) {
        self.channel_close_frame = self.channel_close_frame.max(frame);
    }

    /// Due on the default lane this frame, or forced since the last send.
    pub fn is_ready(&self, force_update_frame: Frame, frame: Frame) -> bool {
        self.next_rep_frame <= frame || force_update_frame > self.last_rep_frame
    }

    pub fn is_fast_path_ready(&self, force_update_frame: Frame, frame: Frame) -> bool {
        self.fast_path_next_rep_frame <= frame || force_update_frame > self.fast_path_last_rep_frame
    }

    /// Called after the channel closed. Frame bookkeeping restarts while the
    /// dormant flag, cull distance and periods survive.
    pub fn reset_frame_counters(&mut self) {
        self.channel = None;
        self.last_rep_frame = 0;
        self.next_rep_frame = 0;
        self.fast_path_last_rep_frame = 0;
        self.fast_path_next_rep_frame = 0;
        self.channel_close_frame = 0;
        self.tear_off = false;
        self.grid_already_dormant = false;
    }
}

/// A connection's view of every object it has touched.
#[derive(Debug, Default)]
pub struct ConnectionInfoMap {
    infos: SecondaryMap<ObjectHandle, ConnectionReplicationInfo>,
}

impl ConnectionInfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `handle`, creating it from the global info on
    /// first touch. `None` only for a handle from a removed slot.
    pub fn find_or_add(&mut self, handle: ObjectHandle, global: &GlobalReplicationInfo) -> Option<&mut ConnectionReplicationInfo> {
        self.infos
            .entry(handle)
            .map(|entry| entry.or_insert_with(|| ConnectionReplicationInfo::new(global)))
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&ConnectionReplicationInfo> {
        self.infos.get(handle)
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut ConnectionReplicationInfo> {
        self.infos.get_mut(handle)
    }

    pub fn remove(&mut self, handle: ObjectHandle) -> Option<ConnectionReplicationInfo> {
        self.infos.remove(handle)
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.infos.contains_key(handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectHandle, &ConnectionReplicationInfo)> {
        self.infos.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ObjectHandle, &mut ConnectionReplicationInfo)> {
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
    use crate::info::global::{GlobalReplicationInfo, ObjectDescriptor, ObjectInfoMap};
    use crate::settings::ClassReplicationSettings;
    use crate::types::NetObjectId;

    fn sample() -> (ObjectInfoMap, ObjectHandle) {
        let mut objects = ObjectInfoMap::new();
        let settings = ClassReplicationSettings::default().with_cull_distance(100.0).with_period(3);
        let handle = objects.insert(GlobalReplicationInfo::new(&ObjectDescriptor::new(NetObjectId(1), "Crate"), settings));
        (objects, handle)
    }

    #[test]
    fn test_lazy_creation_copies_class_settings() {
        let (objects, handle) = sample();
        let mut map = ConnectionInfoMap::new();
        assert!(map.get(handle).is_none());

        let info = map.find_or_add(handle, objects.get(handle).expect("registered")).expect("live handle");
        assert_eq!(info.cull_distance_squared(), 10_000.0);
        assert_eq!(info.replication_period_frames, 3);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_close_frame_is_monotonic() {
        let (objects, handle) = sample();
        let mut map = ConnectionInfoMap::new();
        let info = map.find_or_add(handle, objects.get(handle).expect("registered")).expect("live handle");
        info.raise_channel_close_frame(20);
        info.raise_channel_close_frame(12);
        assert_eq!(info.channel_close_frame(), 20);
    }

    #[test]
    fn test_reset_keeps_dormancy_and_cull() {
        let (objects, handle) = sample();
        let mut map = ConnectionInfoMap::new();
        let info = map.find_or_add(handle, objects.get(handle).expect("registered")).expect("live handle");
        info.channel = Some(ChannelId(4));
        info.last_rep_frame = 9;
        info.dormant_on_connection = true;
        info.set_cull_distance_squared(0.0);

        info.reset_frame_counters();
        assert!(info.channel.is_none());
        assert_eq!(info.last_rep_frame, 0);
        assert!(info.dormant_on_connection);
        assert_eq!(info.cull_distance_squared(), 0.0);
    }

    #[test]
    fn test_readiness_respects_force_update() {
        let (objects, handle) = sample();
        let mut map = ConnectionInfoMap::new();
        let info = map.find_or_add(handle, objects.get(handle).expect("registered")).expect("live handle");
        info.last_rep_frame = 5;
        info.next_rep_frame = 8;
        assert!(!info.is_ready(0, 6));
        assert!(info.is_ready(6, 6));
        assert!(info.is_ready(0, 8));
    }
}
