//! Dormancy nodes.
//!
//! A [`DormancyNode`] holds the master list of objects that want to be
//! dormant. The first time a connection gathers from it, the master list is
//! copied into a [`ConnectionDormancyNode`] owned by that connection. The copy
//! then shrinks as the connection sees each object go dormant, and grows back
//! when an object flushes.

use super::actor_list::{RegionLists, RepList};
use super::{GatherContext, GatheredLists};
use crate::config::DormancyConfig;
use crate::types::{ConnectionHandle, ObjectHandle};
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// One connection's working copy of a dormancy node.
#[derive(Debug, Clone)]
pub struct ConnectionDormancyNode {
    persistent: RepList,
    regions: RegionLists,
    /// Objects dropped from a region list, kept until the region is reloaded
    removed_regions: RegionLists,
    trickle_start_counter: u32,
    trickle_enabled: bool,
}

impl ConnectionDormancyNode {
    fn copy_of(persistent: &RepList, regions: &RegionLists, config: &DormancyConfig) -> Self {
        Self {
            persistent: persistent.clone(),
            regions: regions.clone(),
            removed_regions: RegionLists::default(),
            trickle_start_counter: config.trickle_start_counter,
            trickle_enabled: config.trickle_enabled,
        }
    }

    pub fn add_object(&mut self, handle: ObjectHandle, region: Option<&str>, verify: bool) {
        match region {
            Some(region) => {
                self.regions.add(region, handle, verify);
            }
            None => {
                self.persistent.add(handle, verify);
            }
        }
    }

    /// Removes from the active lists, falling back to the removed lists.
    pub fn remove_object(&mut self, handle: ObjectHandle, region: Option<&str>) -> bool {
        let removed = match region {
            Some(region) => self.regions.remove(Some(region), handle),
            None => self.persistent.remove(handle),
        };
        removed || self.removed_regions.remove(region, handle)
    }

    /// Puts a flushed object back on this connection's lists.
    pub fn notify_flush(&mut self, handle: ObjectHandle, region: Option<&str>) {
        match region {
            None => {
                self.persistent.add_unique(handle);
            }
            Some(region) => {
                self.regions.add_unique(region, handle);
                if let Some(removed) = self.removed_regions.get_mut(region) {
                    removed.remove(handle);
                }
            }
        }
    }

    /// The client loaded `region` again; everything dropped from it is back in play.
    pub fn on_region_visible(&mut self, region: &str) {
        let Some(removed) = self.removed_regions.get_mut(region) else {
            return;
        };
        let mut restored = std::mem::take(removed);
        if !restored.is_empty() {
            debug!("💤 Restoring {} dormant objects for region {}", restored.len(), region);
        }
        self.regions.entry(region).append(&mut restored);
    }

    pub fn reset_all(&mut self) {
        self.persistent.clear();
        self.regions.clear();
        self.removed_regions.clear();
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.persistent.contains(handle) || self.regions.contains(handle)
    }

    pub fn len(&self) -> usize {
        self.persistent.len() + self.regions.total_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn gather(&mut self, ctx: &mut GatherContext<'_>, out: &mut GatheredLists) {
        let trickle_enabled = self.trickle_enabled;
        let counter = &mut self.trickle_start_counter;
        filter_dormant(&mut self.persistent, None, ctx, out, trickle_enabled, counter);

        self.regions.prune_empty();
        for (region, list) in self.regions.iter_mut() {
            if !ctx.is_region_visible(region) {
                trace!("Region {} not loaded by {:?}", region, ctx.connection);
                continue;
            }
            let removed = self.removed_regions.entry(region);
            filter_dormant(list, Some(removed), ctx, out, trickle_enabled, counter);
        }
    }
}

/// Drops objects already dormant on the connection and emits the rest.
///
/// Once the start counter has run out, one still-awake object per list has
/// its cull distance zeroed so it replicates from any range.
fn filter_dormant(
    list: &mut RepList,
    mut removed: Option<&mut RepList>,
    ctx: &mut GatherContext<'_>,
    out: &mut GatheredLists,
    trickle_enabled: bool,
    trickle_start_counter: &mut u32,
) {
    let mut should_trickle = *trickle_start_counter == 0;

    for index in (0..list.len()).rev() {
        let Some(handle) = list.get(index) else {
            continue;
        };
        let Some(global) = ctx.objects.get(handle) else {
            continue;
        };
        let Some(info) = ctx.infos.find_or_add(handle, global) else {
            continue;
        };

        if info.dormant_on_connection {
            if info.cull_distance_squared() <= 0.0 {
                info.set_cull_distance_squared(global.cull_distance_squared());
            }
            list.swap_remove_at(index);
            if let Some(removed) = removed.as_deref_mut() {
                removed.add(handle, false);
            }
            trace!("💤 {} dormant on {:?}, dropped from mirror ({} left)", global.id, ctx.connection, list.len());
            should_trickle = false;
        } else if trickle_enabled && should_trickle {
            info.set_cull_distance_squared(0.0);
            should_trickle = false;
        }
    }

    if !list.is_empty() {
        out.default.extend(list.iter());
        *trickle_start_counter = trickle_start_counter.saturating_sub(1);
    }
}

/// Master list of dormancy-intent objects plus per-connection mirrors.
#[derive(Debug, Clone)]
pub struct DormancyNode {
    persistent: RepList,
    regions: RegionLists,
    connections: HashMap<ConnectionHandle, ConnectionDormancyNode>,
    config: DormancyConfig,
}

impl DormancyNode {
    pub fn new(config: &DormancyConfig) -> Self {
        Self {
            persistent: RepList::new(),
            regions: RegionLists::default(),
            connections: HashMap::new(),
            config: config.clone(),
        }
    }

    pub fn add_object(&mut self, handle: ObjectHandle, region: Option<&str>, verify: bool) {
        match region {
            Some(region) => {
                self.regions.add(region, handle, verify);
            }
            None => {
                self.persistent.add(handle, verify);
            }
        }
        for mirror in self.connections.values_mut() {
            mirror.add_object(handle, region, verify);
        }
    }

    pub fn remove_object(&mut self, handle: ObjectHandle, region: Option<&str>) -> bool {
        let removed = match region {
            Some(region) => self.regions.remove(Some(region), handle),
            None => self.persistent.remove(handle),
        };
        for mirror in self.connections.values_mut() {
            mirror.remove_object(handle, region);
        }
        removed
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.persistent.contains(handle) || self.regions.contains(handle)
    }

    pub fn len(&self) -> usize {
        self.persistent.len() + self.regions.total_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-adds a flushed object to every connection mirror.
    pub fn on_dormancy_flush(&mut self, handle: ObjectHandle, region: Option<&str>, verify: bool) {
        if !self.contains(handle) {
            if verify {
                warn!("⚠️ Dormancy flush for {:?} which is not in this dormancy node", handle);
            }
            return;
        }
        if !self.connections.is_empty() {
            trace!("💤 Flush of {:?} refreshes {} connection mirrors", handle, self.connections.len());
        }
        for mirror in self.connections.values_mut() {
            mirror.notify_flush(handle, region);
        }
    }

    pub fn on_region_visible(&mut self, connection: ConnectionHandle, region: &str) {
        if let Some(mirror) = self.connections.get_mut(&connection) {
            mirror.on_region_visible(region);
        }
    }

    pub fn remove_connection(&mut self, connection: ConnectionHandle) {
        self.connections.remove(&connection);
    }

    pub fn existing_connection_node(&mut self, connection: ConnectionHandle) -> Option<&mut ConnectionDormancyNode> {
        self.connections.get_mut(&connection)
    }

    pub fn has_connection_node(&self, connection: ConnectionHandle) -> bool {
        self.connections.contains_key(&connection)
    }

    pub fn reset_all(&mut self) {
        self.persistent.clear();
        self.regions.clear();
        for mirror in self.connections.values_mut() {
            mirror.reset_all();
        }
    }

    pub fn gather(&mut self, ctx: &mut GatherContext<'_>, out: &mut GatheredLists) {
        if let Some(max_z) = self.config.max_z {
            if ctx.viewers.iter().all(|viewer| viewer.location.z > max_z) {
                return;
            }
        }

        let persistent = &self.persistent;
        let regions = &self.regions;
        let config = &self.config;
        let mirror = self.connections.entry(ctx.connection).or_insert_with(|| {
            debug!("💤 First gather for {:?}, mirroring {} dormancy objects", ctx.connection, persistent.len() + regions.total_len());
            ConnectionDormancyNode::copy_of(persistent, regions, config)
        });
        mirror.gather(ctx, out);
    }

    /// Collects master-list objects that are dormant on the gathering
    /// connection and were not placed at level load.
    ///
    /// Objects present in `skip` are ignored. With `enforce_unique` each
    /// object is collected once per connection until its marker is cleared.
    pub fn collect_dormant_dynamic(
        &self,
        ctx: &mut GatherContext<'_>,
        out: &mut RepList,
        skip: Option<&RepList>,
        enforce_unique: bool,
    ) {
        for handle in self.persistent.iter() {
            let Some(global) = ctx.objects.get(handle) else {
                continue;
            };
            if global.net_startup {
                continue;
            }
            let Some(info) = ctx.infos.get_mut(handle) else {
                continue;
            };
            if !info.dormant_on_connection {
                continue;
            }
            if skip.is_some_and(|skip| skip.contains(handle)) {
                continue;
            }
            if enforce_unique {
                if info.grid_already_dormant {
                    continue;
                }
                info.grid_already_dormant = true;
            }
            out.add_unique(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn handles(n: usize) -> Vec<ObjectHandle> {
        let mut map: SlotMap<ObjectHandle, ()> = SlotMap::with_key();
        (0..n).map(|_| map.insert(())).collect()
    }

    fn connection() -> ConnectionHandle {
        let mut map: SlotMap<ConnectionHandle, ()> = SlotMap::with_key();
        map.insert(())
    }

    #[test]
    fn test_flush_readds_once_and_clears_removed() {
        let h = handles(1);
        let mut node = ConnectionDormancyNode::copy_of(&RepList::new(), &RegionLists::default(), &DormancyConfig::default());
        node.removed_regions.add("Harbor", h[0], false);

        node.notify_flush(h[0], Some("Harbor"));
        node.notify_flush(h[0], Some("Harbor"));
        assert_eq!(node.len(), 1);
        assert!(node.removed_regions.get("Harbor").is_some_and(RepList::is_empty));
    }

    #[test]
    fn test_region_visible_moves_removed_back() {
        let h = handles(2);
        let mut node = ConnectionDormancyNode::copy_of(&RepList::new(), &RegionLists::default(), &DormancyConfig::default());
        node.removed_regions.add("Harbor", h[0], false);
        node.removed_regions.add("Harbor", h[1], false);

        node.on_region_visible("Harbor");
        assert_eq!(node.len(), 2);
        assert!(node.remove_object(h[0], Some("Harbor")));
        assert!(!node.contains(h[0]));
    }

    #[test]
    fn test_master_changes_propagate_to_mirrors() {
        let h = handles(2);
        let conn = connection();
        let mut node = DormancyNode::new(&DormancyConfig::default());
        node.add_object(h[0], None, true);
        node.connections.insert(
            conn,
            ConnectionDormancyNode::copy_of(&node.persistent, &node.regions, &node.config),
        );

        node.add_object(h[1], None, true);
        assert_eq!(node.existing_connection_node(conn).map(|m| m.len()), Some(2));

        node.remove_object(h[0], None);
        assert_eq!(node.existing_connection_node(conn).map(|m| m.len()), Some(1));

        node.remove_connection(conn);
        assert!(!node.has_connection_node(conn));
    }

    #[test]
    fn test_flush_ignores_unknown_objects() {
        let h = handles(1);
        let conn = connection();
        let mut node = DormancyNode::new(&DormancyConfig::default());
        node.connections.insert(
            conn,
            ConnectionDormancyNode::copy_of(&RepList::new(), &RegionLists::default(), &DormancyConfig::default()),
        );
        node.on_dormancy_flush(h[0], None, false);
        assert_eq!(node.existing_connection_node(conn).map(|m| m.len()), Some(0));
    }
}
