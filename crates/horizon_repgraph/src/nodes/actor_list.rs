//! Plain and region-partitioned object lists.
//!
//! [`RepList`] is the membership primitive every other node builds on.

use super::GatherContext;
use crate::types::{ObjectHandle, RegionName};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

/// An ordered list of object handles.
///
/// Membership is unique when verification is on. Outside verification a
/// duplicate add is logged and accepted, and remove drops every copy so
/// nothing is left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepList {
    items: Vec<ObjectHandle>,
}

impl RepList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handle`. With `verify` set a duplicate is reported and
    /// skipped; returns whether the handle was appended.
    pub fn add(&mut self, handle: ObjectHandle, verify: bool) -> bool {
        if self.items.contains(&handle) {
            if verify {
                warn!("⚠️ Duplicate list membership for {:?}, skipping add", handle);
                return false;
            }
            debug!("Duplicate list membership for {:?}, keeping both entries", handle);
        }
        self.items.push(handle);
        true
    }

    /// Appends unless already present. Used where re-adds are expected.
    pub fn add_unique(&mut self, handle: ObjectHandle) -> bool {
        if self.items.iter().rev().any(|h| *h == handle) {
            return false;
        }
        self.items.push(handle);
        true
    }

    /// Removes every occurrence of `handle`; returns whether any was found.
    pub fn remove(&mut self, handle: ObjectHandle) -> bool {
        let before = self.items.len();
        self.items.retain(|h| *h != handle);
        before != self.items.len()
    }

    pub fn swap_remove_at(&mut self, index: usize) -> ObjectHandle {
        self.items.swap_remove(index)
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.items.contains(&handle)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn append(&mut self, other: &mut RepList) {
        self.items.append(&mut other.items);
    }

    pub fn as_slice(&self) -> &[ObjectHandle] {
        &self.items
    }

    pub fn iter(&self) -> impl Iterator<Item = ObjectHandle> + '_ {
        self.items.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<ObjectHandle> {
        self.items.get(index).copied()
    }
}

impl From<Vec<ObjectHandle>> for RepList {
    fn from(items: Vec<ObjectHandle>) -> Self {
        Self { items }
    }
}

/// Region name to list. Ordered so gathers are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionLists {
    lists: BTreeMap<RegionName, RepList>,
}

impl RegionLists {
    pub fn add(&mut self, region: &str, handle: ObjectHandle, verify: bool) -> bool {
        self.lists.entry(region.to_string()).or_default().add(handle, verify)
    }

    pub fn add_unique(&mut self, region: &str, handle: ObjectHandle) -> bool {
        self.lists.entry(region.to_string()).or_default().add_unique(handle)
    }

    /// Removes `handle` from one region, or from all of them when `region` is `None`.
    pub fn remove(&mut self, region: Option<&str>, handle: ObjectHandle) -> bool {
        match region {
            Some(region) => self.lists.get_mut(region).is_some_and(|list| list.remove(handle)),
            None => self.lists.values_mut().fold(false, |found, list| list.remove(handle) || found),
        }
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.lists.values().any(|list| list.contains(handle))
    }

    pub fn get(&self, region: &str) -> Option<&RepList> {
        self.lists.get(region)
    }

    pub fn get_mut(&mut self, region: &str) -> Option<&mut RepList> {
        self.lists.get_mut(region)
    }

    pub fn entry(&mut self, region: &str) -> &mut RepList {
        self.lists.entry(region.to_string()).or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RegionName, &RepList)> {
        self.lists.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&RegionName, &mut RepList)> {
        self.lists.iter_mut()
    }

    /// Drops regions whose lists are empty.
    pub fn prune_empty(&mut self) {
        self.lists.retain(|_, list| !list.is_empty());
    }

    pub fn clear(&mut self) {
        self.lists.clear();
    }

    pub fn total_len(&self) -> usize {
        self.lists.values().map(RepList::len).sum()
    }
}

/// A flat candidate list offered to every connection.
#[derive(Debug, Clone, Default)]
pub struct ActorListNode {
    pub list: RepList,
}

impl ActorListNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&mut self, handle: ObjectHandle, verify: bool) {
        self.list.add(handle, verify);
    }

    pub fn remove_object(&mut self, handle: ObjectHandle) -> bool {
        self.list.remove(handle)
    }

    pub fn gather(&self, out: &mut Vec<ObjectHandle>) {
        out.extend(self.list.iter());
    }

    pub fn reset_all(&mut self) {
        self.list.clear();
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.list.contains(handle)
    }
}

/// A persistent list plus per-region lists that are only offered to
/// connections reporting the region as visible.
#[derive(Debug, Clone, Default)]
pub struct RegionPartitionedNode {
    pub persistent: RepList,
    pub regions: RegionLists,
}

impl RegionPartitionedNode {
    pub fn new() -> Self {
        Self::default()
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

    pub fn remove_object(&mut self, handle: ObjectHandle, region: Option<&str>) -> bool {
        match region {
            Some(region) => self.regions.remove(Some(region), handle),
            None => self.persistent.remove(handle),
        }
    }

    pub fn gather(&self, ctx: &GatherContext<'_>, out: &mut Vec<ObjectHandle>) {
        out.extend(self.persistent.iter());
        for (region, list) in self.regions.iter() {
            if ctx.is_region_visible(region) {
                out.extend(list.iter());
            } else {
                trace!("Region {} not visible to {:?}, skipping {} objects", region, ctx.connection, list.len());
            }
        }
    }

    pub fn reset_all(&mut self) {
        self.persistent.clear();
        self.regions.clear();
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
}
