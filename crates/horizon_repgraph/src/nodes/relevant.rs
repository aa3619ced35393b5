//! Always-relevant and tear-off nodes.

use super::actor_list::RepList;
use super::{GatherContext, GatheredLists, PrepareContext};
use crate::types::{Frame, NetObjectId, ObjectHandle};
use tracing::{debug, trace, warn};

/// Offers every registered object of a set of classes to every connection.
///
/// The list is rebuilt from the object map during Prepare, so objects join
/// and leave without explicit routing.
#[derive(Debug, Clone, Default)]
pub struct AlwaysRelevantNode {
    classes: Vec<String>,
    list: RepList,
}

impl AlwaysRelevantNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_classes<I, S>(classes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut node = Self::new();
        for class in classes {
            node.add_class(class);
        }
        node
    }

    pub fn add_class(&mut self, class: impl Into<String>) {
        let class = class.into();
        if self.classes.contains(&class) {
            warn!("⚠️ Always-relevant class {} added twice", class);
            return;
        }
        self.classes.push(class);
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn prepare(&mut self, ctx: &PrepareContext<'_>) {
        self.list.clear();
        for (handle, info) in ctx.objects.iter() {
            if info.routed && !info.torn_off && self.classes.iter().any(|class| *class == info.class) {
                self.list.add(handle, false);
            }
        }
    }

    pub fn gather(&self, out: &mut GatheredLists) {
        out.default.extend(self.list.iter());
    }

    pub fn remove_object(&mut self, handle: ObjectHandle) -> bool {
        self.list.remove(handle)
    }

    pub fn reset_all(&mut self) {
        self.list.clear();
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.list.contains(handle)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PastRelevant {
    viewer: Option<NetObjectId>,
    view_target: Option<NetObjectId>,
}

/// Objects relevant to one connection only: those it owns plus its
/// viewers' pawns and camera targets.
///
/// A pawn or camera target becoming current has its cull distance zeroed on
/// the connection; the one it replaced gets its class cull distance back.
#[derive(Debug, Clone, Default)]
pub struct AlwaysRelevantForConnectionNode {
    owned: RepList,
    current: RepList,
    past: Vec<PastRelevant>,
}

impl AlwaysRelevantForConnectionNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_object(&mut self, handle: ObjectHandle, verify: bool) {
        self.owned.add(handle, verify);
    }

    pub fn remove_object(&mut self, handle: ObjectHandle) -> bool {
        let owned = self.owned.remove(handle);
        let current = self.current.remove(handle);
        owned || current
    }

    pub fn reset_all(&mut self) {
        self.owned.clear();
        self.current.clear();
        self.past.clear();
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.owned.contains(handle) || self.current.contains(handle)
    }

    pub fn gather(&mut self, ctx: &mut GatherContext<'_>, out: &mut GatheredLists) {
        out.default.extend(self.owned.iter());

        self.current.clear();
        let viewers = ctx.viewers;
        if self.past.len() < viewers.len() {
            self.past.resize(viewers.len(), PastRelevant::default());
        }
        self.past.truncate(viewers.len());

        for (viewer, past) in viewers.iter().zip(self.past.iter_mut()) {
            update_relevant(ctx, &mut self.current, viewer.viewer, &mut past.viewer);
            update_relevant(ctx, &mut self.current, viewer.view_target, &mut past.view_target);
        }

        out.default.extend(self.current.iter());
    }
}

fn update_relevant(
    ctx: &mut GatherContext<'_>,
    current: &mut RepList,
    new: Option<NetObjectId>,
    last: &mut Option<NetObjectId>,
) {
    if new != *last {
        if let Some(handle) = new.and_then(|id| ctx.objects.handle_of(id)) {
            if let Some(global) = ctx.objects.get(handle) {
                if let Some(info) = ctx.infos.find_or_add(handle, global) {
                    info.set_cull_distance_squared(0.0);
                }
            }
        }
        if let Some(handle) = last.and_then(|id| ctx.objects.handle_of(id)) {
            if let Some(global) = ctx.objects.get(handle) {
                if let Some(info) = ctx.infos.find_or_add(handle, global) {
                    info.set_cull_distance_squared(global.cull_distance_squared());
                }
            }
        }
        trace!("Viewer relevance on {:?} changed {:?} -> {:?}", ctx.connection, last, new);
        *last = new;
    }

    if let Some(handle) = new.and_then(|id| ctx.objects.handle_of(id)) {
        current.add_unique(handle);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TearOffEntry {
    handle: ObjectHandle,
    tear_off_frame: Frame,
    has_repped_once: bool,
}

/// Holds torn-off objects for one connection until each has been sent once.
#[derive(Debug, Clone, Default)]
pub struct TearOffForConnectionNode {
    entries: Vec<TearOffEntry>,
}

impl TearOffForConnectionNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// `tear_off_frame` is the object's last replication frame on this
    /// connection when it was torn off.
    pub fn notify_tear_off(&mut self, handle: ObjectHandle, tear_off_frame: Frame) {
        debug!("🪓 {:?} torn off at frame {}", handle, tear_off_frame);
        self.entries.push(TearOffEntry {
            handle,
            tear_off_frame,
            has_repped_once: false,
        });
    }

    pub fn remove_object(&mut self, handle: ObjectHandle) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.handle != handle);
        before != self.entries.len()
    }

    pub fn reset_all(&mut self) {
        self.entries.clear();
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.entries.iter().any(|entry| entry.handle == handle)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn gather(&mut self, ctx: &mut GatherContext<'_>, out: &mut GatheredLists) {
        let mut index = self.entries.len();
        while index > 0 {
            index -= 1;
            let entry = &mut self.entries[index];
            let keep = ctx.objects.contains(entry.handle)
                && ctx.infos.get(entry.handle).is_some_and(|info| {
                    // A cleared info after a send means the close was acked.
                    info.last_rep_frame <= entry.tear_off_frame
                        && !(info.last_rep_frame == 0 && entry.has_repped_once)
                });

            if keep {
                out.default.push(entry.handle);
                entry.has_repped_once = true;
            } else {
                trace!("Tear-off of {:?} complete on {:?}", entry.handle, ctx.connection);
                self.entries.swap_remove(index);
            }
        }
    }
}
