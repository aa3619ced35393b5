//! 2D spatial grid.
//!
//! World XY is mapped onto square cells by subtracting the spatial bias and
//! dividing by the cell size. An object occupies every cell whose square
//! intersects the open square `(pos - cull, pos + cull)` around it, so a
//! viewer standing in any of those cells receives it as a candidate.
//!
//! Static objects are placed once. Dynamic objects have their cell rectangle
//! recomputed every Prepare and only the cells entering or leaving the
//! rectangle are touched. An object moving below the bias (with no fixed
//! bounds) moves the bias and rebuilds every cell on the next Prepare.

use super::actor_list::{RegionPartitionedNode, RepList};
use super::buckets::FrequencyBucketsNode;
use super::dormancy::DormancyNode;
use super::{GatherContext, GatheredLists, NodeObject, PrepareContext};
use crate::config::{DormancyConfig, FrequencyBucketsConfig, GridConfig};
use crate::info::GlobalReplicationInfo;
use crate::settings::{RoutingPolicy, SpatialMode};
use crate::types::{ConnectionHandle, ObjectHandle, Vec3};
use slotmap::SecondaryMap;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

/// Inclusive range of cell indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRect {
    pub start_x: usize,
    pub start_y: usize,
    pub end_x: usize,
    pub end_y: usize,
}

impl CellRect {
    pub fn contains(&self, x: usize, y: usize) -> bool {
        x >= self.start_x && x <= self.end_x && y >= self.start_y && y <= self.end_y
    }

    pub fn intersects(&self, other: &CellRect) -> bool {
        !(other.start_x > self.end_x
            || other.end_x < self.start_x
            || other.start_y > self.end_y
            || other.end_y < self.start_y)
    }

    pub fn cells(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (self.start_x..=self.end_x).flat_map(move |x| (self.start_y..=self.end_y).map(move |y| (x, y)))
    }

    pub fn cell_count(&self) -> usize {
        (self.end_x - self.start_x + 1) * (self.end_y - self.start_y + 1)
    }
}

/// Configuration handed to every cell for its lazily created children.
#[derive(Debug, Clone, Default)]
pub struct CellSettings {
    pub buckets: FrequencyBucketsConfig,
    pub dormancy: DormancyConfig,
}

/// One grid cell: a static list, a dormancy node for dormant statics and a
/// frequency-bucket node for moving objects. Children are created on first use.
#[derive(Debug, Clone)]
pub struct GridCellNode {
    static_list: RegionPartitionedNode,
    dormancy: Option<DormancyNode>,
    dynamic: Option<FrequencyBucketsNode>,
    settings: Arc<CellSettings>,
}

impl GridCellNode {
    pub fn new(settings: Arc<CellSettings>) -> Self {
        Self {
            static_list: RegionPartitionedNode::new(),
            dormancy: None,
            dynamic: None,
            settings,
        }
    }

    fn dormancy_node(&mut self) -> &mut DormancyNode {
        let settings = &self.settings;
        self.dormancy.get_or_insert_with(|| DormancyNode::new(&settings.dormancy))
    }

    fn dynamic_node(&mut self) -> &mut FrequencyBucketsNode {
        let settings = &self.settings;
        self.dynamic.get_or_insert_with(|| FrequencyBucketsNode::new(&settings.buckets))
    }

    pub fn dormancy(&self) -> Option<&DormancyNode> {
        self.dormancy.as_ref()
    }

    pub fn dormancy_mut(&mut self) -> Option<&mut DormancyNode> {
        self.dormancy.as_mut()
    }

    /// Places a non-moving object: dormant ones go to the dormancy node.
    pub fn add_static(&mut self, handle: ObjectHandle, region: Option<&str>, wants_dormant: bool, verify: bool) {
        if wants_dormant {
            self.dormancy_node().add_object(handle, region, verify);
        } else {
            self.static_list.add_object(handle, region, verify);
        }
    }

    pub fn remove_static(&mut self, handle: ObjectHandle, region: Option<&str>) -> bool {
        let from_list = self.static_list.remove_object(handle, region);
        let from_dormancy = self.dormancy.as_mut().is_some_and(|node| node.remove_object(handle, region));
        from_list || from_dormancy
    }

    pub fn add_dynamic(&mut self, handle: ObjectHandle, region: Option<&str>, verify: bool) {
        self.dynamic_node().add_object(handle, region, verify);
    }

    pub fn remove_dynamic(&mut self, handle: ObjectHandle, region: Option<&str>) -> bool {
        self.dynamic.as_mut().is_some_and(|node| node.remove_object(handle, region))
    }

    /// Moves a static object between the static list and the dormancy node.
    pub fn on_static_dormancy_changed(&mut self, handle: ObjectHandle, region: Option<&str>, was_dormant: bool, now_dormant: bool) {
        if was_dormant && !now_dormant {
            if let Some(node) = self.dormancy.as_mut() {
                node.remove_object(handle, region);
            }
            self.static_list.add_object(handle, region, false);
        } else if now_dormant && !was_dormant {
            self.static_list.remove_object(handle, region);
            self.dormancy_node().add_object(handle, region, false);
        }
    }

    /// Standalone use: dormancy intent picks the dormancy or the dynamic child.
    pub fn add_object(&mut self, object: NodeObject<'_>, verify: bool) {
        let region = object.info.region.as_deref();
        if object.info.wants_dormant {
            self.dormancy_node().add_object(object.handle, region, verify);
        } else {
            self.add_dynamic(object.handle, region, verify);
        }
    }

    pub fn remove_object(&mut self, object: NodeObject<'_>) -> bool {
        let region = object.info.region.as_deref();
        let from_static = self.remove_static(object.handle, region);
        let from_dynamic = self.remove_dynamic(object.handle, region);
        from_static || from_dynamic
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.static_list.contains(handle)
            || self.dormancy.as_ref().is_some_and(|node| node.contains(handle))
            || self.dynamic.as_ref().is_some_and(|node| node.contains(handle))
    }

    pub fn is_empty(&self) -> bool {
        self.static_list.is_empty()
            && self.dormancy.as_ref().map_or(true, DormancyNode::is_empty)
            && self.dynamic.as_ref().map_or(true, FrequencyBucketsNode::is_empty)
    }

    pub fn reset_all(&mut self) {
        self.static_list.reset_all();
        if let Some(node) = self.dormancy.as_mut() {
            node.reset_all();
        }
        if let Some(node) = self.dynamic.as_mut() {
            node.reset_all();
        }
    }

    pub fn on_dormancy_flush(&mut self, handle: ObjectHandle, region: Option<&str>, verify: bool) {
        if let Some(node) = self.dormancy.as_mut() {
            node.on_dormancy_flush(handle, region, verify);
        }
    }

    pub fn on_region_visible(&mut self, connection: ConnectionHandle, region: &str) {
        if let Some(node) = self.dormancy.as_mut() {
            node.on_region_visible(connection, region);
        }
    }

    pub fn remove_connection(&mut self, connection: ConnectionHandle) {
        if let Some(node) = self.dormancy.as_mut() {
            node.remove_connection(connection);
        }
    }

    pub fn gather(&mut self, ctx: &mut GatherContext<'_>, out: &mut GatheredLists) {
        self.static_list.gather(ctx, &mut out.default);
        if let Some(node) = self.dynamic.as_ref() {
            node.gather(ctx, out);
        }
        if let Some(node) = self.dormancy.as_mut() {
            node.gather(ctx, out);
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct StaticEntry {
    /// `None` while a rebuild is pending
    rect: Option<CellRect>,
    dormancy_driven: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct DynamicEntry {
    /// `None` until the first Prepare places the object
    rect: Option<CellRect>,
}

/// The spatial grid node.
#[derive(Debug, Clone)]
pub struct GridSpatialization2D {
    config: GridConfig,
    cell_settings: Arc<CellSettings>,
    spatial_bias: (f64, f64),
    cells: Vec<Vec<Option<GridCellNode>>>,
    statics: SecondaryMap<ObjectHandle, StaticEntry>,
    dynamics: SecondaryMap<ObjectHandle, DynamicEntry>,
    pending_statics: Vec<(ObjectHandle, bool)>,
    needs_rebuild: bool,
    rebuild_count: u64,
}

impl GridSpatialization2D {
    pub fn new(config: &GridConfig, buckets: &FrequencyBucketsConfig, dormancy: &DormancyConfig) -> Self {
        let spatial_bias = match config.bounds {
            Some(bounds) => (bounds.min_x, bounds.min_y),
            None => config.spatial_bias,
        };
        Self {
            config: config.clone(),
            cell_settings: Arc::new(CellSettings {
                buckets: buckets.clone(),
                dormancy: dormancy.clone(),
            }),
            spatial_bias,
            cells: Vec::new(),
            statics: SecondaryMap::new(),
            dynamics: SecondaryMap::new(),
            pending_statics: Vec::new(),
            needs_rebuild: false,
            rebuild_count: 0,
        }
    }

    pub fn spatial_bias(&self) -> (f64, f64) {
        self.spatial_bias
    }

    pub fn cell_size(&self) -> f64 {
        self.config.cell_size
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild
    }

    pub fn rebuild_count(&self) -> u64 {
        self.rebuild_count
    }

    pub fn cell(&self, x: usize, y: usize) -> Option<&GridCellNode> {
        self.cells.get(x).and_then(|column| column.get(y)).and_then(Option::as_ref)
    }

    fn cell_mut(&mut self, x: usize, y: usize) -> Option<&mut GridCellNode> {
        self.cells.get_mut(x).and_then(|column| column.get_mut(y)).and_then(Option::as_mut)
    }

    fn cell_or_create(&mut self, x: usize, y: usize) -> &mut GridCellNode {
        if self.cells.len() <= x {
            self.cells.resize_with(x + 1, Vec::new);
        }
        let column = &mut self.cells[x];
        if column.len() <= y {
            column.resize_with(y + 1, || None);
        }
        let settings = &self.cell_settings;
        column[y].get_or_insert_with(|| GridCellNode::new(Arc::clone(settings)))
    }

    /// Cells an object at `location` with cull distance `cull` occupies.
    pub fn cell_rect(&self, location: Vec3, cull: f64) -> CellRect {
        let cell = self.config.cell_size;
        let bx = location.x - self.spatial_bias.0;
        let by = location.y - self.spatial_bias.1;
        let (min_x, min_y) = (bx - cull, by - cull);
        let (mut max_x, mut max_y) = (bx + cull, by + cull);
        if let Some(bounds) = self.config.bounds {
            max_x = max_x.min(bounds.max_x - bounds.min_x);
            max_y = max_y.min(bounds.max_y - bounds.min_y);
        }

        let start_x = (min_x / cell).floor().max(0.0) as usize;
        let start_y = (min_y / cell).floor().max(0.0) as usize;
        let end_x = ((max_x / cell).ceil() - 1.0).max(start_x as f64) as usize;
        let end_y = ((max_y / cell).ceil() - 1.0).max(start_y as f64) as usize;
        CellRect { start_x, start_y, end_x, end_y }
    }

    /// The cell a viewer stands in.
    pub fn viewer_cell(&self, location: Vec3) -> (usize, usize) {
        let cell = self.config.cell_size;
        let (mut x, mut y) = (location.x, location.y);
        let mut limit = (usize::MAX, usize::MAX);
        if let Some(bounds) = self.config.bounds {
            x = x.clamp(bounds.min_x, bounds.max_x);
            y = y.clamp(bounds.min_y, bounds.max_y);
            limit = (
                (((bounds.max_x - bounds.min_x) / cell).ceil() as usize).saturating_sub(1),
                (((bounds.max_y - bounds.min_y) / cell).ceil() as usize).saturating_sub(1),
            );
        }
        let cx = ((x - self.spatial_bias.0) / cell).floor().max(0.0) as usize;
        let cy = ((y - self.spatial_bias.1) / cell).floor().max(0.0) as usize;
        (cx.min(limit.0), cy.min(limit.1))
    }

    fn check_grows_bounds(&mut self, location: Vec3, handle: ObjectHandle, is_static: bool) {
        if self.config.bounds.is_some() {
            return;
        }
        let was_pending = self.needs_rebuild;
        let half = self.config.cell_size / 2.0;
        if location.x < self.spatial_bias.0 {
            self.spatial_bias.0 = location.x - half;
            self.needs_rebuild = true;
        }
        if location.y < self.spatial_bias.1 {
            self.spatial_bias.1 = location.y - half;
            self.needs_rebuild = true;
        }
        if self.needs_rebuild && !was_pending {
            warn!(
                "🧭 Grid rebuild caused by {:?} at ({:.1}, {:.1}), new bias ({:.1}, {:.1}), static: {}",
                handle, location.x, location.y, self.spatial_bias.0, self.spatial_bias.1, is_static
            );
        }
    }

    // -- membership -------------------------------------------------------

    pub fn add_object(&mut self, object: NodeObject<'_>, verify: bool) {
        let info = object.info;
        let RoutingPolicy::Spatialize(mode) = info.settings.routing else {
            debug!("Grid asked to hold non-spatialized {}", info.id);
            return;
        };
        match mode {
            SpatialMode::Static => self.add_static(object, false, verify),
            SpatialMode::Dynamic => self.add_dynamic(object.handle, verify),
            SpatialMode::Dormancy if info.wants_dormant => self.add_static(object, true, verify),
            SpatialMode::Dormancy => self.add_dynamic(object.handle, verify),
        }
    }

    fn add_dynamic(&mut self, handle: ObjectHandle, verify: bool) {
        if self.dynamics.contains_key(handle) {
            if verify {
                warn!("⚠️ {:?} already tracked as dynamic in grid", handle);
            }
            return;
        }
        self.dynamics.insert(handle, DynamicEntry::default());
    }

    fn add_static(&mut self, object: NodeObject<'_>, dormancy_driven: bool, verify: bool) {
        let handle = object.handle;
        if !object.initialized {
            if self.pending_statics.iter().any(|(pending, _)| *pending == handle) {
                warn!("⚠️ {:?} already waiting for static placement", handle);
                return;
            }
            self.pending_statics.push((handle, dormancy_driven));
            return;
        }
        self.place_static(handle, object.info, dormancy_driven, verify);
    }

    fn place_static(&mut self, handle: ObjectHandle, info: &GlobalReplicationInfo, dormancy_driven: bool, verify: bool) {
        if verify && self.statics.contains_key(handle) {
            warn!("⚠️ {} already placed in static grid", info.id);
            return;
        }
        self.check_grows_bounds(info.world_location, handle, true);

        let rect = if self.needs_rebuild {
            None
        } else {
            let rect = self.cell_rect(info.world_location, info.settings.cull_distance);
            let region = info.region.as_deref();
            for (x, y) in rect.cells() {
                self.cell_or_create(x, y).add_static(handle, region, info.wants_dormant, verify);
            }
            trace!("Placed {} into {} static cells", info.id, rect.cell_count());
            Some(rect)
        };
        self.statics.insert(handle, StaticEntry { rect, dormancy_driven });
    }

    pub fn remove_object(&mut self, object: NodeObject<'_>) -> bool {
        let handle = object.handle;
        let region = object.info.region.as_deref();

        if let Some(entry) = self.dynamics.remove(handle) {
            if let Some(rect) = entry.rect {
                for (x, y) in rect.cells() {
                    if let Some(cell) = self.cell_mut(x, y) {
                        cell.remove_dynamic(handle, region);
                    }
                }
            }
            return true;
        }

        if let Some(entry) = self.statics.remove(handle) {
            if let Some(rect) = entry.rect {
                for (x, y) in rect.cells() {
                    if let Some(cell) = self.cell_mut(x, y) {
                        cell.remove_static(handle, region);
                    }
                }
            }
            return true;
        }

        let before = self.pending_statics.len();
        self.pending_statics.retain(|(pending, _)| *pending != handle);
        before != self.pending_statics.len()
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.dynamics.contains_key(handle)
            || self.statics.contains_key(handle)
            || self.pending_statics.iter().any(|(pending, _)| *pending == handle)
    }

    /// Whether any grid cell currently lists `handle`.
    pub fn in_any_cell(&self, handle: ObjectHandle) -> bool {
        self.cells.iter().flatten().flatten().any(|cell| cell.contains(handle))
    }

    pub fn is_static(&self, handle: ObjectHandle) -> bool {
        self.statics.contains_key(handle)
    }

    pub fn is_dynamic(&self, handle: ObjectHandle) -> bool {
        self.dynamics.contains_key(handle)
    }

    pub fn reset_all(&mut self) {
        self.cells.clear();
        self.statics.clear();
        self.dynamics.clear();
        self.pending_statics.clear();
    }

    // -- change notifications --------------------------------------------

    pub fn on_dormancy_changed(&mut self, object: NodeObject<'_>, was_dormant: bool, now_dormant: bool) {
        let handle = object.handle;
        let info = object.info;
        let verify = false;

        if let Some(entry) = self.statics.get(handle).copied() {
            if entry.dormancy_driven {
                if !now_dormant {
                    self.remove_object(object);
                    self.add_dynamic(handle, verify);
                }
            } else if let Some(rect) = entry.rect {
                let region = info.region.as_deref();
                for (x, y) in rect.cells() {
                    if let Some(cell) = self.cell_mut(x, y) {
                        cell.on_static_dormancy_changed(handle, region, was_dormant, now_dormant);
                    }
                }
            }
            return;
        }

        if self.dynamics.contains_key(handle)
            && now_dormant
            && info.settings.routing == RoutingPolicy::Spatialize(SpatialMode::Dormancy)
        {
            self.remove_object(object);
            self.add_static(object, true, verify);
        }
    }

    pub fn on_dormancy_flush(&mut self, handle: ObjectHandle, region: Option<&str>, verify: bool) {
        let Some(rect) = self.statics.get(handle).and_then(|entry| entry.rect) else {
            return;
        };
        for (x, y) in rect.cells() {
            if let Some(cell) = self.cell_mut(x, y) {
                cell.on_dormancy_flush(handle, region, verify);
            }
        }
    }

    /// Static objects are re-placed with the new cull distance; dynamic ones
    /// pick it up on the next Prepare.
    pub fn on_cull_distance_changed(&mut self, object: NodeObject<'_>) {
        if let Some(entry) = self.statics.get(object.handle).copied() {
            self.remove_object(object);
            self.place_static(object.handle, object.info, entry.dormancy_driven, false);
        } else if !self.dynamics.contains_key(object.handle) {
            warn!("⚠️ Cull distance of {} changed but it is not spatialized here", object.info.id);
        }
    }

    pub fn on_region_visible(&mut self, connection: ConnectionHandle, region: &str) {
        for cell in self.cells.iter_mut().flatten().flatten() {
            cell.on_region_visible(connection, region);
        }
    }

    pub fn remove_connection(&mut self, connection: ConnectionHandle) {
        for cell in self.cells.iter_mut().flatten().flatten() {
            cell.remove_connection(connection);
        }
    }

    // -- prepare ------------------------------------------------------------

    /// Moves dynamic objects, places pending statics and runs a queued
    /// rebuild. Returns true when the grid was rebuilt.
    pub fn prepare(&mut self, ctx: &PrepareContext<'_>) -> bool {
        let handles: Vec<ObjectHandle> = self.dynamics.keys().collect();
        for handle in handles {
            let Some(info) = ctx.objects.get(handle) else {
                warn!("⚠️ Dynamic grid object {:?} is no longer registered", handle);
                continue;
            };
            self.check_grows_bounds(info.world_location, handle, false);
            if self.needs_rebuild {
                continue;
            }
            let new_rect = self.cell_rect(info.world_location, info.settings.cull_distance);
            let old_rect = self.dynamics.get(handle).and_then(|entry| entry.rect);
            self.move_dynamic(handle, info.region.as_deref(), old_rect, new_rect);
            if let Some(entry) = self.dynamics.get_mut(handle) {
                entry.rect = Some(new_rect);
            }
        }

        let mut index = self.pending_statics.len();
        while index > 0 {
            index -= 1;
            let (handle, dormancy_driven) = self.pending_statics[index];
            let Some(info) = ctx.objects.get(handle) else {
                self.pending_statics.swap_remove(index);
                continue;
            };
            if !ctx.world.is_initialized(info.id) {
                continue;
            }
            self.pending_statics.swap_remove(index);
            self.place_static(handle, info, dormancy_driven, false);
        }

        if self.needs_rebuild {
            self.rebuild(ctx);
            return true;
        }
        false
    }

    fn move_dynamic(&mut self, handle: ObjectHandle, region: Option<&str>, old: Option<CellRect>, new: CellRect) {
        let Some(old) = old else {
            for (x, y) in new.cells() {
                self.cell_or_create(x, y).add_dynamic(handle, region, false);
            }
            return;
        };
        if old == new {
            return;
        }

        if !old.intersects(&new) {
            for (x, y) in old.cells() {
                if let Some(cell) = self.cell_mut(x, y) {
                    cell.remove_dynamic(handle, region);
                }
            }
            for (x, y) in new.cells() {
                self.cell_or_create(x, y).add_dynamic(handle, region, false);
            }
        } else {
            for (x, y) in old.cells().filter(|(x, y)| !new.contains(*x, *y)) {
                if let Some(cell) = self.cell_mut(x, y) {
                    cell.remove_dynamic(handle, region);
                }
            }
            for (x, y) in new.cells().filter(|(x, y)| !old.contains(*x, *y)) {
                self.cell_or_create(x, y).add_dynamic(handle, region, false);
            }
        }
        trace!("{:?} moved cells {:?} -> {:?}", handle, old, new);
    }

    fn rebuild(&mut self, ctx: &PrepareContext<'_>) {
        warn!("🧭 Rebuilding spatial grid for bias ({:.1}, {:.1})", self.spatial_bias.0, self.spatial_bias.1);
        let destroyed = self.cells.iter().flatten().filter(|cell| cell.is_some()).count();
        self.cells.clear();
        if destroyed >= self.config.rebuild_collect_threshold as usize {
            info!("🧹 Grid rebuild destroyed {} cells, a memory collection pass is advised", destroyed);
        }
        self.needs_rebuild = false;
        self.rebuild_count += 1;

        let dynamics: Vec<ObjectHandle> = self.dynamics.keys().collect();
        for handle in dynamics {
            let Some(info) = ctx.objects.get(handle) else {
                continue;
            };
            let rect = self.cell_rect(info.world_location, info.settings.cull_distance);
            self.move_dynamic(handle, info.region.as_deref(), None, rect);
            if let Some(entry) = self.dynamics.get_mut(handle) {
                entry.rect = Some(rect);
            }
        }

        let statics: Vec<(ObjectHandle, StaticEntry)> = self.statics.iter().map(|(h, e)| (h, *e)).collect();
        for (handle, entry) in statics {
            let Some(info) = ctx.objects.get(handle) else {
                continue;
            };
            let rect = self.cell_rect(info.world_location, info.settings.cull_distance);
            let region = info.region.as_deref();
            for (x, y) in rect.cells() {
                self.cell_or_create(x, y).add_static(handle, region, info.wants_dormant, false);
            }
            self.statics.insert(handle, StaticEntry { rect: Some(rect), ..entry });
        }
    }

    // -- gather -------------------------------------------------------------

    pub fn gather(&mut self, ctx: &mut GatherContext<'_>, out: &mut GatheredLists) {
        let max_z = self.config.connection_max_z.unwrap_or(f64::MAX);
        let mut current_cells: Vec<(usize, usize)> = Vec::with_capacity(ctx.viewers.len());
        let mut active: Vec<((usize, usize), (usize, usize))> = Vec::with_capacity(ctx.viewers.len());

        let viewers = ctx.viewers;
        let last_locations = ctx.last_gather_locations;
        for (index, viewer) in viewers.iter().enumerate() {
            if viewer.location.z > max_z {
                continue;
            }
            let current = self.viewer_cell(viewer.location);
            let last = last_locations.get(index).copied().unwrap_or_default();
            let previous = self.viewer_cell(last);

            if !current_cells.contains(&current) {
                if let Some(cell) = self.cell_mut(current.0, current.1) {
                    cell.gather(ctx, out);
                }
                current_cells.push(current);
            }
            active.push((current, previous));
        }

        if self.config.destroy_dormant_dynamic_objects {
            self.collect_dormant_destructions(ctx, &current_cells, &active);
        }
    }

    /// When a viewer changes cell, dormant objects only the old cell knew
    /// about are destroyed on the client and put back into the connection's
    /// dormancy mirrors so they come back once relevant again.
    fn collect_dormant_destructions(
        &mut self,
        ctx: &mut GatherContext<'_>,
        current_cells: &[(usize, usize)],
        active: &[((usize, usize), (usize, usize))],
    ) {
        let mut cell_changed = false;
        let mut previous_dormant = RepList::new();

        for &(current, previous) in active {
            if current == previous || current_cells.contains(&previous) {
                continue;
            }
            cell_changed = true;

            let mut current_dormant = RepList::new();
            if let Some(node) = self.cell(current.0, current.1).and_then(GridCellNode::dormancy) {
                node.collect_dormant_dynamic(ctx, &mut current_dormant, None, false);
            }
            if let Some(node) = self.cell(previous.0, previous.1).and_then(GridCellNode::dormancy) {
                node.collect_dormant_dynamic(ctx, &mut previous_dormant, Some(&current_dormant), true);
            }
        }

        if !cell_changed || previous_dormant.is_empty() {
            return;
        }

        debug!("💀 {:?} left cells holding {} dormant objects", ctx.connection, previous_dormant.len());
        for handle in previous_dormant.iter() {
            ctx.dormant_destructions.push(handle);
            if let Some(info) = ctx.infos.get_mut(handle) {
                info.dormant_on_connection = false;
                info.grid_already_dormant = false;
            }

            let Some(rect) = self.statics.get(handle).and_then(|entry| entry.rect) else {
                continue;
            };
            let region = ctx.objects.get(handle).and_then(|info| info.region.clone());
            for (x, y) in rect.cells() {
                let Some(node) = self.cell_mut(x, y).and_then(GridCellNode::dormancy_mut) else {
                    continue;
                };
                if let Some(mirror) = node.existing_connection_node(ctx.connection) {
                    mirror.notify_flush(handle, region.as_deref());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridBounds;

    fn grid(cell_size: f64) -> GridSpatialization2D {
        let config = GridConfig {
            cell_size,
            spatial_bias: (0.0, 0.0),
            ..GridConfig::default()
        };
        GridSpatialization2D::new(&config, &FrequencyBucketsConfig::default(), &DormancyConfig::default())
    }

    #[test]
    fn test_cell_rect_on_boundary_is_exact() {
        let grid = grid(1000.0);
        // (1000, 2000) open interval touches only cell 1 on each axis.
        let rect = grid.cell_rect(Vec3::new(1500.0, 1500.0, 0.0), 500.0);
        assert_eq!(rect, CellRect { start_x: 1, start_y: 1, end_x: 1, end_y: 1 });

        let rect = grid.cell_rect(Vec3::new(1000.0, 1000.0, 0.0), 500.0);
        assert_eq!(rect, CellRect { start_x: 0, start_y: 0, end_x: 1, end_y: 1 });
    }

    #[test]
    fn test_cell_rect_clamps_below_bias() {
        let grid = grid(1000.0);
        let rect = grid.cell_rect(Vec3::new(100.0, 2500.0, 0.0), 600.0);
        assert_eq!((rect.start_x, rect.end_x), (0, 0));
        assert_eq!((rect.start_y, rect.end_y), (1, 3));
    }

    #[test]
    fn test_bounds_set_bias_and_cap_cells() {
        let config = GridConfig {
            cell_size: 1000.0,
            bounds: Some(GridBounds { min_x: -5000.0, min_y: -5000.0, max_x: 5000.0, max_y: 5000.0 }),
            ..GridConfig::default()
        };
        let grid = GridSpatialization2D::new(&config, &FrequencyBucketsConfig::default(), &DormancyConfig::default());
        assert_eq!(grid.spatial_bias(), (-5000.0, -5000.0));

        let rect = grid.cell_rect(Vec3::new(4900.0, 4900.0, 0.0), 2000.0);
        assert_eq!((rect.end_x, rect.end_y), (9, 9));
        assert_eq!(grid.viewer_cell(Vec3::new(9000.0, -9000.0, 0.0)), (9, 0));
    }

    #[test]
    fn test_rect_helpers() {
        let a = CellRect { start_x: 0, start_y: 0, end_x: 2, end_y: 2 };
        let b = CellRect { start_x: 2, start_y: 2, end_x: 3, end_y: 3 };
        let c = CellRect { start_x: 4, start_y: 0, end_x: 5, end_y: 1 };
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert_eq!(a.cell_count(), 9);
        assert_eq!(a.cells().count(), 9);
    }

    #[test]
    fn test_viewer_cell_floors_and_clamps() {
        let grid = grid(1000.0);
        assert_eq!(grid.viewer_cell(Vec3::new(1999.0, 0.0, 0.0)), (1, 0));
        assert_eq!(grid.viewer_cell(Vec3::new(-50.0, 3000.0, 0.0)), (0, 3));
    }
}
