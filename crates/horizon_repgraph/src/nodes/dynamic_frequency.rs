//! Distance and view-direction driven replication frequency.
//!
//! Instead of offering a flat list, this node decides per connection how
//! often each member should replicate. The closest viewer's view direction
//! picks a zone; the distance to the object, as a fraction of its cull
//! distance, interpolates the zone's near and far periods. Only objects due
//! this frame are scheduled, sorted by how overdue they are.

use super::actor_list::RegionPartitionedNode;
use super::{GatherContext, GatheredLists, NodeObject, ScheduledBatch, ScheduledItem};
use crate::config::{DynamicFrequencyConfig, FrequencyZone, GraphConfig};
use crate::prioritize::update_channel_close_frame;
use crate::types::{NetViewer, ObjectHandle, Vec3};
use tracing::{trace, warn};

/// A zone with its frequencies converted to frame periods.
#[derive(Debug, Clone, Copy, PartialEq)]
struct ZonePeriods {
    min_dot: f64,
    min_dist_pct: f64,
    max_dist_pct: f64,
    near: u32,
    far: u32,
    fast_near: u32,
    fast_far: u32,
}

impl ZonePeriods {
    fn from_zone(zone: &FrequencyZone, config: &GraphConfig) -> Self {
        Self {
            min_dot: zone.min_dot,
            min_dist_pct: zone.min_dist_pct,
            max_dist_pct: zone.max_dist_pct,
            near: config.hz_to_period(zone.near_hz).max(1),
            far: config.hz_to_period(zone.far_hz).max(1),
            fast_near: config.hz_to_period(zone.fast_near_hz),
            fast_far: config.hz_to_period(zone.fast_far_hz),
        }
    }
}

/// Period between `near` and `far` for a distance fraction in [0, 1].
fn interpolate_period(pct: f64, near: u32, far: u32) -> u32 {
    let range = far as f64 - near as f64;
    let extra = (range * pct).ceil() as i64;
    (near as i64 + extra).max(1) as u32
}

fn replicates_every_frame(period: u32, fast_path: bool, fast_period: u32) -> bool {
    !(period > 1 && (!fast_path || fast_period > 1))
}

#[derive(Debug, Clone)]
pub struct DynamicSpatialFrequencyNode {
    members: RegionPartitionedNode,
    zones: Vec<ZonePeriods>,
    fast_shared_zones: Vec<ZonePeriods>,
    max_nearest_objects: i32,
    enable_fast_path: bool,
    max_bits_per_frame: i64,
}

impl DynamicSpatialFrequencyNode {
    pub fn new(config: &GraphConfig) -> Self {
        let settings: &DynamicFrequencyConfig = &config.dynamic_frequency;
        Self {
            members: RegionPartitionedNode::new(),
            zones: settings.zones.iter().map(|z| ZonePeriods::from_zone(z, config)).collect(),
            fast_shared_zones: settings.fast_shared_zones.iter().map(|z| ZonePeriods::from_zone(z, config)).collect(),
            max_nearest_objects: settings.max_nearest_objects,
            enable_fast_path: settings.enable_fast_path,
            max_bits_per_frame: settings.max_bits_per_frame,
        }
    }

    pub fn add_object(&mut self, object: NodeObject<'_>, verify: bool) {
        self.members.add_object(object.handle, object.info.region.as_deref(), verify);
    }

    pub fn remove_object(&mut self, object: NodeObject<'_>) -> bool {
        self.members.remove_object(object.handle, object.info.region.as_deref())
    }

    pub fn reset_all(&mut self) {
        self.members.reset_all();
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.members.contains(handle)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn gather(&mut self, ctx: &mut GatherContext<'_>, out: &mut GatheredLists) {
        let objects = ctx.objects;
        let viewers = ctx.viewers;

        let mut candidates = Vec::with_capacity(self.members.len());
        self.members.gather(ctx, &mut candidates);
        candidates.retain(|handle| {
            let id = objects.id_of(*handle);
            !viewers.iter().any(|viewer| id.is_some() && viewer.view_target == id)
        });

        if self.max_nearest_objects >= 0 && candidates.len() > self.max_nearest_objects as usize {
            let mut by_distance: Vec<(f64, ObjectHandle)> = candidates
                .iter()
                .filter_map(|handle| {
                    let location = objects.get(*handle)?.world_location;
                    Some((closest_distance_squared(viewers, location), *handle))
                })
                .collect();
            by_distance.sort_by(|a, b| a.0.total_cmp(&b.0));
            by_distance.truncate(self.max_nearest_objects as usize);
            candidates = by_distance.into_iter().map(|(_, handle)| handle).collect();
        }

        let mut expected_this_frame = 0i32;
        let mut expected_next_frame = 0i32;
        let mut items = Vec::with_capacity(candidates.len());
        for handle in candidates {
            if let Some(item) = self.schedule(ctx, handle, &mut expected_this_frame, &mut expected_next_frame) {
                items.push(item);
            }
        }
        items.sort_by_key(|item: &ScheduledItem| item.frames_till_replicate);

        if !items.is_empty() {
            out.scheduled.push(ScheduledBatch {
                items,
                load_balance_quota: (expected_this_frame - expected_next_frame) >> 1,
                max_bits: self.max_bits_per_frame,
            });
        }
    }

    /// Computes the object's periods for this connection and returns an item
    /// when it is due now (or overdue).
    fn schedule(
        &self,
        ctx: &mut GatherContext<'_>,
        handle: ObjectHandle,
        expected_this_frame: &mut i32,
        expected_next_frame: &mut i32,
    ) -> Option<ScheduledItem> {
        let frame = ctx.frame;
        let skip_cull = ctx.config.general.skip_distance_cull;
        let global_timeout = ctx.config.general.global_channel_close_timeout_frames;
        let global = ctx.objects.get(handle)?;

        let mut closest = None;
        let mut smallest = f64::MAX;
        for viewer in ctx.viewers {
            let distance = global.world_location.distance_squared(viewer.location);
            if closest.is_none() || distance < smallest {
                closest = Some(viewer);
                smallest = distance;
            }
        }
        let viewer = closest?;

        let info = ctx.infos.find_or_add(handle, global)?;
        if info.dormant_on_connection {
            return None;
        }
        if !skip_cull && info.cull_distance_squared() > 0.0 && smallest > info.cull_distance_squared() {
            return None;
        }

        let distance = smallest.sqrt();
        let to_object = global.world_location - viewer.location;
        let direction = if distance > f64::EPSILON { to_object * (1.0 / distance) } else { to_object };
        let dot = direction.dot(viewer.direction);

        let supports_fast_shared = global.fast_shared.is_some();
        let zones = if supports_fast_shared { &self.fast_shared_zones } else { &self.zones };
        let Some(zone) = zones.iter().find(|zone| dot <= zone.min_dot) else {
            warn!("⚠️ {} fits no frequency zone (dot {:.2})", global.id, dot);
            return None;
        };

        let cull_squared = if info.cull_distance_squared() > 0.0 {
            info.cull_distance_squared()
        } else {
            global.cull_distance_squared()
        };
        if cull_squared <= 0.0 {
            warn!("⚠️ {} has no cull distance, skipping frequency scheduling", global.id);
            return None;
        }

        let dist_pct = distance / cull_squared.sqrt();
        let pct = ((dist_pct - zone.min_dist_pct) / (zone.max_dist_pct - zone.min_dist_pct)).clamp(0.0, 1.0);

        let period = interpolate_period(pct, zone.near, zone.far);
        info.replication_period_frames = period;
        info.next_rep_frame = info.last_rep_frame + period;
        let mut frames_till = info.next_rep_frame as i64 - frame as i64;
        info.raise_channel_close_frame(info.next_rep_frame + 1);

        let mut enable_fast_path = false;
        if supports_fast_shared && self.enable_fast_path && zone.fast_near > 0 {
            let fast_period = interpolate_period(pct, zone.fast_near, zone.fast_far.max(1));
            info.fast_path_period_frames = fast_period;
            info.fast_path_next_rep_frame = info.fast_path_last_rep_frame + fast_period;
            frames_till = frames_till.min(info.fast_path_next_rep_frame as i64 - frame as i64);
            enable_fast_path = true;
        }

        let every_frame = replicates_every_frame(period, enable_fast_path, info.fast_path_period_frames);
        match frames_till {
            f if f < 0 => {}
            0 => {
                if !every_frame {
                    *expected_this_frame += 1;
                }
            }
            1 => {
                if !every_frame {
                    *expected_next_frame += 1;
                }
                return None;
            }
            _ => return None,
        }

        update_channel_close_frame(info, global, frame, global_timeout);
        trace!("{} scheduled in {} frames (period {})", global.id, frames_till, period);
        Some(ScheduledItem {
            handle,
            frames_till_replicate: frames_till,
            enable_fast_path,
            replicates_every_frame: every_frame,
        })
    }
}

fn closest_distance_squared(viewers: &[NetViewer], location: Vec3) -> f64 {
    viewers
        .iter()
        .map(|viewer| viewer.location.distance_squared(location))
        .fold(f64::MAX, f64::min)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_interpolation() {
        assert_eq!(interpolate_period(0.0, 2, 30), 2);
        assert_eq!(interpolate_period(1.0, 2, 30), 30);
        assert_eq!(interpolate_period(0.5, 2, 30), 16);
        assert_eq!(interpolate_period(0.01, 2, 30), 3);
    }

    #[test]
    fn test_every_frame_detection() {
        assert!(replicates_every_frame(1, false, 0));
        assert!(!replicates_every_frame(3, false, 1));
        assert!(replicates_every_frame(3, true, 1));
        assert!(!replicates_every_frame(3, true, 2));
    }

    #[test]
    fn test_default_zones_convert_to_periods() {
        let config = GraphConfig::default();
        let node = DynamicSpatialFrequencyNode::new(&config);
        let facing = node.fast_shared_zones[2];
        assert_eq!((facing.near, facing.far), (6, 30));
        assert_eq!((facing.fast_near, facing.fast_far), (2, 3));
        assert_eq!(node.fast_shared_zones[0].fast_near, 0);

        let behind = node.zones[0];
        assert_eq!((behind.near, behind.far), (6, 30));
    }
}
