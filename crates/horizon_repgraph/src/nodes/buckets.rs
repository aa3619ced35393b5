//! Round-robin frequency buckets.
//!
//! Membership is spread over N buckets and only bucket `frame % N` is offered
//! on the default lane, so each object is a default candidate once every N
//! frames. The remaining buckets can feed the fast-shared lane.

use super::actor_list::{RegionLists, RepList};
use super::{GatherContext, GatheredLists};
use crate::config::{BucketThreshold, FrequencyBucketsConfig};
use crate::types::ObjectHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct FrequencyBucketsNode {
    buckets: Vec<RepList>,
    regions: RegionLists,
    total_non_region: usize,
    thresholds: Vec<BucketThreshold>,
    enable_fast_path: bool,
    fast_path_frame_modulo: u32,
}

impl FrequencyBucketsNode {
    pub fn new(config: &FrequencyBucketsConfig) -> Self {
        let num_buckets = config.num_buckets.max(1);
        Self {
            buckets: vec![RepList::new(); num_buckets],
            regions: RegionLists::default(),
            total_non_region: 0,
            thresholds: config.thresholds.clone(),
            enable_fast_path: config.enable_fast_path,
            fast_path_frame_modulo: config.fast_path_frame_modulo.max(1),
        }
    }

    pub fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket(&self, index: usize) -> Option<&RepList> {
        self.buckets.get(index)
    }

    pub fn add_object(&mut self, handle: ObjectHandle, region: Option<&str>, verify: bool) {
        if let Some(region) = region {
            self.regions.add(region, handle, verify);
            return;
        }

        if verify && self.buckets.iter().any(|bucket| bucket.contains(handle)) {
            warn!("⚠️ {:?} added to frequency buckets twice", handle);
            return;
        }

        // Smallest bucket wins; ties go to the lowest index.
        let mut best = 0;
        for (index, bucket) in self.buckets.iter().enumerate() {
            if bucket.len() < self.buckets[best].len() {
                best = index;
            }
        }
        self.buckets[best].add(handle, false);
        self.total_non_region += 1;
        self.check_rebalance();
    }

    pub fn remove_object(&mut self, handle: ObjectHandle, region: Option<&str>) -> bool {
        if let Some(region) = region {
            return self.regions.remove(Some(region), handle);
        }

        let mut removed = false;
        for bucket in &mut self.buckets {
            let before = bucket.len();
            if bucket.remove(handle) {
                removed = true;
                self.total_non_region = self.total_non_region.saturating_sub(before - bucket.len());
            }
        }
        if removed {
            self.check_rebalance();
        }
        removed
    }

    pub fn reset_all(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.regions.clear();
        self.total_non_region = 0;
    }

    pub fn contains(&self, handle: ObjectHandle) -> bool {
        self.buckets.iter().any(|bucket| bucket.contains(handle)) || self.regions.contains(handle)
    }

    pub fn is_empty(&self) -> bool {
        self.total_non_region == 0 && self.regions.total_len() == 0
    }

    pub fn gather(&self, ctx: &GatherContext<'_>, out: &mut GatheredLists) {
        let count = self.buckets.len();
        let default_index = ctx.frame as usize % count;
        out.default.extend(self.buckets[default_index].iter());

        if self.enable_fast_path && ctx.frame % self.fast_path_frame_modulo == 0 {
            for (index, bucket) in self.buckets.iter().enumerate() {
                if index != default_index {
                    out.fast_shared.push(bucket.as_slice().to_vec());
                }
            }
        }

        for (region, list) in self.regions.iter() {
            if ctx.is_region_visible(region) {
                out.default.extend(list.iter());
            }
        }
    }

    /// Picks the bucket count from the first threshold the population fits
    /// under; keeps the current count when none fits.
    fn check_rebalance(&mut self) {
        let desired = self
            .thresholds
            .iter()
            .find(|threshold| self.total_non_region <= threshold.max_objects)
            .map(|threshold| threshold.num_buckets.max(1))
            .unwrap_or(self.buckets.len());

        if desired != self.buckets.len() {
            self.set_bucket_count(desired);
        }
    }

    fn set_bucket_count(&mut self, count: usize) {
        debug!("🪣 Rebalancing {} objects into {} buckets", self.total_non_region, count);
        let all: Vec<ObjectHandle> = self.buckets.iter().flat_map(RepList::iter).collect();
        self.buckets = vec![RepList::new(); count];
        for (index, handle) in all.into_iter().enumerate() {
            self.buckets[index % count].add(handle, false);
        }
    }
}
