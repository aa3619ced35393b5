//! Candidate scoring.
//!
//! Lower scores replicate first. A score is the class bias plus a distance
//! term, minus a starvation term, plus fixed biases for pending dormancy,
//! forced updates and the connection's own viewer objects.

use crate::config::GraphConfig;
use crate::info::{ConnectionInfoMap, ConnectionReplicationInfo, GlobalReplicationInfo, ObjectInfoMap};
use crate::types::{Frame, NetViewer, ObjectHandle};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrioritizedItem {
    pub handle: ObjectHandle,
    pub score: f32,
}

/// Why candidates were dropped before scoring, for stats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrioritizeOutcome {
    pub scored: usize,
    pub dormant: usize,
    pub not_ready: usize,
    pub culled: usize,
    pub duplicates: usize,
}

/// Keeps the channel open for at least the class timeout past the current
/// period. Never lowers the close frame.
pub fn update_channel_close_frame(
    info: &mut ConnectionReplicationInfo,
    global: &GlobalReplicationInfo,
    frame: Frame,
    global_timeout: u32,
) {
    let timeout = global.settings.channel_close_timeout_frames;
    if timeout > 0 {
        let close = frame + info.replication_period_frames + timeout + global_timeout;
        info.raise_channel_close_frame(close);
    }
}

/// Scores `candidates` for one connection into `out`, sorted ascending.
///
/// Every candidate that survives the dormancy, readiness and distance checks
/// has its channel close frame extended, whether or not it is sent later.
pub fn prioritize(
    candidates: &[ObjectHandle],
    objects: &ObjectInfoMap,
    infos: &mut ConnectionInfoMap,
    viewers: &[NetViewer],
    frame: Frame,
    config: &GraphConfig,
    out: &mut Vec<PrioritizedItem>,
) -> PrioritizeOutcome {
    let mut outcome = PrioritizeOutcome::default();
    let weights = &config.prioritization;
    let max_distance_scaling = weights.max_distance_scaling * weights.max_distance_scaling;
    let global_timeout = config.general.global_channel_close_timeout_frames;
    let skip_cull = config.general.skip_distance_cull;
    let starvation_frames = weights.max_frames_since_last_rep.max(1) as f32;

    out.clear();
    out.reserve(candidates.len());

    for &handle in candidates {
        let Some(global) = objects.get(handle) else {
            continue;
        };
        let Some(info) = infos.find_or_add(handle, global) else {
            continue;
        };

        if info.dormant_on_connection {
            outcome.dormant += 1;
            continue;
        }
        if info.last_rep_frame == frame {
            outcome.duplicates += 1;
            continue;
        }
        if !info.is_ready(global.force_update_frame, frame) {
            outcome.not_ready += 1;
            continue;
        }
        if global.settings.cull_distance < 0.0 {
            outcome.culled += 1;
            continue;
        }

        let mut score = global.settings.priority_bias;

        let mut smallest = f64::MAX;
        let mut viewers_out_of_range = 0;
        let cull_squared = info.cull_distance_squared();
        for viewer in viewers {
            let distance = global.world_location.distance_squared(viewer.location);
            smallest = smallest.min(distance);
            if !skip_cull && cull_squared > 0.0 && distance > cull_squared {
                viewers_out_of_range += 1;
            }
        }
        if !viewers.is_empty() && viewers_out_of_range >= viewers.len() {
            trace!("{} culled by distance for all {} viewers", global.id, viewers.len());
            outcome.culled += 1;
            continue;
        }
        if global.settings.distance_priority_scale > 0.0 && smallest < f64::MAX {
            let factor = (smallest / max_distance_scaling).clamp(0.0, 1.0) as f32;
            score += factor * global.settings.distance_priority_scale;
        }

        update_channel_close_frame(info, global, frame, global_timeout);

        if global.settings.starvation_priority_scale > 0.0 {
            let starved = frame.saturating_sub(info.last_rep_frame) as f32;
            score -= (starved * global.settings.starvation_priority_scale / starvation_frames).clamp(0.0, 1.0);
        }

        if global.wants_dormant && info.last_rep_frame > 0 {
            score += weights.dormancy_bias;
        }

        if global.force_update_frame > info.last_rep_frame {
            score += weights.force_update_bias;
        }

        if viewers.iter().any(|viewer| viewer.is_viewing(global.id)) {
            if config.general.force_viewer_top_priority {
                score = -f32::MAX;
            } else {
                score += weights.viewer_bias;
            }
        }

        out.push(PrioritizedItem { handle, score });
    }

    // Stable: equal scores keep gather order.
    out.sort_by(|a, b| a.score.total_cmp(&b.score));
    outcome.scored = out.len();
    outcome
}
