//! The fast-shared lane.
//!
//! A cheap secondary path for objects whose class can produce a small
//! pre-serialized payload. The payload is built at most once per frame and
//! the same bytes are sent to every connection that wants the object, so the
//! serialization cost does not grow with the connection count. A payload is
//! kept until the next build, so connections that missed it still get it. Lists are
//! walked round-robin from a frame-dependent offset instead of by score, and
//! the lane has its own bit budget.

use crate::replicate::SendContext;
use crate::transport::{FastSharedBuild, ReplicationTransport, ReplicationWorld, SharedBunch};
use crate::types::{NetViewer, ObjectHandle};
use tracing::trace;

/// Sends the object's shared payload over its existing channel.
///
/// Objects without an open channel are skipped; the default lane opens it.
pub(crate) fn replicate_fast_shared<W, T>(ctx: &mut SendContext<'_, W, T>, handle: ObjectHandle) -> i64
where
    W: ReplicationWorld + ?Sized,
    T: ReplicationTransport + ?Sized,
{
    let connection = ctx.connection;
    let frame = ctx.frame;

    let Some(global) = ctx.objects.get_mut(handle) else {
        return 0;
    };
    let id = global.id;
    let Some(info) = ctx.infos.get_mut(handle) else {
        return 0;
    };
    let Some(channel) = info.channel else {
        return 0;
    };
    if ctx.transport.is_closing(connection, channel) {
        return 0;
    }
    let Some(state) = global.fast_shared.as_mut() else {
        return 0;
    };

    if state.last_attempt_build_frame < frame {
        state.last_attempt_build_frame = frame;
        match ctx.world.build_fast_shared(id, frame) {
            FastSharedBuild::New(data) => {
                state.bunch = SharedBunch::new(data);
                state.last_bunch_build_frame = frame;
                ctx.stats.fast_shared_builds += 1;
            }
            FastSharedBuild::Unchanged => {
                trace!("{} has no fast-shared changes this frame", id);
            }
            FastSharedBuild::Unavailable => {
                trace!("{} could not build a fast-shared payload", id);
            }
        }
    }

    // The last built payload stays valid until a newer one replaces it, so a
    // connection only skips it once it has been sent that build.
    if state.bunch.is_empty() || info.fast_path_last_rep_frame >= state.last_bunch_build_frame {
        return 0;
    }

    info.fast_path_last_rep_frame = frame;
    info.fast_path_next_rep_frame = frame + info.fast_path_period_frames;

    let bits = ctx.transport.send_fast_shared(connection, channel, &state.bunch);
    ctx.stats.fast_shared_sends += 1;
    ctx.stats.fast_shared_bits += bits;
    bits
}

/// True when any viewer faces the object or stands inside the configured
/// fraction of its squared cull distance.
fn is_fast_relevant(location: crate::types::Vec3, viewers: &[NetViewer], cull_distance_squared: f64, pct: f64) -> bool {
    viewers.iter().any(|viewer| {
        let to_object = location - viewer.location;
        let facing = to_object.normalized().dot(viewer.direction) >= 0.0;
        let near = to_object.length_squared() <= cull_distance_squared * pct;
        facing || near
    })
}

/// Walks every fast-shared list until the lane budget is spent. The first
/// list walked rotates with the frame.
pub(crate) fn replicate_fast_shared_lists<W, T>(
    ctx: &mut SendContext<'_, W, T>,
    lists: &[Vec<ObjectHandle>],
    viewers: &[NetViewer],
) -> i64
where
    W: ReplicationWorld + ?Sized,
    T: ReplicationTransport + ?Sized,
{
    let settings = &ctx.config.fast_shared;
    if !settings.enabled {
        return 0;
    }
    let max_bits = settings.max_bits_per_frame;
    let pct = settings.distance_requirement_pct;
    let start = ctx.frame as usize * settings.list_skip_per_frame as usize;
    let frame = ctx.frame;

    let mut bits = 0;
    let list_count = lists.len();
    for list_offset in 0..list_count {
        let list = &lists[(list_offset + frame as usize) % list_count];
        let count = list.len();
        for offset in 0..count {
            let handle = list[(offset + start) % count];
            let Some(global) = ctx.objects.get(handle) else {
                continue;
            };
            if global.fast_shared.is_none() || global.torn_off {
                continue;
            }
            let location = global.world_location;
            let Some(info) = ctx.infos.find_or_add(handle, global) else {
                continue;
            };
            if info.last_rep_frame == frame || info.tear_off {
                continue;
            }
            if !is_fast_relevant(location, viewers, info.cull_distance_squared(), pct) {
                continue;
            }

            bits += replicate_fast_shared(ctx, handle);
            if bits > max_bits {
                trace!("🚦 Fast-shared lane on {:?} spent its {} bit budget", ctx.connection, max_bits);
                ctx.transport.notify_saturated(ctx.connection);
                return bits;
            }
        }
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Vec3;

    #[test]
    fn test_relevance_by_direction_or_distance() {
        let viewer = NetViewer::at(Vec3::zero()).facing(Vec3::new(1.0, 0.0, 0.0));
        let cull_squared = 1_000.0 * 1_000.0;

        assert!(is_fast_relevant(Vec3::new(800.0, 0.0, 0.0), &[viewer], cull_squared, 0.1));
        // Behind, but inside 10% of the squared cull distance.
        assert!(is_fast_relevant(Vec3::new(-300.0, 0.0, 0.0), &[viewer], cull_squared, 0.1));
        assert!(!is_fast_relevant(Vec3::new(-400.0, 0.0, 0.0), &[viewer], cull_squared, 0.1));
    }
}
