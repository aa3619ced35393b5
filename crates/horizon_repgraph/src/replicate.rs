//! Sending candidates over the default lane.

use crate::config::GraphConfig;
use crate::info::{ConnectionInfoMap, ObjectInfoMap};
use crate::nodes::ScheduledBatch;
use crate::prioritize::{update_channel_close_frame, PrioritizedItem};
use crate::stats::TickStats;
use crate::transport::{ReplicationTransport, ReplicationWorld};
use crate::types::{CloseReason, ConnectionHandle, Frame, ObjectHandle};
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

/// Everything a send needs for one connection.
pub(crate) struct SendContext<'a, W: ?Sized, T: ?Sized> {
    pub connection: ConnectionHandle,
    pub frame: Frame,
    pub objects: &'a mut ObjectInfoMap,
    pub infos: &'a mut ConnectionInfoMap,
    pub world: &'a mut W,
    pub transport: &'a mut T,
    pub config: &'a GraphConfig,
    /// 0 when the discovery budget is disabled
    pub discovery_max_bits: i64,
    pub discovery_queued_bits: &'a mut i64,
    pub stats: &'a mut TickStats,
}

/// Sends one object, then its ready dependents. Returns bits written.
///
/// A failed channel open leaves the object's frame counters untouched so it
/// is picked up again next tick.
pub(crate) fn replicate_single<W, T>(ctx: &mut SendContext<'_, W, T>, handle: ObjectHandle) -> i64
where
    W: ReplicationWorld + ?Sized,
    T: ReplicationTransport + ?Sized,
{
    let connection = ctx.connection;
    let frame = ctx.frame;

    let Some(global) = ctx.objects.get_mut(handle) else {
        warn!("⚠️ Replicating unregistered handle {:?}", handle);
        return 0;
    };
    let id = global.id;
    let Some(info) = ctx.infos.find_or_add(handle, global) else {
        return 0;
    };

    if global.torn_off && !info.tear_off {
        debug!("{} is torn off, skipping send on {:?}", id, connection);
        return 0;
    }
    if let Some(channel) = info.channel {
        if ctx.transport.is_closing(connection, channel) {
            trace!("{} channel closing on {:?}", id, connection);
            return 0;
        }
    }

    let channel = match info.channel {
        Some(channel) => channel,
        None => match ctx.transport.open_channel(connection, id) {
            Some(channel) => {
                ctx.stats.channel_opens += 1;
                info.channel = Some(channel);
                channel
            }
            None => {
                debug!("📪 Channel open failed for {} on {:?}, retrying next tick", id, connection);
                ctx.stats.channel_open_failures += 1;
                return 0;
            }
        },
    };

    info.last_rep_frame = frame;
    info.next_rep_frame = frame + info.replication_period_frames;

    if global.last_pre_replication_frame != frame {
        global.last_pre_replication_frame = frame;
        ctx.world.pre_replication(id, frame);
    }

    let mut bits = ctx.transport.replicate(connection, channel, id);
    ctx.stats.sends += 1;

    if global.wants_dormant && ctx.transport.start_becoming_dormant(connection, channel) {
        trace!("💤 {} went dormant immediately on {:?}", id, connection);
        info.dormant_on_connection = true;
        info.channel = None;
    } else if info.tear_off {
        ctx.transport.close_channel(connection, channel, CloseReason::TearOff);
        ctx.stats.channel_closes += 1;
        info.channel = None;
    }

    let discovery = ctx.discovery_max_bits > 0 && !ctx.transport.spawn_acked(connection, channel);
    let discovery_full = discovery && *ctx.discovery_queued_bits >= ctx.discovery_max_bits;

    let close_frame = info.channel_close_frame();
    let dependents: SmallVec<[ObjectHandle; 4]> = global.dependents.clone();
    for dependent in dependents {
        let Some(dep_global) = ctx.objects.get(dependent) else {
            continue;
        };
        let Some(dep_info) = ctx.infos.find_or_add(dependent, dep_global) else {
            continue;
        };
        update_channel_close_frame(dep_info, dep_global, frame, ctx.config.general.global_channel_close_timeout_frames);
        dep_info.raise_channel_close_frame(close_frame);

        if !dep_info.is_ready(dep_global.force_update_frame, frame) || dep_info.last_rep_frame == frame {
            continue;
        }
        if dep_global.torn_off {
            continue;
        }
        bits += replicate_single(ctx, dependent);
    }

    if discovery && !discovery_full {
        *ctx.discovery_queued_bits += bits;
        ctx.transport.refund_queued_bits(connection, bits);
        ctx.stats.discovery_bits += bits;
    }

    ctx.stats.bits_written += bits;
    bits
}

/// Raises the close frames of candidates that were not reached this tick so
/// their channels are not closed as stale.
pub(crate) fn handle_starved<W: ?Sized, T: ?Sized>(ctx: &mut SendContext<'_, W, T>, remaining: &[PrioritizedItem]) {
    let frame = ctx.frame;
    let global_timeout = ctx.config.general.global_channel_close_timeout_frames;
    for item in remaining {
        let Some(global) = ctx.objects.get(item.handle) else {
            continue;
        };
        let Some(info) = ctx.infos.find_or_add(item.handle, global) else {
            continue;
        };
        update_channel_close_frame(info, global, frame, global_timeout);
        let close_frame = info.channel_close_frame();

        for &dependent in &global.dependents {
            let Some(dep_global) = ctx.objects.get(dependent) else {
                continue;
            };
            if let Some(dep_info) = ctx.infos.find_or_add(dependent, dep_global) {
                update_channel_close_frame(dep_info, dep_global, frame, global_timeout);
                dep_info.raise_channel_close_frame(close_frame);
            }
        }
    }
}

/// Walks the sorted default list until the connection saturates.
///
/// Saturation is checked before every send, so a connection that starts the
/// tick saturated sends nothing.
pub(crate) fn replicate_prioritized<W, T>(ctx: &mut SendContext<'_, W, T>, items: &[PrioritizedItem]) -> i64
where
    W: ReplicationWorld + ?Sized,
    T: ReplicationTransport + ?Sized,
{
    let mut bits = 0;
    for (index, item) in items.iter().enumerate() {
        if ctx.transport.is_saturated(ctx.connection) {
            debug!(
                "🚦 {:?} saturated with {} of {} candidates left",
                ctx.connection,
                items.len() - index,
                items.len()
            );
            handle_starved(ctx, &items[index..]);
            ctx.transport.notify_saturated(ctx.connection);
            ctx.stats.saturations += 1;
            break;
        }

        // A handle gathered by more than one node is sent once.
        if ctx.infos.get(item.handle).is_some_and(|info| info.last_rep_frame == ctx.frame) {
            continue;
        }
        bits += replicate_single(ctx, item.handle);
    }
    bits
}

/// Consumes one frequency-scheduled batch against its own bit budget.
pub(crate) fn replicate_scheduled<W, T>(ctx: &mut SendContext<'_, W, T>, batch: &ScheduledBatch) -> i64
where
    W: ReplicationWorld + ?Sized,
    T: ReplicationTransport + ?Sized,
{
    let frame = ctx.frame;
    let mut quota = batch.load_balance_quota;
    let mut bits = 0;

    for item in &batch.items {
        let Some(global) = ctx.objects.get(item.handle) else {
            continue;
        };
        let force_update_frame = global.force_update_frame;
        let Some(info) = ctx.infos.get_mut(item.handle) else {
            continue;
        };
        if info.tear_off || info.last_rep_frame == frame {
            continue;
        }

        if quota > 0 && item.frames_till_replicate == 0 && !item.replicates_every_frame {
            quota -= 1;
            ctx.stats.load_balanced += 1;
            continue;
        }

        if ctx.transport.is_saturated(ctx.connection) {
            ctx.transport.notify_saturated(ctx.connection);
            ctx.stats.saturations += 1;
            break;
        }

        if info.is_ready(force_update_frame, frame) {
            bits += replicate_single(ctx, item.handle);
            ctx.stats.scheduled_sends += 1;
            if let Some(info) = ctx.infos.get_mut(item.handle) {
                info.fast_path_last_rep_frame = frame;
            }
        } else if item.enable_fast_path && info.is_fast_path_ready(force_update_frame, frame) {
            bits += crate::fast_shared::replicate_fast_shared(ctx, item.handle);
        }

        if bits > batch.max_bits {
            trace!("🚦 Scheduled batch on {:?} hit its {} bit budget", ctx.connection, batch.max_bits);
            ctx.transport.notify_saturated(ctx.connection);
            ctx.stats.saturations += 1;
            break;
        }
    }
    bits
}
