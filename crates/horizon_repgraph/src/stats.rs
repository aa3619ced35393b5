//! Replication counters.
//!
//! [`TickStats`] is filled during one tick; [`GraphStats`] keeps running
//! totals and the most recent tick. Both serialize so a host can log them as
//! JSON.

use crate::types::Frame;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickStats {
    pub frame: Frame,
    pub connections: usize,
    /// Handles gathered across every lane, duplicates included
    pub candidates: usize,
    pub scored: usize,
    pub culled: usize,
    pub sends: u64,
    pub bits_written: i64,
    pub saturations: u64,
    pub channel_opens: u64,
    pub channel_open_failures: u64,
    pub channel_closes: u64,
    pub fast_shared_sends: u64,
    pub fast_shared_bits: i64,
    pub fast_shared_builds: u64,
    pub discovery_bits: i64,
    pub scheduled_sends: u64,
    pub load_balanced: u64,
    pub destruction_infos_sent: u64,
    pub grid_rebuilds: u64,
}

impl TickStats {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            ..Self::default()
        }
    }

    fn accumulate_into(&self, totals: &mut TickStats) {
        totals.frame = self.frame;
        totals.connections = self.connections;
        totals.candidates += self.candidates;
        totals.scored += self.scored;
        totals.culled += self.culled;
        totals.sends += self.sends;
        totals.bits_written += self.bits_written;
        totals.saturations += self.saturations;
        totals.channel_opens += self.channel_opens;
        totals.channel_open_failures += self.channel_open_failures;
        totals.channel_closes += self.channel_closes;
        totals.fast_shared_sends += self.fast_shared_sends;
        totals.fast_shared_bits += self.fast_shared_bits;
        totals.fast_shared_builds += self.fast_shared_builds;
        totals.discovery_bits += self.discovery_bits;
        totals.scheduled_sends += self.scheduled_sends;
        totals.load_balanced += self.load_balanced;
        totals.destruction_infos_sent += self.destruction_infos_sent;
        totals.grid_rebuilds += self.grid_rebuilds;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub ticks: u64,
    /// Calls to `tick` that did not replicate (paused or throttled)
    pub skipped_ticks: u64,
    pub objects: usize,
    pub connections: usize,
    pub last_tick: TickStats,
    pub totals: TickStats,
}

impl GraphStats {
    pub fn record(&mut self, tick: TickStats) {
        self.ticks += 1;
        tick.accumulate_into(&mut self.totals);
        self.last_tick = tick;
    }

    pub fn record_skipped(&mut self) {
        self.skipped_ticks += 1;
    }

    /// Average bits written per replicated tick.
    pub fn average_bits_per_tick(&self) -> f64 {
        if self.ticks == 0 {
            0.0
        } else {
            self.totals.bits_written as f64 / self.ticks as f64
        }
    }
}
