// STREAMLINE — SYNC: PERIODIC BARRIER RENDEZVOUS
// Flush+Reload rendezvous on the six ready registers, three per direction.
// The receiver arrives first (it leads by `rx_lead` bits), waits for the
// sender's registers to turn hot, then keeps loading its own registers until
// the sender stops flushing them. The sender flushes the receiver's registers,
// touches its own, and leaves once the receiver's registers read hot.
//
// No counters cross the channel; only the rendezvous event does.
// Both sides are bounded: rx by `rx_timeout`, tx by `tx_timeout`.

use serde::Serialize;

use crate::channel::medium::ChannelLayout;
use crate::channel::timing::{is_hit, TimingSource};
use crate::engine::protocol::{BarrierParams, ChannelConfig, SyncStrategy};

/// One rendezvous as seen by one side. Timestamps are raw cycle counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BarrierRecord {
    /// Loop bit after which the barrier was entered.
    pub bit_index: u64,
    pub reached: u64,
    /// Peer detected (equals `completed` on the sender and on timeout).
    pub arrived: u64,
    pub completed: u64,
    pub timed_out: bool,
    /// Evict/sleep/reload rounds spent waiting for the peer.
    pub polls: u64,
}

impl BarrierRecord {
    pub fn duration(&self) -> u64 { self.completed.wrapping_sub(self.reached) }
}

/// Timed reload of three registers; returns how many were cache hits.
#[inline]
pub fn tally_hits<T: TimingSource>(timing: &T, regs: &[usize; 3], threshold: u64) -> u32 {
    // Measure all three before classifying so the loads stay back to back.
    let lat = [timing.measure(regs[0]), timing.measure(regs[1]), timing.measure(regs[2])];
    lat.iter().map(|l| is_hit(*l, threshold) as u32).sum()
}

pub fn rx_rendezvous<T: TimingSource>(
    timing: &T,
    layout: &ChannelLayout,
    params: &BarrierParams,
    threshold: u64,
    bit_index: u64,
) -> BarrierRecord {
    let tx = layout.tx_ready();
    let rx = layout.rx_ready();
    let reached = timing.now();
    // Own registers start cold.
    for a in rx { timing.evict(a); }

    // Phase 1: wait for the sender's registers to turn hot.
    let mut votes = 0u32;
    let mut polls = 0u64;
    let mut timed_out = false;
    loop {
        for a in tx { timing.evict(a); }
        timing.delay(params.poll_sleep);
        votes += tally_hits(timing, &tx, threshold);
        polls += 1;
        if votes >= params.arrival_votes { break; }
        if polls * params.poll_sleep > params.rx_timeout {
            timed_out = true;
            break;
        }
    }
    let arrived = timing.now();
    if timed_out {
        return BarrierRecord { bit_index, reached, arrived, completed: arrived, timed_out, polls };
    }

    // Phase 2: the sender flushes our registers while it waits for us; once
    // they stay hot it has left.
    timing.serialize();
    let mut hits = 0u32;
    while hits < params.exit_hits {
        hits += tally_hits(timing, &rx, threshold);
        if timing.now().wrapping_sub(arrived) > params.rx_timeout {
            timed_out = true;
            break;
        }
    }
    BarrierRecord { bit_index, reached, arrived, completed: timing.now(), timed_out, polls }
}

pub fn tx_rendezvous<T: TimingSource>(
    timing: &T,
    layout: &ChannelLayout,
    params: &BarrierParams,
    threshold: u64,
    bit_index: u64,
) -> BarrierRecord {
    let tx = layout.tx_ready();
    let rx = layout.rx_ready();
    let reached = timing.now();

    let mut hits = 0u32;
    let mut polls = 0u64;
    let mut timed_out = false;
    loop {
        for a in rx { timing.evict(a); }
        for a in tx { timing.touch(a); }
        timing.delay(params.poll_sleep);
        hits += tally_hits(timing, &rx, threshold);
        polls += 1;
        if hits >= params.arrival_votes { break; }
        if polls * params.poll_sleep > params.tx_timeout {
            timed_out = true;
            break;
        }
    }
    let completed = timing.now();
    BarrierRecord { bit_index, reached, arrived: completed, completed, timed_out, polls }
}

/// Sender side of a sync point under the configured strategy.
pub fn tx_sync_point<T: TimingSource>(
    timing: &T,
    layout: &ChannelLayout,
    cfg: &ChannelConfig,
    bit_index: u64,
) -> Option<BarrierRecord> {
    match cfg.sync {
        SyncStrategy::FlushReload => {
            Some(tx_rendezvous(timing, layout, &cfg.barrier, cfg.thresholds.barrier, bit_index))
        }
        SyncStrategy::StaticDelay { cycles } => {
            timing.delay(cycles);
            None
        }
        SyncStrategy::None => None,
    }
}

/// Receiver side of a sync point. Only the barrier strategy involves it.
pub fn rx_sync_point<T: TimingSource>(
    timing: &T,
    layout: &ChannelLayout,
    cfg: &ChannelConfig,
    bit_index: u64,
) -> Option<BarrierRecord> {
    match cfg.sync {
        SyncStrategy::FlushReload => {
            Some(rx_rendezvous(timing, layout, &cfg.barrier, cfg.thresholds.barrier, bit_index))
        }
        SyncStrategy::StaticDelay { .. } | SyncStrategy::None => None,
    }
}

// ============================================================================
// TESTS
// ============================================================================
