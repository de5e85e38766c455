// STREAMLINE — CHANNEL: DATAPATH
// Steady-state loops. One bit per iteration, no logging, no allocation: every
// buffer is sized before the first bit and the summary is built afterwards.
//
// Sender per bit:   load select(scratch, slot(i), symbol), re-touch the slot
//                   `access_lag` bits back, heartbeat, maybe sync.
// Receiver per bit: timed load of slot(i), record, heartbeat, maybe sync.
// Polarity:         symbol 0 warms the shared slot → receiver hit → 0.
//                   symbol 1 warms private scratch → receiver miss → 1.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use bytemuck::{Pod, Zeroable};
use serde::Serialize;

use crate::channel::medium::ChannelLayout;
use crate::channel::timing::{is_hit, select, TimingSource};
use crate::engine::protocol::{ChannelConfig, HEARTBEAT_BITS};
use crate::engine::typestate::{is_heartbeat, should_retouch, Aligned, Rx, SyncState, Tx};
use crate::error::ChannelError;
use crate::sync::barrier::{rx_sync_point, tx_sync_point, BarrierRecord};

/// One receiver observation. Written verbatim by `dump_samples`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SampleRecord {
    pub latency: u64,
    pub timestamp: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LatencyTally {
    pub hits: u64,
    pub misses: u64,
    /// Samples at or above the outlier bound. Kept in the trace, left out here.
    pub outliers: u64,
}

#[derive(Clone, Debug)]
pub struct TransmitLog {
    pub aligned_at: u64,
    pub start: u64,
    pub end: u64,
    pub bits: u64,
    pub heartbeats: Vec<u64>,
    pub barriers: Vec<BarrierRecord>,
}

#[derive(Clone, Debug)]
pub struct ReceiveLog {
    pub aligned_at: u64,
    pub start: u64,
    pub end: u64,
    pub samples: Vec<SampleRecord>,
    pub tally: LatencyTally,
    pub heartbeats: Vec<u64>,
    pub barriers: Vec<BarrierRecord>,
}

fn barrier_capacity(bits: u64, cfg: &ChannelConfig) -> usize {
    (bits / cfg.barrier.period.max(1) + 1) as usize
}

pub fn transmit<T: TimingSource>(
    timing: &T,
    layout: &ChannelLayout,
    scratch: usize,
    symbols: &[bool],
    cfg: &ChannelConfig,
    aligned: Aligned,
) -> TransmitLog {
    let n = symbols.len() as u64;
    let lag = cfg.stream.access_lag;
    let mut st: SyncState<Tx> = SyncState::new();
    let mut heartbeats = Vec::with_capacity((n / HEARTBEAT_BITS) as usize + 1);
    let mut barriers = Vec::with_capacity(barrier_capacity(n, cfg));

    let start = timing.now();
    while st.bit_index < n {
        let i = st.bit_index;
        timing.touch(select(scratch, layout.slot_address(i), symbols[i as usize]));
        if should_retouch(i, lag) {
            let j = i - lag;
            timing.touch(select(scratch, layout.slot_address(j), symbols[j as usize]));
        }
        if is_heartbeat(i) { heartbeats.push(timing.now()); }
        st.advance();
        if st.at_sync_point(&cfg.barrier) {
            if let Some(rec) = tx_sync_point(timing, layout, cfg, i) {
                st.record_round(rec.timed_out);
                barriers.push(rec);
            }
        }
    }
    let end = timing.now();
    TransmitLog { aligned_at: aligned.at(), start, end, bits: n, heartbeats, barriers }
}

pub fn receive<T: TimingSource>(
    timing: &T,
    layout: &ChannelLayout,
    bits: u64,
    cfg: &ChannelConfig,
    aligned: Aligned,
) -> ReceiveLog {
    let mut samples = vec![SampleRecord::zeroed(); bits as usize];
    let mut tally = LatencyTally::default();
    let mut st: SyncState<Rx> = SyncState::new();
    let mut heartbeats = Vec::with_capacity((bits / HEARTBEAT_BITS) as usize + 1);
    let mut barriers = Vec::with_capacity(barrier_capacity(bits, cfg));
    let threshold = cfg.thresholds.stream;
    let outlier_bound = cfg.thresholds.outlier_bound;

    // Let the sender get ahead before the first sample.
    timing.delay(cfg.stream.rx_start_delay);

    let start = timing.now();
    while st.bit_index < bits {
        let i = st.bit_index;
        let addr = layout.slot_address(i);
        let timestamp = timing.now();
        let latency = timing.measure(addr);
        samples[i as usize] = SampleRecord { latency, timestamp };
        if latency >= outlier_bound {
            tally.outliers += 1;
        } else if is_hit(latency, threshold) {
            tally.hits += 1;
        } else {
            tally.misses += 1;
        }
        if is_heartbeat(i) { heartbeats.push(timing.now()); }
        st.advance();
        if st.at_sync_point(&cfg.barrier) {
            if let Some(rec) = rx_sync_point(timing, layout, cfg, i) {
                st.record_round(rec.timed_out);
                barriers.push(rec);
            }
        }
    }
    let end = timing.now();
    ReceiveLog { aligned_at: aligned.at(), start, end, samples, tally, heartbeats, barriers }
}

/// Decode the trace: a miss (latency above threshold) is 1, a hit is 0.
/// Outliers are classified like everything else.
pub fn classify(samples: &[SampleRecord], threshold: u64) -> Vec<bool> {
    samples.iter().map(|s| !is_hit(s.latency, threshold)).collect()
}

/// Write the raw trace as native-endian (latency, timestamp) u64 pairs.
pub fn dump_samples(path: &Path, samples: &[SampleRecord]) -> Result<(), ChannelError> {
    let bytes: &[u8] = bytemuck::cast_slice(samples);
    File::create(path)
        .and_then(|mut f| f.write_all(bytes))
        .map_err(|source| ChannelError::Output { path: path.to_path_buf(), source })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::sim::{SimCache, SimTiming, SIM_HIT_CYCLES, SIM_MISS_CYCLES};
    use crate::engine::protocol::SyncStrategy;

    const SCRATCH: usize = 0x40;

    fn loopback_cfg() -> ChannelConfig {
        let mut cfg = ChannelConfig::default();
        cfg.sync = SyncStrategy::None;
        cfg.stream.rx_start_delay = 0;
        cfg
    }

    fn layout(cfg: &ChannelConfig) -> ChannelLayout {
        ChannelLayout::new(0x1000_0000, &cfg.geometry)
    }

    #[test]
    fn polarity_round_trip_over_sim() {
        let cfg = loopback_cfg();
        let l = layout(&cfg);
        let t = SimTiming::new(SimCache::new());
        let symbols: Vec<bool> = (0..3000).map(|i| (i * 7) % 5 < 2).collect();
        let tx = transmit(&t, &l, SCRATCH, &symbols, &cfg, Aligned::assume(0));
        let rx = receive(&t, &l, symbols.len() as u64, &cfg, Aligned::assume(0));
        assert_eq!(tx.bits, 3000);
        assert_eq!(classify(&rx.samples, cfg.thresholds.stream), symbols);
        let zeros = symbols.iter().filter(|s| !**s).count() as u64;
        assert_eq!(rx.tally.hits, zeros);
        assert_eq!(rx.tally.misses, 3000 - zeros);
    }

    #[test]
    fn access_lag_only_rewarms_zero_slots() {
        let mut cfg = loopback_cfg();
        cfg.stream.access_lag = 10;
        let l = layout(&cfg);
        let t = SimTiming::new(SimCache::new());
        let symbols: Vec<bool> = (0..100).map(|i| i % 2 == 1).collect();
        transmit(&t, &l, SCRATCH, &symbols, &cfg, Aligned::assume(0));
        for (i, s) in symbols.iter().enumerate() {
            assert_eq!(t.cache().is_resident(l.slot_address(i as u64)), !*s, "bit {}", i);
        }
    }

    #[test]
    fn classification_matches_threshold() {
        let samples = [
            SampleRecord { latency: 60, timestamp: 0 },
            SampleRecord { latency: 180, timestamp: 1 },
            SampleRecord { latency: 181, timestamp: 2 },
            SampleRecord { latency: 5000, timestamp: 3 },
        ];
        assert_eq!(classify(&samples, 180), vec![false, false, true, true]);
    }

    #[test]
    fn heartbeats_every_thousand_bits() {
        let cfg = loopback_cfg();
        let l = layout(&cfg);
        let t = SimTiming::new(SimCache::new());
        let tx = transmit(&t, &l, SCRATCH, &vec![false; 2500], &cfg, Aligned::assume(0));
        assert_eq!(tx.heartbeats.len(), 2);
        assert!(tx.heartbeats[0] < tx.heartbeats[1]);
        let rx = receive(&t, &l, 2500, &cfg, Aligned::assume(0));
        assert_eq!(rx.heartbeats.len(), 2);
        assert!(rx.start <= rx.samples[0].timestamp && rx.samples[2499].timestamp <= rx.end);
    }

    #[test]
    fn lone_sides_record_timed_out_barriers() {
        let mut cfg = loopback_cfg();
        cfg.sync = SyncStrategy::FlushReload;
        cfg.barrier.period = 1000;
        cfg.barrier.rx_lead = 100;
        cfg.barrier.rx_timeout = 5000;
        cfg.barrier.tx_timeout = 5000;
        let l = layout(&cfg);
        let t = SimTiming::new(SimCache::new());
        let tx = transmit(&t, &l, SCRATCH, &vec![true; 2500], &cfg, Aligned::assume(0));
        assert_eq!(tx.barriers.iter().map(|b| b.bit_index).collect::<Vec<_>>(), vec![999, 1999]);
        assert!(tx.barriers.iter().all(|b| b.timed_out));
        let rx = receive(&t, &l, 2500, &cfg, Aligned::assume(0));
        assert_eq!(rx.barriers.iter().map(|b| b.bit_index).collect::<Vec<_>>(), vec![900, 1900]);
        assert!(rx.barriers.iter().all(|b| b.timed_out));
    }

    #[test]
    fn outliers_are_kept_but_not_tallied() {
        struct Slow;
        impl TimingSource for Slow {
            fn now(&self) -> u64 { 0 }
            fn evict(&self, _a: usize) {}
            fn touch(&self, _a: usize) {}
            fn measure(&self, _a: usize) -> u64 { 5000 }
            fn delay(&self, _c: u64) {}
        }
        let cfg = loopback_cfg();
        let rx = receive(&Slow, &layout(&cfg), 10, &cfg, Aligned::assume(0));
        assert_eq!(rx.tally, LatencyTally { hits: 0, misses: 0, outliers: 10 });
        assert!(rx.samples.iter().all(|s| s.latency == 5000));
    }

    #[test]
    fn dump_writes_pairs() {
        let samples = vec![
            SampleRecord { latency: SIM_HIT_CYCLES, timestamp: 10 },
            SampleRecord { latency: SIM_MISS_CYCLES, timestamp: 20 },
        ];
        let path = std::env::temp_dir().join(format!("streamline-dump-{}", std::process::id()));
        dump_samples(&path, &samples).unwrap();
        let raw = std::fs::read(&path).unwrap();
        assert_eq!(raw.len(), 32);
        assert_eq!(u64::from_ne_bytes(raw[16..24].try_into().unwrap()), SIM_MISS_CYCLES);
        std::fs::remove_file(path).unwrap();
    }
}
