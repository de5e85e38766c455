// STREAMLINE — INTEGRATION TESTS
// Full pipelines over the simulated cache: prepare → transmit → receive →
// classify → analyse, plus the two-sided barrier with real threads.
// No mapping, no pinning, no TSC: SimTiming stands in for the LLC.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use streamline::analysis::{analyze, RunReport};
use streamline::channel::datapath::{classify, receive, transmit};
use streamline::channel::medium::ChannelLayout;
use streamline::channel::sim::{loopback, SimCache, SimTiming};
use streamline::channel::timing::TimingSource;
use streamline::coding::framing::{generate_payload, Transmission};
use streamline::engine::protocol::*;
use streamline::sync::barrier::{rx_rendezvous, tx_rendezvous};

const BASE: usize = 0x1000_0000;
const SCRATCH: usize = 0x40;

fn sim_config(bits: u64, framing: Framing, coding: LineCoding) -> ChannelConfig {
    let mut cfg = ChannelConfig::default();
    cfg.payload = PayloadSpec { kind: PayloadKind::Random, bits, framing, line_coding: coding };
    cfg.sync = SyncStrategy::None;
    cfg.stream.rx_start_delay = 0;
    cfg
}

/// Run both loops back to back on one SimTiming and classify the trace.
fn run(cfg: &ChannelConfig, tx: &Transmission, timing: &SimTiming) -> Vec<bool> {
    let layout = ChannelLayout::new(BASE, &cfg.geometry);
    let aligned = timing.align();
    transmit(timing, &layout, SCRATCH, &tx.symbols, cfg, aligned);
    let log = receive(timing, &layout, tx.len() as u64, cfg, aligned);
    classify(&log.samples, cfg.thresholds.stream)
}

#[test]
fn zeros_with_fec_over_all_hit_channel() {
    // Zeros keep the parity at zero, so the sender touches every slot and
    // every receiver load hits.
    let cfg = sim_config(64, Framing::Secded, LineCoding::Plain);
    let tx = Transmission::prepare(&PayloadSpec { kind: PayloadKind::Zeros, ..cfg.payload.clone() }).unwrap();
    assert_eq!(tx.len(), 72);
    assert!(tx.symbols.iter().all(|s| !s));
    let (_, log) = loopback(&cfg, &tx.symbols, None);
    assert_eq!(log.tally.hits, 72);
    let rx = classify(&log.samples, cfg.thresholds.stream);
    let r = analyze(&tx, &rx, Framing::Secded, LineCoding::Plain);
    assert_eq!(r.blocks.clean, 1);
    assert_eq!(r.blocks.total(), 1);
    assert_eq!(r.ber_pct(), 0.0);
    assert_eq!(r.fec_corrected + r.fec_detected, 0);
}

#[test]
fn whitened_fec_round_trip_over_sim() {
    let coding = LineCoding::Keystream { seed: KEYSTREAM_SEED, period: 500 };
    let cfg = sim_config(640, Framing::Secded, coding);
    let tx = Transmission::prepare(&cfg.payload).unwrap();
    let rx = run(&cfg, &tx, &SimTiming::new(SimCache::new()));
    assert_eq!(rx, tx.symbols);
    let r = analyze(&tx, &rx, Framing::Secded, coding);
    assert_eq!(r.decoded, tx.payload);
    assert_eq!(r.blocks.clean, 10);
    assert_eq!(r.symbol_correct_pct(), 100.0);
}

#[test]
fn five_percent_symbol_errors_plain_framing() {
    let payload = generate_payload(PayloadKind::Random, 640);
    let tx = Transmission::from_payload(payload, Framing::Plain, LineCoding::Plain).unwrap();
    let mut rx = tx.symbols.clone();
    // 32 flips, one per 20 bits: two per 64-bit block except where a block
    // boundary splits them.
    for i in (0..640).step_by(20) { rx[i] = !rx[i]; }
    let r = analyze(&tx, &rx, Framing::Plain, LineCoding::Plain);
    assert_eq!(r.symbols, 640);
    assert_eq!(r.symbols - r.symbols_correct, 32);
    assert!((r.ber_pct() - 5.0).abs() < 1e-9);
    assert_eq!(r.blocks.total(), 10);
    assert_eq!(r.blocks.clean, 0);
    assert!((r.single_bit_pct() + r.multi_bit_pct() - 5.0).abs() < 1e-9);
    assert_eq!(r.one_to_zero + r.zero_to_one, 32);
}

#[test]
fn noisy_loopback_reports_errors_within_bounds() {
    let coding = LineCoding::Keystream { seed: KEYSTREAM_SEED, period: 200_000 };
    let cfg = sim_config(6400, Framing::Plain, coding);
    let tx = Transmission::prepare(&cfg.payload).unwrap();
    let (tx_log, rx_log) = loopback(&cfg, &tx.symbols, Some(0.05));
    assert_eq!(tx_log.bits, 6400);
    let rx = classify(&rx_log.samples, cfg.thresholds.stream);
    let report = RunReport::build(&cfg.payload, &tx, &rx_log, &rx, 1000.0, cfg.barrier.rx_timeout);
    let ber = report.errors.ber_pct();
    assert!(ber > 2.0 && ber < 8.0, "ber {}", ber);
    assert_eq!(report.epochs.len(), 7);
    assert!(report.throughput.bits_per_second > 0.0);
    // Results line carries the seven plot columns.
    assert_eq!(report.results_line().split_whitespace().count(), 7);
    assert!(report.to_string().contains("Bit period"));
}

#[test]
fn noiseless_loopback_is_exact() {
    let cfg = sim_config(1024, Framing::Secded, LineCoding::Plain);
    let tx = Transmission::prepare(&PayloadSpec { kind: PayloadKind::Ones, ..cfg.payload.clone() }).unwrap();
    let (_, rx_log) = loopback(&cfg, &tx.symbols, None);
    let rx = classify(&rx_log.samples, cfg.thresholds.stream);
    let r = analyze(&tx, &rx, Framing::Secded, LineCoding::Plain);
    assert_eq!(r.data_correct, 1024);
    assert_eq!(rx_log.tally.hits + rx_log.tally.misses, 1152);
}

#[test]
fn threaded_barrier_rendezvous_completes() {
    let cache = SimCache::new();
    let geometry = ChannelConfig::default().geometry;
    let layout = ChannelLayout::new(BASE, &geometry);
    let params = BarrierParams {
        period: 1000,
        rx_lead: 100,
        poll_sleep: 10,
        rx_timeout: 50_000_000,
        tx_timeout: 50_000_000,
        arrival_votes: DEFAULT_ARRIVAL_VOTES,
        exit_hits: DEFAULT_EXIT_HITS,
    };

    // The receiver goes back to loading its own lines after the rendezvous,
    // the way it would keep running between barriers, until the sender leaves.
    let sender_done = Arc::new(AtomicBool::new(false));
    let rx_timing = SimTiming::new(Arc::clone(&cache));
    let rx_layout = layout;
    let rx_params = params.clone();
    let rx_done = Arc::clone(&sender_done);
    let rx = thread::spawn(move || {
        let rec = rx_rendezvous(&rx_timing, &rx_layout, &rx_params, DEFAULT_HIT_THRESHOLD, 900);
        while !rx_done.load(Ordering::Acquire) {
            for a in rx_layout.rx_ready() { rx_timing.touch(a); }
            thread::yield_now();
        }
        rec
    });

    let tx_timing = SimTiming::new(cache);
    let tx_rec = tx_rendezvous(&tx_timing, &layout, &params, DEFAULT_HIT_THRESHOLD, 999);
    sender_done.store(true, Ordering::Release);
    let rx_rec = rx.join().unwrap();

    assert!(!tx_rec.timed_out, "sender timed out after {} polls", tx_rec.polls);
    assert!(!rx_rec.timed_out, "receiver timed out after {} polls", rx_rec.polls);
    assert!(rx_rec.reached <= rx_rec.arrived && rx_rec.arrived <= rx_rec.completed);
}
