// STREAMLINE RX — Receiver
// Boot: parse → validate → C-state lock → pin + SCHED_FIFO → TSC calibration
// → prepare expected payload → map backing file → prime → flush registers →
// wait for preamble → receive → classify → analyse → report.
// --loopback swaps the hardware for the simulated cache and skips the boot.

use std::path::Path;

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use streamline::analysis::RunReport;
use streamline::channel::datapath::{classify, dump_samples, receive, ReceiveLog};
use streamline::channel::medium::SharedRegion;
use streamline::channel::sim::loopback;
use streamline::channel::timing::HardwareTiming;
use streamline::cli::{ChannelArgs, ReportArgs};
use streamline::coding::framing::Transmission;
use streamline::engine::protocol::ChannelConfig;
use streamline::engine::runtime::{
    calibrate_tsc, claim_core, fatal, lock_cstates, E_CONFIG, E_OUTPUT_WRITE, E_SHARED_MAP,
};
use streamline::sync::handshake::await_preamble;

#[derive(Parser, Debug)]
#[command(name = "streamline-rx", version, about = "LLC covert channel receiver")]
struct Cli {
    #[command(flatten)]
    channel: ChannelArgs,
    #[command(flatten)]
    report: ReportArgs,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = match cli.channel.into_config() {
        Ok(c) => c,
        Err(e) => fatal(E_CONFIG, &e.to_string()),
    };
    let noise = match cli.report.noise() {
        Ok(n) => n,
        Err(e) => fatal(E_CONFIG, &e.to_string()),
    };
    let tx = match Transmission::prepare(&cfg.payload) {
        Ok(t) => t,
        Err(e) => fatal(E_CONFIG, &e.to_string()),
    };
    info!(
        bits = cfg.payload.bits,
        transmitted = tx.len(),
        framing = ?cfg.payload.framing,
        coding = ?cfg.payload.line_coding,
        sync = ?cfg.sync,
        loopback = cli.report.loopback,
        "receiver configured"
    );

    let (log, mhz) = if cli.report.loopback {
        let (_, rx) = loopback(&cfg, &tx.symbols, noise);
        (rx, cfg.placement.cpu_mhz)
    } else {
        run_hardware(&cfg, tx.len() as u64)
    };

    let rx_symbols = classify(&log.samples, cfg.thresholds.stream);
    let report = RunReport::build(&cfg.payload, &tx, &log, &rx_symbols, mhz, cfg.barrier.rx_timeout);

    if report.sync.timeouts > 0 {
        warn!(count = report.sync.timeouts, rounds = report.sync.rounds, "barrier rounds timed out");
        for r in &report.sync.timed_out {
            debug!(bit = r.bit_index, waited = r.delay, "barrier timeout");
        }
    }

    if cli.report.json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{}", s),
            Err(e) => fatal(E_OUTPUT_WRITE, &e.to_string()),
        }
    } else {
        println!("{}", report);
        if cli.report.epochs {
            print!("{}", report.render_epochs());
        }
    }

    if let Some(path) = &cli.report.results_file {
        write_or_die(report.append_results(path), path);
    }
    if let Some(path) = &cli.report.dump_samples {
        write_or_die(dump_samples(path, &log.samples), path);
    }
}

/// Map, pin, handshake, and sample. Returns the log and the clock in MHz.
fn run_hardware(cfg: &ChannelConfig, bits: u64) -> (ReceiveLog, f64) {
    lock_cstates();
    claim_core(cfg.placement.rx_core, cfg.placement.rt_priority);
    let cal = calibrate_tsc();
    let mhz = match cal.mhz() {
        Some(m) => m,
        None => {
            warn!(cpu_mhz = cfg.placement.cpu_mhz, "no calibrated TSC, using configured clock");
            cfg.placement.cpu_mhz
        }
    };

    let region = match SharedRegion::open(&cfg.file, cfg.offset_bytes(), &cfg.geometry) {
        Ok(r) => r,
        Err(e) => fatal(E_SHARED_MAP, &e.to_string()),
    };
    if let Err(e) = region.prime() {
        fatal(E_SHARED_MAP, &e.to_string());
    }
    let layout = region.layout(&cfg.geometry);

    // SAFETY: every address the channel touches lies inside `region`, which
    // outlives `timing`.
    let timing = unsafe { HardwareTiming::new() };
    layout.flush_registers(&timing);

    info!("waiting for preamble");
    let hs = match await_preamble(&timing, layout.handshake_line(), &cfg.handshake, &cfg.thresholds, None) {
        Some(h) => h,
        None => fatal(E_CONFIG, "handshake listener returned without a preamble"),
    };
    info!(slots = hs.bits_observed, outliers = hs.outliers, "handshake complete");

    let log = receive(&timing, &layout, bits, cfg, hs.aligned);
    info!(
        samples = log.samples.len(),
        hits = log.tally.hits,
        misses = log.tally.misses,
        outliers = log.tally.outliers,
        heartbeats = log.heartbeats.len(),
        "reception complete"
    );
    (log, mhz)
}

fn write_or_die<E: std::fmt::Display>(r: Result<(), E>, path: &Path) {
    match r {
        Ok(()) => info!(path = %path.display(), "written"),
        Err(e) => fatal(E_OUTPUT_WRITE, &e.to_string()),
    }
}
