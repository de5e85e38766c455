// STREAMLINE TX — Sender
// Boot: parse → validate → C-state lock → pin + SCHED_FIFO → prepare payload
// → map backing file → prime → flush → handshake → transmit → summary.
// Everything before the handshake may be fatal; nothing after it is.

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use streamline::channel::datapath::transmit;
use streamline::channel::medium::SharedRegion;
use streamline::channel::timing::HardwareTiming;
use streamline::cli::ChannelArgs;
use streamline::coding::framing::Transmission;
use streamline::engine::protocol::CACHE_LINE;
use streamline::engine::runtime::{claim_core, fatal, lock_cstates, E_CONFIG, E_SHARED_MAP};
use streamline::sync::handshake::send_preamble;

/// Private lines the sender loads for a '1'. Never shared with the receiver.
const SCRATCH_WORDS: usize = 4 * CACHE_LINE as usize;

#[derive(Parser, Debug)]
#[command(name = "streamline-tx", version, about = "LLC covert channel sender")]
struct Cli {
    #[command(flatten)]
    channel: ChannelArgs,
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
    info!(
        bits = cfg.payload.bits,
        transmitted = cfg.transmitted_bits(),
        framing = ?cfg.payload.framing,
        coding = ?cfg.payload.line_coding,
        sync = ?cfg.sync,
        "sender configured"
    );

    lock_cstates();
    claim_core(cfg.placement.tx_core, cfg.placement.rt_priority);

    let tx = match Transmission::prepare(&cfg.payload) {
        Ok(t) => t,
        Err(e) => fatal(E_CONFIG, &e.to_string()),
    };
    let region = match SharedRegion::open(&cfg.file, cfg.offset_bytes(), &cfg.geometry) {
        Ok(r) => r,
        Err(e) => fatal(E_SHARED_MAP, &e.to_string()),
    };
    if let Err(e) = region.prime() {
        fatal(E_SHARED_MAP, &e.to_string());
    }
    let layout = region.layout(&cfg.geometry);
    info!(
        array_bytes = cfg.geometry.array_bytes(),
        array_lines = layout.array_lines(),
        "communication array primed"
    );

    let scratch = vec![0u64; SCRATCH_WORDS];
    let scratch_addr = scratch.as_ptr() as usize;

    // SAFETY: every address the channel touches is either inside `region`
    // (alive until the end of main) or inside `scratch` (likewise).
    let timing = unsafe { HardwareTiming::new() };
    layout.flush_array(&timing);
    layout.flush_registers(&timing);

    info!("sending preamble");
    let aligned = send_preamble(&timing, layout.handshake_line(), &cfg.handshake);
    let log = transmit(&timing, &layout, scratch_addr, &tx.symbols, &cfg, aligned);
    std::hint::black_box(&scratch);

    let cycles = log.end.wrapping_sub(log.start);
    info!(
        bits = log.bits,
        cycles,
        cycles_per_bit = cycles / log.bits.max(1),
        heartbeats = log.heartbeats.len(),
        barriers = log.barriers.len(),
        "transmission complete"
    );
    let timeouts: Vec<_> = log.barriers.iter().filter(|b| b.timed_out).collect();
    if !timeouts.is_empty() {
        warn!(count = timeouts.len(), rounds = log.barriers.len(), "barrier rounds timed out");
        for b in timeouts {
            debug!(bit = b.bit_index, waited = b.duration(), polls = b.polls, "barrier timeout");
        }
    }
}
