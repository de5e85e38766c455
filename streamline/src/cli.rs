// STREAMLINE — COMMAND LINE
// One argument surface for both binaries. Every flag has a STREAMLINE_* env
// twin so scripted sweeps can pin the shared parameters once and vary the rest.
// into_config() is the only way to a ChannelConfig from the outside and always
// ends in ChannelConfig::validate().

use std::path::PathBuf;

use clap::{Args, ValueEnum};

use crate::engine::protocol::*;
use crate::error::ConfigError;

/// Parse decimal or 0x-prefixed hex.
pub fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.trim().replace('_', "");
    let r = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse::<u64>(),
    };
    r.map_err(|e| format!("{}: {}", s, e))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SyncMode {
    FlushReload,
    StaticDelay,
    None,
}

#[derive(Args, Clone, Debug)]
pub struct ChannelArgs {
    /// Backing file both sides map read-only.
    #[arg(short = 'f', long, env = "STREAMLINE_FILE", default_value = DEFAULT_FILE)]
    pub file: PathBuf,

    /// Offset into the backing file, in cache blocks.
    #[arg(short = 'o', long, env = "STREAMLINE_OFFSET", default_value_t = 0, value_parser = parse_u64)]
    pub offset: u64,

    /// Handshake bit interval in cycles.
    #[arg(short = 'i', long, env = "STREAMLINE_SYNC_INTERVAL", default_value_t = DEFAULT_SYNC_INTERVAL, value_parser = parse_u64)]
    pub sync_interval: u64,

    /// Counter bits that form the handshake slot clock.
    #[arg(short = 's', long, env = "STREAMLINE_SYNC_TIMEMASK", default_value_t = DEFAULT_SYNC_TIMEMASK, value_parser = parse_u64)]
    pub sync_timemask: u64,

    #[arg(long, env = "STREAMLINE_SYNC_JITTER", default_value_t = DEFAULT_SYNC_JITTER, value_parser = parse_u64)]
    pub sync_jitter: u64,

    #[arg(long, env = "STREAMLINE_PREAMBLE_PAIRS", default_value_t = DEFAULT_PREAMBLE_PAIRS)]
    pub preamble_pairs: u32,

    /// Payload bits, before FEC expansion.
    #[arg(short = 'n', long, env = "STREAMLINE_BITS", value_parser = parse_u64)]
    pub bits: u64,

    #[arg(long, env = "STREAMLINE_PAYLOAD", value_enum, default_value_t = PayloadKind::Random)]
    pub payload: PayloadKind,

    /// Frame the payload as SECDED(72,64) codewords.
    #[arg(long, env = "STREAMLINE_FEC")]
    pub fec: bool,

    /// Send framed bits without the keystream.
    #[arg(long, env = "STREAMLINE_NO_WHITENING")]
    pub no_whitening: bool,

    /// Keystream reseed period; defaults to the barrier period.
    #[arg(long, env = "STREAMLINE_KEYSTREAM_PERIOD", value_parser = parse_u64)]
    pub keystream_period: Option<u64>,

    #[arg(long, env = "STREAMLINE_SYNC", value_enum, default_value_t = SyncMode::FlushReload)]
    pub sync: SyncMode,

    /// Sender stall per sync point under --sync static-delay.
    #[arg(long, env = "STREAMLINE_STATIC_DELAY", default_value_t = DEFAULT_STATIC_DELAY, value_parser = parse_u64)]
    pub static_delay: u64,

    #[arg(long, env = "STREAMLINE_HANDSHAKE_THRESHOLD", default_value_t = DEFAULT_HIT_THRESHOLD)]
    pub handshake_threshold: u64,

    #[arg(long, env = "STREAMLINE_BARRIER_THRESHOLD", default_value_t = DEFAULT_HIT_THRESHOLD)]
    pub barrier_threshold: u64,

    #[arg(long, env = "STREAMLINE_STREAM_THRESHOLD", default_value_t = DEFAULT_HIT_THRESHOLD)]
    pub stream_threshold: u64,

    /// Samples at or above this latency are outliers.
    #[arg(long, env = "STREAMLINE_OUTLIER_BOUND", default_value_t = DEFAULT_OUTLIER_BOUND)]
    pub outlier_bound: u64,

    /// Bits between barrier rendezvous.
    #[arg(long, env = "STREAMLINE_BARRIER_PERIOD", default_value_t = DEFAULT_BARRIER_PERIOD, value_parser = parse_u64)]
    pub barrier_period: u64,

    /// Bits by which the receiver enters the barrier early.
    #[arg(long, env = "STREAMLINE_RX_LEAD", default_value_t = DEFAULT_RX_LEAD, value_parser = parse_u64)]
    pub rx_lead: u64,

    #[arg(long, env = "STREAMLINE_BARRIER_SLEEP", default_value_t = DEFAULT_BARRIER_SLEEP, value_parser = parse_u64)]
    pub barrier_sleep: u64,

    #[arg(long, env = "STREAMLINE_RX_TIMEOUT", default_value_t = DEFAULT_RX_TIMEOUT, value_parser = parse_u64)]
    pub rx_timeout: u64,

    /// Defaults to ten receiver timeouts.
    #[arg(long, env = "STREAMLINE_TX_TIMEOUT", value_parser = parse_u64)]
    pub tx_timeout: Option<u64>,

    /// Re-touch distance in bits; 0 disables.
    #[arg(long, env = "STREAMLINE_ACCESS_LAG", default_value_t = DEFAULT_ACCESS_LAG, value_parser = parse_u64)]
    pub access_lag: u64,

    #[arg(long, env = "STREAMLINE_RX_START_DELAY", default_value_t = DEFAULT_RX_START_DELAY, value_parser = parse_u64)]
    pub rx_start_delay: u64,

    /// Last-level cache size in MiB.
    #[arg(long, env = "STREAMLINE_CACHE_MB", default_value_t = DEFAULT_CACHE_BYTES >> 20)]
    pub cache_mb: u64,

    /// Communication array size as a multiple of the cache.
    #[arg(long, env = "STREAMLINE_ARRAY_FACTOR", default_value_t = DEFAULT_ARRAY_FACTOR)]
    pub array_factor: u64,

    #[arg(long, env = "STREAMLINE_TX_CORE", default_value_t = DEFAULT_TX_CORE)]
    pub tx_core: usize,

    #[arg(long, env = "STREAMLINE_RX_CORE", default_value_t = DEFAULT_RX_CORE)]
    pub rx_core: usize,

    /// SCHED_FIFO priority; defaults to the policy maximum.
    #[arg(long, env = "STREAMLINE_RT_PRIORITY")]
    pub rt_priority: Option<i32>,

    /// Clock used for µs figures when TSC calibration fails.
    #[arg(long, env = "STREAMLINE_CPU_MHZ", default_value_t = DEFAULT_CPU_MHZ)]
    pub cpu_mhz: f64,
}

impl ChannelArgs {
    pub fn sync_strategy(&self) -> SyncStrategy {
        match self.sync {
            SyncMode::FlushReload => SyncStrategy::FlushReload,
            SyncMode::StaticDelay => SyncStrategy::StaticDelay { cycles: self.static_delay },
            SyncMode::None => SyncStrategy::None,
        }
    }

    pub fn into_config(&self) -> Result<ChannelConfig, ConfigError> {
        let cfg = ChannelConfig {
            file: self.file.clone(),
            offset_blocks: self.offset,
            handshake: HandshakeParams {
                interval: self.sync_interval,
                timemask: self.sync_timemask,
                jitter: self.sync_jitter,
                preamble_pairs: self.preamble_pairs,
            },
            thresholds: Thresholds {
                handshake: self.handshake_threshold,
                barrier: self.barrier_threshold,
                stream: self.stream_threshold,
                outlier_bound: self.outlier_bound,
            },
            barrier: BarrierParams {
                period: self.barrier_period,
                rx_lead: self.rx_lead,
                poll_sleep: self.barrier_sleep,
                rx_timeout: self.rx_timeout,
                tx_timeout: self.tx_timeout.unwrap_or(10 * self.rx_timeout),
                arrival_votes: DEFAULT_ARRIVAL_VOTES,
                exit_hits: DEFAULT_EXIT_HITS,
            },
            stream: StreamParams { access_lag: self.access_lag, rx_start_delay: self.rx_start_delay },
            geometry: ChannelGeometry {
                cache_bytes: self.cache_mb << 20,
                array_factor: self.array_factor,
                first_slot: SLOT_SEED,
            },
            payload: PayloadSpec {
                kind: self.payload,
                bits: self.bits,
                framing: if self.fec { Framing::Secded } else { Framing::Plain },
                line_coding: if self.no_whitening {
                    LineCoding::Plain
                } else {
                    LineCoding::Keystream {
                        seed: KEYSTREAM_SEED,
                        period: self.keystream_period.unwrap_or(self.barrier_period),
                    }
                },
            },
            sync: self.sync_strategy(),
            placement: Placement {
                tx_core: self.tx_core,
                rx_core: self.rx_core,
                rt_priority: self.rt_priority,
                cpu_mhz: self.cpu_mhz,
            },
        };
        cfg.validate()?;
        if cfg.placement.tx_core == cfg.placement.rx_core {
            tracing::warn!(core = cfg.placement.tx_core, "sender and receiver share a core");
        }
        Ok(cfg)
    }
}

/// Receiver-only outputs.
#[derive(Args, Clone, Debug)]
pub struct ReportArgs {
    /// Print the report as JSON on stdout.
    #[arg(long, env = "STREAMLINE_JSON")]
    pub json: bool,

    /// Append one results line (bits, bps, BER and its split) to this file.
    #[arg(long, env = "STREAMLINE_RESULTS_FILE")]
    pub results_file: Option<PathBuf>,

    /// Write the raw (latency, timestamp) trace to this file.
    #[arg(long, env = "STREAMLINE_DUMP_SAMPLES")]
    pub dump_samples: Option<PathBuf>,

    /// Print the per-epoch breakdown after the report.
    #[arg(long, env = "STREAMLINE_EPOCHS")]
    pub epochs: bool,

    /// Run both loops in-process over the simulated cache.
    #[arg(long, env = "STREAMLINE_LOOPBACK")]
    pub loopback: bool,

    /// Per-load flip probability for --loopback.
    #[arg(long, env = "STREAMLINE_LOOPBACK_NOISE")]
    pub loopback_noise: Option<f64>,
}

impl ReportArgs {
    pub fn noise(&self) -> Result<Option<f64>, ConfigError> {
        match self.loopback_noise {
            Some(p) if !(0.0..=1.0).contains(&p) => Err(ConfigError::NoiseProbability(p)),
            other => Ok(other),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct Cli {
        #[command(flatten)]
        channel: ChannelArgs,
        #[command(flatten)]
        report: ReportArgs,
    }

    fn parse(args: &[&str]) -> Result<Cli, clap::Error> {
        Cli::try_parse_from(std::iter::once("streamline").chain(args.iter().copied()))
    }

    #[test]
    fn hex_and_decimal() {
        assert_eq!(parse_u64("0x8000"), Ok(0x8000));
        assert_eq!(parse_u64("0XfFfFf"), Ok(0xFFFFF));
        assert_eq!(parse_u64("200_000"), Ok(200_000));
        assert!(parse_u64("0xZZ").is_err());
    }

    #[test]
    fn defaults_match_protocol() {
        let cli = parse(&["-n", "640"]).unwrap();
        let cfg = cli.channel.into_config().unwrap();
        assert_eq!(cfg.payload.bits, 640);
        assert_eq!(cfg.payload.framing, Framing::Plain);
        assert_eq!(cfg.payload.line_coding, LineCoding::Keystream { seed: KEYSTREAM_SEED, period: 200_000 });
        assert_eq!(cfg.handshake.interval, DEFAULT_SYNC_INTERVAL);
        assert_eq!(cfg.barrier.tx_timeout, 10 * DEFAULT_RX_TIMEOUT);
        assert_eq!(cfg.geometry.cache_bytes, DEFAULT_CACHE_BYTES);
        assert_eq!(cfg.sync, SyncStrategy::FlushReload);
        assert!(!cli.report.loopback);
    }

    #[test]
    fn flags_reach_config() {
        let cli = parse(&[
            "-n", "128", "--fec", "--no-whitening", "-i", "0x4000", "--sync", "static-delay",
            "--static-delay", "1000", "--payload", "ones", "--cache-mb", "16", "--rt-priority", "50",
        ]).unwrap();
        let cfg = cli.channel.into_config().unwrap();
        assert_eq!(cfg.payload.framing, Framing::Secded);
        assert_eq!(cfg.payload.line_coding, LineCoding::Plain);
        assert_eq!(cfg.payload.kind, PayloadKind::Ones);
        assert_eq!(cfg.handshake.interval, 0x4000);
        assert_eq!(cfg.sync, SyncStrategy::StaticDelay { cycles: 1000 });
        assert_eq!(cfg.geometry.cache_bytes, 16 << 20);
        assert_eq!(cfg.placement.rt_priority, Some(50));
        assert_eq!(cfg.transmitted_bits(), 144);
    }

    #[test]
    fn invalid_configs_rejected() {
        let cli = parse(&["-n", "100", "--fec"]).unwrap();
        assert_eq!(
            cli.channel.into_config().unwrap_err(),
            ConfigError::PayloadNotBlockAligned { bits: 100, block: 64 }
        );
        let cli = parse(&["-n", "0"]).unwrap();
        assert_eq!(cli.channel.into_config().unwrap_err(), ConfigError::EmptyPayload);
        let cli = parse(&["-n", "64", "--barrier-period", "100", "--rx-lead", "100"]).unwrap();
        assert_eq!(
            cli.channel.into_config().unwrap_err(),
            ConfigError::BarrierPeriod { period: 100, lead: 100 }
        );
        let cli = parse(&["-n", "64", "--rx-lead", "0"]).unwrap();
        assert_eq!(cli.channel.into_config().unwrap_err(), ConfigError::ZeroRxLead);
        let cli = parse(&["-n", "64", "--no-whitening", "--sync", "none", "--barrier-period", "0"]).unwrap();
        assert_eq!(
            cli.channel.into_config().unwrap_err(),
            ConfigError::BarrierPeriod { period: 0, lead: DEFAULT_RX_LEAD }
        );
    }

    #[test]
    fn bits_are_required() {
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn noise_must_be_a_probability() {
        let cli = parse(&["-n", "64", "--loopback", "--loopback-noise", "0.05"]).unwrap();
        assert_eq!(cli.report.noise(), Ok(Some(0.05)));
        let cli = parse(&["-n", "64", "--loopback-noise", "1.5"]).unwrap();
        assert_eq!(cli.report.noise(), Err(ConfigError::NoiseProbability(1.5)));
    }
}
