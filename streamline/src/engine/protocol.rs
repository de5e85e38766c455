// STREAMLINE — ENGINE: PROTOCOL MODULE
// Everything both ends must agree on without ever talking: channel layout
// constants, payload framing, line coding, synchronization strategy, and the
// per-run ChannelConfig that carries them.
// Layout:     handshake line at page 0, ready registers at pages 1..=6,
//             communication array from page 7
// Framing:    64 data bits → 72-bit SECDED codeword (optional)
// Line code:  ChaCha8 keystream XOR, reseeded every keystream period
// Sync:       Flush+Reload barrier every barrier period (or static delay / none)

use std::path::PathBuf;
use serde::Serialize;
use crate::error::ConfigError;

// ============================================================================
// GEOMETRY CONSTANTS
// ============================================================================

pub const PAGE_SIZE: u64 = 4096;
pub const CACHE_LINE: u64 = 64;
pub const LINES_PER_PAGE: u64 = PAGE_SIZE / CACHE_LINE;
/// Communication array is addressed in u64 entries.
pub const ENTRY_SIZE: u64 = 8;
pub const ENTRIES_PER_PAGE: u64 = PAGE_SIZE / ENTRY_SIZE;
pub const ENTRIES_PER_LINE: u64 = CACHE_LINE / ENTRY_SIZE;

// Byte offsets from the channel base. One page per register keeps every
// register on its own line and out of the array's way.
pub const OFFSET_HANDSHAKE: u64 = 0;
pub const OFFSET_RX_READY: [u64; 3] = [PAGE_SIZE, 3 * PAGE_SIZE, 5 * PAGE_SIZE];
pub const OFFSET_TX_READY: [u64; 3] = [2 * PAGE_SIZE, 4 * PAGE_SIZE, 6 * PAGE_SIZE];
pub const OFFSET_ARRAY: u64 = 7 * PAGE_SIZE;

/// Extra mapped bytes past the array (slot shift and register pages).
pub const MAPPING_SLACK: u64 = 1024 * 1024;

/// First logical slot. Bit 0 maps through slot SLOT_SEED.
pub const SLOT_SEED: u64 = 42;
/// Entry shift inside the selected line (32 bytes in).
pub const SLOT_ENTRY_SHIFT: u64 = 4;
/// Line stride between consecutive slot pairs inside a page.
pub const SLOT_LINE_STRIDE: u64 = 3;
/// Line the stride walk starts from.
pub const SLOT_LINE_BASE: u64 = 14;

// ============================================================================
// FRAMING CONSTANTS
// ============================================================================

pub const DATA_BLOCK_BITS: usize = 64;
pub const PARITY_BITS: usize = 8;
pub const CODEWORD_BITS: usize = DATA_BLOCK_BITS + PARITY_BITS;

pub const KEYSTREAM_SEED: u64 = 42;
pub const PAYLOAD_SEED: u64 = 42;

/// Both loops stamp the cycle counter every HEARTBEAT_BITS bits.
pub const HEARTBEAT_BITS: u64 = 1000;

// ============================================================================
// DEFAULTS (values the reference harness was tuned with)
// ============================================================================

pub const DEFAULT_SYNC_INTERVAL: u64 = 0x0000_8000;
pub const DEFAULT_SYNC_TIMEMASK: u64 = 0x000F_FFFF;
pub const DEFAULT_SYNC_JITTER: u64 = 0x0100;
pub const DEFAULT_PREAMBLE_PAIRS: u32 = 3;
pub const DEFAULT_HIT_THRESHOLD: u64 = 180;
/// Anything slower is a page fault or an interrupt, not a cache miss.
pub const DEFAULT_OUTLIER_BOUND: u64 = 1000;
pub const DEFAULT_BARRIER_PERIOD: u64 = 200_000;
pub const DEFAULT_RX_LEAD: u64 = 5000;
pub const DEFAULT_BARRIER_SLEEP: u64 = 1000;
pub const DEFAULT_RX_TIMEOUT: u64 = 5 * 100 * 5000;
pub const DEFAULT_ARRIVAL_VOTES: u32 = 2;
pub const DEFAULT_EXIT_HITS: u32 = 30;
pub const DEFAULT_ACCESS_LAG: u64 = 5000;
pub const DEFAULT_RX_START_DELAY: u64 = 250_000;
pub const DEFAULT_STATIC_DELAY: u64 = 400_000;
pub const DEFAULT_CACHE_BYTES: u64 = 8 * 1024 * 1024;
pub const DEFAULT_ARRAY_FACTOR: u64 = 8;
pub const DEFAULT_TX_CORE: usize = 1;
pub const DEFAULT_RX_CORE: usize = 0;
pub const DEFAULT_CPU_MHZ: f64 = 3900.0;
pub const DEFAULT_FILE: &str = "shared_readonly_file.txt";

// ============================================================================
// STRATEGY ENUMS — resolved once at session start
// ============================================================================

/// Payload generator. Both ends regenerate the same payload from PAYLOAD_SEED.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadKind {
    Random,
    Zeros,
    Ones,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Framing {
    /// Payload bits go out as-is, analysed in 64-bit blocks.
    Plain,
    /// Every 64 payload bits become one 72-bit SECDED codeword.
    Secded,
}

impl Framing {
    /// Channel symbols per 64-bit data block.
    pub const fn block_len(self) -> usize {
        match self {
            Framing::Plain => DATA_BLOCK_BITS,
            Framing::Secded => CODEWORD_BITS,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LineCoding {
    Plain,
    Keystream { seed: u64, period: u64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStrategy {
    /// Barrier rendezvous through the ready registers.
    FlushReload,
    /// Sender stalls a fixed number of cycles at each sync point.
    StaticDelay { cycles: u64 },
    /// Free-running loops.
    None,
}

// ============================================================================
// CHANNEL CONFIG — immutable after validate()
// ============================================================================

#[derive(Clone, Debug)]
pub struct HandshakeParams {
    /// Length of one preamble bit in cycles.
    pub interval: u64,
    /// Cycle counter bits that form the free-running slot clock.
    pub timemask: u64,
    /// A slot boundary is any counter value with (tsc & timemask) <= jitter.
    pub jitter: u64,
    /// Alternating 1,0 pairs before the closing 1,1.
    pub preamble_pairs: u32,
}

#[derive(Clone, Debug)]
pub struct Thresholds {
    pub handshake: u64,
    pub barrier: u64,
    pub stream: u64,
    pub outlier_bound: u64,
}

#[derive(Clone, Debug)]
pub struct BarrierParams {
    /// Bits between rendezvous.
    pub period: u64,
    /// The receiver enters its barrier this many bits before the sender does.
    pub rx_lead: u64,
    /// Busy-wait between evict and reload while polling.
    pub poll_sleep: u64,
    /// Receiver gives up waiting for the sender after sleeping this many cycles.
    pub rx_timeout: u64,
    /// Sender gives up waiting for the receiver after sleeping this many cycles.
    pub tx_timeout: u64,
    pub arrival_votes: u32,
    pub exit_hits: u32,
}

#[derive(Clone, Debug)]
pub struct StreamParams {
    /// Re-touch the slot this many bits back; 0 disables.
    pub access_lag: u64,
    /// Receiver busy-wait between handshake and first sample.
    pub rx_start_delay: u64,
}

#[derive(Clone, Debug)]
pub struct ChannelGeometry {
    pub cache_bytes: u64,
    pub array_factor: u64,
    pub first_slot: u64,
}

impl ChannelGeometry {
    pub fn array_bytes(&self) -> u64 { self.cache_bytes * self.array_factor }
    pub fn array_entries(&self) -> u64 { self.array_bytes() / ENTRY_SIZE }
    pub fn array_lines(&self) -> u64 { self.array_bytes() / CACHE_LINE }
    /// Bytes that must be mapped from the channel base.
    pub fn mapping_len(&self) -> u64 { OFFSET_ARRAY + self.array_bytes() + MAPPING_SLACK }
}

#[derive(Clone, Debug)]
pub struct PayloadSpec {
    pub kind: PayloadKind,
    /// Logical payload bits (before FEC expansion).
    pub bits: u64,
    pub framing: Framing,
    pub line_coding: LineCoding,
}

impl PayloadSpec {
    /// Channel symbols actually carried, parity included.
    pub fn transmitted_bits(&self) -> u64 {
        match self.framing {
            Framing::Plain => self.bits,
            Framing::Secded => self.bits / DATA_BLOCK_BITS as u64 * CODEWORD_BITS as u64,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Placement {
    pub tx_core: usize,
    pub rx_core: usize,
    /// SCHED_FIFO priority; None selects the policy maximum.
    pub rt_priority: Option<i32>,
    /// Used for µs conversion when TSC calibration is unavailable.
    pub cpu_mhz: f64,
}

#[derive(Clone, Debug)]
pub struct ChannelConfig {
    pub file: PathBuf,
    /// Offset into the backing file, in cache blocks.
    pub offset_blocks: u64,
    pub handshake: HandshakeParams,
    pub thresholds: Thresholds,
    pub barrier: BarrierParams,
    pub stream: StreamParams,
    pub geometry: ChannelGeometry,
    pub payload: PayloadSpec,
    pub sync: SyncStrategy,
    pub placement: Placement,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            file: PathBuf::from(DEFAULT_FILE),
            offset_blocks: 0,
            handshake: HandshakeParams {
                interval: DEFAULT_SYNC_INTERVAL,
                timemask: DEFAULT_SYNC_TIMEMASK,
                jitter: DEFAULT_SYNC_JITTER,
                preamble_pairs: DEFAULT_PREAMBLE_PAIRS,
            },
            thresholds: Thresholds {
                handshake: DEFAULT_HIT_THRESHOLD,
                barrier: DEFAULT_HIT_THRESHOLD,
                stream: DEFAULT_HIT_THRESHOLD,
                outlier_bound: DEFAULT_OUTLIER_BOUND,
            },
            barrier: BarrierParams {
                period: DEFAULT_BARRIER_PERIOD,
                rx_lead: DEFAULT_RX_LEAD,
                poll_sleep: DEFAULT_BARRIER_SLEEP,
                rx_timeout: DEFAULT_RX_TIMEOUT,
                tx_timeout: 10 * DEFAULT_RX_TIMEOUT,
                arrival_votes: DEFAULT_ARRIVAL_VOTES,
                exit_hits: DEFAULT_EXIT_HITS,
            },
            stream: StreamParams {
                access_lag: DEFAULT_ACCESS_LAG,
                rx_start_delay: DEFAULT_RX_START_DELAY,
            },
            geometry: ChannelGeometry {
                cache_bytes: DEFAULT_CACHE_BYTES,
                array_factor: DEFAULT_ARRAY_FACTOR,
                first_slot: SLOT_SEED,
            },
            payload: PayloadSpec {
                kind: PayloadKind::Random,
                bits: 1,
                framing: Framing::Plain,
                line_coding: LineCoding::Keystream { seed: KEYSTREAM_SEED, period: DEFAULT_BARRIER_PERIOD },
            },
            sync: SyncStrategy::FlushReload,
            placement: Placement {
                tx_core: DEFAULT_TX_CORE,
                rx_core: DEFAULT_RX_CORE,
                rt_priority: None,
                cpu_mhz: DEFAULT_CPU_MHZ,
            },
        }
    }
}

impl ChannelConfig {
    /// Reject every configuration the channel cannot run. Called once at startup;
    /// nothing downstream re-checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.payload;
        if p.bits == 0 { return Err(ConfigError::EmptyPayload); }
        if p.framing == Framing::Secded && p.bits % DATA_BLOCK_BITS as u64 != 0 {
            return Err(ConfigError::PayloadNotBlockAligned { bits: p.bits, block: DATA_BLOCK_BITS as u64 });
        }
        if let LineCoding::Keystream { period: 0, .. } = p.line_coding {
            return Err(ConfigError::KeystreamPeriod);
        }
        // Checked for every strategy: the loops evaluate sync points even when
        // no rendezvous follows.
        let b = &self.barrier;
        if b.rx_lead == 0 { return Err(ConfigError::ZeroRxLead); }
        if b.period <= b.rx_lead {
            return Err(ConfigError::BarrierPeriod { period: b.period, lead: b.rx_lead });
        }
        let t = &self.thresholds;
        for (name, v) in [("handshake", t.handshake), ("barrier", t.barrier), ("stream", t.stream)] {
            if v == 0 { return Err(ConfigError::ZeroThreshold { name }); }
        }
        if t.outlier_bound <= t.stream {
            return Err(ConfigError::OutlierBound { bound: t.outlier_bound, threshold: t.stream });
        }
        if self.geometry.array_bytes() < 2 * PAGE_SIZE {
            return Err(ConfigError::ArrayTooSmall { bytes: self.geometry.array_bytes() });
        }
        if self.handshake.interval == 0 { return Err(ConfigError::HandshakeInterval); }
        if self.handshake.preamble_pairs < 2 {
            return Err(ConfigError::PreambleTooShort(self.handshake.preamble_pairs));
        }
        Ok(())
    }

    pub fn transmitted_bits(&self) -> u64 { self.payload.transmitted_bits() }

    /// Byte offset of the channel base inside the backing file.
    pub fn offset_bytes(&self) -> u64 { self.offset_blocks * CACHE_LINE }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg_with(bits: u64, framing: Framing) -> ChannelConfig {
        let mut cfg = ChannelConfig::default();
        cfg.payload.bits = bits;
        cfg.payload.framing = framing;
        cfg
    }

    #[test]
    fn register_pages_do_not_touch_array() {
        for off in OFFSET_RX_READY.iter().chain(OFFSET_TX_READY.iter()) {
            assert!(*off < OFFSET_ARRAY);
            assert_eq!(off % PAGE_SIZE, 0);
        }
        assert_eq!(OFFSET_ARRAY, 7 * 4096);
    }

    #[test]
    fn default_config_is_valid() {
        assert_eq!(ChannelConfig::default().validate(), Ok(()));
    }

    #[test]
    fn fec_needs_whole_blocks() {
        assert_eq!(
            cfg_with(100, Framing::Secded).validate(),
            Err(ConfigError::PayloadNotBlockAligned { bits: 100, block: 64 })
        );
        assert_eq!(cfg_with(128, Framing::Secded).validate(), Ok(()));
        // Plain framing takes any length.
        assert_eq!(cfg_with(100, Framing::Plain).validate(), Ok(()));
    }

    #[test]
    fn zero_bits_rejected() {
        assert_eq!(cfg_with(0, Framing::Plain).validate(), Err(ConfigError::EmptyPayload));
    }

    #[test]
    fn barrier_period_must_exceed_lead() {
        let mut cfg = ChannelConfig::default();
        cfg.barrier.period = 5000;
        assert_eq!(cfg.validate(), Err(ConfigError::BarrierPeriod { period: 5000, lead: 5000 }));
        // Free-running loops still walk the schedule.
        cfg.sync = SyncStrategy::None;
        assert_eq!(cfg.validate(), Err(ConfigError::BarrierPeriod { period: 5000, lead: 5000 }));
        cfg.barrier.period = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::BarrierPeriod { period: 0, lead: 5000 }));
        cfg.barrier.period = 1000;
        cfg.sync = SyncStrategy::StaticDelay { cycles: DEFAULT_STATIC_DELAY };
        assert_eq!(cfg.validate(), Err(ConfigError::BarrierPeriod { period: 1000, lead: 5000 }));
    }

    #[test]
    fn zero_rx_lead_rejected() {
        let mut cfg = ChannelConfig::default();
        cfg.barrier.rx_lead = 0;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroRxLead));
        cfg.sync = SyncStrategy::None;
        assert_eq!(cfg.validate(), Err(ConfigError::ZeroRxLead));
        cfg.barrier.rx_lead = 1;
        assert_eq!(cfg.validate(), Ok(()));
    }

    #[test]
    fn transmitted_bits_include_parity() {
        assert_eq!(cfg_with(640, Framing::Secded).transmitted_bits(), 720);
        assert_eq!(cfg_with(640, Framing::Plain).transmitted_bits(), 640);
    }

    #[test]
    fn geometry_defaults_cover_twice_the_cache() {
        let g = ChannelConfig::default().geometry;
        assert_eq!(g.array_bytes(), 64 * 1024 * 1024);
        assert!(g.array_bytes() >= 2 * g.cache_bytes);
        assert_eq!(g.mapping_len(), OFFSET_ARRAY + g.array_bytes() + MAPPING_SLACK);
    }

    #[test]
    fn block_len_matches_framing() {
        assert_eq!(Framing::Plain.block_len(), 64);
        assert_eq!(Framing::Secded.block_len(), 72);
    }
}
