// STREAMLINE — CHANNEL: SIMULATED CACHE
// A deterministic stand-in for the shared LLC. A line is either resident or
// not; loads make it resident, evictions remove it, and a timed load reports a
// fixed hit or miss latency. Several SimTiming handles may share one SimCache
// across threads, which is how the two-sided protocol runs inside one process.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::channel::datapath::{receive, transmit, ReceiveLog, TransmitLog};
use crate::channel::medium::ChannelLayout;
use crate::channel::timing::TimingSource;
use crate::engine::protocol::{ChannelConfig, SyncStrategy, CACHE_LINE};
use crate::engine::typestate::Aligned;

pub const SIM_HIT_CYCLES: u64 = 60;
pub const SIM_MISS_CYCLES: u64 = 300;

struct Noise {
    rng: ChaCha8Rng,
    flip: f64,
}

pub struct SimCache {
    lines: Mutex<HashSet<usize>>,
    clock: AtomicU64,
    noise: Option<Mutex<Noise>>,
}

impl SimCache {
    pub fn new() -> Arc<Self> {
        Arc::new(SimCache { lines: Mutex::new(HashSet::new()), clock: AtomicU64::new(0), noise: None })
    }

    /// Every timed load reports the opposite outcome with probability `flip`.
    pub fn with_noise(flip: f64, seed: u64) -> Arc<Self> {
        Arc::new(SimCache {
            lines: Mutex::new(HashSet::new()),
            clock: AtomicU64::new(0),
            noise: Some(Mutex::new(Noise { rng: ChaCha8Rng::seed_from_u64(seed), flip })),
        })
    }

    #[inline]
    fn line(addr: usize) -> usize { addr / CACHE_LINE as usize }

    pub fn is_resident(&self, addr: usize) -> bool {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).contains(&Self::line(addr))
    }

    pub fn resident_lines(&self) -> usize {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn load(&self, addr: usize) -> bool {
        !self.lines.lock().unwrap_or_else(|e| e.into_inner()).insert(Self::line(addr))
    }

    fn remove(&self, addr: usize) {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).remove(&Self::line(addr));
    }

    fn flip(&self) -> bool {
        match &self.noise {
            Some(n) => {
                let mut n = n.lock().unwrap_or_else(|e| e.into_inner());
                let p = n.flip;
                n.rng.gen_bool(p)
            }
            None => false,
        }
    }
}

/// TimingSource over a SimCache. Cheap to clone; clones share the cache.
#[derive(Clone)]
pub struct SimTiming {
    cache: Arc<SimCache>,
}

impl SimTiming {
    pub fn new(cache: Arc<SimCache>) -> Self { SimTiming { cache } }

    pub fn cache(&self) -> &SimCache { &self.cache }

    /// Alignment for loops that all run on this handle's clock. Sharing the
    /// simulated clock is the handshake's guarantee, so no preamble is needed.
    pub fn align(&self) -> Aligned { Aligned::assume(self.now()) }
}

impl TimingSource for SimTiming {
    fn now(&self) -> u64 {
        self.cache.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn evict(&self, addr: usize) { self.cache.remove(addr); }

    fn touch(&self, addr: usize) { self.cache.load(addr); }

    fn measure(&self, addr: usize) -> u64 {
        let hit = self.cache.load(addr) ^ self.cache.flip();
        let latency = if hit { SIM_HIT_CYCLES } else { SIM_MISS_CYCLES };
        self.cache.clock.fetch_add(latency, Ordering::Relaxed);
        latency
    }

    /// Advance the shared clock and give the other side a chance to run.
    fn delay(&self, cycles: u64) {
        self.cache.clock.fetch_add(cycles, Ordering::Relaxed);
        std::thread::yield_now();
    }
}

// ============================================================================
// LOOPBACK — both loops back to back in one process
// ============================================================================

/// Where the loopback places the simulated mapping and the sender's scratch
/// line. Far enough apart that no slot shares a line with scratch.
pub const LOOPBACK_BASE: usize = 0x1000_0000;
pub const LOOPBACK_SCRATCH: usize = 0x40;
pub const LOOPBACK_NOISE_SEED: u64 = 0x5EED;

/// Run the sender over every symbol, then the receiver over the same slots.
/// A lone barrier can only time out, so the sync strategy is forced to None.
pub fn loopback(cfg: &ChannelConfig, symbols: &[bool], noise: Option<f64>) -> (TransmitLog, ReceiveLog) {
    let cache = match noise {
        Some(p) if p > 0.0 => SimCache::with_noise(p, LOOPBACK_NOISE_SEED),
        _ => SimCache::new(),
    };
    let timing = SimTiming::new(cache);
    let mut cfg = cfg.clone();
    cfg.sync = SyncStrategy::None;
    cfg.stream.rx_start_delay = 0;
    let layout = ChannelLayout::new(LOOPBACK_BASE, &cfg.geometry);
    let aligned = timing.align();
    let tx = transmit(&timing, &layout, LOOPBACK_SCRATCH, symbols, &cfg, aligned);
    let rx = receive(&timing, &layout, symbols.len() as u64, &cfg, aligned);
    (tx, rx)
}

// ============================================================================
// TESTS
// ============================================================================
