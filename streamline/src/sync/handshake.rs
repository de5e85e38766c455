// STREAMLINE — SYNC: INITIAL HANDSHAKE
// One-shot, one-bit-at-a-time Flush+Reload exchange on the handshake line.
// Both ends slice time with the same free-running slot clock
// (tsc & timemask <= jitter marks a slot boundary), so no message ever says
// "now". The sender drives the preamble open-loop; the receiver polls each
// slot and runs the countdown detector until the closing 1,1 arrives.
//
// Preamble: `pairs` × (1,0) then 1,1.
// A '1' slot is spent flushing the line; a '0' slot leaves it alone.

use crate::channel::timing::{is_hit, TimingSource};
use crate::engine::protocol::{HandshakeParams, Thresholds};
use crate::engine::typestate::Aligned;

/// Transitions matched before the closing pair is accepted.
pub const HANDSHAKE_COUNTDOWN: u8 = 4;

pub fn preamble(pairs: u32) -> Vec<bool> {
    let mut bits: Vec<bool> = (0..pairs * 2).map(|i| i % 2 == 0).collect();
    bits.extend([true, true]);
    bits
}

/// Spin until the next slot boundary. Returns the counter value at the boundary.
#[inline]
pub fn slot_sync<T: TimingSource>(timing: &T, params: &HandshakeParams) -> u64 {
    while timing.now() & params.timemask > params.jitter {
        core::hint::spin_loop();
    }
    timing.now()
}

// ============================================================================
// SENDER SIDE
// ============================================================================

pub fn send_bit<T: TimingSource>(timing: &T, line: usize, bit: bool, params: &HandshakeParams) {
    let start = slot_sync(timing, params);
    if bit {
        while timing.now().wrapping_sub(start) < params.interval {
            timing.evict(line);
        }
    } else {
        while timing.now().wrapping_sub(start) < params.interval {
            core::hint::spin_loop();
        }
    }
}

/// Drive the whole preamble. Alignment holds from the end of the last bit.
pub fn send_preamble<T: TimingSource>(timing: &T, line: usize, params: &HandshakeParams) -> Aligned {
    for bit in preamble(params.preamble_pairs) {
        send_bit(timing, line, bit, params);
    }
    Aligned::new(timing.now())
}

// ============================================================================
// RECEIVER SIDE
// ============================================================================

/// Per-slot hit/miss tally.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BitVote {
    pub hits: u32,
    pub misses: u32,
    /// Loads slower than the outlier bound. Not counted either way.
    pub outliers: u32,
}

impl BitVote {
    /// A slot reads as '1' when misses are at least as common as hits.
    pub fn bit(&self) -> bool { self.misses >= self.hits }
}

pub fn detect_bit<T: TimingSource>(
    timing: &T,
    line: usize,
    params: &HandshakeParams,
    thresholds: &Thresholds,
) -> BitVote {
    let start = slot_sync(timing, params);
    let mut vote = BitVote::default();
    while timing.now().wrapping_sub(start) < params.interval {
        let latency = timing.measure(line);
        if latency >= thresholds.outlier_bound {
            vote.outliers += 1;
        } else if is_hit(latency, thresholds.handshake) {
            vote.hits += 1;
        } else {
            vote.misses += 1;
        }
    }
    vote
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeState {
    WaitPreamble { countdown: u8 },
    Done,
}

/// Countdown detector. Each transition between consecutive bits ticks the
/// countdown; a repeated bit rewinds it. Once it reaches zero, the first 1,1
/// completes the handshake.
#[derive(Clone, Debug)]
pub struct HandshakeDetector {
    countdown: u8,
    previous: bool,
    bits_seen: u64,
    done: bool,
}

impl Default for HandshakeDetector {
    fn default() -> Self { Self::new() }
}

impl HandshakeDetector {
    pub fn new() -> Self {
        HandshakeDetector { countdown: HANDSHAKE_COUNTDOWN, previous: true, bits_seen: 0, done: false }
    }

    pub fn bits_seen(&self) -> u64 { self.bits_seen }

    pub fn state(&self) -> HandshakeState {
        if self.done { HandshakeState::Done } else { HandshakeState::WaitPreamble { countdown: self.countdown } }
    }

    pub fn feed(&mut self, current: bool) -> HandshakeState {
        if self.done { return HandshakeState::Done; }
        self.bits_seen += 1;
        if self.countdown == 0 && current && self.previous {
            self.done = true;
        } else if self.countdown > 0 && current != self.previous {
            self.countdown -= 1;
        } else if current == self.previous {
            self.countdown = HANDSHAKE_COUNTDOWN;
        }
        self.previous = current;
        self.state()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeOutcome {
    pub aligned: Aligned,
    /// Slots listened to, idle ones included.
    pub bits_observed: u64,
    pub outliers: u64,
}

/// Listen until the preamble completes. `max_bits` bounds the wait; None
/// listens forever, which is what a receiver started before its sender wants.
pub fn await_preamble<T: TimingSource>(
    timing: &T,
    line: usize,
    params: &HandshakeParams,
    thresholds: &Thresholds,
    max_bits: Option<u64>,
) -> Option<HandshakeOutcome> {
    let mut detector = HandshakeDetector::new();
    let mut outliers = 0u64;
    loop {
        if max_bits.is_some_and(|m| detector.bits_seen() >= m) {
            return None;
        }
        let vote = detect_bit(timing, line, params, thresholds);
        outliers += vote.outliers as u64;
        if detector.feed(vote.bit()) == HandshakeState::Done {
            return Some(HandshakeOutcome {
                aligned: Aligned::new(timing.now()),
                bits_observed: detector.bits_seen(),
                outliers,
            });
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use crate::engine::protocol::ChannelConfig;

    fn feed_all(bits: &[bool]) -> (HandshakeDetector, Option<usize>) {
        let mut d = HandshakeDetector::new();
        for (i, b) in bits.iter().enumerate() {
            if d.feed(*b) == HandshakeState::Done { return (d, Some(i + 1)); }
        }
        (d, None)
    }

    #[test]
    fn preamble_shape() {
        assert_eq!(preamble(3), vec![true, false, true, false, true, false, true, true]);
        assert_eq!(preamble(5).len(), 12);
    }

    #[test]
    fn noiseless_preamble_completes_on_last_bit() {
        let (_, at) = feed_all(&preamble(3));
        assert_eq!(at, Some(8));
    }

    #[test]
    fn idle_zeros_before_preamble_do_not_matter() {
        let mut bits = vec![false; 37];
        bits.extend(preamble(3));
        let (_, at) = feed_all(&bits);
        assert_eq!(at, Some(37 + 8));
    }

    #[test]
    fn corrupted_bit_resets_countdown() {
        let mut bits = preamble(3);
        bits[2] = false;
        let (d, at) = feed_all(&bits);
        assert_eq!(at, None);
        assert!(matches!(d.state(), HandshakeState::WaitPreamble { .. }));
    }

    #[test]
    fn longer_preamble_absorbs_a_corrupted_bit() {
        let mut bits = preamble(6);
        bits[2] = false;
        let (_, at) = feed_all(&bits);
        assert_eq!(at, Some(bits.len()));
    }

    #[test]
    fn no_false_completion() {
        assert_eq!(feed_all(&vec![true; 500]).1, None);
        assert_eq!(feed_all(&vec![false; 500]).1, None);
        let alternating: Vec<bool> = (0..500).map(|i| i % 2 == 0).collect();
        assert_eq!(feed_all(&alternating).1, None);
    }

    #[test]
    fn done_is_sticky() {
        let mut d = HandshakeDetector::new();
        for b in preamble(3) { d.feed(b); }
        assert_eq!(d.feed(false), HandshakeState::Done);
        assert_eq!(d.bits_seen(), 8);
    }

    /// Plays a fixed bit pattern on the handshake line, one bit per slot.
    struct PatternTiming {
        clock: Cell<u64>,
        slot_shift: u32,
        pattern: Vec<bool>,
        evicted: RefCell<u64>,
    }

    impl TimingSource for PatternTiming {
        fn now(&self) -> u64 {
            let t = self.clock.get();
            self.clock.set(t + 1);
            t
        }
        fn evict(&self, _addr: usize) { *self.evicted.borrow_mut() += 1; }
        fn touch(&self, _addr: usize) {}
        fn measure(&self, _addr: usize) -> u64 {
            let slot = (self.clock.get() >> self.slot_shift) as usize;
            self.clock.set(self.clock.get() + 20);
            if self.pattern.get(slot).copied().unwrap_or(false) { 300 } else { 60 }
        }
    }

    fn test_params() -> (HandshakeParams, Thresholds) {
        let cfg = ChannelConfig::default();
        let params = HandshakeParams { interval: 0x400, timemask: 0xFFF, jitter: 0x10, preamble_pairs: 3 };
        (params, cfg.thresholds)
    }

    #[test]
    fn detect_bit_majority() {
        let (params, th) = test_params();
        let t = PatternTiming { clock: Cell::new(0), slot_shift: 12, pattern: vec![true, false], evicted: RefCell::new(0) };
        let one = detect_bit(&t, 0, &params, &th);
        assert!(one.bit());
        assert!(one.misses > 0 && one.hits == 0);
        let zero = detect_bit(&t, 0, &params, &th);
        assert!(!zero.bit());
    }

    #[test]
    fn await_preamble_over_pattern() {
        let (params, th) = test_params();
        // Slots 0..5 idle, then the preamble.
        let mut pattern = vec![false; 5];
        pattern.extend(preamble(3));
        let t = PatternTiming { clock: Cell::new(0), slot_shift: 12, pattern, evicted: RefCell::new(0) };
        let out = await_preamble(&t, 0, &params, &th, Some(100)).unwrap();
        assert_eq!(out.bits_observed, 13);
        assert_eq!(out.outliers, 0);
    }

    #[test]
    fn await_preamble_gives_up() {
        let (params, th) = test_params();
        let t = PatternTiming { clock: Cell::new(0), slot_shift: 12, pattern: vec![], evicted: RefCell::new(0) };
        assert!(await_preamble(&t, 0, &params, &th, Some(10)).is_none());
    }

    #[test]
    fn send_bit_flushes_only_for_one() {
        let (params, _) = test_params();
        let t = PatternTiming { clock: Cell::new(0), slot_shift: 12, pattern: vec![], evicted: RefCell::new(0) };
        send_bit(&t, 0, false, &params);
        assert_eq!(*t.evicted.borrow(), 0);
        send_bit(&t, 0, true, &params);
        assert!(*t.evicted.borrow() > 0);
    }
}
