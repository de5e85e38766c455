// STREAMLINE — COMPILE-TIME SIDE MARKERS + ALIGNMENT PROOF + LOOP PREDICATES
//
// Zero-sized markers tie a SyncState to the side that owns it, so a sender
// loop can never be driven with receiver counters. The steady-state loops
// demand an `Aligned` token, which only a completed handshake (or an explicit
// loopback assumption) can produce.
//
// The loop predicates below are branchless `const fn`s evaluated once per bit.

use core::marker::PhantomData;
use crate::engine::protocol::{BarrierParams, HEARTBEAT_BITS};

// ============================================================================
// SEALED TRAIT — prevent downstream impl
// ============================================================================

mod sealed { pub trait Sealed {} }

/// Which end of the channel a counter set belongs to.
pub trait Side: sealed::Sealed + Copy + 'static {
    const NAME: &'static str;
    /// True when this side enters the barrier after bit `i`.
    fn is_sync_point(i: u64, barrier: &BarrierParams) -> bool;
}

// ============================================================================
// ZERO-SIZED SIDE MARKERS
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub struct Tx;
impl sealed::Sealed for Tx {}
impl Side for Tx {
    const NAME: &'static str = "tx";
    #[inline(always)]
    fn is_sync_point(i: u64, barrier: &BarrierParams) -> bool {
        is_tx_sync_point(i, barrier.period)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Rx;
impl sealed::Sealed for Rx {}
impl Side for Rx {
    const NAME: &'static str = "rx";
    #[inline(always)]
    fn is_sync_point(i: u64, barrier: &BarrierParams) -> bool {
        is_rx_sync_point(i, barrier.period, barrier.rx_lead)
    }
}

// ============================================================================
// ALIGNMENT PROOF
// ============================================================================

/// Proof that both ends share a time origin. Carries the cycle counter value
/// at which alignment was established. Minted by a completed handshake on
/// hardware, or by `SimTiming::align` on the simulated cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Aligned {
    at: u64,
}

impl Aligned {
    /// Hardware tokens come from the handshake.
    pub(crate) fn new(at: u64) -> Self { Aligned { at } }

    /// Skip the handshake where both loops share one clock. Reached from
    /// outside the crate only through `SimTiming::align`.
    pub(crate) fn assume(at: u64) -> Self { Aligned { at } }

    pub fn at(&self) -> u64 { self.at }
}

// ============================================================================
// PER-SIDE SYNC STATE — owned by the executing loop, never shared
// ============================================================================

#[derive(Debug)]
pub struct SyncState<S: Side> {
    /// Next bit to send or sample.
    pub bit_index: u64,
    /// Barrier rounds entered.
    pub round: u64,
    /// Rounds that ended through the timeout escape.
    pub timeouts: u64,
    _side: PhantomData<S>,
}

impl<S: Side> Default for SyncState<S> {
    fn default() -> Self { Self::new() }
}

impl<S: Side> SyncState<S> {
    pub fn new() -> Self {
        SyncState { bit_index: 0, round: 0, timeouts: 0, _side: PhantomData }
    }

    #[inline(always)]
    pub fn advance(&mut self) { self.bit_index += 1; }

    /// Symbols are whitened before the loop starts, so the keystream position
    /// of the current bit is its index. Barrier rounds and timeouts never
    /// skip or repeat a position.
    #[inline(always)]
    pub fn keystream_position(&self) -> u64 { self.bit_index }

    /// Whether the bit just completed (`bit_index - 1`) is a sync point.
    #[inline(always)]
    pub fn at_sync_point(&self, barrier: &BarrierParams) -> bool {
        self.bit_index > 0 && S::is_sync_point(self.bit_index - 1, barrier)
    }

    pub fn record_round(&mut self, timed_out: bool) {
        self.round += 1;
        self.timeouts += timed_out as u64;
    }

    pub fn side(&self) -> &'static str { S::NAME }
}

// ============================================================================
// LOOP PREDICATES
// ============================================================================

/// Sender rendezvouses on the last bit of each period. A zero period never
/// fires.
#[inline(always)]
pub const fn is_tx_sync_point(i: u64, period: u64) -> bool {
    period != 0 && i % period == period - 1
}

/// Receiver rendezvouses `lead` bits before the period ends, so it is waiting
/// when the sender arrives. Fires only for `0 < lead < period`.
#[inline(always)]
pub const fn is_rx_sync_point(i: u64, period: u64, lead: u64) -> bool {
    (lead != 0) & (lead < period) && i % period == period - lead
}

/// Re-touch the slot `lag` bits back once that slot exists. `lag == 0` disables.
#[inline(always)]
pub const fn should_retouch(i: u64, lag: u64) -> bool {
    (lag != 0) & (i > lag)
}

/// Heartbeat on the last bit of every HEARTBEAT_BITS block.
#[inline(always)]
pub const fn is_heartbeat(i: u64) -> bool {
    i % HEARTBEAT_BITS == HEARTBEAT_BITS - 1
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::protocol::ChannelConfig;

    #[test]
    fn tx_sync_points() {
        assert!(is_tx_sync_point(199_999, 200_000));
        assert!(is_tx_sync_point(399_999, 200_000));
        assert!(!is_tx_sync_point(0, 200_000));
        assert!(!is_tx_sync_point(200_000, 200_000));
    }

    #[test]
    fn rx_leads_tx_by_lead_bits() {
        assert!(is_rx_sync_point(195_000, 200_000, 5000));
        assert!(!is_rx_sync_point(199_999, 200_000, 5000));
        let gap = 199_999 - 195_000;
        assert_eq!(gap, 5000 - 1);
    }

    #[test]
    fn degenerate_schedules_never_fire() {
        for i in [0, 1, 999, 5000, u64::MAX] {
            assert!(!is_tx_sync_point(i, 0));
            assert!(!is_rx_sync_point(i, 0, 5000));
            assert!(!is_rx_sync_point(i, 1000, 5000));
            assert!(!is_rx_sync_point(i, 1000, 1000));
            assert!(!is_rx_sync_point(i, 1000, 0));
        }
        assert!(is_tx_sync_point(0, 1));
    }

    #[test]
    fn sync_state_survives_unvalidated_barrier() {
        let mut barrier = ChannelConfig::default().barrier;
        barrier.period = 0;
        let mut tx: SyncState<Tx> = SyncState::new();
        let mut rx: SyncState<Rx> = SyncState::new();
        for _ in 0..10 {
            tx.advance();
            rx.advance();
            assert!(!tx.at_sync_point(&barrier));
            assert!(!rx.at_sync_point(&barrier));
        }
        barrier.period = 1000;
        rx.bit_index = 1000;
        assert!(!rx.at_sync_point(&barrier));
    }

    #[test]
    fn retouch_window() {
        assert!(!should_retouch(5000, 5000));
        assert!(should_retouch(5001, 5000));
        assert!(!should_retouch(10_000, 0));
    }

    #[test]
    fn heartbeat_every_thousand() {
        assert!(is_heartbeat(999));
        assert!(is_heartbeat(2999));
        assert!(!is_heartbeat(0));
        assert!(!is_heartbeat(1000));
    }

    #[test]
    fn sync_state_tracks_rounds() {
        let barrier = ChannelConfig::default().barrier;
        let mut st: SyncState<Tx> = SyncState::new();
        assert!(!st.at_sync_point(&barrier));
        st.bit_index = barrier.period;
        assert!(st.at_sync_point(&barrier));
        st.record_round(false);
        st.record_round(true);
        assert_eq!(st.round, 2);
        assert_eq!(st.timeouts, 1);
        assert_eq!(st.side(), "tx");
    }

    #[test]
    fn rx_state_uses_rx_schedule() {
        let barrier = ChannelConfig::default().barrier;
        let mut st: SyncState<Rx> = SyncState::new();
        st.bit_index = barrier.period - barrier.rx_lead + 1;
        assert!(st.at_sync_point(&barrier));
        st.advance();
        assert!(!st.at_sync_point(&barrier));
    }

    #[test]
    fn keystream_position_ignores_barrier_rounds() {
        let mut st: SyncState<Rx> = SyncState::new();
        for _ in 0..7 { st.advance(); }
        st.record_round(true);
        st.record_round(false);
        assert_eq!(st.keystream_position(), 7);
        st.advance();
        assert_eq!(st.keystream_position(), 8);
    }

    #[test]
    fn assumed_alignment_keeps_origin() {
        assert_eq!(Aligned::assume(1234).at(), 1234);
    }
}
