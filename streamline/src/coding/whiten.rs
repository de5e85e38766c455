// STREAMLINE — CODING: LINE CODER
// XOR whitening with a ChaCha8 keystream. Each position consumes one 32-bit
// keystream word and uses its low bit as the mask. The generator restarts from
// the fixed seed every `period` positions, so a receiver that lost its place
// can recompute any mask from the position alone.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::engine::protocol::LineCoding;

/// Sequential keystream. Cheaper than `mask_at` when walking positions in order.
pub struct Keystream {
    rng: ChaCha8Rng,
    seed: u64,
    period: u64,
    pos: u64,
}

impl Keystream {
    pub fn new(seed: u64, period: u64) -> Self {
        Keystream { rng: ChaCha8Rng::seed_from_u64(seed), seed, period, pos: 0 }
    }

    pub fn position(&self) -> u64 { self.pos }

    #[inline]
    pub fn next_mask(&mut self) -> bool {
        if self.pos % self.period == 0 && self.pos != 0 {
            self.rng = ChaCha8Rng::seed_from_u64(self.seed);
        }
        self.pos += 1;
        self.rng.next_u32() & 1 == 1
    }
}

/// Mask bit for position `pos`, computed without walking the stream.
pub fn mask_at(seed: u64, period: u64, pos: u64) -> bool {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_word_pos((pos % period) as u128);
    rng.next_u32() & 1 == 1
}

/// Whiten (or un-whiten: the operation is its own inverse) one bit.
pub fn whiten(coding: LineCoding, bit: bool, pos: u64) -> bool {
    match coding {
        LineCoding::Plain => bit,
        LineCoding::Keystream { seed, period } => bit ^ mask_at(seed, period, pos),
    }
}

/// Mask sequence for positions `0..len`. All zeros under `Plain`.
pub fn keystream(coding: LineCoding, len: usize) -> Vec<bool> {
    match coding {
        LineCoding::Plain => vec![false; len],
        LineCoding::Keystream { seed, period } => {
            let mut ks = Keystream::new(seed, period);
            (0..len).map(|_| ks.next_mask()).collect()
        }
    }
}

/// Whiten a whole symbol stream starting at position 0.
pub fn whiten_in_place(coding: LineCoding, symbols: &mut [bool]) {
    if let LineCoding::Keystream { seed, period } = coding {
        let mut ks = Keystream::new(seed, period);
        for s in symbols.iter_mut() {
            *s ^= ks.next_mask();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
