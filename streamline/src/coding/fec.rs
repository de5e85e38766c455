// STREAMLINE — CODING: SECDED(72,64)
// Extended Hamming code. Systematic layout on the wire: the 64 data bits go
// out untouched (MSB first) followed by one check byte.
//
// Check byte: bits 0..=6 are the Hamming check bits c0..c6, bit 7 is the
// overall parity over all 71 other bits. Data bit i sits at Hamming position
// DATA_POSITIONS[i] (the i-th non-power-of-two in 3..=71); check bit j sits at
// position 2^j.

/// Hamming position of each data bit, MSB of the data word first.
pub const DATA_POSITIONS: [u8; 64] = data_positions();

/// Inverse of DATA_POSITIONS. 0xFF marks check-bit and unused positions.
const POSITION_TO_DATA: [u8; 128] = position_to_data();

const fn data_positions() -> [u8; 64] {
    let mut out = [0u8; 64];
    let mut pos: u8 = 1;
    let mut i = 0;
    while i < 64 {
        if pos & (pos - 1) != 0 {
            out[i] = pos;
            i += 1;
        }
        pos += 1;
    }
    out
}

const fn position_to_data() -> [u8; 128] {
    let mut out = [0xFFu8; 128];
    let mut i = 0;
    while i < 64 {
        out[DATA_POSITIONS[i] as usize] = i as u8;
        i += 1;
    }
    out
}

#[inline(always)]
const fn data_bit(data: u64, i: usize) -> bool {
    (data >> (63 - i)) & 1 == 1
}

/// XOR of the Hamming positions of every set data bit, plus the data parity.
#[inline]
fn data_syndrome(data: u64) -> (u8, u32) {
    let mut syn = 0u8;
    for (i, pos) in DATA_POSITIONS.iter().enumerate() {
        // Branchless accumulate: mask is 0x00 or 0xFF.
        let m = 0u8.wrapping_sub(data_bit(data, i) as u8);
        syn ^= pos & m;
    }
    (syn, data.count_ones() & 1)
}

/// Check byte for one 64-bit data block.
pub fn encode(data: u64) -> u8 {
    let (syn, data_parity) = data_syndrome(data);
    let check = syn & 0x7F;
    let parity = (data_parity ^ (check.count_ones() & 1)) as u8;
    check | (parity << 7)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decoded {
    pub data: u64,
    /// 0 clean, 1 corrected, 2 detected but not corrected (two or more).
    pub errors: u32,
}

pub fn decode(data: u64, check: u8) -> Decoded {
    let (syn, data_parity) = data_syndrome(data);
    let syn = syn ^ (check & 0x7F);
    let overall = data_parity ^ (check.count_ones() & 1);

    match (syn, overall) {
        (0, 0) => Decoded { data, errors: 0 },
        // Overall parity bit itself.
        (0, _) => Decoded { data, errors: 1 },
        (s, 1) if s.is_power_of_two() => Decoded { data, errors: 1 },
        (s, 1) => match POSITION_TO_DATA[s as usize] {
            0xFF => Decoded { data, errors: 2 },
            i => Decoded { data: data ^ (1u64 << (63 - i as u32)), errors: 1 },
        },
        _ => Decoded { data, errors: 2 },
    }
}

// ============================================================================
// TESTS
// ============================================================================
