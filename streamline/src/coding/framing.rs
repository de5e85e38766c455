// STREAMLINE — CODING: PAYLOAD FRAMING
// Payload generation, SECDED block framing, and bit/word packing.
// Pipeline on the sender: payload → encoded (FEC) → symbols (whitened).
// The receiver rebuilds the same Transmission from the same seed so the
// analysis can compare against what was actually sent.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::coding::{fec, whiten};
use crate::engine::protocol::*;
use crate::error::ConfigError;

// ============================================================================
// BIT PACKING (MSB first)
// ============================================================================

/// Pack up to 64 bools into a word, first bool in the most significant used bit.
pub fn bits_to_u64(bits: &[bool]) -> u64 {
    bits.iter().fold(0u64, |acc, b| (acc << 1) | *b as u64)
}

/// Unpack the low `out.len()` bits of `v`, most significant first.
pub fn u64_to_bits(v: u64, out: &mut [bool]) {
    let n = out.len();
    for (i, o) in out.iter_mut().enumerate() {
        *o = (v >> (n - 1 - i)) & 1 == 1;
    }
}

// ============================================================================
// PAYLOAD GENERATION
// ============================================================================

pub fn generate_payload(kind: PayloadKind, bits: usize) -> Vec<bool> {
    match kind {
        PayloadKind::Zeros => vec![false; bits],
        PayloadKind::Ones => vec![true; bits],
        PayloadKind::Random => {
            let mut rng = ChaCha8Rng::seed_from_u64(PAYLOAD_SEED);
            (0..bits).map(|_| rng.next_u32() & 1 == 1).collect()
        }
    }
}

// ============================================================================
// BLOCK FRAMING
// ============================================================================

/// Replace every 64-bit block by its 72-bit codeword (Secded) or pass through.
pub fn encode_payload(payload: &[bool], framing: Framing) -> Result<Vec<bool>, ConfigError> {
    match framing {
        Framing::Plain => Ok(payload.to_vec()),
        Framing::Secded => {
            if payload.len() % DATA_BLOCK_BITS != 0 {
                return Err(ConfigError::PayloadNotBlockAligned {
                    bits: payload.len() as u64,
                    block: DATA_BLOCK_BITS as u64,
                });
            }
            let mut out = Vec::with_capacity(payload.len() / DATA_BLOCK_BITS * CODEWORD_BITS);
            for block in payload.chunks_exact(DATA_BLOCK_BITS) {
                let data = bits_to_u64(block);
                let mut check = [false; PARITY_BITS];
                u64_to_bits(fec::encode(data) as u64, &mut check);
                out.extend_from_slice(block);
                out.extend_from_slice(&check);
            }
            Ok(out)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedPayload {
    pub bits: Vec<bool>,
    /// Per-block FEC error count. Empty under Plain framing.
    pub fec_errors: Vec<u32>,
}

/// Inverse of encode_payload on de-whitened symbols. A trailing partial
/// codeword is dropped.
pub fn decode_symbols(symbols: &[bool], framing: Framing) -> DecodedPayload {
    match framing {
        Framing::Plain => DecodedPayload { bits: symbols.to_vec(), fec_errors: Vec::new() },
        Framing::Secded => {
            let blocks = symbols.len() / CODEWORD_BITS;
            let mut bits = vec![false; blocks * DATA_BLOCK_BITS];
            let mut fec_errors = Vec::with_capacity(blocks);
            for (cw, out) in symbols.chunks_exact(CODEWORD_BITS).zip(bits.chunks_exact_mut(DATA_BLOCK_BITS)) {
                let data = bits_to_u64(&cw[..DATA_BLOCK_BITS]);
                let check = bits_to_u64(&cw[DATA_BLOCK_BITS..]) as u8;
                let d = fec::decode(data, check);
                u64_to_bits(d.data, out);
                fec_errors.push(d.errors);
            }
            DecodedPayload { bits, fec_errors }
        }
    }
}

// ============================================================================
// TRANSMISSION — everything both ends derive from the PayloadSpec
// ============================================================================

#[derive(Clone, Debug)]
pub struct Transmission {
    /// Logical payload bits.
    pub payload: Vec<bool>,
    /// Payload after FEC framing (equal to payload under Plain).
    pub encoded: Vec<bool>,
    /// Whitened channel symbols, one per transmitted bit. Symbol `i` is masked
    /// with keystream position `i`, so the loops never track the keystream.
    pub symbols: Vec<bool>,
}

impl Transmission {
    pub fn prepare(spec: &PayloadSpec) -> Result<Self, ConfigError> {
        if spec.bits == 0 { return Err(ConfigError::EmptyPayload); }
        let payload = generate_payload(spec.kind, spec.bits as usize);
        Self::from_payload(payload, spec.framing, spec.line_coding)
    }

    pub fn from_payload(payload: Vec<bool>, framing: Framing, coding: LineCoding) -> Result<Self, ConfigError> {
        let encoded = encode_payload(&payload, framing)?;
        let mut symbols = encoded.clone();
        whiten::whiten_in_place(coding, &mut symbols);
        Ok(Transmission { payload, encoded, symbols })
    }

    pub fn len(&self) -> usize { self.symbols.len() }

    pub fn is_empty(&self) -> bool { self.symbols.is_empty() }
}

// ============================================================================
// TESTS
// ============================================================================
