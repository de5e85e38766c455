// STREAMLINE — POST-RUN ANALYSIS
// Consumes the known Transmission and the receiver's decoded symbols.
// Two views of the same run:
//   channel level: whitened symbol vs received symbol, per direction
//   data level:    after un-whitening and FEC decode, per 64-bit block
// plus throughput from the receive loop duration, per-epoch breakdown, and
// barrier diagnostics. Nothing here runs during transmission.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use crate::channel::datapath::{LatencyTally, ReceiveLog};
use crate::coding::framing::{decode_symbols, Transmission};
use crate::coding::whiten;
use crate::engine::protocol::{Framing, LineCoding, PayloadKind, PayloadSpec, DATA_BLOCK_BITS, HEARTBEAT_BITS};
use crate::error::ChannelError;
use crate::sync::barrier::BarrierRecord;

// ============================================================================
// ERROR STATISTICS
// ============================================================================

/// Blocks by residual data-bit errors after decoding.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BlockTally {
    pub clean: u64,
    pub single: u64,
    pub multi: u64,
}

impl BlockTally {
    pub fn record(&mut self, errors: u64) {
        match errors {
            0 => self.clean += 1,
            1 => self.single += 1,
            _ => self.multi += 1,
        }
    }

    pub fn total(&self) -> u64 { self.clean + self.single + self.multi }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ErrorReport {
    /// Channel symbols compared.
    pub symbols: u64,
    pub symbols_correct: u64,
    /// Sent 1, received 0.
    pub one_to_zero: u64,
    /// Sent 0, received 1.
    pub zero_to_one: u64,
    /// Transmitted symbols equal to 1.
    pub ones: u64,
    /// Payload bits compared after decoding.
    pub data_bits: u64,
    pub data_correct: u64,
    pub blocks: BlockTally,
    /// Blocks where the decoder fixed one error.
    pub fec_corrected: u64,
    /// Blocks where the decoder saw two or more and gave up.
    pub fec_detected: u64,
    #[serde(skip)]
    pub decoded: Vec<bool>,
}

fn pct(n: u64, d: u64) -> f64 {
    if d == 0 { 0.0 } else { 100.0 * n as f64 / d as f64 }
}

impl ErrorReport {
    /// Data-level bit-error rate in percent.
    pub fn ber_pct(&self) -> f64 { 100.0 - self.correct_pct() }
    pub fn correct_pct(&self) -> f64 {
        if self.data_bits == 0 { 0.0 } else { pct(self.data_correct, self.data_bits) }
    }
    pub fn symbol_correct_pct(&self) -> f64 { pct(self.symbols_correct, self.symbols) }
    pub fn one_to_zero_pct(&self) -> f64 { pct(self.one_to_zero, self.symbols) }
    pub fn zero_to_one_pct(&self) -> f64 { pct(self.zero_to_one, self.symbols) }
    pub fn ones_pct(&self) -> f64 { pct(self.ones, self.symbols) }
    /// Share of payload bits lost to blocks with exactly one residual error.
    pub fn single_bit_pct(&self) -> f64 { pct(self.blocks.single, self.data_bits) }
    /// Everything else.
    pub fn multi_bit_pct(&self) -> f64 { (self.ber_pct() - self.single_bit_pct()).max(0.0) }
}

/// Compare what was sent against what was received.
/// `rx_symbols` are raw classified channel symbols (still whitened). Only the
/// common prefix of both sequences is compared.
pub fn analyze(tx: &Transmission, rx_symbols: &[bool], framing: Framing, coding: LineCoding) -> ErrorReport {
    let n = tx.symbols.len().min(rx_symbols.len());
    let mut report = ErrorReport {
        symbols: n as u64,
        symbols_correct: 0,
        one_to_zero: 0,
        zero_to_one: 0,
        ones: 0,
        data_bits: 0,
        data_correct: 0,
        blocks: BlockTally::default(),
        fec_corrected: 0,
        fec_detected: 0,
        decoded: Vec::new(),
    };

    for (sent, got) in tx.symbols[..n].iter().zip(&rx_symbols[..n]) {
        report.ones += *sent as u64;
        if sent == got {
            report.symbols_correct += 1;
        } else if *sent {
            report.one_to_zero += 1;
        } else {
            report.zero_to_one += 1;
        }
    }

    // Undo the line code, then the framing.
    let mask = whiten::keystream(coding, n);
    let dewhitened: Vec<bool> = rx_symbols[..n].iter().zip(&mask).map(|(b, m)| b ^ m).collect();
    let decoded = decode_symbols(&dewhitened, framing);
    for e in &decoded.fec_errors {
        match *e {
            0 => {}
            1 => report.fec_corrected += 1,
            _ => report.fec_detected += 1,
        }
    }

    let data_len = decoded.bits.len().min(tx.payload.len());
    for (sent, got) in tx.payload[..data_len].chunks(DATA_BLOCK_BITS).zip(decoded.bits[..data_len].chunks(DATA_BLOCK_BITS)) {
        let errors = sent.iter().zip(got).filter(|(a, b)| a != b).count() as u64;
        report.data_bits += sent.len() as u64;
        report.data_correct += sent.len() as u64 - errors;
        report.blocks.record(errors);
    }
    report.decoded = decoded.bits;
    report
}

// ============================================================================
// THROUGHPUT
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Throughput {
    pub bit_period_cycles: u64,
    pub bit_period_us: f64,
    /// Payload bits per second, parity overhead excluded.
    pub bits_per_second: f64,
    pub mhz: f64,
}

pub fn throughput(start: u64, end: u64, samples: u64, mhz: f64, framing: Framing) -> Throughput {
    let bit_period_cycles = if samples == 0 { 0 } else { end.wrapping_sub(start) / samples };
    let bit_period_us = bit_period_cycles as f64 / mhz;
    let efficiency = DATA_BLOCK_BITS as f64 / framing.block_len() as f64;
    let bits_per_second = if bit_period_us > 0.0 { efficiency * 1_000_000.0 / bit_period_us } else { 0.0 };
    Throughput { bit_period_cycles, bit_period_us, bits_per_second, mhz }
}

// ============================================================================
// EPOCH BREAKDOWN (channel level, per HEARTBEAT_BITS symbols)
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct EpochStats {
    pub epoch: u64,
    pub samples: u64,
    pub correct: u64,
    pub one_to_zero: u64,
    pub zero_to_one: u64,
}

impl EpochStats {
    pub fn correct_pct(&self) -> f64 { pct(self.correct, self.samples) }
}

pub fn epoch_breakdown(tx_symbols: &[bool], rx_symbols: &[bool], epoch_len: usize) -> Vec<EpochStats> {
    let n = tx_symbols.len().min(rx_symbols.len());
    tx_symbols[..n].chunks(epoch_len.max(1))
        .zip(rx_symbols[..n].chunks(epoch_len.max(1)))
        .enumerate()
        .map(|(epoch, (tx, rx))| {
            let mut s = EpochStats { epoch: epoch as u64, samples: tx.len() as u64, correct: 0, one_to_zero: 0, zero_to_one: 0 };
            for (a, b) in tx.iter().zip(rx) {
                if a == b { s.correct += 1; } else if *a { s.one_to_zero += 1; } else { s.zero_to_one += 1; }
            }
            s
        })
        .collect()
}

// ============================================================================
// BARRIER DIAGNOSTICS
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TimedOutRound {
    pub bit_index: u64,
    pub delay: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SyncDiagnostics {
    pub rounds: u64,
    pub timeouts: u64,
    /// Rounds longer than 90% of the timeout, timed out or not.
    pub misses: u64,
    pub mean_duration: f64,
    pub timed_out: Vec<TimedOutRound>,
}

pub fn sync_diagnostics(records: &[BarrierRecord], timeout: u64) -> SyncDiagnostics {
    let limit = timeout as f64 * 0.9;
    let total: u64 = records.iter().map(|r| r.duration()).sum();
    SyncDiagnostics {
        rounds: records.len() as u64,
        timeouts: records.iter().filter(|r| r.timed_out).count() as u64,
        misses: records.iter().filter(|r| r.duration() as f64 > limit).count() as u64,
        mean_duration: if records.is_empty() { 0.0 } else { total as f64 / records.len() as f64 },
        timed_out: records.iter()
            .filter(|r| r.timed_out)
            .map(|r| TimedOutRound { bit_index: r.bit_index, delay: r.duration() })
            .collect(),
    }
}

// ============================================================================
// RUN REPORT
// ============================================================================

/// Column header for the results file, matching the bitrate plot script.
pub const RESULTS_HEADER: &str = "PayloadBits BitsPerSec BER OneToZero ZeroToOne OneBit MultiBit";

#[derive(Clone, Debug, Serialize)]
pub struct RunReport {
    pub payload_kind: PayloadKind,
    pub payload_bits: u64,
    pub transmitted_bits: u64,
    pub framing: Framing,
    pub throughput: Throughput,
    pub errors: ErrorReport,
    pub latency: LatencyTally,
    pub sync: SyncDiagnostics,
    pub epochs: Vec<EpochStats>,
}

impl RunReport {
    pub fn build(
        spec: &PayloadSpec,
        tx: &Transmission,
        log: &ReceiveLog,
        rx_symbols: &[bool],
        mhz: f64,
        rx_timeout: u64,
    ) -> Self {
        RunReport {
            payload_kind: spec.kind,
            payload_bits: tx.payload.len() as u64,
            transmitted_bits: tx.symbols.len() as u64,
            framing: spec.framing,
            throughput: throughput(log.start, log.end, log.samples.len() as u64, mhz, spec.framing),
            errors: analyze(tx, rx_symbols, spec.framing, spec.line_coding),
            latency: log.tally,
            sync: sync_diagnostics(&log.barriers, rx_timeout),
            epochs: epoch_breakdown(&tx.symbols, rx_symbols, HEARTBEAT_BITS as usize),
        }
    }

    /// One whitespace-separated line in RESULTS_HEADER order.
    pub fn results_line(&self) -> String {
        let e = &self.errors;
        format!(
            "{} {:.4} {:.2}% {:.2} {:.2} {:.2} {:.2}",
            self.payload_bits, self.throughput.bits_per_second, e.ber_pct(),
            e.one_to_zero_pct(), e.zero_to_one_pct(), e.single_bit_pct(), e.multi_bit_pct()
        )
    }

    /// Append the results line, writing the header first if the file is new.
    pub fn append_results(&self, path: &Path) -> Result<(), ChannelError> {
        let fresh = !path.exists();
        let out = |source| ChannelError::Output { path: path.to_path_buf(), source };
        let mut f = OpenOptions::new().create(true).append(true).open(path).map_err(out)?;
        if fresh { writeln!(f, "{}", RESULTS_HEADER).map_err(out)?; }
        writeln!(f, "{}", self.results_line()).map_err(out)
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let e = &self.errors;
        let t = &self.throughput;
        let b = &e.blocks;
        writeln!(f, "-----------------------------")?;
        writeln!(f, "Bit period: {} cycles ({:.4}us @ {:.0}MHz). Bits/s: {:.4}",
            t.bit_period_cycles, t.bit_period_us, t.mhz, t.bits_per_second)?;
        writeln!(f, "Final correct: {:.2}% ({}/{}). 1->0: {:.2}%  0->1: {:.2}%  ones: {:.2}%",
            e.correct_pct(), e.data_correct, e.data_bits,
            e.one_to_zero_pct(), e.zero_to_one_pct(), e.ones_pct())?;
        let tot = b.total();
        writeln!(f, "Blocks clean / 1-bit / 2+-bit: {:.2}% {:.2}% {:.2}% ({},{},{})/{}. Bit errors (1-bit, 2+): {:.2}% {:.2}%",
            pct(b.clean, tot), pct(b.single, tot), pct(b.multi, tot), b.clean, b.single, b.multi, tot,
            e.single_bit_pct(), e.multi_bit_pct())?;
        if self.framing == Framing::Secded {
            writeln!(f, "FEC: {} corrected, {} detected uncorrectable", e.fec_corrected, e.fec_detected)?;
        }
        writeln!(f, "Channel correct: {:.2}% ({}/{}). 1->0: {:.2}%  0->1: {:.2}%",
            e.symbol_correct_pct(), e.symbols_correct, e.symbols, e.one_to_zero_pct(), e.zero_to_one_pct())?;
        writeln!(f, "Samples: {} hits, {} misses, {} outliers",
            self.latency.hits, self.latency.misses, self.latency.outliers)?;
        writeln!(f, "Sync: {} rounds, {} timeouts, {} misses", self.sync.rounds, self.sync.timeouts, self.sync.misses)?;
        for r in &self.sync.timed_out {
            writeln!(f, "  bit {}: waited {} cycles", r.bit_index, r.delay)?;
        }
        write!(f, "-----------------------------")
    }
}

impl RunReport {
    /// Epoch table, one row per HEARTBEAT_BITS symbols.
    pub fn render_epochs(&self) -> String {
        let mut s = String::from("epoch  correct  1->0  0->1\n");
        for ep in &self.epochs {
            s.push_str(&format!("{:>5}  {:>6.2}%  {:>5.2}%  {:>5.2}%\n",
                ep.epoch, ep.correct_pct(), pct(ep.one_to_zero, ep.samples), pct(ep.zero_to_one, ep.samples)));
        }
        s
    }
}

// ============================================================================
// TESTS
// ============================================================================
