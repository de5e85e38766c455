// STREAMLINE — ERROR TYPES
// Configuration errors are rejected before any transmission starts.
// Channel errors cover the backing file and trace output.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("bit count must be non-zero")]
    EmptyPayload,
    #[error("FEC framing needs a multiple of {block} payload bits, got {bits}")]
    PayloadNotBlockAligned { bits: u64, block: u64 },
    #[error("receiver lead must be non-zero")]
    ZeroRxLead,
    #[error("barrier period {period} must exceed receiver lead {lead}")]
    BarrierPeriod { period: u64, lead: u64 },
    #[error("keystream period must be non-zero")]
    KeystreamPeriod,
    #[error("{name} threshold must be non-zero")]
    ZeroThreshold { name: &'static str },
    #[error("outlier bound {bound} must exceed stream threshold {threshold}")]
    OutlierBound { bound: u64, threshold: u64 },
    #[error("communication array of {bytes} bytes cannot hold a page pair")]
    ArrayTooSmall { bytes: u64 },
    #[error("handshake interval must be non-zero")]
    HandshakeInterval,
    #[error("preamble needs at least 2 alternating pairs, got {0}")]
    PreambleTooShort(u32),
    #[error("loopback noise {0} is not a probability")]
    NoiseProbability(f64),
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("cannot open backing file {path}: {source}")]
    Open { path: PathBuf, source: std::io::Error },
    #[error("backing file {path} is {actual} bytes, channel needs {required}")]
    TooSmall { path: PathBuf, actual: u64, required: u64 },
    #[error("mmap of {len} bytes failed: {source}")]
    Map { len: usize, source: std::io::Error },
    #[error("offset {offset} leaves no room for the channel in a {len}-byte file")]
    Offset { offset: u64, len: u64 },
    #[error("mapped view is not 8-byte aligned")]
    Misaligned,
    #[error("trace output {path}: {source}")]
    Output { path: PathBuf, source: std::io::Error },
}
