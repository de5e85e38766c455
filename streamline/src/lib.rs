// STREAMLINE — CRATE ROOT (LIBRARY)
// Cross-core last-level-cache covert channel. Two processes share a read-only
// mapping and the LLC; bits move as cache residency, nothing else is exchanged.
//
// Module hierarchy:
//   engine/protocol  — channel constants, ChannelConfig, strategy enums
//   engine/runtime   — TSC clock, fatal exit, CPU pinning, SCHED_FIFO
//   engine/typestate — handshake proof token, per-side sync counters
//   channel/         — timing capability, shared medium layout, tx/rx loops, cache model
//   coding/          — keystream whitening, SECDED(72,64), payload framing
//   sync/            — one-shot Flush+Reload handshake, periodic barrier rendezvous
//   analysis         — BER, block classification, throughput, epoch breakdown
//   cli              — shared argument surface → validated ChannelConfig

pub mod engine;
pub mod channel;
pub mod coding;
pub mod sync;
pub mod analysis;
pub mod cli;
pub mod error;
