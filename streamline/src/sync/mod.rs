// STREAMLINE — SYNC MODULE
// handshake: one-shot preamble exchange that aligns both ends before streaming.
// barrier:   periodic Flush+Reload rendezvous that bounds clock drift mid-stream.

pub mod handshake;
pub mod barrier;
