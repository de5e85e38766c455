// STREAMLINE — CHANNEL MODULE
// timing:   cycle counter, eviction and timed loads behind one capability trait.
// medium:   shared region geometry, slot mapping, ready registers, file mapping.
// datapath: steady-state per-bit send and sample loops.
// sim:      in-process cache model for running the protocol without hardware.

pub mod timing;
pub mod medium;
pub mod datapath;
pub mod sim;
