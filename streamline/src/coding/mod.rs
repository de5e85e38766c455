// STREAMLINE — CODING MODULE
// Keystream line coding (whiten) and SECDED(72,64) block framing (fec, framing).

pub mod whiten;
pub mod fec;
pub mod framing;
