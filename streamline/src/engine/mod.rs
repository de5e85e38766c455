// STREAMLINE — ENGINE MODULE
// What the channel IS: its parameters (protocol) and the process it runs in (runtime).
// Channel moves the bits. Coding shapes them. Sync keeps both ends in step.

pub mod protocol;
pub mod runtime;
pub mod typestate;
