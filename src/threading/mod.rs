//! Thread-coordination primitives for the multi-threaded table passes.
//!
//! # Module map
//! - `signal`: auto-reset latch used for command-ring wakeups and fences.
//! - `barrier`: reusable rendezvous plus the control-thread critical-section
//!   protocol the generators run under.
//! - `prefix_sum`: per-thread bucket destination offsets.

pub mod barrier;
pub mod prefix_sum;
pub mod signal;

pub use barrier::JobBarrier;
pub use prefix_sum::PrefixSumWorkspace;
pub use signal::Signal;
