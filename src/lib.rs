//! External-memory bucketized plot generation pipeline.
//!
//! Given a 32-byte plot identifier, the pipeline materializes seven sorted
//! tables of proof-of-space entries linked by back-pointers, streaming every
//! table pass through bucket files on temporary storage so the working set
//! stays bounded regardless of k.
//!
//! High-level flow (one table pass):
//! 1) Read the table's bucket streams through the disk buffer queue.
//! 2) Radix-sort each bucket by y; find kBC-group matches.
//! 3) Append `(left, delta)` pair records for the next table.
//! 4) Evaluate fx (BLAKE3 over `y ‖ metaL ‖ metaR`) across the compute pool.
//! 5) Redistribute `(y', meta')` into the next generation's bucket files
//!    through the bit-packed bucket writers (f7 streams out directly).
//!
//! Component map:
//! - [`io`]: bounded work heap, command ring, dispatch thread, bit-bucket
//!   writer (the asynchronous I/O layer).
//! - [`plot`]: F1 generator, matcher, fx, table passes, coordinator.
//! - [`threading`]: signals, the job barrier, the parallel prefix sum.
//! - [`bits`]: big-endian bit-field packing shared by all of the above.
//!
//! The crate stops at the emitted artifacts (pair streams, the f7 stream,
//! bucket counts); assembling a finished plot file from them is the
//! finalizer's job, not ours.

pub mod bits;
pub mod errors;
pub mod io;
pub mod params;
pub mod plot;
pub mod threading;

pub use errors::{PlotError, QueueError};
pub use params::{ConfigError, PlotParams, Table, EXTRA_BITS, K_BC, PLOT_ID_LEN};
pub use plot::{DiskPlotter, PlotArtifacts};
