//! The forward-propagation plotting pipeline.
//!
//! # Module map
//! - `f1`: seeds table 1 from the ChaCha8 keystream into bucket files.
//! - `sort`: radix sort of bucket entries by y.
//! - `matching`: the kBC group matching rule and pair finder.
//! - `fx`: the per-table forward function (BLAKE3 over y and metadata).
//! - `pass`: one table-to-table pass over all buckets.
//! - `coordinator`: sequences F1 and the six passes, owning file rotation.
//! - `reader`: unpackers for the emitted artifacts.

pub mod coordinator;
pub mod f1;
pub mod fx;
pub mod matching;
pub mod pass;
pub mod reader;
pub mod sort;

pub use coordinator::{DiskPlotter, PlotArtifacts};
pub use matching::has_match;
