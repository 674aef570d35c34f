//! Error types for the plotting pipeline stages.
//!
//! Errors are stage-specific to keep diagnostics precise. All of them are
//! fatal to the plot in progress: the output is a cryptographically tied
//! dataset, so partial completion is worthless and nothing retries.
//! I/O variants preserve the file-set name and bucket index so a failing
//! temporary file can be identified directly from the message.

use std::fmt;
use std::io;

use crate::io::work_heap::HeapAllocError;

pub use crate::params::ConfigError;

/// Errors raised by the disk buffer queue's dispatch thread.
#[derive(Debug)]
#[non_exhaustive]
pub enum QueueError {
    /// Opening a temporary file failed.
    Open {
        name: &'static str,
        bucket: u32,
        source: io::Error,
    },
    /// Writing to a temporary file failed.
    Write {
        name: &'static str,
        bucket: u32,
        source: io::Error,
    },
    /// Reading from a temporary file failed.
    Read {
        name: &'static str,
        bucket: u32,
        source: io::Error,
    },
    /// Seeking a temporary file failed.
    Seek {
        name: &'static str,
        bucket: u32,
        source: io::Error,
    },
    /// Temporary files reported inconsistent device block sizes.
    BlockSizeMismatch { expected: usize, got: usize },
    /// A bucket write would land at a non-block-aligned file offset.
    Misaligned {
        name: &'static str,
        bucket: u32,
        offset: u64,
        block_size: usize,
    },
    /// The dispatch thread terminated before completing a request.
    Terminated,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open {
                name,
                bucket,
                source,
            } => write!(f, "open '{name}_{bucket}.tmp' failed: {source}"),
            Self::Write {
                name,
                bucket,
                source,
            } => write!(f, "write to '{name}_{bucket}.tmp' failed: {source}"),
            Self::Read {
                name,
                bucket,
                source,
            } => write!(f, "read from '{name}_{bucket}.tmp' failed: {source}"),
            Self::Seek {
                name,
                bucket,
                source,
            } => write!(f, "seek in '{name}_{bucket}.tmp' failed: {source}"),
            Self::BlockSizeMismatch { expected, got } => write!(
                f,
                "temporary files have differing block sizes: {expected} vs {got}"
            ),
            Self::Misaligned {
                name,
                bucket,
                offset,
                block_size,
            } => write!(
                f,
                "bucket write misaligned: '{name}_{bucket}.tmp' offset {offset} not a multiple of {block_size}"
            ),
            Self::Terminated => write!(f, "disk buffer queue terminated"),
        }
    }
}

impl std::error::Error for QueueError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open { source, .. }
            | Self::Write { source, .. }
            | Self::Read { source, .. }
            | Self::Seek { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Top-level pipeline error.
#[derive(Debug)]
#[non_exhaustive]
pub enum PlotError {
    /// Invalid configuration (detected at construction).
    Config(ConfigError),
    /// Fatal I/O failure in the disk buffer queue.
    Queue(QueueError),
    /// The work heap cannot satisfy an allocation it was provisioned for.
    Heap(HeapAllocError),
    /// An internal invariant was violated; the plot is corrupt.
    Invariant { detail: String },
}

impl PlotError {
    /// Creates an invariant-violation error.
    pub fn invariant(detail: impl Into<String>) -> Self {
        Self::Invariant {
            detail: detail.into(),
        }
    }
}

impl fmt::Display for PlotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Queue(err) => write!(f, "{err}"),
            Self::Heap(err) => write!(f, "{err}"),
            Self::Invariant { detail } => write!(f, "invariant violated: {detail}"),
        }
    }
}

impl std::error::Error for PlotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Queue(err) => Some(err),
            Self::Heap(err) => Some(err),
            Self::Invariant { .. } => None,
        }
    }
}

impl From<ConfigError> for PlotError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<QueueError> for PlotError {
    fn from(err: QueueError) -> Self {
        Self::Queue(err)
    }
}

impl From<HeapAllocError> for PlotError {
    fn from(err: HeapAllocError) -> Self {
        Self::Heap(err)
    }
}
