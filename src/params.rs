//! Proof-of-space constants, table identities, and validated configuration.
//!
//! The bit-layout constants here are fixed by the external plot-format
//! standard and must be reproduced exactly: the ChaCha8 key prefix, the
//! extra-bit count carried on y, and the kBC group modulus. Everything else
//! (bucket count, thread counts, heap extent) is per-run configuration
//! validated at construction per the fail-fast error policy.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Length of a plot identifier in bytes.
pub const PLOT_ID_LEN: usize = 32;

/// Extra bits carried on y above the k-bit core, used by the matching rule.
pub const EXTRA_BITS: u32 = 6;

/// `2^EXTRA_BITS`: number of match targets scanned per left entry.
pub const EXTRA_BITS_POW: u32 = 1 << EXTRA_BITS;

/// Matching group modulus: `K_B * K_C`.
pub const K_BC: u32 = K_B * K_C;

/// Matching rule row modulus.
pub const K_B: u32 = 119;

/// Matching rule column modulus.
pub const K_C: u32 = 127;

/// ChaCha8 block size in bytes.
pub const F1_BLOCK_SIZE: usize = 64;

/// ChaCha8 block size in bits.
pub const F1_BLOCK_SIZE_BITS: u64 = (F1_BLOCK_SIZE as u64) * 8;

/// Smallest k accepted. Below this the kBC y-space degenerates (fewer than
/// two groups per bucket) and the pipeline's provisioning math is meaningless.
pub const MIN_K: u32 = 16;

/// Largest k accepted. The meta carrier is 128 bits (`k * 4` at most) and
/// the packed layout constants assume k=32.
pub const MAX_K: u32 = 32;

/// Bucket counts the pipeline supports (powers of two).
pub const SUPPORTED_BUCKET_COUNTS: [u32; 5] = [64, 128, 256, 512, 1024];

/// Fallback device block size when discovery is unavailable.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Identifies one of the seven forward-propagation tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Table {
    Table1 = 1,
    Table2 = 2,
    Table3 = 3,
    Table4 = 4,
    Table5 = 5,
    Table6 = 6,
    Table7 = 7,
}

impl Table {
    /// All tables in forward order.
    pub const ALL: [Table; 7] = [
        Table::Table1,
        Table::Table2,
        Table::Table3,
        Table::Table4,
        Table::Table5,
        Table::Table6,
        Table::Table7,
    ];

    /// Constructs a table from its 1-based number.
    #[must_use]
    pub const fn from_number(n: u8) -> Option<Table> {
        match n {
            1 => Some(Table::Table1),
            2 => Some(Table::Table2),
            3 => Some(Table::Table3),
            4 => Some(Table::Table4),
            5 => Some(Table::Table5),
            6 => Some(Table::Table6),
            7 => Some(Table::Table7),
            _ => None,
        }
    }

    /// 1-based table number.
    #[inline]
    #[must_use]
    pub const fn number(self) -> u8 {
        self as u8
    }

    /// The next table, if any.
    #[must_use]
    pub const fn next(self) -> Option<Table> {
        Table::from_number(self as u8 + 1)
    }

    /// Metadata width multiplier for this table's entries.
    ///
    /// Entry metadata is `k * multiplier` bits wide. Table 7 carries none.
    #[inline]
    #[must_use]
    pub const fn meta_multiplier(self) -> u32 {
        match self {
            Table::Table1 => 1,
            Table::Table2 => 2,
            Table::Table3 | Table::Table4 => 4,
            Table::Table5 => 3,
            Table::Table6 => 2,
            Table::Table7 => 0,
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table {}", self.number())
    }
}

/// Configuration errors detected at pipeline construction.
///
/// Every variant is fatal: the pipeline refuses to start rather than run
/// with parameters that would corrupt the plot or deadlock the heap.
#[derive(Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// k outside the supported range.
    InvalidK { k: u32 },
    /// Bucket count is not one of the supported powers of two.
    UnsupportedBucketCount { num_buckets: u32 },
    /// A thread count was zero.
    ZeroThreads,
    /// The heap cannot hold the minimum I/O reserve for this configuration.
    HeapTooSmall { required: usize, configured: usize },
    /// Explicit block size override is zero or not a power of two.
    InvalidBlockSize { block_size: usize },
    /// The work directory could not be created or probed.
    WorkDir { path: PathBuf, source: io::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidK { k } => {
                write!(f, "k={k} out of supported range {MIN_K}..={MAX_K}")
            }
            Self::UnsupportedBucketCount { num_buckets } => {
                write!(
                    f,
                    "bucket count {num_buckets} unsupported (expected one of {SUPPORTED_BUCKET_COUNTS:?})"
                )
            }
            Self::ZeroThreads => write!(f, "thread counts must be positive"),
            Self::HeapTooSmall {
                required,
                configured,
            } => write!(
                f,
                "work heap too small: minimum IO reserve {required} bytes, configured {configured}"
            ),
            Self::InvalidBlockSize { block_size } => {
                write!(f, "block size {block_size} is not a power of two >= 512")
            }
            Self::WorkDir { path, source } => {
                write!(f, "work directory {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::WorkDir { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Runtime configuration for one plot.
#[derive(Clone, Debug)]
pub struct PlotParams {
    /// log2 of the nominal entry count. k=32 is the primary target.
    pub k: u32,
    /// Number of y-space buckets (power of two in 64..=1024).
    pub num_buckets: u32,
    /// Compute threads for the fx passes.
    pub thread_count: usize,
    /// Compute threads for the F1 generator.
    pub f1_thread_count: usize,
    /// Directory for temporary bucket files.
    pub work_dir: PathBuf,
    /// Work heap extent in bytes.
    pub heap_size: usize,
    /// Request unbuffered (direct) I/O on bucket files.
    pub use_direct_io: bool,
    /// Block size override. `None` discovers the size from the first
    /// temporary file.
    pub block_size: Option<usize>,
}

impl PlotParams {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k < MIN_K || self.k > MAX_K {
            return Err(ConfigError::InvalidK { k: self.k });
        }
        if !SUPPORTED_BUCKET_COUNTS.contains(&self.num_buckets) {
            return Err(ConfigError::UnsupportedBucketCount {
                num_buckets: self.num_buckets,
            });
        }
        if self.thread_count == 0 || self.f1_thread_count == 0 {
            return Err(ConfigError::ZeroThreads);
        }
        if let Some(bs) = self.block_size {
            if bs < 512 || !bs.is_power_of_two() {
                return Err(ConfigError::InvalidBlockSize { block_size: bs });
            }
        }
        let required = self.minimum_heap_size();
        if self.heap_size < required {
            return Err(ConfigError::HeapTooSmall {
                required,
                configured: self.heap_size,
            });
        }
        Ok(())
    }

    /// Bits of y that select the bucket.
    #[inline]
    #[must_use]
    pub fn bucket_bits(&self) -> u32 {
        self.num_buckets.trailing_zeros()
    }

    /// Full y width: k + EXTRA_BITS.
    #[inline]
    #[must_use]
    pub fn y_bits(&self) -> u32 {
        self.k + EXTRA_BITS
    }

    /// Width of the bucket-local y stored in bucket files.
    #[inline]
    #[must_use]
    pub fn y_bits_local(&self) -> u32 {
        self.y_bits() - self.bucket_bits()
    }

    /// Bit width of one table-1 bucket entry: `x || y_local`.
    #[inline]
    #[must_use]
    pub fn t1_entry_bits(&self) -> u32 {
        self.y_bits_local() + self.k
    }

    /// Metadata width in bits for a table's entries.
    #[inline]
    #[must_use]
    pub fn meta_bits(&self, table: Table) -> u32 {
        self.k * table.meta_multiplier()
    }

    /// Width of the meta-A stream field for a table (high part of meta).
    #[inline]
    #[must_use]
    pub fn meta_a_bits(&self, table: Table) -> u32 {
        self.k * table.meta_multiplier().min(2)
    }

    /// Width of the meta-B stream field for a table (low remainder of meta).
    #[inline]
    #[must_use]
    pub fn meta_b_bits(&self, table: Table) -> u32 {
        self.k * table.meta_multiplier().saturating_sub(2)
    }

    /// Nominal entries per bucket-sized x chunk in F1.
    #[inline]
    #[must_use]
    pub fn entries_per_chunk(&self) -> u64 {
        (1u64 << self.k).div_ceil(u64::from(self.num_buckets))
    }

    /// Minimum heap size for this configuration.
    ///
    /// The heap must hold, concurrently: one submit buffer for each of the
    /// three bucket writers (a chunk's worth of entries at the widest entry
    /// encoding plus per-bucket block slack), the read buffers for one
    /// bucket of the widest table, and a pair-stream staging buffer,
    /// doubled so one batch can be in flight while the next is staged.
    #[must_use]
    pub fn minimum_heap_size(&self) -> usize {
        let block = self.block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        // Widest bucket entry: y_local + meta at multiplier 4.
        let widest_bits = u64::from(self.y_bits_local() + self.k * 4);
        let chunk_entries = self.entries_per_chunk();
        let chunk_bytes = (chunk_entries * widest_bits).div_ceil(8) as usize;
        let slack = (self.num_buckets as usize + 1) * block;
        // Three writers (y, meta A, meta B), read-side buffers, pair staging.
        (chunk_bytes + slack) * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_params() -> PlotParams {
        PlotParams {
            k: 18,
            num_buckets: 64,
            thread_count: 2,
            f1_thread_count: 2,
            work_dir: PathBuf::from("/tmp"),
            heap_size: 64 * 1024 * 1024,
            use_direct_io: false,
            block_size: Some(4096),
        }
    }

    #[test]
    fn kbc_constant() {
        assert_eq!(K_BC, 15113);
        assert_eq!(K_B as u64 * K_C as u64, K_BC as u64);
    }

    #[test]
    fn meta_multipliers_follow_standard() {
        let expected = [1, 2, 4, 4, 3, 2, 0];
        for (table, want) in Table::ALL.into_iter().zip(expected) {
            assert_eq!(table.meta_multiplier(), want, "{table}");
        }
    }

    #[test]
    fn widths_k18_64_buckets() {
        let p = base_params();
        assert_eq!(p.bucket_bits(), 6);
        assert_eq!(p.y_bits(), 24);
        assert_eq!(p.y_bits_local(), 18);
        assert_eq!(p.t1_entry_bits(), 36);
        assert_eq!(p.meta_bits(Table::Table3), 72);
        assert_eq!(p.meta_a_bits(Table::Table3), 36);
        assert_eq!(p.meta_b_bits(Table::Table3), 36);
        assert_eq!(p.meta_b_bits(Table::Table2), 0);
    }

    #[test]
    fn validate_rejects_bad_k() {
        let mut p = base_params();
        p.k = 40;
        assert!(matches!(
            p.validate(),
            Err(ConfigError::InvalidK { k: 40 })
        ));
    }

    #[test]
    fn validate_rejects_bucket_count() {
        let mut p = base_params();
        p.num_buckets = 96;
        assert!(matches!(
            p.validate(),
            Err(ConfigError::UnsupportedBucketCount { .. })
        ));
    }

    #[test]
    fn validate_rejects_tiny_heap() {
        let mut p = base_params();
        p.heap_size = 1024;
        assert!(matches!(p.validate(), Err(ConfigError::HeapTooSmall { .. })));
    }

    #[test]
    fn validate_accepts_base() {
        assert!(base_params().validate().is_ok());
    }
}
