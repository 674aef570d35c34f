//! Unpackers for the pipeline's on-disk artifacts.
//!
//! Bucket files are contiguous big-endian bit streams whose true length is
//! implied by the entry counts the pipeline tracks (trailing pad bits and
//! block padding are ignored). Pair and f7 streams are fixed-width
//! little-endian records. The table pass uses these unpackers on freshly
//! read buffers; the test suite and downstream plot finalizers use them on
//! whole files.

use crate::bits::BitReader;

/// Unpacks `count` single-field entries of `field_bits` each.
///
/// Used for table 2+ y streams and both metadata streams (every such field
/// is at most 64 bits wide).
#[must_use]
pub fn unpack_fields(bytes: &[u8], count: u64, field_bits: u32) -> Vec<u64> {
    debug_assert!(field_bits <= 64);
    let mut reader = BitReader::new(bytes);
    (0..count).map(|_| reader.read(field_bits)).collect()
}

/// Unpacks `count` table-1 entries of `x ‖ y_local`.
///
/// Returns `(x, y_local)` per entry.
#[must_use]
pub fn unpack_t1_entries(bytes: &[u8], count: u64, k: u32, y_local_bits: u32) -> Vec<(u64, u64)> {
    let mut reader = BitReader::new(bytes);
    (0..count)
        .map(|_| {
            let x = reader.read(k);
            let y_local = reader.read(y_local_bits);
            (x, y_local)
        })
        .collect()
}

/// Byte length of one pair record: `left u32 LE ‖ delta u16 LE`.
pub const PAIR_RECORD_BYTES: usize = 6;

/// Byte length of one f7 record (`u32 LE`).
pub const F7_RECORD_BYTES: usize = 4;

/// Decodes `count` pair records.
#[must_use]
pub fn read_pairs(bytes: &[u8], count: u64) -> Vec<(u32, u16)> {
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let at = i * PAIR_RECORD_BYTES;
        let left = u32::from_le_bytes(bytes[at..at + 4].try_into().expect("pair record"));
        let delta = u16::from_le_bytes(bytes[at + 4..at + 6].try_into().expect("pair record"));
        out.push((left, delta));
    }
    out
}

/// Encodes one pair record into `out`.
pub fn write_pair(out: &mut [u8], left: u32, delta: u16) {
    out[..4].copy_from_slice(&left.to_le_bytes());
    out[4..6].copy_from_slice(&delta.to_le_bytes());
}

/// Decodes `count` f7 records.
#[must_use]
pub fn read_f7(bytes: &[u8], count: u64) -> Vec<u32> {
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count as usize {
        let at = i * F7_RECORD_BYTES;
        out.push(u32::from_le_bytes(
            bytes[at..at + 4].try_into().expect("f7 record"),
        ));
    }
    out
}

/// Reconstructs a full y from its bucket index and bucket-local bits.
#[inline]
#[must_use]
pub const fn full_y(bucket: u64, y_local: u64, y_local_bits: u32) -> u64 {
    (bucket << y_local_bits) | y_local
}
