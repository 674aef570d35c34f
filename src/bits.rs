//! Big-endian bit-field packing primitives.
//!
//! Bucket files are contiguous bit streams: fields are concatenated without
//! byte alignment, most-significant bit first. This matches the slicing the
//! proof-of-space standard applies to ChaCha8 keystreams and BLAKE3 outputs,
//! so the same reader extracts y values from keystream blocks and entries
//! from bucket files.
//!
//! # Write contract
//!
//! Writers OR bits into **zeroed** 64-bit words with atomic `fetch_or`.
//! Because every field occupies a disjoint bit range and words start zeroed,
//! concurrent writers compose correctly regardless of ordering, including at
//! the word boundaries where two writers' ranges meet in the middle of one
//! word. Re-writing a bit range is not supported; zero the region first.
//!
//! # Invariants
//! - A word slice passed to the OR helpers must cover
//!   `ceil((bit_pos + bits) / 64)` words.
//! - Values must fit their declared width (`value < 2^bits`).

use std::sync::atomic::{AtomicU64, Ordering};

/// Bytes needed to hold `bits` bits.
#[inline]
#[must_use]
pub const fn bits_to_bytes(bits: u64) -> usize {
    (bits as usize).div_ceil(8)
}

/// 64-bit words needed to hold `bits` bits.
#[inline]
#[must_use]
pub const fn bits_to_words(bits: u64) -> usize {
    (bits as usize).div_ceil(64)
}

#[inline]
const fn low_mask(bits: u32) -> u64 {
    if bits == 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

/// ORs the low `bits` bits of `value` into the stream at `bit_pos`.
///
/// Words are stored big-endian on disk; the atomic operates on the native
/// representation, which is equivalent under OR after byte-swapping the
/// contribution.
#[inline]
pub fn or_bits(words: &[AtomicU64], bit_pos: u64, value: u64, bits: u32) {
    debug_assert!(bits <= 64);
    debug_assert!(bits == 64 || value <= low_mask(bits));
    if bits == 0 {
        return;
    }
    let wi = (bit_pos / 64) as usize;
    let off = (bit_pos % 64) as u32;
    let avail = 64 - off;
    if bits <= avail {
        let contribution = value << (avail - bits);
        words[wi].fetch_or(contribution.to_be(), Ordering::Relaxed);
    } else {
        let lo_bits = bits - avail;
        words[wi].fetch_or((value >> lo_bits).to_be(), Ordering::Relaxed);
        let lo = (value & low_mask(lo_bits)) << (64 - lo_bits);
        words[wi + 1].fetch_or(lo.to_be(), Ordering::Relaxed);
    }
}

/// ORs the low `bits` bits of a 128-bit value into the stream at `bit_pos`.
#[inline]
pub fn or_bits_u128(words: &[AtomicU64], bit_pos: u64, value: u128, bits: u32) {
    debug_assert!(bits <= 128);
    if bits > 64 {
        let lo_bits = 64;
        let hi_bits = bits - lo_bits;
        or_bits(words, bit_pos, (value >> lo_bits) as u64, hi_bits);
        or_bits(words, bit_pos + u64::from(hi_bits), value as u64, lo_bits);
    } else {
        or_bits(words, bit_pos, value as u64, bits);
    }
}

/// Sequential bit cursor over a zeroed word region.
///
/// Multiple cursors over the same region are fine as long as their bit
/// ranges are disjoint (see module docs).
pub struct BitCursor<'a> {
    words: &'a [AtomicU64],
    bit_pos: u64,
}

impl<'a> BitCursor<'a> {
    /// Creates a cursor positioned at `bit_pos`.
    #[must_use]
    pub fn new(words: &'a [AtomicU64], bit_pos: u64) -> Self {
        Self { words, bit_pos }
    }

    /// Current bit position.
    #[inline]
    #[must_use]
    pub fn position(&self) -> u64 {
        self.bit_pos
    }

    /// Writes a field of up to 64 bits and advances.
    #[inline]
    pub fn write(&mut self, value: u64, bits: u32) {
        or_bits(self.words, self.bit_pos, value, bits);
        self.bit_pos += u64::from(bits);
    }

    /// Writes a field of up to 128 bits and advances.
    #[inline]
    pub fn write_u128(&mut self, value: u128, bits: u32) {
        or_bits_u128(self.words, self.bit_pos, value, bits);
        self.bit_pos += u64::from(bits);
    }
}

/// Sequential single-threaded bit packer over a zeroed byte buffer.
///
/// Used for hash-input construction where fields are packed once and read
/// immediately; the concurrent paths go through [`BitCursor`] instead.
#[derive(Debug)]
pub struct BytePacker<'a> {
    buf: &'a mut [u8],
    bit_pos: u64,
}

impl<'a> BytePacker<'a> {
    /// Creates a packer at bit position 0. The buffer must be zeroed.
    #[must_use]
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, bit_pos: 0 }
    }

    /// Bits written so far.
    #[inline]
    #[must_use]
    pub fn position(&self) -> u64 {
        self.bit_pos
    }

    /// Appends the low `bits` bits of `value`.
    pub fn write(&mut self, value: u64, bits: u32) {
        debug_assert!(bits <= 64);
        debug_assert!(bits == 64 || value <= low_mask(bits));
        let mut remaining = bits;
        while remaining > 0 {
            let byte = &mut self.buf[(self.bit_pos / 8) as usize];
            let used = (self.bit_pos % 8) as u32;
            let avail = 8 - used;
            let take = avail.min(remaining);
            let chunk = (value >> (remaining - take)) & low_mask(take);
            *byte |= (chunk as u8) << (avail - take);
            self.bit_pos += u64::from(take);
            remaining -= take;
        }
    }

    /// Appends the low `bits` bits of a 128-bit value.
    pub fn write_u128(&mut self, value: u128, bits: u32) {
        debug_assert!(bits <= 128);
        if bits > 64 {
            let lo_bits = 64;
            let hi_bits = bits - lo_bits;
            self.write((value >> lo_bits) as u64, hi_bits);
            self.write(value as u64, lo_bits);
        } else {
            self.write(value as u64, bits);
        }
    }
}

/// Reads big-endian bit fields from a byte slice.
#[derive(Clone, Debug)]
pub struct BitReader<'a> {
    data: &'a [u8],
    bit_pos: u64,
}

impl<'a> BitReader<'a> {
    /// Creates a reader at bit position 0.
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, bit_pos: 0 }
    }

    /// Repositions the reader.
    #[inline]
    pub fn seek(&mut self, bit_pos: u64) {
        self.bit_pos = bit_pos;
    }

    /// Current bit position.
    #[inline]
    #[must_use]
    pub fn position(&self) -> u64 {
        self.bit_pos
    }

    /// Remaining bits in the underlying slice.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> u64 {
        (self.data.len() as u64 * 8).saturating_sub(self.bit_pos)
    }

    /// Reads a field of up to 64 bits.
    ///
    /// # Panics
    ///
    /// Panics if the field extends past the end of the slice.
    pub fn read(&mut self, bits: u32) -> u64 {
        debug_assert!(bits <= 64);
        let mut remaining = bits;
        let mut out = 0u64;
        while remaining > 0 {
            let byte = self.data[(self.bit_pos / 8) as usize];
            let used = (self.bit_pos % 8) as u32;
            let avail = 8 - used;
            let take = avail.min(remaining);
            let chunk = u64::from(byte >> (avail - take)) & low_mask(take);
            out = (out << take) | chunk;
            self.bit_pos += u64::from(take);
            remaining -= take;
        }
        out
    }

    /// Reads a field of up to 128 bits.
    pub fn read_u128(&mut self, bits: u32) -> u128 {
        debug_assert!(bits <= 128);
        if bits > 64 {
            let hi_bits = bits - 64;
            let hi = u128::from(self.read(hi_bits));
            let lo = u128::from(self.read(64));
            (hi << 64) | lo
        } else {
            u128::from(self.read(bits))
        }
    }
}

/// Copies atomic words back out as plain big-endian bytes.
///
/// Used when a filled region must be inspected or carried over (the
/// bit-bucket writer's sub-block tails).
#[must_use]
pub fn words_to_bytes(words: &[AtomicU64], len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    for word in words {
        let bytes = word.load(Ordering::Relaxed).to_ne_bytes();
        let take = (len - out.len()).min(8);
        out.extend_from_slice(&bytes[..take]);
        if out.len() == len {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn zeroed(words: usize) -> Vec<AtomicU64> {
        (0..words).map(|_| AtomicU64::new(0)).collect()
    }

    fn snapshot(words: &[AtomicU64]) -> Vec<u8> {
        words_to_bytes(words, words.len() * 8)
    }

    #[test]
    fn single_field_round_trip() {
        let words = zeroed(2);
        or_bits(&words, 0, 0b1011, 4);
        let bytes = snapshot(&words);
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read(4), 0b1011);
    }

    #[test]
    fn fields_cross_word_boundary() {
        let words = zeroed(3);
        let mut cursor = BitCursor::new(&words, 0);
        // 3 fields of 23 bits straddle the first word boundary.
        for value in [0x7AAAAA, 0x155555, 0x3FFFFF] {
            cursor.write(value, 23);
        }
        let bytes = snapshot(&words);
        let mut reader = BitReader::new(&bytes);
        for value in [0x7AAAAAu64, 0x155555, 0x3FFFFF] {
            assert_eq!(reader.read(23), value);
        }
    }

    #[test]
    fn u128_field_round_trip() {
        let words = zeroed(4);
        let value = 0x0123_4567_89AB_CDEF_0011_2233_4455_6677u128;
        or_bits_u128(&words, 5, value, 125);
        let bytes = snapshot(&words);
        let mut reader = BitReader::new(&bytes);
        reader.seek(5);
        assert_eq!(reader.read_u128(125), value & ((1u128 << 125) - 1));
    }

    #[test]
    fn disjoint_writes_compose_out_of_order() {
        let a = zeroed(2);
        let b = zeroed(2);
        // Same fields, opposite write order; identical bytes.
        or_bits(&a, 0, 0x1FFFF, 17);
        or_bits(&a, 17, 0x0A0A0, 20);
        or_bits(&b, 17, 0x0A0A0, 20);
        or_bits(&b, 0, 0x1FFFF, 17);
        assert_eq!(snapshot(&a), snapshot(&b));
    }

    #[test]
    fn full_word_write() {
        let words = zeroed(2);
        or_bits(&words, 0, u64::MAX, 64);
        let bytes = snapshot(&words);
        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read(64), u64::MAX);
        assert_eq!(reader.read(64), 0);
    }

    #[test]
    fn byte_packer_matches_atomic_writer() {
        let fields: [(u64, u32); 5] = [(0x3, 2), (0x1FF, 9), (0xABCDEF, 24), (0, 1), (0x7F, 7)];
        let total: u64 = fields.iter().map(|&(_, b)| u64::from(b)).sum();

        let words = zeroed(bits_to_words(total));
        let mut cursor = BitCursor::new(&words, 0);
        let mut packed = vec![0u8; bits_to_bytes(total)];
        let mut packer = BytePacker::new(&mut packed);
        for &(value, bits) in &fields {
            cursor.write(value, bits);
            packer.write(value, bits);
        }
        assert_eq!(words_to_bytes(&words, packed.len()), packed);
    }

    #[test]
    fn reader_matches_manual_bytes() {
        // 0xA5 0x5A: bits 1010_0101 0101_1010.
        let data = [0xA5u8, 0x5A];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read(3), 0b101);
        assert_eq!(reader.read(6), 0b001010);
        assert_eq!(reader.read(7), 0b1011010);
    }

    proptest! {
        #[test]
        fn packed_stream_round_trips(
            fields in proptest::collection::vec((0u64..u64::MAX, 1u32..=64), 1..64)
        ) {
            let total_bits: u64 = fields.iter().map(|&(_, b)| u64::from(b)).sum();
            let words = zeroed(bits_to_words(total_bits));
            let mut cursor = BitCursor::new(&words, 0);
            for &(value, bits) in &fields {
                cursor.write(value & low_mask(bits), bits);
            }
            let bytes = snapshot(&words);
            let mut reader = BitReader::new(&bytes);
            for &(value, bits) in &fields {
                prop_assert_eq!(reader.read(bits), value & low_mask(bits));
            }
        }
    }
}
