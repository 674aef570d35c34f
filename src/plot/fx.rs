//! The forward function fx: BLAKE3 over a matched pair.
//!
//! The hash input is the bit-exact concatenation
//! `y(k+6) ‖ metaL(k·m) ‖ metaR(k·m)`, big-endian, padded with zero bits to
//! a whole byte. The output y is the high `k+6` bits of the 32-byte hash,
//! or just `k` bits when producing table 7, which carries no extra bits. The
//! output metadata is the concatenation `metaL ‖ metaR` whenever the next
//! table's multiplier doubles the current one, and otherwise the hash bits
//! starting right after the y field.

use crate::bits::{bits_to_bytes, BitReader, BytePacker};
use crate::params::{Table, EXTRA_BITS};

/// Largest hash input: y(38) + two metas at multiplier 4 with k=32.
const MAX_INPUT_BYTES: usize = bits_to_bytes(38 + 2 * 128);

/// Computes `(y', meta')` for a match in `table` (the table being read);
/// the result seeds `table.next()`.
///
/// Metadata values are right-aligned in their `u128` carriers.
#[must_use]
pub fn compute_fx(k: u32, table: Table, y: u64, meta_l: u128, meta_r: u128) -> (u64, u128) {
    let m_in = table.meta_multiplier();
    let m_out = table
        .next()
        .expect("fx is never computed for the last table")
        .meta_multiplier();
    let y_bits = k + EXTRA_BITS;
    let meta_bits = k * m_in;
    let total_bits = u64::from(y_bits + 2 * meta_bits);

    let mut input = [0u8; MAX_INPUT_BYTES];
    let mut packer = BytePacker::new(&mut input);
    packer.write(y, y_bits);
    packer.write_u128(meta_l, meta_bits);
    packer.write_u128(meta_r, meta_bits);

    let hash = blake3::hash(&input[..bits_to_bytes(total_bits)]);
    let bytes = hash.as_bytes();

    // Table 7 output keeps only the k-bit core.
    let y_out_bits = if m_out == 0 { k } else { y_bits };
    let head = u64::from_be_bytes(bytes[..8].try_into().expect("8 hash bytes"));
    let y_out = head >> (64 - y_out_bits);

    let meta_out = if m_out == 0 {
        0
    } else if m_out == 2 * m_in {
        (meta_l << meta_bits) | meta_r
    } else {
        let mut reader = BitReader::new(bytes);
        reader.seek(u64::from(y_bits));
        reader.read_u128(k * m_out)
    };

    (y_out, meta_out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference construction of the k=32, multiplier-1 hash input as
    /// big-endian 64-bit words, the way 32-bit metadata packs into two
    /// words: `y(38) ‖ l0(32) ‖ r0(32)` over 102 bits.
    fn reference_input_m1(y: u64, l0: u32, r0: u32) -> Vec<u8> {
        let w0 = (y << 26) | u64::from(l0 >> 6);
        let w1 = (u64::from(l0) << 58) | (u64::from(r0) << 26);
        let mut out = Vec::new();
        out.extend_from_slice(&w0.to_be_bytes());
        out.extend_from_slice(&w1.to_be_bytes());
        out.truncate(bits_to_bytes(38 + 64));
        out
    }

    #[test]
    fn k32_m1_packing_matches_word_reference() {
        let k = 32;
        let y = 0x3A_DEAD_BEEFu64 & ((1 << 38) - 1);
        let l0 = 0x1234_5678u32;
        let r0 = 0x9ABC_DEF0u32;

        let mut input = [0u8; MAX_INPUT_BYTES];
        let mut packer = BytePacker::new(&mut input);
        packer.write(y, k + EXTRA_BITS);
        packer.write_u128(u128::from(l0), k);
        packer.write_u128(u128::from(r0), k);
        let len = bits_to_bytes(38 + 64);

        assert_eq!(&input[..len], &reference_input_m1(y, l0, r0)[..]);
    }

    #[test]
    fn concat_tables_concatenate_meta() {
        // Table 1 -> 2: multiplier 1 -> 2.
        let k = 18;
        let (_, meta) = compute_fx(k, Table::Table1, 123, 0x2AAAA, 0x15555);
        assert_eq!(meta, (0x2AAAAu128 << 18) | 0x15555);
        // Table 2 -> 3: multiplier 2 -> 4.
        let (_, meta) = compute_fx(k, Table::Table2, 99, 0x1_0000_0001, 0x2_0000_0002);
        assert_eq!(meta, (0x1_0000_0001u128 << 36) | 0x2_0000_0002);
    }

    #[test]
    fn hash_tables_take_meta_from_hash() {
        let k = 18;
        let y = 0x5_4321u64;
        let meta_l = 0xAAAA_BBBB_CCCCu128 & ((1 << 72) - 1);
        let meta_r = 0x1111_2222_3333u128 & ((1 << 72) - 1);
        // Table 3 -> 4: multiplier 4 -> 4 (not doubled, so hash-derived).
        let (y_out, meta_out) = compute_fx(k, Table::Table3, y, meta_l, meta_r);
        assert!(y_out < 1 << (k + EXTRA_BITS));
        assert!(meta_out < 1 << 72);

        // Recompute the hash independently and check the slices.
        let y_bits = k + EXTRA_BITS;
        let meta_bits = k * 4;
        let total_bits = u64::from(y_bits + 2 * meta_bits);
        let mut input = [0u8; MAX_INPUT_BYTES];
        let mut packer = BytePacker::new(&mut input);
        packer.write(y, y_bits);
        packer.write_u128(meta_l, meta_bits);
        packer.write_u128(meta_r, meta_bits);
        let hash = blake3::hash(&input[..bits_to_bytes(total_bits)]);
        let mut reader = BitReader::new(hash.as_bytes());
        assert_eq!(reader.read(y_bits), y_out);
        assert_eq!(reader.read_u128(meta_bits), meta_out);
    }

    #[test]
    fn table6_output_drops_extra_bits() {
        let k = 18;
        let (y_out, meta_out) = compute_fx(k, Table::Table6, 0xFFFFFF, 0x123456789, 0x987654321);
        assert!(y_out < 1 << k, "f7 is k bits wide");
        assert_eq!(meta_out, 0);
    }

    #[test]
    fn fx_is_deterministic() {
        let a = compute_fx(18, Table::Table4, 42, 7, 9);
        let b = compute_fx(18, Table::Table4, 42, 7, 9);
        assert_eq!(a, b);
    }
}
