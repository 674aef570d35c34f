//! Radix sort of bucket entries by y.
//!
//! Within a bucket the high bucket-selecting bits of y are equal, so only
//! the remaining low bits participate. LSD distribution sort with 8-bit
//! digits: a fixed `ceil(bits/8)` passes, each a count/prefix/scatter,
//! stable throughout so equal y values keep their read order and the pass
//! output is deterministic.

/// One sortable bucket entry: full y plus its metadata carrier.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SortEntry {
    pub y: u64,
    pub meta: u128,
}

/// Sorts `entries` ascending by `y`, using `scratch` as the ping-pong
/// buffer. Only the low `key_bits` of y are significant.
pub fn radix_sort_entries(entries: &mut Vec<SortEntry>, scratch: &mut Vec<SortEntry>, key_bits: u32) {
    let passes = key_bits.div_ceil(8);
    if entries.len() < 2 || passes == 0 {
        return;
    }
    scratch.clear();
    scratch.resize(entries.len(), SortEntry::default());

    for pass in 0..passes {
        let shift = pass * 8;
        let mut counts = [0usize; 256];
        for entry in entries.iter() {
            counts[((entry.y >> shift) & 0xFF) as usize] += 1;
        }
        let mut offsets = [0usize; 256];
        let mut running = 0usize;
        for (offset, &count) in offsets.iter_mut().zip(counts.iter()) {
            *offset = running;
            running += count;
        }
        for entry in entries.iter() {
            let digit = ((entry.y >> shift) & 0xFF) as usize;
            scratch[offsets[digit]] = *entry;
            offsets[digit] += 1;
        }
        std::mem::swap(entries, scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn entry(y: u64, meta: u128) -> SortEntry {
        SortEntry { y, meta }
    }

    #[test]
    fn sorts_small_bucket() {
        let mut entries = vec![entry(5, 50), entry(1, 10), entry(3, 30), entry(2, 20)];
        let mut scratch = Vec::new();
        radix_sort_entries(&mut entries, &mut scratch, 24);
        let ys: Vec<u64> = entries.iter().map(|e| e.y).collect();
        assert_eq!(ys, vec![1, 2, 3, 5]);
        // Metadata travels with its key.
        assert!(entries.iter().all(|e| e.meta == u128::from(e.y) * 10));
    }

    #[test]
    fn stable_for_equal_keys() {
        let mut entries = vec![entry(7, 1), entry(7, 2), entry(3, 3), entry(7, 4)];
        let mut scratch = Vec::new();
        radix_sort_entries(&mut entries, &mut scratch, 8);
        let metas: Vec<u128> = entries.iter().map(|e| e.meta).collect();
        assert_eq!(metas, vec![3, 1, 2, 4]);
    }

    proptest! {
        #[test]
        fn matches_std_sort(ys in proptest::collection::vec(0u64..(1 << 38), 0..500)) {
            let mut entries: Vec<SortEntry> = ys
                .iter()
                .enumerate()
                .map(|(i, &y)| entry(y, i as u128))
                .collect();
            let mut scratch = Vec::new();
            radix_sort_entries(&mut entries, &mut scratch, 38);

            let mut expected = ys.clone();
            expected.sort_unstable();
            let got: Vec<u64> = entries.iter().map(|e| e.y).collect();
            prop_assert_eq!(got, expected);
        }
    }
}
