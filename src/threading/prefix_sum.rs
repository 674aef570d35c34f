//! Per-thread bucket destination offsets.
//!
//! Each generator thread counts its entries per target bucket, publishes
//! the histogram, and (after a rendezvous) computes where its slice of each
//! bucket ends. The offsets satisfy: thread slices within a bucket are
//! contiguous, disjoint, ordered by thread id, and collectively cover the
//! bucket.
//!
//! Offsets are in entries, relative to the concatenation of all buckets.
//! Device-block alignment of the bucket regions themselves is the bucket
//! writer's job: it places each bucket's region at a block-multiple byte
//! offset and carries sub-block tails, so the offsets computed here map
//! onto bit positions inside those regions without any padding terms.
//!
//! Publication uses relaxed atomics; the caller's barrier provides the
//! ordering between `publish` and `offsets_for_thread`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared `threads x buckets` histogram matrix.
#[derive(Debug)]
pub struct PrefixSumWorkspace {
    counts: Box<[AtomicU64]>,
    threads: usize,
    buckets: usize,
}

impl PrefixSumWorkspace {
    /// Creates a workspace for `threads` rows of `buckets` counters.
    #[must_use]
    pub fn new(threads: usize, buckets: usize) -> Self {
        let counts = (0..threads * buckets).map(|_| AtomicU64::new(0)).collect();
        Self {
            counts,
            threads,
            buckets,
        }
    }

    /// Number of rows.
    #[inline]
    #[must_use]
    pub const fn threads(&self) -> usize {
        self.threads
    }

    /// Publishes one thread's per-bucket histogram.
    pub fn publish(&self, thread: usize, counts: &[u64]) {
        debug_assert_eq!(counts.len(), self.buckets);
        let row = &self.counts[thread * self.buckets..(thread + 1) * self.buckets];
        for (slot, &count) in row.iter().zip(counts) {
            slot.store(count, Ordering::Relaxed);
        }
    }

    #[inline]
    fn count(&self, thread: usize, bucket: usize) -> u64 {
        self.counts[thread * self.buckets + bucket].load(Ordering::Relaxed)
    }

    /// Computes one thread's per-bucket slice *end* offsets (exclusive), in
    /// entries, plus the per-bucket totals across all threads.
    ///
    /// The thread's slice in bucket `b` is
    /// `[offsets[b] - counts[thread][b], offsets[b])`. Callers that fill
    /// ascending subtract their own count; callers that fill descending
    /// pre-decrement, which is what the distribution loops do.
    pub fn offsets_for_thread(&self, thread: usize, offsets: &mut [u64], totals: &mut [u64]) {
        debug_assert_eq!(offsets.len(), self.buckets);
        debug_assert_eq!(totals.len(), self.buckets);

        // Column totals across every thread.
        for bucket in 0..self.buckets {
            let mut sum = 0u64;
            for t in 0..self.threads {
                sum += self.count(t, bucket);
            }
            offsets[bucket] = sum;
            totals[bucket] = sum;
        }

        // Inclusive prefix over bucket extents.
        for bucket in 1..self.buckets {
            offsets[bucket] += offsets[bucket - 1];
        }

        // Drop the contributions of threads after this one so the offset
        // becomes this thread's slice end.
        for t in thread + 1..self.threads {
            for bucket in 0..self.buckets {
                offsets[bucket] -= self.count(t, bucket);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn offsets_matrix(counts: &[Vec<u64>]) -> (Vec<Vec<u64>>, Vec<u64>) {
        let threads = counts.len();
        let buckets = counts[0].len();
        let ws = PrefixSumWorkspace::new(threads, buckets);
        for (t, row) in counts.iter().enumerate() {
            ws.publish(t, row);
        }
        let mut all = Vec::new();
        let mut totals = vec![0u64; buckets];
        for t in 0..threads {
            let mut offsets = vec![0u64; buckets];
            ws.offsets_for_thread(t, &mut offsets, &mut totals);
            all.push(offsets);
        }
        (all, totals)
    }

    #[test]
    fn slices_are_contiguous_and_cover() {
        let counts = vec![vec![3, 0, 5], vec![1, 2, 0], vec![4, 4, 4]];
        let (offsets, totals) = offsets_matrix(&counts);
        assert_eq!(totals, vec![8, 6, 9]);
        for bucket in 0..3 {
            let mut expected_start = if bucket == 0 {
                0
            } else {
                // Bucket base = sum of earlier bucket totals.
                totals[..bucket].iter().sum::<u64>()
            };
            for (t, row) in offsets.iter().enumerate() {
                let count = counts[t][bucket];
                let start = row[bucket] - count;
                assert_eq!(start, expected_start, "thread {t} bucket {bucket}");
                expected_start = row[bucket];
            }
            assert_eq!(
                expected_start,
                totals[..=bucket].iter().sum::<u64>(),
                "bucket {bucket} covered"
            );
        }
    }

    #[test]
    fn empty_rows_do_not_shift_offsets() {
        let counts = vec![vec![0, 0, 0, 0], vec![7, 0, 1, 0], vec![0, 0, 0, 0]];
        let (offsets, totals) = offsets_matrix(&counts);
        assert_eq!(totals, vec![7, 0, 1, 0]);
        // The only contributing thread owns each bucket's whole extent.
        assert_eq!(offsets[1][0], 7);
        assert_eq!(offsets[1][2], 8);
        // Empty threads sit at their predecessors' ends.
        assert_eq!(offsets[0][0], 0);
        assert_eq!(offsets[2][0], 7);
    }

    proptest! {
        #[test]
        fn property_disjoint_cover(
            counts in proptest::collection::vec(
                proptest::collection::vec(0u64..50, 8),
                1..6,
            )
        ) {
            let (offsets, totals) = offsets_matrix(&counts);
            let buckets = 8;
            let mut base = 0u64;
            for bucket in 0..buckets {
                let mut cursor = base;
                for (t, row) in offsets.iter().enumerate() {
                    let count = counts[t][bucket];
                    prop_assert_eq!(row[bucket] - count, cursor);
                    cursor = row[bucket];
                }
                prop_assert_eq!(cursor, base + totals[bucket]);
                base += totals[bucket];
            }
        }
    }
}
