//! Bit-packed bucket writer.
//!
//! Streams variable-bit-width entries into per-bucket byte regions inside a
//! single submit buffer, then hands the buffer to the disk buffer queue as
//! one `WriteBuckets` batch. Each bucket file is a contiguous big-endian
//! bit stream: only whole blocks are persisted per submit, and the
//! sub-block tail (bit-precise) is carried in memory and replayed at the
//! start of the next submit's region, so padding never interrupts the
//! stream. `submit_left_overs` flushes the final tails as zero-padded
//! blocks once a table's production ends.
//!
//! # Concurrency
//!
//! Between `begin_write_buckets` and `submit`, any number of threads may
//! write through [`cursor`](BitBucketWriter::cursor) as long as their bit
//! ranges are disjoint; regions are zeroed at begin and filled with atomic
//! OR writes (see `bits`), so range-disjoint writers compose without
//! word-boundary synchronization.

use crate::bits::{bits_to_bytes, BitCursor};
use crate::errors::PlotError;

use super::queue::{DiskBufferQueue, FileId};
use super::work_heap::HeapBuffer;

/// Carried sub-block tail of one bucket's stream.
#[derive(Clone, Debug, Default)]
struct Remainder {
    bytes: Vec<u8>,
    bits: u64,
}

/// One bucket's region inside the active submit buffer.
#[derive(Clone, Copy, Debug)]
struct Region {
    byte_offset: usize,
    /// Carried bits replayed at the region start.
    rem_bits: u64,
    /// Carried bits plus bits reserved for this round.
    total_bits: u64,
}

struct ActiveSubmit {
    buffer: HeapBuffer,
    regions: Vec<Region>,
}

/// Streams bit-packed entries into per-bucket block-aligned output.
pub struct BitBucketWriter {
    file: FileId,
    num_buckets: usize,
    block_size: usize,
    remainders: Vec<Remainder>,
    active: Option<ActiveSubmit>,
}

impl BitBucketWriter {
    /// Creates a writer for one bucketed file set.
    #[must_use]
    pub fn new(file: FileId, num_buckets: usize, block_size: usize) -> Self {
        debug_assert!(file.is_bucketed());
        Self {
            file,
            num_buckets,
            block_size,
            remainders: vec![Remainder::default(); num_buckets],
            active: None,
        }
    }

    /// The file set this writer feeds.
    #[inline]
    #[must_use]
    pub const fn file(&self) -> FileId {
        self.file
    }

    /// Reserves buffer space for `new_bits[b]` fresh bits per bucket and
    /// replays the carried tails at each region start.
    ///
    /// # Panics
    ///
    /// Panics if a previous round was begun but never submitted.
    pub fn begin_write_buckets(
        &mut self,
        queue: &DiskBufferQueue,
        new_bits: &[u64],
    ) -> Result<(), PlotError> {
        assert!(self.active.is_none(), "begin_write_buckets while a round is active");
        debug_assert_eq!(new_bits.len(), self.num_buckets);

        let block = self.block_size;
        let mut regions = Vec::with_capacity(self.num_buckets);
        let mut total_size = 0usize;
        for (bucket, &bits) in new_bits.iter().enumerate() {
            let rem_bits = self.remainders[bucket].bits;
            let total_bits = rem_bits + bits;
            regions.push(Region {
                byte_offset: total_size,
                rem_bits,
                total_bits,
            });
            // Region stride: true payload rounded to the next block, so the
            // next bucket starts block-aligned (matches the queue's
            // WriteBuckets advance rule).
            total_size += bits_to_bytes(total_bits).next_multiple_of(block);
        }

        let mut buffer = queue.get_buffer(total_size.max(block))?;
        // Regions are filled with OR writes and must start zeroed; the heap
        // recycles buffers.
        buffer.zero();
        for (bucket, region) in regions.iter().enumerate() {
            let rem = &self.remainders[bucket];
            if rem.bits > 0 {
                let len = bits_to_bytes(rem.bits);
                buffer.as_mut_slice()[region.byte_offset..region.byte_offset + len]
                    .copy_from_slice(&rem.bytes[..len]);
            }
        }

        self.active = Some(ActiveSubmit { buffer, regions });
        Ok(())
    }

    /// Returns a cursor positioned `bit_offset` bits into `bucket`'s fresh
    /// range for this round (carried tail bits are skipped automatically).
    ///
    /// # Panics
    ///
    /// Panics if no round is active or the offset exceeds the reservation.
    #[must_use]
    pub fn cursor(&self, bucket: usize, bit_offset: u64) -> BitCursor<'_> {
        let active = self.active.as_ref().expect("no active bucket write round");
        let region = &active.regions[bucket];
        let position = region.byte_offset as u64 * 8 + region.rem_bits + bit_offset;
        debug_assert!(region.rem_bits + bit_offset <= region.total_bits);
        BitCursor::new(active.buffer.as_atomic_words(), position)
    }

    /// Hands the filled buffer to the queue as a `WriteBuckets` batch.
    ///
    /// Whole blocks are persisted; each bucket's sub-block tail is copied
    /// into the carried remainder before the buffer is surrendered. The
    /// caller still has to `commit` the queue.
    ///
    /// # Panics
    ///
    /// Panics if no round is active.
    pub fn submit(&mut self, queue: &DiskBufferQueue) {
        let active = self.active.take().expect("no active bucket write round");
        let block = self.block_size;
        let mut sizes = Vec::with_capacity(self.num_buckets);

        for (bucket, region) in active.regions.iter().enumerate() {
            let payload_bytes = bits_to_bytes(region.total_bits);
            let body_bytes = payload_bytes / block * block;
            let tail_bits = region.total_bits - body_bytes as u64 * 8;
            debug_assert!(tail_bits < block as u64 * 8);

            let rem = &mut self.remainders[bucket];
            rem.bits = tail_bits;
            if tail_bits > 0 {
                let tail_len = bits_to_bytes(tail_bits);
                let start = region.byte_offset + body_bytes;
                rem.bytes.clear();
                rem.bytes
                    .extend_from_slice(&active.buffer.as_slice()[start..start + tail_len]);
            }
            sizes.push(payload_bytes as u32);
        }

        queue.write_buckets(self.file, active.buffer, sizes.into_boxed_slice());
    }

    /// Flushes the carried tails as zero-padded final blocks.
    ///
    /// Call once after the last `submit` of a table's production. The
    /// caller still has to `commit` the queue.
    pub fn submit_left_overs(&mut self, queue: &DiskBufferQueue) -> Result<(), PlotError> {
        assert!(self.active.is_none(), "submit_left_overs during an active round");
        for bucket in 0..self.num_buckets {
            let rem = &mut self.remainders[bucket];
            if rem.bits == 0 {
                continue;
            }
            let len = bits_to_bytes(rem.bits);
            let mut buffer = queue.get_buffer(len)?;
            buffer.as_mut_slice()[..len].copy_from_slice(&rem.bytes[..len]);
            queue.write_file(self.file, bucket as u32, buffer, len);
            rem.bits = 0;
            rem.bytes.clear();
        }
        Ok(())
    }

    /// Bits carried for a bucket (visible for tests and provisioning).
    #[inline]
    #[must_use]
    pub fn carried_bits(&self, bucket: usize) -> u64 {
        self.remainders[bucket].bits
    }
}
