//! One forward-propagation pass: table N buckets in, table N+1 out.
//!
//! Per source bucket: read the bit-packed streams through the disk buffer
//! queue, radix-sort by y, find kBC matches, append the pair records to
//! table N+1's pair stream, then fan the matches out over the compute
//! threads to evaluate fx. The computed `(y', meta')` entries are
//! redistributed into the next generation's bucket files through the
//! bit-bucket writers; for the final pass (table 6 → 7) the k-bit f7 values
//! stream to the `f7` file instead and no bucket files are produced.
//!
//! Matches are emitted per bucket in sorted-left order and buckets are
//! processed in ascending order, so the pair and f7 streams are
//! deterministic for a fixed plot id regardless of the thread count.

use crate::bits::bits_to_bytes;
use crate::errors::PlotError;
use crate::io::{BitBucketWriter, DiskBufferQueue, FileId};
use crate::params::{PlotParams, Table};
use crate::plot::fx::compute_fx;
use crate::plot::matching::{MatchPair, Matcher};
use crate::plot::reader::{
    full_y, unpack_fields, unpack_t1_entries, write_pair, PAIR_RECORD_BYTES,
};
use crate::plot::sort::{radix_sort_entries, SortEntry};
use crate::threading::PrefixSumWorkspace;

/// File rotation for one pass.
#[derive(Clone, Copy, Debug)]
pub struct PassFiles {
    pub y_in: FileId,
    pub meta_a_in: FileId,
    pub meta_b_in: FileId,
    pub y_out: FileId,
    pub meta_a_out: FileId,
    pub meta_b_out: FileId,
}

/// Result of one pass.
#[derive(Clone, Debug)]
pub struct PassOutput {
    /// Matches found, i.e. the entry count of table N+1.
    pub matches: u64,
    /// Per-bucket counts of table N+1. Empty for the final pass.
    pub bucket_counts: Vec<u64>,
}

/// Output of one thread's fx chunk.
struct FxChunk {
    outs: Vec<(u64, u128)>,
    counts: Vec<u64>,
}

struct OutWriters {
    y: BitBucketWriter,
    meta_a: BitBucketWriter,
    meta_b: Option<BitBucketWriter>,
}

/// Runs the pass that consumes `table` (1..=6) and produces `table + 1`.
pub fn run_pass(
    params: &PlotParams,
    queue: &DiskBufferQueue,
    table: Table,
    files: &PassFiles,
    in_counts: &[u64],
) -> Result<PassOutput, PlotError> {
    let next = table.next().expect("pass source must have a successor");
    let k = params.k;
    let num_buckets = params.num_buckets as usize;
    let threads = params.thread_count;
    let y_local_bits = params.y_bits_local();
    let bucket_shift = params.y_bits() - params.bucket_bits();
    let y_mask = (1u64 << y_local_bits) - 1;

    let in_a_bits = params.meta_a_bits(table);
    let in_b_bits = params.meta_b_bits(table);
    let out_a_bits = params.meta_a_bits(next);
    let out_b_bits = params.meta_b_bits(next);
    let out_b_mask: u128 = if out_b_bits == 0 {
        0
    } else {
        (1u128 << out_b_bits) - 1
    };
    let final_pass = next.meta_multiplier() == 0;
    let pairs_file = FileId::pairs(next);

    let mut writers = if final_pass {
        None
    } else {
        Some(OutWriters {
            y: BitBucketWriter::new(files.y_out, num_buckets, queue.block_size()),
            meta_a: BitBucketWriter::new(files.meta_a_out, num_buckets, queue.block_size()),
            meta_b: (out_b_bits > 0).then(|| {
                BitBucketWriter::new(files.meta_b_out, num_buckets, queue.block_size())
            }),
        })
    };

    let workspace = PrefixSumWorkspace::new(threads, num_buckets);
    let mut matcher = Matcher::new();
    let mut entries: Vec<SortEntry> = Vec::new();
    let mut scratch: Vec<SortEntry> = Vec::new();
    let mut ys: Vec<u64> = Vec::new();
    let mut matches: Vec<MatchPair> = Vec::new();
    let mut out_counts = vec![0u64; if final_pass { 0 } else { num_buckets }];
    let mut offsets = vec![0u64; num_buckets];
    let mut totals = vec![0u64; num_buckets];
    let zero_counts = vec![0u64; num_buckets];

    let mut base: u64 = 0;
    let mut matches_total: u64 = 0;

    for bucket in 0..num_buckets {
        let count = in_counts[bucket];
        if count == 0 {
            continue;
        }

        // Read and unpack this bucket's streams.
        load_bucket_entries(
            params,
            queue,
            table,
            files,
            bucket,
            count,
            in_a_bits,
            in_b_bits,
            &mut entries,
        )?;

        radix_sort_entries(&mut entries, &mut scratch, y_local_bits);
        ys.clear();
        ys.extend(entries.iter().map(|entry| entry.y));
        matcher.find_matches(&ys, &mut matches);
        tracing::debug!(
            table = table.number(),
            bucket,
            entries = count,
            matches = matches.len(),
            "bucket pass"
        );

        if matches.is_empty() {
            base += count;
            continue;
        }
        write_pair_records(queue, pairs_file, &matches, base)?;

        // Fan fx evaluation out over the compute pool.
        let chunk_size = matches.len().div_ceil(threads).max(1);
        let chunks: Vec<FxChunk> = std::thread::scope(|scope| {
            let entries = &entries;
            let matches = &matches;
            let handles: Vec<_> = matches
                .chunks(chunk_size)
                .map(|chunk| {
                    scope.spawn(move || {
                        let mut outs = Vec::with_capacity(chunk.len());
                        let mut counts =
                            vec![0u64; if final_pass { 0 } else { num_buckets }];
                        for pair in chunk {
                            let left = &entries[pair.left as usize];
                            let right = &entries[pair.right as usize];
                            let (y_new, meta_new) =
                                compute_fx(k, table, left.y, left.meta, right.meta);
                            if !final_pass {
                                counts[(y_new >> bucket_shift) as usize] += 1;
                            }
                            outs.push((y_new, meta_new));
                        }
                        FxChunk { outs, counts }
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("fx worker panicked"))
                .collect()
        });

        matches_total += matches.len() as u64;

        if final_pass {
            write_f7_records(queue, &chunks)?;
            base += count;
            continue;
        }

        // Destination offsets per chunk, then redistribute.
        for (t, chunk) in chunks.iter().enumerate() {
            workspace.publish(t, &chunk.counts);
        }
        for t in chunks.len()..threads {
            workspace.publish(t, &zero_counts);
        }

        let writers = writers.as_mut().expect("writers exist for non-final pass");
        // Totals are identical for every thread; compute them with the
        // last chunk's offsets below.
        let mut chunk_starts: Vec<Vec<u64>> = Vec::with_capacity(chunks.len());
        for (t, chunk) in chunks.iter().enumerate() {
            workspace.offsets_for_thread(t, &mut offsets, &mut totals);
            let starts: Vec<u64> = offsets
                .iter()
                .zip(chunk.counts.iter())
                .map(|(&end, &n)| end - n)
                .collect();
            chunk_starts.push(starts);
        }

        for (slot, &total) in out_counts.iter_mut().zip(totals.iter()) {
            *slot += total;
        }

        let y_bits_vec: Vec<u64> = totals.iter().map(|&t| t * u64::from(y_local_bits)).collect();
        writers.y.begin_write_buckets(queue, &y_bits_vec)?;
        let a_bits_vec: Vec<u64> = totals.iter().map(|&t| t * u64::from(out_a_bits)).collect();
        writers.meta_a.begin_write_buckets(queue, &a_bits_vec)?;
        if let Some(writer_b) = writers.meta_b.as_mut() {
            let b_bits_vec: Vec<u64> =
                totals.iter().map(|&t| t * u64::from(out_b_bits)).collect();
            writer_b.begin_write_buckets(queue, &b_bits_vec)?;
        }

        std::thread::scope(|scope| {
            let writer_y = &writers.y;
            let writer_a = &writers.meta_a;
            let writer_b = writers.meta_b.as_ref();
            for (chunk, starts) in chunks.iter().zip(chunk_starts.iter()) {
                scope.spawn(move || {
                    let mut positions = starts.clone();
                    for &(y_new, meta_new) in &chunk.outs {
                        let tb = (y_new >> bucket_shift) as usize;
                        let pos = positions[tb];
                        positions[tb] += 1;
                        writer_y
                            .cursor(tb, pos * u64::from(y_local_bits))
                            .write(y_new & y_mask, y_local_bits);
                        writer_a
                            .cursor(tb, pos * u64::from(out_a_bits))
                            .write((meta_new >> out_b_bits) as u64, out_a_bits);
                        if let Some(writer_b) = writer_b {
                            writer_b
                                .cursor(tb, pos * u64::from(out_b_bits))
                                .write((meta_new & out_b_mask) as u64, out_b_bits);
                        }
                    }
                });
            }
        });

        writers.y.submit(queue);
        writers.meta_a.submit(queue);
        if let Some(writer_b) = writers.meta_b.as_mut() {
            writer_b.submit(queue);
        }
        queue.commit();

        base += count;
    }

    if let Some(writers) = writers.as_mut() {
        writers.y.submit_left_overs(queue)?;
        writers.meta_a.submit_left_overs(queue)?;
        if let Some(writer_b) = writers.meta_b.as_mut() {
            writer_b.submit_left_overs(queue)?;
        }
        queue.commit();

        let redistributed: u64 = out_counts.iter().sum();
        if redistributed != matches_total {
            return Err(PlotError::invariant(format!(
                "{next} redistribution lost entries: {redistributed} of {matches_total}"
            )));
        }
    }

    Ok(PassOutput {
        matches: matches_total,
        bucket_counts: out_counts,
    })
}

/// Reads one bucket's streams and reassembles sortable entries.
#[allow(clippy::too_many_arguments)]
fn load_bucket_entries(
    params: &PlotParams,
    queue: &DiskBufferQueue,
    table: Table,
    files: &PassFiles,
    bucket: usize,
    count: u64,
    in_a_bits: u32,
    in_b_bits: u32,
    entries: &mut Vec<SortEntry>,
) -> Result<(), PlotError> {
    let y_local_bits = params.y_bits_local();
    entries.clear();

    if table == Table::Table1 {
        let len = bits_to_bytes(count * u64::from(params.t1_entry_bits()));
        let buffer = queue.get_buffer(len)?;
        let pending = queue.read_file(files.y_in, bucket as u32, buffer, len);
        queue.commit();
        let buffer = pending.wait()?;
        for (x, y_local) in
            unpack_t1_entries(buffer.as_slice(), count, params.k, y_local_bits)
        {
            entries.push(SortEntry {
                y: full_y(bucket as u64, y_local, y_local_bits),
                meta: u128::from(x),
            });
        }
        queue.release_buffer(buffer);
        queue.commit();
        return Ok(());
    }

    let y_len = bits_to_bytes(count * u64::from(y_local_bits));
    let a_len = bits_to_bytes(count * u64::from(in_a_bits));
    let y_buffer = queue.get_buffer(y_len)?;
    let a_buffer = queue.get_buffer(a_len)?;
    let pending_y = queue.read_file(files.y_in, bucket as u32, y_buffer, y_len);
    let pending_a = queue.read_file(files.meta_a_in, bucket as u32, a_buffer, a_len);
    let pending_b = if in_b_bits > 0 {
        let b_len = bits_to_bytes(count * u64::from(in_b_bits));
        let b_buffer = queue.get_buffer(b_len)?;
        Some(queue.read_file(files.meta_b_in, bucket as u32, b_buffer, b_len))
    } else {
        None
    };
    queue.commit();

    let y_buffer = pending_y.wait()?;
    let a_buffer = pending_a.wait()?;
    let b_buffer = match pending_b {
        Some(pending) => Some(pending.wait()?),
        None => None,
    };

    let y_vals = unpack_fields(y_buffer.as_slice(), count, y_local_bits);
    let a_vals = unpack_fields(a_buffer.as_slice(), count, in_a_bits);
    let b_vals = b_buffer
        .as_ref()
        .map(|buffer| unpack_fields(buffer.as_slice(), count, in_b_bits));

    for i in 0..count as usize {
        let meta_a = u128::from(a_vals[i]);
        let meta = match &b_vals {
            Some(b) => (meta_a << in_b_bits) | u128::from(b[i]),
            None => meta_a,
        };
        entries.push(SortEntry {
            y: full_y(bucket as u64, y_vals[i], y_local_bits),
            meta,
        });
    }

    queue.release_buffer(y_buffer);
    queue.release_buffer(a_buffer);
    if let Some(buffer) = b_buffer {
        queue.release_buffer(buffer);
    }
    queue.commit();
    Ok(())
}

/// Serializes `(left, delta)` records for one bucket's matches.
fn write_pair_records(
    queue: &DiskBufferQueue,
    pairs_file: FileId,
    matches: &[MatchPair],
    base: u64,
) -> Result<(), PlotError> {
    if let Some(pair) = matches
        .iter()
        .find(|pair| pair.right - pair.left > u32::from(u16::MAX))
    {
        return Err(PlotError::invariant(format!(
            "pair delta {} exceeds the 16-bit record field",
            pair.right - pair.left
        )));
    }
    let len = matches.len() * PAIR_RECORD_BYTES;
    let mut buffer = queue.get_buffer(len)?;
    let bytes = buffer.as_mut_slice();
    for (i, pair) in matches.iter().enumerate() {
        let left_abs = base + u64::from(pair.left);
        write_pair(
            &mut bytes[i * PAIR_RECORD_BYTES..(i + 1) * PAIR_RECORD_BYTES],
            left_abs as u32,
            (pair.right - pair.left) as u16,
        );
    }
    queue.write_file(pairs_file, 0, buffer, len);
    queue.commit();
    Ok(())
}

/// Streams one bucket's f7 values in match order.
fn write_f7_records(queue: &DiskBufferQueue, chunks: &[FxChunk]) -> Result<(), PlotError> {
    let total: usize = chunks.iter().map(|chunk| chunk.outs.len()).sum();
    if total == 0 {
        return Ok(());
    }
    let len = total * 4;
    let mut buffer = queue.get_buffer(len)?;
    let bytes = buffer.as_mut_slice();
    let mut at = 0usize;
    for chunk in chunks {
        for &(f7, _) in &chunk.outs {
            bytes[at..at + 4].copy_from_slice(&(f7 as u32).to_le_bytes());
            at += 4;
        }
    }
    queue.write_file(FileId::F7, 0, buffer, len);
    queue.commit();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_shift_selects_high_bits() {
        // k=18, 64 buckets: y is 24 bits, bucket = top 6.
        let params = PlotParams {
            k: 18,
            num_buckets: 64,
            thread_count: 1,
            f1_thread_count: 1,
            work_dir: std::path::PathBuf::from("/tmp"),
            heap_size: 64 * 1024 * 1024,
            use_direct_io: false,
            block_size: Some(4096),
        };
        let shift = params.y_bits() - params.bucket_bits();
        assert_eq!(shift, 18);
        let y = 0b101_011u64 << 18 | 0x15555;
        assert_eq!(y >> shift, 0b101_011);
    }
}
