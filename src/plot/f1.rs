//! F1 generator: seeds table 1 from the ChaCha8 keystream.
//!
//! The keystream (key `0x01 ‖ plotId[0..31]`, zero nonce) is an infinite
//! big-endian bit string; the y candidate for x occupies bits
//! `[x·k, (x+1)·k)`. The full y is `(candidate << 6) | (x >> (k-6))` and the
//! bucket is selected by the candidate's high bits, so entries can be
//! distributed before the extra bits are appended.
//!
//! The x range is processed in `num_buckets` chunks. Per chunk, each thread
//! of the team: generates the keystream for its x slice, histograms target
//! buckets, joins the parallel prefix sum, distributes its packed
//! `x ‖ y_local` entries into a local scratch grouped by bucket, and
//! bit-packs its slice of every bucket region. The control thread (id 0)
//! accumulates global bucket counts and reserves writer regions inside a
//! lock/release window, and submits each chunk's buffer.
//!
//! Per-slice writes follow the paired protocol: up to two entries, an
//! all-threads rendezvous, then the bulk, so the words where neighboring
//! slices meet are quiescent before bulk filling (the atomic OR writes make
//! boundary overlap benign even for degenerate slice sizes).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use chacha20::cipher::{Iv, KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::{ChaCha8, Key};

use crate::bits::BitReader;
use crate::errors::PlotError;
use crate::io::{BitBucketWriter, DiskBufferQueue, FileId};
use crate::params::{PlotParams, EXTRA_BITS, F1_BLOCK_SIZE_BITS, PLOT_ID_LEN};
use crate::threading::{JobBarrier, PrefixSumWorkspace};

/// ChaCha8 key for a plot: `0x01 ‖ plotId[0..31]`.
#[must_use]
pub fn chacha_key(plot_id: &[u8; PLOT_ID_LEN]) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[0] = 1;
    key[1..].copy_from_slice(&plot_id[..PLOT_ID_LEN - 1]);
    key
}

#[derive(Clone, Copy)]
struct F1Config {
    k: u32,
    num_buckets: usize,
    threads: usize,
    y_local_bits: u32,
    entry_bits: u32,
    /// Shift applied to the raw k-bit candidate to select the bucket.
    bucket_shift: u32,
    entries_per_chunk: u64,
}

struct F1Shared {
    /// Mutated only by the control thread, inside lock/release windows or
    /// after the post-fill rendezvous; read by workers only for cursors
    /// between begin and submit.
    writer: UnsafeCell<BitBucketWriter>,
    /// Global per-bucket entry counts. Control thread only.
    counts: UnsafeCell<Vec<u64>>,
    error: Mutex<Option<PlotError>>,
    abort: AtomicBool,
}

// SAFETY: Access to the UnsafeCell fields follows the barrier protocol
// documented on each access site; no two threads touch them concurrently
// with a writer present.
unsafe impl Sync for F1Shared {}

impl F1Shared {
    fn fail(&self, err: PlotError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
        self.abort.store(true, Ordering::Release);
    }
}

/// Generates table 1 into the `Y0` bucket files.
///
/// Returns the per-bucket entry counts. Deterministic for a fixed
/// `(plot_id, k, num_buckets)` regardless of the thread count.
pub fn generate_f1(
    params: &PlotParams,
    plot_id: &[u8; PLOT_ID_LEN],
    queue: &DiskBufferQueue,
) -> Result<Vec<u64>, PlotError> {
    let cfg = F1Config {
        k: params.k,
        num_buckets: params.num_buckets as usize,
        threads: params.f1_thread_count,
        y_local_bits: params.y_bits_local(),
        entry_bits: params.t1_entry_bits(),
        bucket_shift: params.k - params.bucket_bits(),
        entries_per_chunk: params.entries_per_chunk(),
    };
    let key = chacha_key(plot_id);

    let shared = F1Shared {
        writer: UnsafeCell::new(BitBucketWriter::new(
            FileId::Y0,
            cfg.num_buckets,
            queue.block_size(),
        )),
        counts: UnsafeCell::new(vec![0u64; cfg.num_buckets]),
        error: Mutex::new(None),
        abort: AtomicBool::new(false),
    };
    let barrier = JobBarrier::new(cfg.threads);
    let workspace = PrefixSumWorkspace::new(cfg.threads, cfg.num_buckets);

    let started = std::time::Instant::now();
    std::thread::scope(|scope| {
        for id in 1..cfg.threads {
            let shared = &shared;
            let barrier = &barrier;
            let workspace = &workspace;
            let key = &key;
            scope.spawn(move || f1_worker(id, cfg, key, shared, barrier, workspace, queue));
        }
        f1_worker(0, cfg, &key, &shared, &barrier, &workspace, queue);
    });

    if let Some(err) = shared.error.into_inner().unwrap() {
        return Err(err);
    }
    let counts = shared.counts.into_inner();
    let total: u64 = counts.iter().sum();
    if total != 1u64 << cfg.k {
        return Err(PlotError::invariant(format!(
            "f1 produced {total} entries, expected {}",
            1u64 << cfg.k
        )));
    }
    tracing::info!(
        entries = total,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "f1 generation complete"
    );
    Ok(counts)
}

#[allow(clippy::too_many_arguments)]
fn f1_worker(
    id: usize,
    cfg: F1Config,
    key: &[u8; 32],
    shared: &F1Shared,
    barrier: &JobBarrier,
    workspace: &PrefixSumWorkspace,
    queue: &DiskBufferQueue,
) {
    let k = u64::from(cfg.k);
    let k_minus_ext = cfg.k - EXTRA_BITS;
    let y_mask = (1u64 << cfg.y_local_bits) - 1;
    let entry_bits = u64::from(cfg.entry_bits);
    let threads = cfg.threads as u64;

    let chacha_key = Key::from(*key);
    let iv = Iv::<ChaCha8>::default();

    let mut keystream: Vec<u8> = Vec::new();
    let mut raw_ys: Vec<u64> = Vec::new();
    let mut packed: Vec<u64> = Vec::new();
    let mut counts = vec![0u64; cfg.num_buckets];
    let mut offsets = vec![0u64; cfg.num_buckets];
    let mut totals = vec![0u64; cfg.num_buckets];
    let mut local_starts = vec![0usize; cfg.num_buckets];

    let mut remaining: u64 = 1u64 << cfg.k;
    let mut next_x: u64 = 0;

    for _chunk in 0..cfg.num_buckets {
        // The last chunk absorbs any residual from the ceiling division.
        let chunk_entries = cfg.entries_per_chunk.min(remaining);
        let per_thread = chunk_entries / threads;
        let my_x = next_x + per_thread * id as u64;
        let my_count = if id as u64 == threads - 1 {
            chunk_entries - per_thread * (threads - 1)
        } else {
            per_thread
        };

        // Keystream covering this thread's bit range [my_x*k, (my_x+n)*k).
        let bit_start = my_x * k;
        let bit_end = (my_x + my_count) * k;
        let first_block = bit_start / F1_BLOCK_SIZE_BITS;
        let block_count = bit_end.div_ceil(F1_BLOCK_SIZE_BITS) - first_block;
        // Keystream = ChaCha8 applied over zeroed bytes.
        keystream.clear();
        keystream.resize(block_count as usize * 64, 0);
        if block_count > 0 {
            let mut cipher = ChaCha8::new(&chacha_key, &iv);
            cipher.seek(first_block * 64);
            cipher.apply_keystream(&mut keystream);
        }

        // Candidate extraction and target-bucket histogram.
        counts.fill(0);
        raw_ys.clear();
        let mut reader = BitReader::new(&keystream);
        reader.seek(bit_start - first_block * F1_BLOCK_SIZE_BITS);
        for _ in 0..my_count {
            let candidate = reader.read(cfg.k);
            counts[(candidate >> cfg.bucket_shift) as usize] += 1;
            raw_ys.push(candidate);
        }

        // Parallel prefix sum over all threads' histograms.
        workspace.publish(id, &counts);
        barrier.sync();
        workspace.offsets_for_thread(id, &mut offsets, &mut totals);

        if id == 0 {
            barrier.lock_threads();
            {
                // SAFETY: Exclusive inside the lock/release window; workers
                // are parked in wait_for_release.
                let bucket_counts = unsafe { &mut *shared.counts.get() };
                for (slot, &total) in bucket_counts.iter_mut().zip(totals.iter()) {
                    *slot += total;
                }
                let new_bits: Vec<u64> =
                    totals.iter().map(|&total| total * entry_bits).collect();
                // SAFETY: As above.
                let writer = unsafe { &mut *shared.writer.get() };
                if let Err(err) = writer.begin_write_buckets(queue, &new_bits) {
                    shared.fail(err);
                }
            }
            barrier.release_threads();
        } else {
            barrier.wait_for_release();
        }
        if shared.abort.load(Ordering::Acquire) {
            return;
        }

        // Distribute this thread's entries into scratch, grouped by bucket.
        let mut running = 0usize;
        for (start, &count) in local_starts.iter_mut().zip(counts.iter()) {
            *start = running;
            running += count as usize;
        }
        packed.clear();
        packed.resize(my_count as usize, 0);
        let mut fill = local_starts.clone();
        for (i, &candidate) in raw_ys.iter().enumerate() {
            let x = my_x + i as u64;
            let bucket = (candidate >> cfg.bucket_shift) as usize;
            let y_full = (candidate << EXTRA_BITS) | (x >> k_minus_ext);
            let value = (x << cfg.y_local_bits) | (y_full & y_mask);
            packed[fill[bucket]] = value;
            fill[bucket] += 1;
        }

        // SAFETY: Shared read-only between begin and submit; cursors write
        // through atomics.
        let writer = unsafe { &*shared.writer.get() };
        for bucket in 0..cfg.num_buckets {
            let n = counts[bucket] as usize;
            let slice = &packed[local_starts[bucket]..local_starts[bucket] + n];
            let start_entry = offsets[bucket] - counts[bucket];
            let mut cursor = writer.cursor(bucket, start_entry * entry_bits);
            // First two entries, rendezvous, then the bulk.
            let head = n.min(2);
            for &value in &slice[..head] {
                cursor.write(value, cfg.entry_bits);
            }
            barrier.sync();
            for &value in &slice[head..] {
                cursor.write(value, cfg.entry_bits);
            }
        }
        barrier.sync();

        if id == 0 {
            // SAFETY: Workers are past the rendezvous above and will not
            // touch the writer again until the next begin.
            let writer = unsafe { &mut *shared.writer.get() };
            writer.submit(queue);
            queue.commit();
        }

        remaining -= chunk_entries;
        next_x += chunk_entries;
    }

    if id == 0 {
        // SAFETY: All workers have left their chunk loops.
        let writer = unsafe { &mut *shared.writer.get() };
        if let Err(err) = writer.submit_left_overs(queue) {
            shared.fail(err);
        }
        queue.commit();
    }
}
