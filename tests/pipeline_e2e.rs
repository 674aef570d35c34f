//! Full-pipeline checks at k=18: seven tables, match-rule verification of
//! the emitted pairs, count conservation, and cross-thread-count
//! determinism of the final streams.

use std::path::Path;
use std::sync::Arc;

use diskplot::bits::bits_to_bytes;
use diskplot::io::{DiskBufferQueue, FileId, QueueParams, SeekOrigin, WorkHeap};
use diskplot::plot::f1::generate_f1;
use diskplot::plot::has_match;
use diskplot::plot::pass::{run_pass, PassFiles};
use diskplot::plot::reader::{
    full_y, read_f7, read_pairs, unpack_t1_entries, F7_RECORD_BYTES, PAIR_RECORD_BYTES,
};
use diskplot::{DiskPlotter, PlotArtifacts, PlotParams, Table};

const K: u32 = 18;
const NUM_BUCKETS: u32 = 64;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn run_plot(work_dir: &Path, threads: usize) -> PlotArtifacts {
    init_tracing();
    let params = PlotParams {
        k: K,
        num_buckets: NUM_BUCKETS,
        thread_count: threads,
        f1_thread_count: threads,
        work_dir: work_dir.to_path_buf(),
        heap_size: 32 * 1024 * 1024,
        use_direct_io: false,
        block_size: Some(4096),
    };
    let plotter = DiskPlotter::new(params).unwrap();
    plotter.run(&[0u8; 32]).unwrap()
}

/// Rebuilds table 1's per-bucket ascending y arrays from the bucket files.
fn sorted_t1_ys(work_dir: &Path, counts: &[u64]) -> Vec<Vec<u64>> {
    let y_local_bits = K + 6 - NUM_BUCKETS.trailing_zeros();
    let mut per_bucket = Vec::new();
    for bucket in 0..NUM_BUCKETS as usize {
        let bytes = std::fs::read(work_dir.join(format!("y0_{bucket}.tmp"))).unwrap();
        let mut ys: Vec<u64> = unpack_t1_entries(&bytes, counts[bucket], K, y_local_bits)
            .into_iter()
            .map(|(_, y_local)| full_y(bucket as u64, y_local, y_local_bits))
            .collect();
        ys.sort_unstable();
        per_bucket.push(ys);
    }
    per_bucket
}

#[test]
fn full_pipeline_produces_seven_tables() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = run_plot(dir.path(), 2);

    assert_eq!(artifacts.table_counts[0], 1 << K);
    for table in 0..7 {
        assert!(
            artifacts.table_counts[table] > 0,
            "table {} is empty",
            table + 1
        );
    }

    // Bucket counts are recorded for tables 1..=6 and agree with totals.
    assert_eq!(artifacts.bucket_counts.len(), 6);
    for (i, counts) in artifacts.bucket_counts.iter().enumerate() {
        assert_eq!(counts.len(), NUM_BUCKETS as usize);
        assert_eq!(
            counts.iter().sum::<u64>(),
            artifacts.table_counts[i],
            "bucket counts disagree for table {}",
            i + 1
        );
    }

    // Pair streams hold exactly one record per entry of their table.
    for table in [
        Table::Table2,
        Table::Table3,
        Table::Table4,
        Table::Table5,
        Table::Table6,
        Table::Table7,
    ] {
        let len = std::fs::metadata(artifacts.pairs_path(table)).unwrap().len();
        let expected = artifacts.table_counts[table.number() as usize - 1]
            * PAIR_RECORD_BYTES as u64;
        assert_eq!(len, expected, "{table} pair stream size");
    }

    // The f7 stream has one k-bit value per table-7 entry.
    let f7_len = std::fs::metadata(artifacts.f7_path()).unwrap().len();
    assert_eq!(f7_len, artifacts.table_counts[6] * F7_RECORD_BYTES as u64);
    let f7_bytes = std::fs::read(artifacts.f7_path()).unwrap();
    let f7 = read_f7(&f7_bytes, artifacts.table_counts[6]);
    assert!(f7.iter().all(|&v| u64::from(v) < 1 << K));
}

#[test]
fn table2_pairs_satisfy_the_match_rule() {
    // Run only F1 and the first pass so generation 0 still holds table 1
    // when the pairs are verified against it.
    let dir = tempfile::tempdir().unwrap();
    let params = PlotParams {
        k: K,
        num_buckets: NUM_BUCKETS,
        thread_count: 2,
        f1_thread_count: 2,
        work_dir: dir.path().to_path_buf(),
        heap_size: 32 * 1024 * 1024,
        use_direct_io: false,
        block_size: Some(4096),
    };
    let heap = Arc::new(WorkHeap::new(params.heap_size, 4096));
    let queue = DiskBufferQueue::new(
        QueueParams {
            work_dir: dir.path().to_path_buf(),
            num_buckets: NUM_BUCKETS,
            use_direct_io: false,
            block_size: Some(4096),
        },
        heap,
    )
    .unwrap();

    let t1_counts = generate_f1(&params, &[0u8; 32], &queue).unwrap();
    queue.seek_bucket(FileId::Y0, 0, SeekOrigin::Start);
    queue.commit();
    let files = PassFiles {
        y_in: FileId::Y0,
        meta_a_in: FileId::MetaA0,
        meta_b_in: FileId::MetaB0,
        y_out: FileId::Y1,
        meta_a_out: FileId::MetaA1,
        meta_b_out: FileId::MetaB1,
    };
    let output = run_pass(&params, &queue, Table::Table1, &files, &t1_counts).unwrap();
    let fence = queue.add_fence();
    queue.commit();
    fence.wait().unwrap();

    let per_bucket = sorted_t1_ys(dir.path(), &t1_counts);

    // Cumulative bucket bases in table 1's sorted order.
    let mut bases = Vec::with_capacity(per_bucket.len());
    let mut base = 0u64;
    for ys in &per_bucket {
        bases.push(base);
        base += ys.len() as u64;
    }

    let pair_bytes = std::fs::read(dir.path().join("table2_pairs_0.tmp")).unwrap();
    let pairs = read_pairs(&pair_bytes, output.matches);
    assert_eq!(pairs.len() as u64, output.matches);
    assert_eq!(output.bucket_counts.iter().sum::<u64>(), output.matches);

    for &(left_abs, delta) in &pairs {
        let left_abs = u64::from(left_abs);
        let bucket = match bases.binary_search(&left_abs) {
            Ok(exact) => {
                // A base hit can point at an empty bucket run; walk to the
                // bucket that actually contains this index.
                let mut b = exact;
                while per_bucket[b].is_empty() {
                    b += 1;
                }
                b
            }
            Err(insert) => insert - 1,
        };
        let local = (left_abs - bases[bucket]) as usize;
        let right = local + delta as usize;
        assert!(
            right < per_bucket[bucket].len(),
            "pair crosses its bucket: left={left_abs} delta={delta}"
        );
        let y_left = per_bucket[bucket][local];
        let y_right = per_bucket[bucket][right];
        assert!(y_left <= y_right);
        assert!(
            has_match(y_left, y_right),
            "pair violates the kBC rule: yL={y_left} yR={y_right}"
        );
    }
}

#[test]
fn final_streams_are_thread_count_invariant() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = run_plot(dir_a.path(), 2);
    let b = run_plot(dir_b.path(), 3);

    assert_eq!(a.table_counts, b.table_counts);
    for table in [Table::Table2, Table::Table7] {
        let pa = std::fs::read(a.pairs_path(table)).unwrap();
        let pb = std::fs::read(b.pairs_path(table)).unwrap();
        assert_eq!(pa, pb, "{table} pair stream differs across thread counts");
    }
    let fa = std::fs::read(a.f7_path()).unwrap();
    let fb = std::fs::read(b.f7_path()).unwrap();
    assert_eq!(fa, fb, "f7 stream differs across thread counts");
}

#[test]
fn bucket_files_stay_block_padded_through_passes() {
    let dir = tempfile::tempdir().unwrap();
    let artifacts = run_plot(dir.path(), 2);

    // After the full run, generation 1 last held table 6 (written by the
    // table-5 pass; the final pass emits no bucket files).
    let y_local_bits = K + 6 - NUM_BUCKETS.trailing_zeros();
    let counts = &artifacts.bucket_counts[5];
    for bucket in 0..NUM_BUCKETS as usize {
        let bytes =
            std::fs::read(artifacts.work_dir.join(format!("y1_{bucket}.tmp"))).unwrap();
        assert_eq!(bytes.len() % 4096, 0, "bucket {bucket} lost block padding");
        let payload = bits_to_bytes(counts[bucket] * u64::from(y_local_bits));
        assert!(bytes.len() >= payload);
    }
}
