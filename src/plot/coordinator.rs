//! Pass coordinator: `Init → F1 → Pass(T2) → … → Pass(T7) → Done`.
//!
//! Owns the work heap and the disk buffer queue for one plot, rotates the
//! double-buffered file-set generations between passes, seeks file sets
//! back to zero before reuse, and fences after every pass so a pass only
//! starts once the previous table is durably issued.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::errors::PlotError;
use crate::io::{DiskBufferQueue, FileId, QueueParams, SeekOrigin, WorkHeap};
use crate::params::{PlotParams, Table, DEFAULT_BLOCK_SIZE, PLOT_ID_LEN};
use crate::plot::f1::generate_f1;
use crate::plot::pass::{run_pass, PassFiles};

/// Artifacts handed to the plot-file finalizer.
#[derive(Clone, Debug)]
pub struct PlotArtifacts {
    /// Entry counts per table (index 0 = table 1).
    pub table_counts: [u64; 7],
    /// Per-bucket entry counts for tables 1..=6 (table 7 is not bucketed).
    pub bucket_counts: Vec<Vec<u64>>,
    /// Directory holding the emitted streams.
    pub work_dir: PathBuf,
}

impl PlotArtifacts {
    /// Path of a table's pair stream (tables 2..=7).
    #[must_use]
    pub fn pairs_path(&self, table: Table) -> PathBuf {
        self.work_dir
            .join(format!("{}_0.tmp", FileId::pairs(table).name()))
    }

    /// Path of the f7 stream.
    #[must_use]
    pub fn f7_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}_0.tmp", FileId::F7.name()))
    }
}

/// External-memory plotter for one plot.
pub struct DiskPlotter {
    params: PlotParams,
    queue: DiskBufferQueue,
}

impl DiskPlotter {
    /// Validates the configuration and provisions the temporary file sets,
    /// heap, and dispatch thread.
    pub fn new(params: PlotParams) -> Result<Self, PlotError> {
        params.validate()?;
        std::fs::create_dir_all(&params.work_dir).map_err(|source| {
            PlotError::Config(crate::params::ConfigError::WorkDir {
                path: params.work_dir.clone(),
                source,
            })
        })?;

        let provisional_block = params.block_size.unwrap_or(DEFAULT_BLOCK_SIZE);
        let heap = Arc::new(WorkHeap::new(params.heap_size, provisional_block));
        let queue = DiskBufferQueue::new(
            QueueParams {
                work_dir: params.work_dir.clone(),
                num_buckets: params.num_buckets,
                use_direct_io: params.use_direct_io,
                block_size: params.block_size,
            },
            Arc::clone(&heap),
        )?;
        // Rebuild the heap at the discovered block alignment (no buffers
        // are live yet).
        if queue.block_size() != provisional_block {
            heap.reset(params.heap_size, queue.block_size());
        }

        Ok(Self { params, queue })
    }

    /// The validated parameters.
    #[must_use]
    pub fn params(&self) -> &PlotParams {
        &self.params
    }

    /// Runs the full pipeline for `plot_id`, consuming the plotter.
    pub fn run(self, plot_id: &[u8; PLOT_ID_LEN]) -> Result<PlotArtifacts, PlotError> {
        let params = &self.params;
        let queue = &self.queue;
        let started = Instant::now();
        tracing::info!(
            k = params.k,
            num_buckets = params.num_buckets,
            threads = params.thread_count,
            f1_threads = params.f1_thread_count,
            direct_io = params.use_direct_io,
            "plot started"
        );

        let mut table_counts = [0u64; 7];
        let mut bucket_counts: Vec<Vec<u64>> = Vec::with_capacity(6);

        // F1 seeds table 1 into generation 0.
        let t1_counts = generate_f1(params, plot_id, queue)?;
        self.fence()?;
        table_counts[0] = t1_counts.iter().sum();
        bucket_counts.push(t1_counts);

        for table in [
            Table::Table1,
            Table::Table2,
            Table::Table3,
            Table::Table4,
            Table::Table5,
            Table::Table6,
        ] {
            let next = table.next().expect("source table has a successor");
            let files = self.rotation(table);
            let pass_started = Instant::now();

            // Rewind the generation being read and the one being rewritten.
            queue.seek_bucket(files.y_in, 0, SeekOrigin::Start);
            queue.seek_bucket(files.meta_a_in, 0, SeekOrigin::Start);
            queue.seek_bucket(files.meta_b_in, 0, SeekOrigin::Start);
            queue.seek_bucket(files.y_out, 0, SeekOrigin::Start);
            queue.seek_bucket(files.meta_a_out, 0, SeekOrigin::Start);
            queue.seek_bucket(files.meta_b_out, 0, SeekOrigin::Start);
            queue.commit();

            let in_counts = bucket_counts
                .last()
                .expect("previous table counts recorded");
            let output = run_pass(params, queue, table, &files, in_counts)?;
            self.fence()?;

            table_counts[next.number() as usize - 1] = output.matches;
            tracing::info!(
                table = next.number(),
                entries = output.matches,
                elapsed_ms = pass_started.elapsed().as_millis() as u64,
                "table pass complete"
            );
            if !output.bucket_counts.is_empty() {
                bucket_counts.push(output.bucket_counts);
            }
        }

        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            f7_entries = table_counts[6],
            "plot pipeline complete"
        );

        Ok(PlotArtifacts {
            table_counts,
            bucket_counts,
            work_dir: params.work_dir.clone(),
        })
    }

    /// File rotation for the pass consuming `table`: generation 0 holds odd
    /// tables (1, 3, 5), generation 1 holds even ones.
    fn rotation(&self, table: Table) -> PassFiles {
        let gen_in = (table.number() - 1) % 2;
        if gen_in == 0 {
            PassFiles {
                y_in: FileId::Y0,
                meta_a_in: FileId::MetaA0,
                meta_b_in: FileId::MetaB0,
                y_out: FileId::Y1,
                meta_a_out: FileId::MetaA1,
                meta_b_out: FileId::MetaB1,
            }
        } else {
            PassFiles {
                y_in: FileId::Y1,
                meta_a_in: FileId::MetaA1,
                meta_b_in: FileId::MetaB1,
                y_out: FileId::Y0,
                meta_a_out: FileId::MetaA0,
                meta_b_out: FileId::MetaB0,
            }
        }
    }

    fn fence(&self) -> Result<(), PlotError> {
        let fence = self.queue.add_fence();
        self.queue.commit();
        fence.wait()?;
        Ok(())
    }
}
