//! Disk buffer queue: the single owner of all temporary file handles.
//!
//! Producers submit commands through the ring (`command`); one dispatch
//! thread executes them in FIFO order. Every read/write on a bucketed file
//! set honors the block-alignment contract: bucket writes land on
//! block-multiple file offsets, bodies are written in whole blocks, and
//! sub-block tails are either carried by the caller (bucket submits) or
//! zero-padded into a full block (`WriteFile`, used for final leftovers).
//!
//! # Failure policy
//!
//! Any I/O error is fatal to the plot. The dispatch thread latches the
//! first error, disposes subsequent commands (releasing their buffers and
//! signaling their fences so producers unblock), and surfaces the error
//! through `Fence::wait` and `PendingRead::wait`.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use super::command::{command_ring, Command, CommandReader, CommandWriter, ReadSlot};
use super::file_stream::{FileStream, SeekOrigin};
use super::work_heap::{HeapAllocError, HeapBuffer, WorkHeap};
use crate::errors::QueueError;
use crate::params::Table;
use crate::threading::Signal;

/// Identifies a file set owned by the queue.
///
/// `Y`/`MetaA`/`MetaB` sets are double-buffered bucket sets (`_0`/`_1`
/// generations); pair and f7 sets are single sequential files.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FileId {
    Y0,
    Y1,
    MetaA0,
    MetaA1,
    MetaB0,
    MetaB1,
    Pairs2,
    Pairs3,
    Pairs4,
    Pairs5,
    Pairs6,
    Pairs7,
    F7,
}

impl FileId {
    /// Number of file sets.
    pub const COUNT: usize = 13;

    /// All file sets.
    pub const ALL: [FileId; Self::COUNT] = [
        FileId::Y0,
        FileId::Y1,
        FileId::MetaA0,
        FileId::MetaA1,
        FileId::MetaB0,
        FileId::MetaB1,
        FileId::Pairs2,
        FileId::Pairs3,
        FileId::Pairs4,
        FileId::Pairs5,
        FileId::Pairs6,
        FileId::Pairs7,
        FileId::F7,
    ];

    /// Dense index for file-set tables.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Base name used in `<name>_<bucket>.tmp`.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            FileId::Y0 => "y0",
            FileId::Y1 => "y1",
            FileId::MetaA0 => "meta_a0",
            FileId::MetaA1 => "meta_a1",
            FileId::MetaB0 => "meta_b0",
            FileId::MetaB1 => "meta_b1",
            FileId::Pairs2 => "table2_pairs",
            FileId::Pairs3 => "table3_pairs",
            FileId::Pairs4 => "table4_pairs",
            FileId::Pairs5 => "table5_pairs",
            FileId::Pairs6 => "table6_pairs",
            FileId::Pairs7 => "table7_pairs",
            FileId::F7 => "f7",
        }
    }

    /// Whether this set has one file per bucket.
    #[must_use]
    pub const fn is_bucketed(self) -> bool {
        matches!(
            self,
            FileId::Y0
                | FileId::Y1
                | FileId::MetaA0
                | FileId::MetaA1
                | FileId::MetaB0
                | FileId::MetaB1
        )
    }

    /// Pair stream for a table (tables 2..=7).
    ///
    /// # Panics
    ///
    /// Panics for table 1, which has no pair stream.
    #[must_use]
    pub fn pairs(table: Table) -> FileId {
        match table {
            Table::Table2 => FileId::Pairs2,
            Table::Table3 => FileId::Pairs3,
            Table::Table4 => FileId::Pairs4,
            Table::Table5 => FileId::Pairs5,
            Table::Table6 => FileId::Pairs6,
            Table::Table7 => FileId::Pairs7,
            Table::Table1 => panic!("table 1 has no pair stream"),
        }
    }
}

/// Queue construction parameters.
#[derive(Clone, Debug)]
pub struct QueueParams {
    /// Directory for temporary files.
    pub work_dir: PathBuf,
    /// Buckets per bucketed file set.
    pub num_buckets: u32,
    /// Request `O_DIRECT` opens for bucketed sets (buffered fallback when
    /// the filesystem refuses). The block-alignment write contract is tied
    /// to [`FileId::is_bucketed`], not to this flag, so the on-disk layout
    /// is identical either way.
    pub use_direct_io: bool,
    /// Block size override; `None` discovers from the first file.
    pub block_size: Option<usize>,
}

struct FileSet {
    files: Vec<FileStream>,
    /// Block-aligned write contract active for this set.
    aligned: bool,
}

#[derive(Debug, Default)]
struct SharedState {
    error: Mutex<Option<QueueError>>,
}

impl SharedState {
    fn fail(&self, err: QueueError) {
        let mut slot = self.error.lock().unwrap();
        if slot.is_none() {
            tracing::error!(error = %err, "disk buffer queue failed");
            *slot = Some(err);
        }
    }

    fn failed(&self) -> bool {
        self.error.lock().unwrap().is_some()
    }

    fn take_error(&self) -> QueueError {
        self.error
            .lock()
            .unwrap()
            .take()
            .unwrap_or(QueueError::Terminated)
    }
}

/// Completion handle for a fence command.
#[derive(Debug)]
pub struct Fence {
    signal: Arc<Signal>,
    shared: Arc<SharedState>,
}

impl Fence {
    /// Blocks until every command submitted before the fence has executed.
    pub fn wait(self) -> Result<(), QueueError> {
        self.signal.wait();
        if self.shared.failed() {
            return Err(self.shared.take_error());
        }
        Ok(())
    }
}

/// Completion handle for a read command.
#[derive(Debug)]
pub struct PendingRead {
    slot: Arc<ReadSlot>,
    shared: Arc<SharedState>,
}

impl PendingRead {
    /// Blocks until the read completes and returns the filled buffer.
    pub fn wait(self) -> Result<HeapBuffer, QueueError> {
        match self.slot.wait() {
            Some(buffer) => Ok(buffer),
            None => Err(self.shared.take_error()),
        }
    }
}

/// Asynchronous disk buffer queue.
pub struct DiskBufferQueue {
    writer: Mutex<CommandWriter>,
    heap: Arc<WorkHeap>,
    shared: Arc<SharedState>,
    block_size: usize,
    use_direct_io: bool,
    dispatch: Option<JoinHandle<()>>,
}

impl DiskBufferQueue {
    /// Creates the temporary file sets and starts the dispatch thread.
    pub fn new(params: QueueParams, heap: Arc<WorkHeap>) -> Result<Self, QueueError> {
        let mut sets = Vec::with_capacity(FileId::COUNT);
        let mut block_size: Option<usize> = params.block_size;

        for id in FileId::ALL {
            let bucket_count = if id.is_bucketed() {
                params.num_buckets
            } else {
                1
            };
            // Bucketed sets always use the block-aligned layout so the
            // on-disk format is independent of the direct-I/O flag; pair and
            // f7 streams are sequential final artifacts with arbitrary
            // record sizes and stay exact-length.
            let aligned = id.is_bucketed();
            let direct = params.use_direct_io && aligned;
            let mut files = Vec::with_capacity(bucket_count as usize);
            for bucket in 0..bucket_count {
                let path = params
                    .work_dir
                    .join(format!("{}_{bucket}.tmp", id.name()));
                let stream = FileStream::create(&path, direct, params.block_size)
                    .map_err(|source| QueueError::Open {
                        name: id.name(),
                        bucket,
                        source,
                    })?;
                match block_size {
                    None => block_size = Some(stream.block_size()),
                    Some(expected) => {
                        if stream.block_size() != expected {
                            return Err(QueueError::BlockSizeMismatch {
                                expected,
                                got: stream.block_size(),
                            });
                        }
                    }
                }
                files.push(stream);
            }
            sets.push(FileSet { files, aligned });
        }

        let block_size = block_size.unwrap_or(crate::params::DEFAULT_BLOCK_SIZE);
        let shared = Arc::new(SharedState::default());
        let (writer, reader) = command_ring();

        let dispatch = {
            let heap = Arc::clone(&heap);
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("diskplot-io".into())
                .spawn(move || {
                    Dispatcher {
                        sets,
                        reader,
                        heap,
                        shared,
                        block_size,
                        block_scratch: vec![0u8; block_size],
                    }
                    .run();
                })
                .expect("spawn dispatch thread")
        };

        Ok(Self {
            writer: Mutex::new(writer),
            heap,
            shared,
            block_size,
            use_direct_io: params.use_direct_io,
            dispatch: Some(dispatch),
        })
    }

    /// Effective block size for alignment math.
    #[inline]
    #[must_use]
    pub const fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether `O_DIRECT` opens were requested for bucketed sets. The
    /// block-aligned layout applies to bucketed sets regardless.
    #[inline]
    #[must_use]
    pub const fn use_direct_io(&self) -> bool {
        self.use_direct_io
    }

    /// The buffer heap backing this queue.
    #[must_use]
    pub fn heap(&self) -> &Arc<WorkHeap> {
        &self.heap
    }

    /// Allocates a block-aligned I/O buffer from the heap.
    pub fn get_buffer(&self, size: usize) -> Result<HeapBuffer, HeapAllocError> {
        self.heap.alloc(size)
    }

    fn push(&self, command: Command) {
        self.writer.lock().unwrap().push(command);
    }

    /// Stages a bucket-set write. `sizes` are true payload bytes per bucket;
    /// under the aligned contract only whole blocks are written and the
    /// caller carries sub-block tails.
    pub fn write_buckets(&self, file: FileId, buffer: HeapBuffer, sizes: Box<[u32]>) {
        debug_assert!(file.is_bucketed());
        self.push(Command::WriteBuckets {
            file,
            buffer,
            sizes,
        });
    }

    /// Stages a single-file write of `len` bytes.
    pub fn write_file(&self, file: FileId, bucket: u32, buffer: HeapBuffer, len: usize) {
        self.push(Command::WriteFile {
            file,
            bucket,
            buffer,
            len,
        });
    }

    /// Stages a read of `len` payload bytes into `buffer`.
    pub fn read_file(
        &self,
        file: FileId,
        bucket: u32,
        buffer: HeapBuffer,
        len: usize,
    ) -> PendingRead {
        let slot = Arc::new(ReadSlot::default());
        self.push(Command::ReadFile {
            file,
            bucket,
            len,
            buffer,
            slot: Arc::clone(&slot),
        });
        PendingRead {
            slot,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Stages a seek on one file of a set.
    pub fn seek_file(&self, file: FileId, bucket: u32, offset: i64, origin: SeekOrigin) {
        self.push(Command::SeekFile {
            file,
            bucket,
            offset,
            origin,
        });
    }

    /// Stages a seek on every file of a set.
    pub fn seek_bucket(&self, file: FileId, offset: i64, origin: SeekOrigin) {
        self.push(Command::SeekBucket {
            file,
            offset,
            origin,
        });
    }

    /// Stages a buffer release, ordered after earlier commands.
    pub fn release_buffer(&self, buffer: HeapBuffer) {
        self.push(Command::ReleaseBuffer { buffer });
    }

    /// Stages a fence and returns its completion handle.
    #[must_use]
    pub fn add_fence(&self) -> Fence {
        let signal = Arc::new(Signal::new());
        self.push(Command::Fence {
            signal: Arc::clone(&signal),
        });
        Fence {
            signal,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Publishes all staged commands to the dispatch thread.
    pub fn commit(&self) {
        self.writer.lock().unwrap().commit();
    }
}

impl Drop for DiskBufferQueue {
    fn drop(&mut self) {
        {
            let mut writer = self.writer.lock().unwrap();
            writer.push(Command::Shutdown);
            writer.commit();
        }
        if let Some(handle) = self.dispatch.take() {
            let _ = handle.join();
        }
    }
}

struct Dispatcher {
    sets: Vec<FileSet>,
    reader: CommandReader,
    heap: Arc<WorkHeap>,
    shared: Arc<SharedState>,
    block_size: usize,
    block_scratch: Vec<u8>,
}

impl Dispatcher {
    fn run(mut self) {
        let mut batch = Vec::with_capacity(64);
        'outer: loop {
            batch.clear();
            self.reader.wait_and_drain(&mut batch, 64);
            for command in batch.drain(..) {
                if matches!(command, Command::Shutdown) {
                    break 'outer;
                }
                if self.shared.failed() {
                    self.dispose(command);
                    continue;
                }
                if let Err(err) = self.execute(command) {
                    self.shared.fail(err);
                }
            }
            self.heap.complete_pending_releases();
        }
        self.heap.complete_pending_releases();
    }

    fn set(&mut self, id: FileId) -> &mut FileSet {
        &mut self.sets[id.index()]
    }

    fn execute(&mut self, command: Command) -> Result<(), QueueError> {
        match command {
            Command::WriteBuckets {
                file,
                buffer,
                sizes,
            } => {
                let result = self.cmd_write_buckets(file, &buffer, &sizes);
                self.heap.release(buffer);
                result
            }
            Command::WriteFile {
                file,
                bucket,
                buffer,
                len,
            } => {
                let result = self.cmd_write_file(file, bucket, &buffer.as_slice()[..len]);
                self.heap.release(buffer);
                result
            }
            Command::ReadFile {
                file,
                bucket,
                len,
                mut buffer,
                slot,
            } => match self.cmd_read_file(file, bucket, len, &mut buffer) {
                Ok(()) => {
                    slot.complete(buffer);
                    Ok(())
                }
                Err(err) => {
                    self.heap.release(buffer);
                    slot.complete_empty();
                    Err(err)
                }
            },
            Command::SeekFile {
                file,
                bucket,
                offset,
                origin,
            } => {
                let name = file.name();
                let stream = &mut self.set(file).files[bucket as usize];
                stream
                    .seek(offset, origin)
                    .map(|_| ())
                    .map_err(|source| QueueError::Seek {
                        name,
                        bucket,
                        source,
                    })
            }
            Command::SeekBucket {
                file,
                offset,
                origin,
            } => {
                let name = file.name();
                let set = self.set(file);
                for (bucket, stream) in set.files.iter_mut().enumerate() {
                    stream
                        .seek(offset, origin)
                        .map_err(|source| QueueError::Seek {
                            name,
                            bucket: bucket as u32,
                            source,
                        })?;
                }
                Ok(())
            }
            Command::ReleaseBuffer { buffer } => {
                self.heap.release(buffer);
                Ok(())
            }
            Command::Fence { signal } => {
                signal.signal();
                Ok(())
            }
            Command::Shutdown => Ok(()),
        }
    }

    /// Disposes a command after a fatal error: buffers go back to the heap,
    /// waiters are woken so they can observe the failure.
    fn dispose(&mut self, command: Command) {
        match command {
            Command::WriteBuckets { buffer, .. }
            | Command::WriteFile { buffer, .. }
            | Command::ReleaseBuffer { buffer } => self.heap.release(buffer),
            Command::ReadFile { buffer, slot, .. } => {
                self.heap.release(buffer);
                slot.complete_empty();
            }
            Command::Fence { signal } => signal.signal(),
            Command::SeekFile { .. } | Command::SeekBucket { .. } | Command::Shutdown => {}
        }
    }

    fn cmd_write_buckets(
        &mut self,
        file: FileId,
        buffer: &HeapBuffer,
        sizes: &[u32],
    ) -> Result<(), QueueError> {
        let name = file.name();
        let block = self.block_size;
        let aligned = self.sets[file.index()].aligned;
        let payload = buffer.as_slice();
        let mut offset = 0usize;

        tracing::trace!(file = name, buckets = sizes.len(), "write buckets");

        for (bucket, &size) in sizes.iter().enumerate() {
            let bucket = bucket as u32;
            let size = size as usize;
            // Only write up to the block-aligned boundary; the caller is in
            // charge of the remainders (carried tails).
            let write_size = if aligned { size / block * block } else { size };

            if aligned {
                let stream = &mut self.sets[file.index()].files[bucket as usize];
                let position = stream.position().map_err(|source| QueueError::Seek {
                    name,
                    bucket,
                    source,
                })?;
                if position % block as u64 != 0 {
                    return Err(QueueError::Misaligned {
                        name,
                        bucket,
                        offset: position,
                        block_size: block,
                    });
                }
            }

            if write_size > 0 {
                let stream = &mut self.sets[file.index()].files[bucket as usize];
                stream
                    .write_all(&payload[offset..offset + write_size])
                    .map_err(|source| QueueError::Write {
                        name,
                        bucket,
                        source,
                    })?;
            }

            // Each bucket's region starts at the next block boundary.
            offset += if aligned {
                size.next_multiple_of(block)
            } else {
                size
            };
        }
        Ok(())
    }

    fn cmd_write_file(
        &mut self,
        file: FileId,
        bucket: u32,
        payload: &[u8],
    ) -> Result<(), QueueError> {
        let name = file.name();
        let block = self.block_size;
        let aligned = self.sets[file.index()].aligned;

        if !aligned {
            let stream = &mut self.sets[file.index()].files[bucket as usize];
            return stream
                .write_all(payload)
                .map_err(|source| QueueError::Write {
                    name,
                    bucket,
                    source,
                });
        }

        let body = payload.len() / block * block;
        let remainder = payload.len() - body;
        {
            let stream = &mut self.sets[file.index()].files[bucket as usize];
            if body > 0 {
                stream
                    .write_all(&payload[..body])
                    .map_err(|source| QueueError::Write {
                        name,
                        bucket,
                        source,
                    })?;
            }
        }
        if remainder > 0 {
            self.block_scratch.fill(0);
            self.block_scratch[..remainder].copy_from_slice(&payload[body..]);
            let scratch = std::mem::take(&mut self.block_scratch);
            let stream = &mut self.sets[file.index()].files[bucket as usize];
            let result = stream
                .write_all(&scratch)
                .map_err(|source| QueueError::Write {
                    name,
                    bucket,
                    source,
                });
            self.block_scratch = scratch;
            result?;
        }
        Ok(())
    }

    fn cmd_read_file(
        &mut self,
        file: FileId,
        bucket: u32,
        len: usize,
        buffer: &mut HeapBuffer,
    ) -> Result<(), QueueError> {
        let name = file.name();
        let block = self.block_size;
        let aligned = self.sets[file.index()].aligned;
        // Bucket files are padded to whole blocks, so rounding the read up
        // never runs past end of file.
        let read_len = if aligned {
            len.next_multiple_of(block)
        } else {
            len
        };
        debug_assert!(buffer.len() >= read_len);
        let stream = &mut self.sets[file.index()].files[bucket as usize];
        stream
            .read_exact(&mut buffer.as_mut_slice()[..read_len])
            .map_err(|source| QueueError::Read {
                name,
                bucket,
                source,
            })
    }
}
