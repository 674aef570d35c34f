//! Asynchronous disk I/O: bounded buffer heap, command ring, dispatch
//! thread, and the bit-packed bucket writer.
//!
//! # Module map
//! - `work_heap`: block-aligned buffer arena with deferred releases.
//! - `file_stream`: direct-I/O-capable file handle.
//! - `command`: the producer/consumer command ring and command records.
//! - `queue`: the disk buffer queue owning all file handles.
//! - `bit_bucket_writer`: variable-width entry streaming into per-bucket
//!   block-aligned regions.
//!
//! Ownership flows one way: producers allocate buffers from the heap, fill
//! them, and surrender them to the queue inside commands; the dispatch
//! thread returns them to the heap once the consuming command retires.

pub mod bit_bucket_writer;
pub mod command;
pub mod file_stream;
pub mod queue;
pub mod work_heap;

pub use bit_bucket_writer::BitBucketWriter;
pub use command::Command;
pub use file_stream::{FileStream, SeekOrigin};
pub use queue::{DiskBufferQueue, Fence, FileId, PendingRead, QueueParams};
pub use work_heap::{HeapBuffer, WorkHeap};
