//! I/O command records and the producer/consumer command ring.
//!
//! One producer (the pipeline stage on the control thread) stages commands
//! into a fixed ring and publishes them in batches with `commit`; one
//! consumer (the dispatch thread) drains them in strict FIFO order. The ring
//! is the only hand-off point between compute and I/O, so buffers inside
//! commands carry ownership with them.
//!
//! # Design
//!
//! The ring follows the wait-free SPSC scheme (monotonic u32 indices masked
//! by a power-of-two capacity, acquire/release publication, cache-padded
//! index words, cached remote index on each side), extended with a staging
//! area: `push` writes slots past the published tail, and `commit` makes
//! the whole batch visible at once and raises the ready signal. A producer
//! blocked on a full ring waits on the consumed signal.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_utils::CachePadded;

use super::file_stream::SeekOrigin;
use super::queue::FileId;
use super::work_heap::HeapBuffer;
use crate::threading::Signal;

/// Completion slot for a read command.
///
/// The dispatch thread parks the filled buffer here and raises the signal;
/// the producer reclaims it through `PendingRead::wait`.
#[derive(Debug, Default)]
pub struct ReadSlot {
    buffer: Mutex<Option<HeapBuffer>>,
    done: Signal,
}

impl ReadSlot {
    /// Completes the read with the filled buffer.
    pub fn complete(&self, buffer: HeapBuffer) {
        *self.buffer.lock().unwrap() = Some(buffer);
        self.done.signal();
    }

    /// Completes the read without a buffer (queue error path); the buffer
    /// was released back to the heap by the dispatch thread.
    pub fn complete_empty(&self) {
        self.done.signal();
    }

    /// Waits for completion; `None` means the queue failed the command.
    pub fn wait(&self) -> Option<HeapBuffer> {
        self.done.wait();
        self.buffer.lock().unwrap().take()
    }
}

/// A queued I/O command. Consumed in submission order.
#[derive(Debug)]
pub enum Command {
    /// Write bucket `i` of the payload to file `i` of the set.
    WriteBuckets {
        file: FileId,
        buffer: HeapBuffer,
        /// True payload bytes per bucket (tails handled by the dispatcher).
        sizes: Box<[u32]>,
    },
    /// Write `len` bytes to one file of the set.
    WriteFile {
        file: FileId,
        bucket: u32,
        buffer: HeapBuffer,
        len: usize,
    },
    /// Read `len` bytes from one file of the set into the buffer.
    ReadFile {
        file: FileId,
        bucket: u32,
        len: usize,
        buffer: HeapBuffer,
        slot: Arc<ReadSlot>,
    },
    /// Seek one file of the set.
    SeekFile {
        file: FileId,
        bucket: u32,
        offset: i64,
        origin: SeekOrigin,
    },
    /// Seek every file of the set.
    SeekBucket {
        file: FileId,
        offset: i64,
        origin: SeekOrigin,
    },
    /// Return a buffer to the heap in command order.
    ReleaseBuffer { buffer: HeapBuffer },
    /// Signal the submitter once every earlier command has executed.
    Fence { signal: Arc<Signal> },
    /// Stop the dispatch thread after this command.
    Shutdown,
}

/// Ring capacity. Power of two; matches the original dispatcher's batch
/// window.
pub const COMMAND_RING_CAPACITY: u32 = 64;

const MASK: u32 = COMMAND_RING_CAPACITY - 1;

struct Ring {
    slots: Box<[UnsafeCell<MaybeUninit<Command>>]>,
    /// Consumer's read index (monotonic; masked on access).
    head: CachePadded<AtomicU32>,
    /// Published write index. Slots in `[head, tail)` are initialized.
    tail: CachePadded<AtomicU32>,
    ready: Signal,
    consumed: Signal,
}

// SAFETY: The SPSC protocol ensures the producer and consumer access
// disjoint slots: the producer only writes slots at or past the published
// tail, the consumer only reads slots below it.
unsafe impl Sync for Ring {}
unsafe impl Send for Ring {}

impl Drop for Ring {
    fn drop(&mut self) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let mut idx = head;
        while idx != tail {
            let slot = (idx & MASK) as usize;
            // SAFETY: Slots in [head, tail) are initialized.
            unsafe { (*self.slots[slot].get()).assume_init_drop() };
            idx = idx.wrapping_add(1);
        }
    }
}

/// Producer handle: stages and publishes commands.
pub struct CommandWriter {
    ring: Arc<Ring>,
    /// Next unstaged index (published tail + staged count).
    staged_tail: u32,
    /// Cached snapshot of the consumer's head; refreshed on apparent-full.
    cached_head: u32,
}

// The writer owns the producer side alone.
unsafe impl Send for CommandWriter {}

impl CommandWriter {
    /// Stages a command, blocking while the ring is full.
    ///
    /// The command is not visible to the consumer until [`commit`] runs.
    ///
    /// [`commit`]: Self::commit
    pub fn push(&mut self, command: Command) {
        loop {
            if self.staged_tail.wrapping_sub(self.cached_head) < COMMAND_RING_CAPACITY {
                break;
            }
            self.cached_head = self.ring.head.load(Ordering::Acquire);
            if self.staged_tail.wrapping_sub(self.cached_head) < COMMAND_RING_CAPACITY {
                break;
            }
            // Full: publish what we have so the consumer can make progress,
            // then wait for it to consume something.
            self.commit();
            tracing::debug!("command ring full, waiting for dispatch");
            self.ring.consumed.wait();
        }
        let slot = (self.staged_tail & MASK) as usize;
        // SAFETY: The slot is outside [head, published tail) and not yet
        // staged, so neither side can observe it.
        unsafe {
            (*self.ring.slots[slot].get()).write(command);
        }
        self.staged_tail = self.staged_tail.wrapping_add(1);
    }

    /// Publishes all staged commands and wakes the consumer.
    pub fn commit(&mut self) {
        let published = self.ring.tail.load(Ordering::Relaxed);
        if published == self.staged_tail {
            return;
        }
        self.ring.tail.store(self.staged_tail, Ordering::Release);
        self.ring.ready.signal();
    }
}

/// Consumer handle: drains commands in FIFO order.
pub struct CommandReader {
    ring: Arc<Ring>,
    /// Cached snapshot of the published tail; refreshed on apparent-empty.
    cached_tail: u32,
}

unsafe impl Send for CommandReader {}

impl CommandReader {
    /// Drains up to `max` commands, blocking until at least one arrives.
    pub fn wait_and_drain(&mut self, out: &mut Vec<Command>, max: usize) {
        loop {
            let head = self.ring.head.load(Ordering::Relaxed);
            if self.cached_tail == head {
                self.cached_tail = self.ring.tail.load(Ordering::Acquire);
            }
            if self.cached_tail != head {
                let available = self.cached_tail.wrapping_sub(head) as usize;
                let take = available.min(max);
                for i in 0..take {
                    let slot = (head.wrapping_add(i as u32) & MASK) as usize;
                    // SAFETY: Slots in [head, tail) are initialized and the
                    // producer will not touch them until head advances.
                    let command = unsafe { (*self.ring.slots[slot].get()).assume_init_read() };
                    out.push(command);
                }
                self.ring
                    .head
                    .store(head.wrapping_add(take as u32), Ordering::Release);
                self.ring.consumed.signal();
                return;
            }
            self.ring.ready.wait();
        }
    }
}

/// Creates a connected writer/reader pair.
#[must_use]
pub fn command_ring() -> (CommandWriter, CommandReader) {
    let slots = (0..COMMAND_RING_CAPACITY as usize)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();
    let ring = Arc::new(Ring {
        slots,
        head: CachePadded::new(AtomicU32::new(0)),
        tail: CachePadded::new(AtomicU32::new(0)),
        ready: Signal::new(),
        consumed: Signal::new(),
    });
    (
        CommandWriter {
            ring: Arc::clone(&ring),
            staged_tail: 0,
            cached_head: 0,
        },
        CommandReader {
            ring,
            cached_tail: 0,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn fence_command() -> (Command, Arc<Signal>) {
        let signal = Arc::new(Signal::new());
        (
            Command::Fence {
                signal: Arc::clone(&signal),
            },
            signal,
        )
    }

    #[test]
    fn staged_commands_invisible_until_commit() {
        let (mut writer, mut reader) = command_ring();
        let (cmd, _signal) = fence_command();
        writer.push(cmd);
        // The staged command becomes visible only once committed.
        writer.commit();
        let mut out = Vec::new();
        reader.wait_and_drain(&mut out, 64);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn fifo_order_across_batches() {
        let (mut writer, mut reader) = command_ring();
        let consumer = thread::spawn(move || {
            let mut seen = Vec::new();
            let mut out = Vec::new();
            while seen.len() < 300 {
                out.clear();
                reader.wait_and_drain(&mut out, 64);
                for command in out.drain(..) {
                    match command {
                        Command::SeekBucket { offset, .. } => seen.push(offset),
                        Command::Shutdown => {}
                        other => panic!("unexpected command {other:?}"),
                    }
                }
            }
            seen
        });

        for batch in 0..30 {
            for i in 0..10 {
                writer.push(Command::SeekBucket {
                    file: FileId::Y0,
                    offset: i64::from(batch * 10 + i),
                    origin: SeekOrigin::Start,
                });
            }
            writer.commit();
        }
        let seen = consumer.join().unwrap();
        let expected: Vec<i64> = (0..300).collect();
        assert_eq!(seen, expected);
    }

    #[test]
    fn producer_survives_full_ring() {
        let (mut writer, mut reader) = command_ring();
        let consumer = thread::spawn(move || {
            let mut out = Vec::new();
            let mut count = 0usize;
            while count < 1000 {
                out.clear();
                reader.wait_and_drain(&mut out, 16);
                count += out.len();
            }
            count
        });
        // Far more than the ring holds; push publishes and waits as needed.
        for i in 0..1000 {
            writer.push(Command::SeekBucket {
                file: FileId::Y0,
                offset: i,
                origin: SeekOrigin::Start,
            });
        }
        writer.commit();
        assert_eq!(consumer.join().unwrap(), 1000);
    }

    #[test]
    fn read_slot_round_trip_empty() {
        let slot = ReadSlot::default();
        slot.complete_empty();
        assert!(slot.wait().is_none());
    }
}
