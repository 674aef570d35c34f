//! Bounded work heap for I/O buffers.
//!
//! A contiguous arena serving block-aligned allocations. The pipeline's
//! producers allocate here, hand buffers to the disk buffer queue inside
//! commands, and the dispatch thread releases them after the consuming
//! command retires. Releases from arbitrary threads land on a lock-free
//! pending queue and are folded into the free list either by the heap
//! owner's `complete_pending_releases` or by an allocating thread, so the
//! free list itself is never contended on the hot submission path.
//!
//! # Invariants
//! - Allocation sizes are rounded up to the arena alignment, so every free
//!   span starts and ends on an alignment boundary.
//! - Live allocations plus pending releases never exceed the arena.
//! - `reset` and drop require all buffers returned (checked).

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU64;
use std::sync::{Condvar, Mutex};

use crossbeam_queue::SegQueue;

/// A free region of the arena, in bytes from the arena base.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Span {
    offset: usize,
    size: usize,
}

/// Allocation request that can never be satisfied.
#[derive(Debug)]
pub struct HeapAllocError {
    /// Rounded request size.
    pub requested: usize,
    /// Arena capacity.
    pub capacity: usize,
}

impl fmt::Display for HeapAllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "work heap cannot satisfy allocation: requested {}, capacity {}",
            self.requested, self.capacity
        )
    }
}

impl std::error::Error for HeapAllocError {}

/// Move-only handle to an arena region.
///
/// The handle is surrendered to the disk buffer queue when a command is
/// submitted; the producer cannot observe the buffer afterwards. Buffers
/// must be returned to the heap (directly via [`WorkHeap::release`] or
/// through a `ReleaseBuffer` command); dropping a handle leaks its region
/// until `reset`.
pub struct HeapBuffer {
    ptr: NonNull<u8>,
    size: usize,
    offset: usize,
}

// SAFETY: The buffer is an exclusive region of the arena; the handle is the
// only way to touch it and moves between threads whole.
unsafe impl Send for HeapBuffer {}

// SAFETY: Shared access through `&HeapBuffer` is either read-only
// (`as_slice`, used only after writers are externally synchronized) or goes
// through `as_atomic_words`, which is safe to share by construction.
unsafe impl Sync for HeapBuffer {}

impl HeapBuffer {
    /// Buffer length in bytes (request rounded up to the arena alignment).
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.size
    }

    /// Returns true if the buffer is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Offset from the arena base.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Read access to the buffer bytes.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: The region [ptr, ptr+size) is exclusively ours and
        // initialized (arena is zero-initialized; writes go through this
        // handle).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Write access to the buffer bytes.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: See `as_slice`; `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    /// Views the buffer as atomic 64-bit words for concurrent bit packing.
    ///
    /// The arena alignment is a power of two ≥ 8, so the base is always
    /// word-aligned. The word count is the largest whole-word prefix.
    #[inline]
    #[must_use]
    pub fn as_atomic_words(&self) -> &[AtomicU64] {
        // SAFETY: Alignment holds (arena alignment ≥ block size ≥ 8), the
        // region is exclusively owned by this handle, and AtomicU64 permits
        // shared mutation through &self.
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr().cast::<AtomicU64>(), self.size / 8)
        }
    }

    /// Zeroes the buffer.
    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }
}

impl fmt::Debug for HeapBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeapBuffer")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

#[derive(Debug)]
struct HeapState {
    base: NonNull<u8>,
    capacity: usize,
    alignment: usize,
    /// Free spans sorted by offset, always coalesced.
    free: Vec<Span>,
    /// Bytes currently allocated.
    live: usize,
    /// Largest `live` ever observed.
    high_water: usize,
}

// SAFETY: The raw base pointer is only dereferenced through HeapBuffer
// handles; the state itself is just bookkeeping guarded by the mutex.
unsafe impl Send for HeapState {}

impl HeapState {
    fn insert_free(&mut self, span: Span) {
        let idx = self
            .free
            .partition_point(|existing| existing.offset < span.offset);
        self.free.insert(idx, span);
        // Coalesce with the successor, then the predecessor.
        if idx + 1 < self.free.len() && self.free[idx].offset + self.free[idx].size == self.free[idx + 1].offset
        {
            self.free[idx].size += self.free[idx + 1].size;
            self.free.remove(idx + 1);
        }
        if idx > 0 && self.free[idx - 1].offset + self.free[idx - 1].size == self.free[idx].offset {
            self.free[idx - 1].size += self.free[idx].size;
            self.free.remove(idx);
        }
    }

    fn try_alloc(&mut self, size: usize) -> Option<Span> {
        let idx = self.free.iter().position(|span| span.size >= size)?;
        let span = &mut self.free[idx];
        let carved = Span {
            offset: span.offset,
            size,
        };
        if span.size == size {
            self.free.remove(idx);
        } else {
            span.offset += size;
            span.size -= size;
        }
        self.live += size;
        self.high_water = self.high_water.max(self.live);
        Some(carved)
    }
}

/// Heap usage statistics.
#[derive(Clone, Copy, Debug)]
pub struct HeapStats {
    /// Arena capacity in bytes.
    pub capacity: usize,
    /// Bytes currently allocated.
    pub live: usize,
    /// Largest live total observed.
    pub high_water: usize,
}

/// Fixed-size arena of block-aligned I/O buffers.
#[derive(Debug)]
pub struct WorkHeap {
    state: Mutex<HeapState>,
    space: Condvar,
    pending: SegQueue<Span>,
}

impl WorkHeap {
    /// Allocates an arena of `capacity` bytes at `alignment`.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero, or `alignment` is not a power of two
    /// of at least 8, or the allocation fails.
    #[must_use]
    pub fn new(capacity: usize, alignment: usize) -> Self {
        let (base, capacity) = Self::alloc_arena(capacity, alignment);
        Self {
            state: Mutex::new(HeapState {
                base,
                capacity,
                alignment,
                free: vec![Span {
                    offset: 0,
                    size: capacity,
                }],
                live: 0,
                high_water: 0,
            }),
            space: Condvar::new(),
            pending: SegQueue::new(),
        }
    }

    fn alloc_arena(capacity: usize, alignment: usize) -> (NonNull<u8>, usize) {
        assert!(capacity > 0, "heap capacity must be positive");
        assert!(
            alignment >= 8 && alignment.is_power_of_two(),
            "heap alignment must be a power of two >= 8"
        );
        let capacity = capacity.next_multiple_of(alignment);
        let layout = Layout::from_size_align(capacity, alignment).expect("heap layout");
        // SAFETY: Layout is non-zero-sized and valid.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).expect("work heap arena allocation failed");
        (base, capacity)
    }

    /// Rounds a request up to the arena alignment.
    fn rounded(&self, size: usize) -> usize {
        let alignment = self.state.lock().unwrap().alignment;
        size.max(1).next_multiple_of(alignment)
    }

    /// Allocates a buffer, blocking until space is available.
    ///
    /// Pending releases are folded in before deciding to block. Returns an
    /// error only for requests larger than the whole arena, which can never
    /// be satisfied.
    pub fn alloc(&self, size: usize) -> Result<HeapBuffer, HeapAllocError> {
        let size = self.rounded(size);
        let mut state = self.state.lock().unwrap();
        if size > state.capacity {
            return Err(HeapAllocError {
                requested: size,
                capacity: state.capacity,
            });
        }
        loop {
            Self::drain_pending_locked(&self.pending, &mut state);
            if let Some(span) = state.try_alloc(size) {
                // SAFETY: Offsets stay within the arena by construction.
                let ptr = unsafe { NonNull::new_unchecked(state.base.as_ptr().add(span.offset)) };
                return Ok(HeapBuffer {
                    ptr,
                    size: span.size,
                    offset: span.offset,
                });
            }
            tracing::debug!(requested = size, live = state.live, "work heap full, waiting");
            state = self.space.wait(state).unwrap();
        }
    }

    /// Queues a buffer for release. Callable from any thread; the region
    /// becomes reusable once pending releases are completed.
    pub fn release(&self, buffer: HeapBuffer) {
        self.pending.push(Span {
            offset: buffer.offset,
            size: buffer.size,
        });
        // Wake any blocked allocator so it can fold the release in itself.
        self.space.notify_all();
    }

    /// Folds queued releases into the free list. Called by the heap owner
    /// (the I/O dispatch thread) after draining a command batch.
    pub fn complete_pending_releases(&self) {
        let mut state = self.state.lock().unwrap();
        Self::drain_pending_locked(&self.pending, &mut state);
        drop(state);
        self.space.notify_all();
    }

    fn drain_pending_locked(pending: &SegQueue<Span>, state: &mut HeapState) {
        while let Some(span) = pending.pop() {
            debug_assert!(state.live >= span.size);
            state.live -= span.size;
            state.insert_free(span);
        }
    }

    /// Discards all tracking and reinitializes the arena with new bounds.
    ///
    /// # Panics
    ///
    /// Panics if any allocation is still live. Pending releases are drained
    /// first, so a fully returned heap always resets cleanly.
    pub fn reset(&self, capacity: usize, alignment: usize) {
        let mut state = self.state.lock().unwrap();
        Self::drain_pending_locked(&self.pending, &mut state);
        assert_eq!(state.live, 0, "work heap reset with live allocations");
        let old_layout =
            Layout::from_size_align(state.capacity, state.alignment).expect("heap layout");
        // SAFETY: base came from alloc_zeroed with this layout.
        unsafe { dealloc(state.base.as_ptr(), old_layout) };
        let (base, capacity) = Self::alloc_arena(capacity, alignment);
        state.base = base;
        state.capacity = capacity;
        state.alignment = alignment;
        state.free = vec![Span {
            offset: 0,
            size: capacity,
        }];
        state.high_water = 0;
    }

    /// Current usage statistics.
    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let state = self.state.lock().unwrap();
        HeapStats {
            capacity: state.capacity,
            live: state.live,
            high_water: state.high_water,
        }
    }

    /// Number of spans on the free list (after draining pending releases).
    ///
    /// A fully idle heap reports exactly one span.
    #[must_use]
    pub fn free_span_count(&self) -> usize {
        let mut state = self.state.lock().unwrap();
        Self::drain_pending_locked(&self.pending, &mut state);
        state.free.len()
    }
}

impl Drop for WorkHeap {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        Self::drain_pending_locked(&self.pending, &mut state);
        debug_assert_eq!(state.live, 0, "work heap dropped with live allocations");
        let layout = Layout::from_size_align(state.capacity, state.alignment).expect("heap layout");
        // SAFETY: base came from alloc_zeroed with this layout.
        unsafe { dealloc(state.base.as_ptr(), layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    const MIB: usize = 1024 * 1024;

    #[test]
    fn alternating_alloc_release_never_fails() {
        // 64 MiB heap, 4096 alignment: 1024 alloc(128 KiB)/release rounds.
        let heap = WorkHeap::new(64 * MIB, 4096);
        for _ in 0..1024 {
            let buffer = heap.alloc(128 * 1024).unwrap();
            assert_eq!(buffer.len(), 128 * 1024);
            heap.release(buffer);
            heap.complete_pending_releases();
        }
        assert_eq!(heap.free_span_count(), 1);
        let stats = heap.stats();
        assert_eq!(stats.live, 0);
        assert_eq!(stats.high_water, 128 * 1024);
    }

    #[test]
    fn free_list_coalesces_out_of_order_releases() {
        let heap = WorkHeap::new(16 * MIB, 4096);
        let a = heap.alloc(MIB).unwrap();
        let b = heap.alloc(MIB).unwrap();
        let c = heap.alloc(MIB).unwrap();
        heap.release(b);
        heap.release(a);
        heap.release(c);
        assert_eq!(heap.free_span_count(), 1);
        assert_eq!(heap.stats().live, 0);
    }

    #[test]
    fn alloc_rounds_to_alignment() {
        let heap = WorkHeap::new(MIB, 4096);
        let buffer = heap.alloc(100).unwrap();
        assert_eq!(buffer.len(), 4096);
        heap.release(buffer);
    }

    #[test]
    fn impossible_request_errors() {
        let heap = WorkHeap::new(MIB, 4096);
        let err = heap.alloc(2 * MIB).unwrap_err();
        assert_eq!(err.capacity, MIB);
    }

    #[test]
    fn alloc_blocks_until_release() {
        let heap = Arc::new(WorkHeap::new(MIB, 4096));
        let held = heap.alloc(MIB).unwrap();
        let waiter = {
            let heap = Arc::clone(&heap);
            thread::spawn(move || {
                let buffer = heap.alloc(MIB).unwrap();
                heap.release(buffer);
                heap.complete_pending_releases();
            })
        };
        thread::sleep(std::time::Duration::from_millis(20));
        heap.release(held);
        waiter.join().unwrap();
        assert_eq!(heap.stats().live, 0);
    }

    #[test]
    fn reset_reinitializes_bounds() {
        let heap = WorkHeap::new(MIB, 4096);
        let buffer = heap.alloc(4096).unwrap();
        heap.release(buffer);
        heap.reset(2 * MIB, 4096);
        let stats = heap.stats();
        assert_eq!(stats.capacity, 2 * MIB);
        assert_eq!(stats.high_water, 0);
        let buffer = heap.alloc(2 * MIB).unwrap();
        heap.release(buffer);
        heap.complete_pending_releases();
    }

    #[test]
    fn buffer_words_view_is_word_aligned() {
        let heap = WorkHeap::new(MIB, 4096);
        let buffer = heap.alloc(4096).unwrap();
        let words = buffer.as_atomic_words();
        assert_eq!(words.len(), 512);
        assert_eq!(words.as_ptr() as usize % 8, 0);
        heap.release(buffer);
    }
}
