//! Reusable job barrier with a control-thread critical section.
//!
//! The table generators run a fixed team of threads through a sequence of
//! rounds. Two rendezvous shapes are needed:
//!
//! - `sync`: all threads arrive, then all proceed (plain reusable barrier).
//! - control section: the distinguished control thread calls `lock_threads`,
//!   which blocks until every worker is parked in `wait_for_release`; the
//!   control thread then runs a section alone (accumulating global bucket
//!   counters, reserving writer buffers) and fans the workers back out with
//!   `release_threads`.
//!
//! Thread 0 of a team is the control thread by convention.

use std::sync::{Condvar, Mutex};

#[derive(Debug)]
struct State {
    /// Threads arrived at the current `sync` round.
    arrived: usize,
    /// Generation counter for `sync` rounds.
    sync_generation: u64,
    /// Workers parked in `wait_for_release`.
    parked: usize,
    /// Generation counter for control-section releases.
    release_generation: u64,
}

/// Rendezvous for a fixed team of threads.
#[derive(Debug)]
pub struct JobBarrier {
    threads: usize,
    state: Mutex<State>,
    cv: Condvar,
}

impl JobBarrier {
    /// Creates a barrier for a team of `threads` threads.
    ///
    /// # Panics
    ///
    /// Panics if `threads` is zero.
    #[must_use]
    pub fn new(threads: usize) -> Self {
        assert!(threads > 0, "barrier requires at least one thread");
        Self {
            threads,
            state: Mutex::new(State {
                arrived: 0,
                sync_generation: 0,
                parked: 0,
                release_generation: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Team size.
    #[inline]
    #[must_use]
    pub const fn threads(&self) -> usize {
        self.threads
    }

    /// All-threads rendezvous: blocks until every team member has arrived.
    pub fn sync(&self) {
        let mut state = self.state.lock().unwrap();
        let generation = state.sync_generation;
        state.arrived += 1;
        if state.arrived == self.threads {
            state.arrived = 0;
            state.sync_generation = state.sync_generation.wrapping_add(1);
            drop(state);
            self.cv.notify_all();
            return;
        }
        while state.sync_generation == generation {
            state = self.cv.wait(state).unwrap();
        }
    }

    /// Control thread: blocks until all workers are parked in
    /// [`wait_for_release`](Self::wait_for_release).
    pub fn lock_threads(&self) {
        let mut state = self.state.lock().unwrap();
        while state.parked < self.threads - 1 {
            state = self.cv.wait(state).unwrap();
        }
    }

    /// Control thread: releases every parked worker.
    pub fn release_threads(&self) {
        let mut state = self.state.lock().unwrap();
        debug_assert_eq!(state.parked, self.threads - 1);
        state.parked = 0;
        state.release_generation = state.release_generation.wrapping_add(1);
        drop(state);
        self.cv.notify_all();
    }

    /// Worker: parks until the control thread runs its section and calls
    /// [`release_threads`](Self::release_threads).
    pub fn wait_for_release(&self) {
        let mut state = self.state.lock().unwrap();
        let generation = state.release_generation;
        state.parked += 1;
        if state.parked == self.threads - 1 {
            // Wake the control thread blocked in `lock_threads`.
            self.cv.notify_all();
        }
        while state.release_generation == generation {
            state = self.cv.wait(state).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn sync_is_reusable() {
        let barrier = Arc::new(JobBarrier::new(4));
        let counter = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let barrier = Arc::clone(&barrier);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for round in 0..16u64 {
                    counter.fetch_add(1, Ordering::SeqCst);
                    barrier.sync();
                    // Every thread must observe all arrivals of this round.
                    assert!(counter.load(Ordering::SeqCst) >= (round + 1) * 4);
                    barrier.sync();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn control_section_is_exclusive() {
        let barrier = Arc::new(JobBarrier::new(4));
        let shared = Arc::new(AtomicU64::new(0));
        let mut handles = Vec::new();
        for id in 0..4usize {
            let barrier = Arc::clone(&barrier);
            let shared = Arc::clone(&shared);
            handles.push(thread::spawn(move || {
                for round in 0..8u64 {
                    if id == 0 {
                        barrier.lock_threads();
                        // Alone here: workers are parked.
                        shared.store(round + 1, Ordering::SeqCst);
                        barrier.release_threads();
                    } else {
                        barrier.wait_for_release();
                    }
                    // All threads observe the control thread's store.
                    assert_eq!(shared.load(Ordering::SeqCst), round + 1);
                    barrier.sync();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
    }

    #[test]
    fn single_thread_team_never_blocks() {
        let barrier = JobBarrier::new(1);
        barrier.sync();
        barrier.lock_threads();
        barrier.release_threads();
        barrier.sync();
    }
}
