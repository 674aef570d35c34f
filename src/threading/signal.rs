//! Auto-reset signal.
//!
//! A latching event: `signal` releases exactly one `wait`, and a signal
//! raised while no thread is waiting is remembered until the next `wait`.
//! The latch is what prevents lost wakeups in the command queue's
//! ready/consumed handshake: the producer may signal between the dispatch
//! thread's emptiness check and its park.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// Auto-reset event latch.
#[derive(Debug, Default)]
pub struct Signal {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl Signal {
    /// Creates an unsignaled latch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the signal, waking one waiter if present.
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        drop(signaled);
        self.cv.notify_one();
    }

    /// Blocks until the signal is raised, then consumes it.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.cv.wait(signaled).unwrap();
        }
        *signaled = false;
    }

    /// Waits with a timeout. Returns `true` if the signal was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            let (guard, result) = self.cv.wait_timeout(signaled, timeout).unwrap();
            signaled = guard;
            if result.timed_out() && !*signaled {
                return false;
            }
        }
        *signaled = false;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn signal_before_wait_is_latched() {
        let signal = Signal::new();
        signal.signal();
        signal.wait();
    }

    #[test]
    fn wait_consumes_the_latch() {
        let signal = Signal::new();
        signal.signal();
        signal.wait();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn cross_thread_wakeup() {
        let signal = Arc::new(Signal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            thread::spawn(move || signal.wait())
        };
        signal.signal();
        waiter.join().unwrap();
    }
}
