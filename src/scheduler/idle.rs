//! Idle-timeout driver.
//!
//! Blocks the caller until the worker has been idle (torn down, no work) for
//! a configured duration, at which point the server shuts itself down. A
//! timeout of zero never fires; the wait then only ends on interrupt.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::scheduler::worker_thread::WorkerHandle;

/// Poll quantum while a timeout is armed.
const POLL_MIN: Duration = Duration::from_millis(100);
const POLL_MAX: Duration = Duration::from_secs(1);

pub struct IdleTimeout {
    worker: WorkerHandle,
    stop: Mutex<bool>,
    cv: Condvar,
    num_waiting: AtomicUsize,
}

impl IdleTimeout {
    pub fn new(worker: WorkerHandle) -> Self {
        IdleTimeout {
            worker,
            stop: Mutex::new(false),
            cv: Condvar::new(),
            num_waiting: AtomicUsize::new(0),
        }
    }

    /// Block until the worker has been idle for `timeout`.
    ///
    /// Returns true when the timeout was reached; false when the wait was
    /// interrupted because the server is shutting down for another reason.
    pub fn wait_until_idle_for(&self, timeout: Duration) -> bool {
        self.num_waiting.fetch_add(1, Ordering::SeqCst);
        let result = self.wait_inner(timeout);
        self.num_waiting.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn wait_inner(&self, timeout: Duration) -> bool {
        let mut stop = self.stop.lock().expect("idle timeout poisoned");
        loop {
            if *stop {
                return false;
            }

            if timeout.is_zero() {
                // No timeout configured; sleep until interrupted.
                stop = self.cv.wait(stop).expect("idle timeout poisoned");
                continue;
            }

            if self.is_timeout_reached(timeout) {
                debug!(?timeout, "idle timeout reached");
                return true;
            }

            let remaining = if self.worker.is_set_up() {
                // The worker still holds resources; it cannot count as idle
                // before its next release.
                self.worker.time_till_next_teardown()
            } else {
                timeout.saturating_sub(self.worker.last_idle().elapsed())
            };
            let wait = remaining.clamp(POLL_MIN, POLL_MAX);
            stop = self
                .cv
                .wait_timeout(stop, wait)
                .expect("idle timeout poisoned")
                .0;
        }
    }

    fn is_timeout_reached(&self, timeout: Duration) -> bool {
        !self.worker.is_set_up() && self.worker.last_idle().elapsed() > timeout
    }

    /// Wake the waiter and make it return false. Keeps notifying until no
    /// thread remains inside the wait.
    pub fn interrupt(&self) {
        {
            let mut stop = self.stop.lock().expect("idle timeout poisoned");
            *stop = true;
        }
        while self.num_waiting.load(Ordering::SeqCst) > 0 {
            self.cv.notify_all();
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use super::*;
    use crate::scheduler::worker_thread::{Status, StatusInner, WorkerHandle};

    fn idle_worker() -> WorkerHandle {
        WorkerHandle::from_status(Arc::new(Status {
            inner: std::sync::Mutex::new(StatusInner {
                stop: false,
                is_set_up: false,
                is_idle: true,
                last_idle: Instant::now(),
                last_release: Instant::now(),
                release_interval: Duration::ZERO,
            }),
            cv: std::sync::Condvar::new(),
        }))
    }

    #[test]
    fn fires_once_the_worker_was_idle_long_enough() {
        let idle = IdleTimeout::new(idle_worker());
        let started = Instant::now();
        assert!(idle.wait_until_idle_for(Duration::from_millis(50)));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn interrupt_ends_an_unbounded_wait() {
        let idle = Arc::new(IdleTimeout::new(idle_worker()));
        let waiter = {
            let idle = Arc::clone(&idle);
            std::thread::spawn(move || idle.wait_until_idle_for(Duration::ZERO))
        };
        std::thread::sleep(Duration::from_millis(30));
        idle.interrupt();
        assert!(!waiter.join().unwrap(), "interrupted wait reports false");
    }
}
