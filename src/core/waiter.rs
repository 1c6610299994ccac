//! Interruptible sleep between background-loop iterations.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Interruptible sleep with an external wake signal.
///
/// `do_wait` suspends the calling thread for up to the configured duration.
/// `wake` causes an in-progress `do_wait` to return immediately; a wake
/// delivered while no thread is waiting is remembered and makes the next
/// `do_wait` return immediately, then resets.
#[derive(Debug)]
pub struct Waiter {
    duration: Duration,
    pending_wake: Mutex<bool>,
    condvar: Condvar,
}

impl Waiter {
    /// A waiter sleeping up to `duration` per `do_wait` call.
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            pending_wake: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// The configured sleep duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Suspend until `duration` elapses or `wake` is called, whichever comes
    /// first. Consumes any pending wake.
    pub fn do_wait(&self) {
        let deadline = Instant::now() + self.duration;
        let mut woken = self.pending_wake.lock();
        while !*woken {
            if self.condvar.wait_until(&mut woken, deadline).timed_out() {
                break;
            }
        }
        *woken = false;
    }

    /// Interrupt the current wait, or arm the next one to return immediately.
    pub fn wake(&self) {
        let mut woken = self.pending_wake.lock();
        *woken = true;
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_times_out_without_wake() {
        let waiter = Waiter::new(Duration::from_millis(30));
        let started = Instant::now();
        waiter.do_wait();
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn wake_interrupts_an_in_progress_wait() {
        let waiter = Arc::new(Waiter::new(Duration::from_secs(30)));
        let waker = Arc::clone(&waiter);

        let handle = thread::spawn(move || {
            let started = Instant::now();
            waiter.do_wait();
            started.elapsed()
        });

        thread::sleep(Duration::from_millis(50));
        waker.wake();
        let waited = handle.join().unwrap();
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn wake_before_wait_is_remembered_once() {
        let waiter = Waiter::new(Duration::from_secs(30));
        waiter.wake();

        // Armed wake: returns immediately.
        let started = Instant::now();
        waiter.do_wait();
        assert!(started.elapsed() < Duration::from_secs(1));

        // The pending wake was reset; next wait sleeps for real.
        let waiter = Waiter::new(Duration::from_millis(30));
        waiter.wake();
        waiter.do_wait();
        let started = Instant::now();
        waiter.do_wait();
        assert!(started.elapsed() >= Duration::from_millis(25));
    }
}
