/*! Cooperative cancellation for the daemon's worker thread.

A cloneable, `Arc`-backed cancel flag checked between units of work,
extended with a condition variable so a sleeping worker wakes
immediately on cancellation instead of polling. This is what lets the
daemon's poll loop and its graceful-shutdown wait both use the same
primitive: a normal beat either elapses on its own or is cut short by
[`Cancel::cancel`].
*/

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A cloneable flag that can be waited on with a deadline.
#[derive(Clone)]
pub struct Cancel {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Default for Cancel {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancel {
    /// Create a new, uncancelled flag.
    pub fn new() -> Self {
        Self {
            inner: Arc::new((Mutex::new(false), Condvar::new())),
        }
    }

    /// Set the flag and wake every waiter. Idempotent.
    pub fn cancel(&self) {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().expect("cancel mutex poisoned");
        *cancelled = true;
        cvar.notify_all();
    }

    /// Whether [`Cancel::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        let (lock, _) = &*self.inner;
        *lock.lock().expect("cancel mutex poisoned")
    }

    /// Sleep until `deadline` or until cancelled, whichever comes first.
    /// Returns `true` if cancellation woke it early.
    pub fn wait_until(&self, deadline: Instant) -> bool {
        let (lock, cvar) = &*self.inner;
        let mut cancelled = lock.lock().expect("cancel mutex poisoned");
        loop {
            if *cancelled {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, timeout_result) = cvar
                .wait_timeout(cancelled, deadline - now)
                .expect("cancel condvar poisoned");
            cancelled = guard;
            if timeout_result.timed_out() && !*cancelled {
                return false;
            }
        }
    }

    /// Convenience wrapper around [`Cancel::wait_until`] for a relative
    /// duration from now.
    pub fn wait_for(&self, duration: Duration) -> bool {
        self.wait_until(Instant::now() + duration)
    }
}
