use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A Latch starts as unset and eventually becomes set with a payload `T`. You
/// can block until it becomes set from any thread.
///
/// A poisoned lock is treated as if it were healthy, the payload is a plain
/// value so there is no invariant a panicking writer could have broken.
pub struct LockLatch<T> {
    m: Mutex<Option<T>>,
    v: Condvar,
}

impl<T> Default for LockLatch<T> {
    fn default() -> Self {
        LockLatch::new()
    }
}

impl<T> LockLatch<T> {
    #[inline]
    pub fn new() -> Self {
        LockLatch {
            m: Mutex::new(None),
            v: Condvar::new(),
        }
    }

    /// Set the latch with `value`, waking up every waiters.
    pub fn set(&self, value: T) {
        {
            let mut guard = self.m.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(value);
        }

        self.v.notify_all();
    }

    /// Test if the latch is set.
    #[inline]
    pub fn is_set(&self) -> bool {
        let guard = self.m.lock().unwrap_or_else(|e| e.into_inner());
        guard.is_some()
    }

    /// Takes the payload out, leaving the latch unset.
    #[inline]
    pub fn take(&self) -> Option<T> {
        let mut guard = self.m.lock().unwrap_or_else(|e| e.into_inner());
        guard.take()
    }

    /// Block until latch is set.
    pub fn wait(&self) {
        let mut guard = self.m.lock().unwrap_or_else(|e| e.into_inner());
        while guard.is_none() {
            guard = self.v.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until latch is set or `timeout` elapsed. Returns true if the latch
    /// has been set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.m.lock().unwrap_or_else(|e| e.into_inner());

        while guard.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let (g, _) = self
                .v
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            guard = g;
        }

        true
    }
}
