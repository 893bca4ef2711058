//! Single-value condition used for cooperative cancellation
//!
//! A `ScalarCondition` holds one value that any thread can replace and any
//! number of threads can wait on. Long running work polls it at well defined
//! checkpoints; nothing is ever interrupted.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Thread-safe single-slot value with blocking waits
#[derive(Debug, Default)]
pub struct ScalarCondition<T> {
    value: Mutex<T>,
    changed: Condvar,
}

impl<T: PartialEq> ScalarCondition<T> {
    /// Create a condition holding `initial`
    pub fn new(initial: T) -> Self {
        Self {
            value: Mutex::new(initial),
            changed: Condvar::new(),
        }
    }

    /// Store a new value and wake every waiter
    pub fn set(&self, value: T) {
        let mut current = self.value.lock();
        *current = value;
        drop(current);
        self.changed.notify_all();
    }

    /// Check the current value without blocking
    pub fn test(&self, expected: &T) -> bool {
        *self.value.lock() == *expected
    }

    /// Block until the value equals `expected` or `timeout` elapses.
    ///
    /// Returns whether the expected value was observed. A zero timeout makes
    /// this a non-blocking check.
    pub fn wait(&self, expected: &T, timeout: Duration) -> bool {
        let mut current = self.value.lock();

        // A timeout past the end of `Instant` waits without a deadline
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            while *current != *expected {
                self.changed.wait(&mut current);
            }
            return true;
        };

        while *current != *expected {
            if self.changed.wait_until(&mut current, deadline).timed_out() {
                return *current == *expected;
            }
        }

        true
    }
}
