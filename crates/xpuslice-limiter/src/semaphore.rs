//! Process-local counting semaphore
//!
//! Backs the admission tokens. State is private to the process and guarded
//! by a mutex/condvar pair; cross-process coordination never goes through
//! here.

use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

/// Counting semaphore with blocking and timed acquisition.
#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<u64>,
    available: Condvar,
}

impl Semaphore {
    pub fn new(initial: u64) -> Self {
        Self {
            count: Mutex::new(initial),
            available: Condvar::new(),
        }
    }

    /// Add `n` tokens and wake waiters.
    pub fn release(&self, n: u64) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += n;
        self.available.notify_all();
    }

    /// Block until `n` tokens are available, then take them.
    pub fn acquire(&self, n: u64) {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        let mut count = self
            .available
            .wait_while(count, |c| *c < n)
            .unwrap_or_else(PoisonError::into_inner);
        *count -= n;
    }

    /// Take `n` tokens if they become available within `wait_max`.
    pub fn try_acquire(&self, n: u64, wait_max: Duration) -> bool {
        let count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        if wait_max.is_zero() {
            let mut count = count;
            if *count < n {
                return false;
            }
            *count -= n;
            return true;
        }
        let (mut count, result) = self
            .available
            .wait_timeout_while(count, wait_max, |c| *c < n)
            .unwrap_or_else(PoisonError::into_inner);
        if result.timed_out() {
            return false;
        }
        *count -= n;
        true
    }

    /// Drain every token; returns how many were taken.
    pub fn acquire_all(&self) -> u64 {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *count)
    }

    /// Tokens currently available.
    pub fn available(&self) -> u64 {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
