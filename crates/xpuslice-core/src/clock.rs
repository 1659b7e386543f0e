//! Time source shared by the scheduler and the segment init protocol.
//!
//! Heartbeats are millisecond timestamps compared across processes, so every
//! participant must read the same clock. The trait exists so scheduler tests
//! can drive fail-over scenarios without real wall-clock delays.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Millisecond time source.
pub trait Clock: Send + Sync {
    /// Milliseconds since the epoch shared by all participants.
    fn now_millis(&self) -> u64;
}

/// Wall clock; every process mapping the segment reads the same one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Manually driven clock for tests.
///
/// An optional auto-step advances the clock on every read, which lets
/// spin-with-yield loops (segment init, slice execution) make progress
/// without a second thread driving time forward.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
    step_ms: u64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
            step_ms: 0,
        }
    }

    pub fn with_step(start_ms: u64, step_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
            step_ms,
        }
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        if self.step_ms == 0 {
            self.now_ms.load(Ordering::SeqCst)
        } else {
            self.now_ms.fetch_add(self.step_ms, Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(250);
        assert_eq!(clock.now_millis(), 1_250);
        clock.set(5_000);
        assert_eq!(clock.now_millis(), 5_000);
    }

    #[test]
    fn test_manual_clock_auto_step() {
        let clock = ManualClock::with_step(100, 10);
        assert_eq!(clock.now_millis(), 100);
        assert_eq!(clock.now_millis(), 110);
        assert_eq!(clock.now_millis(), 120);
    }

    #[test]
    fn test_system_clock_monotonic_enough() {
        let clock = SystemClock;
        let a = clock.now_millis();
        let b = clock.now_millis();
        assert!(b >= a);
    }
}
