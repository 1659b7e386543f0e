//! Per-process admission gate
//!
//! `CoreLimiter` is what device-issuing code talks to: obtain a
//! [`RequestGuard`] before submitting an operation, call
//! [`CoreLimiter::release_ops`] when reporting completed work. A background
//! reconciliation thread keeps the scheduler state machine moving whether or
//! not any caller is requesting admission, because leadership fail-over must
//! progress even in an idle process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, trace};
use xpuslice_core::{Clock, LimiterConfig, SystemClock, XpusliceResult};
use xpuslice_shm::Segment;

use crate::semaphore::Semaphore;
use crate::timeslice::{SchedulerTiming, TimesliceScheduler};

/// Opaque device stream handle, carried for tracing symmetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamId(pub u64);

/// One granted admission. Acquisition is final: the token is consumed on
/// construction and dropping the guard performs no further side effect.
/// Not cloneable, so an admission cannot be double-spent.
#[derive(Debug)]
pub struct RequestGuard<'a> {
    stream: StreamId,
    _limiter: &'a CoreLimiter,
}

impl RequestGuard<'_> {
    pub fn stream(&self) -> StreamId {
        self.stream
    }
}

/// Scope marker returned when tokens are pushed; exists only so release
/// sites read symmetrically to request sites.
#[derive(Debug)]
pub struct ReleaseGuard {
    ops: u64,
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        trace!(ops = self.ops, "release scope closed");
    }
}

/// Per-process façade over one scheduler slot and one token semaphore.
#[derive(Debug)]
pub struct CoreLimiter {
    semaphore: Arc<Semaphore>,
    stop: Arc<AtomicBool>,
    watcher: Option<JoinHandle<()>>,
}

impl CoreLimiter {
    /// Resolve configured identity, map the shared segment, and start the
    /// background loop. Fatal on malformed configuration or mapping failure.
    pub fn initialize(config: &LimiterConfig) -> XpusliceResult<Self> {
        config.validate()?;
        let segment = Arc::new(Segment::open(&config.segment.path)?);
        info!(
            slot = config.slot_index,
            quota = config.quota_percent,
            device = %config.device.device_id,
            segment = %config.segment.path.display(),
            "core limiter starting"
        );
        Self::with_segment(
            segment,
            config.slot_index,
            config.quota_percent,
            SchedulerTiming::from_config(&config.timing),
            Arc::new(SystemClock),
        )
    }

    /// Build on an already-mapped segment; tests and embedders use this to
    /// inject timing and clock.
    pub fn with_segment(
        segment: Arc<Segment>,
        idx: u32,
        quota_percent: u32,
        timing: SchedulerTiming,
        clock: Arc<dyn Clock>,
    ) -> XpusliceResult<Self> {
        let scheduler = TimesliceScheduler::new(idx, quota_percent, segment, clock, timing)?;
        let semaphore = Arc::new(Semaphore::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let watcher = {
            let semaphore = Arc::clone(&semaphore);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(format!("xpuslice-watcher-{}", idx))
                .spawn(move || watcher_loop(scheduler, semaphore, stop))?
        };

        Ok(Self {
            semaphore,
            stop,
            watcher: Some(watcher),
        })
    }

    /// Block the calling thread until one admission token is available.
    /// Call sites must hold the returned guard for the duration of the
    /// device submission.
    pub fn acquire_op(&self, stream: StreamId) -> RequestGuard<'_> {
        self.semaphore.acquire(1);
        trace!(stream = stream.0, "op admitted");
        RequestGuard {
            stream,
            _limiter: self,
        }
    }

    /// Timed variant of [`CoreLimiter::acquire_op`].
    pub fn try_acquire_op(&self, stream: StreamId, wait_max: Duration) -> Option<RequestGuard<'_>> {
        if !self.semaphore.try_acquire(1, wait_max) {
            return None;
        }
        trace!(stream = stream.0, "op admitted");
        Some(RequestGuard {
            stream,
            _limiter: self,
        })
    }

    /// Push `ops` admission tokens. Called by the slice loop while this
    /// process owns the slice, and by call sites reporting completed work.
    pub fn release_ops(&self, ops: u64) -> ReleaseGuard {
        self.semaphore.release(ops);
        ReleaseGuard { ops }
    }

    /// Tokens currently available without blocking.
    pub fn available_ops(&self) -> u64 {
        self.semaphore.available()
    }
}

impl Drop for CoreLimiter {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(watcher) = self.watcher.take() {
            if watcher.join().is_err() {
                debug!("watcher thread exited abnormally");
            }
        }
    }
}

/// Background reconciliation loop: stamp the heartbeat, probe ownership, and
/// while owning, run the slice and hand off. Non-owners nap for one poll
/// period, which bounds fail-over latency at staleness timeout plus one
/// polling interval.
fn watcher_loop(mut scheduler: TimesliceScheduler, semaphore: Arc<Semaphore>, stop: Arc<AtomicBool>) {
    let poll = scheduler.timing().poll_period;
    debug!(slot = scheduler.idx(), "watcher loop started");
    while !stop.load(Ordering::Acquire) {
        scheduler.update_timestamp();
        if scheduler.check_current() {
            let released = scheduler.execute_timeslice(|batch| {
                semaphore.release(batch);
            });
            trace!(slot = scheduler.idx(), released, "slice complete");
            scheduler.finish_slice();
            scheduler.release_current();
        } else {
            std::thread::park_timeout(poll);
        }
    }
    debug!(slot = scheduler.idx(), "watcher loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn fast_timing(quota_unit_ms: u64) -> SchedulerTiming {
        SchedulerTiming {
            time_unit: Duration::from_millis(quota_unit_ms),
            stale_timeout: Duration::from_millis(200),
            handoff_liveness: Duration::from_millis(400),
            poll_period: Duration::from_millis(2),
            op_batch: 10,
        }
    }

    fn limiter(segment: &Arc<Segment>, idx: u32, quota: u32) -> CoreLimiter {
        CoreLimiter::with_segment(
            Arc::clone(segment),
            idx,
            quota,
            fast_timing(1),
            Arc::new(SystemClock),
        )
        .expect("limiter")
    }

    #[test]
    fn test_acquire_blocks_until_slice_releases() {
        let segment = Arc::new(Segment::anonymous().expect("segment"));
        let limiter = limiter(&segment, 0, 10);

        // slot 0 owns the fresh segment, so the watcher starts releasing
        let guard = limiter.acquire_op(StreamId(7));
        assert_eq!(guard.stream(), StreamId(7));
    }

    #[test]
    fn test_release_ops_feeds_acquire() {
        // slot 1 never owns (slot 0 exists first), so tokens only come from
        // the explicit completion path
        let segment = Arc::new(Segment::anonymous().expect("segment"));
        let _owner = limiter(&segment, 0, 90);
        let reporter = limiter(&segment, 1, 10);

        let before = reporter.available_ops();
        {
            let _release = reporter.release_ops(3);
        }
        assert!(reporter.available_ops() >= before + 3);
        let guard = reporter.try_acquire_op(StreamId(2), Duration::from_millis(50));
        assert!(guard.is_some());
    }

    #[test]
    fn test_shutdown_joins_watcher() {
        let segment = Arc::new(Segment::anonymous().expect("segment"));
        let limiter = limiter(&segment, 0, 10);
        let begin = Instant::now();
        drop(limiter);
        // join must not hang on the background loop
        assert!(begin.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_quota_split_over_rotation() {
        let segment = Arc::new(Segment::anonymous().expect("segment"));
        let heavy = CoreLimiter::with_segment(
            Arc::clone(&segment),
            0,
            70,
            fast_timing(1),
            Arc::new(SystemClock),
        )
        .expect("heavy");
        let light = CoreLimiter::with_segment(
            Arc::clone(&segment),
            1,
            30,
            fast_timing(1),
            Arc::new(SystemClock),
        )
        .expect("light");

        // several full rotations of 70 ms / 30 ms slices
        std::thread::sleep(Duration::from_millis(700));
        let heavy_ops = heavy.available_ops();
        let light_ops = light.available_ops();
        drop(heavy);
        drop(light);

        let total = heavy_ops + light_ops;
        assert!(total > 0, "no tokens released over the rotation");
        let heavy_fraction = heavy_ops as f64 / total as f64;
        // 0.70 plus or minus one slice's worth of slack
        assert!(
            (0.5..=0.9).contains(&heavy_fraction),
            "heavy share {} out of range (heavy {}, light {})",
            heavy_fraction,
            heavy_ops,
            light_ops
        );
    }

    #[test]
    fn test_crashed_owner_fails_over_to_peer() {
        let segment = Arc::new(Segment::anonymous().expect("segment"));
        let owner = limiter(&segment, 0, 50);
        // let the owner establish itself
        owner.acquire_op(StreamId(0));
        // simulated crash: the watcher stops heartbeating entirely
        drop(owner);
        segment.context().node(0).clear();

        let survivor = limiter(&segment, 1, 50);
        // staleness timeout (200 ms) + one polling interval, with headroom
        let guard = survivor.try_acquire_op(StreamId(1), Duration::from_millis(1_500));
        assert!(
            guard.is_some(),
            "survivor never took over the slice after owner crash"
        );
    }
}
