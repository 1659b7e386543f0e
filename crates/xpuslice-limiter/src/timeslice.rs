//! Cross-process time-slice scheduler
//!
//! Each process owns one slot of the shared segment and runs this state
//! machine: stamp a heartbeat every pass, contend for ownership when the
//! current owner goes stale, and while owning, release admission tokens
//! until the granted slice length elapses, then hand off.
//!
//! All cross-process contention resolves through single CAS attempts on
//! `current`; a lost race is never retried within the same pass.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use xpuslice_core::{Clock, TimingConfig, XpusliceError, XpusliceResult};
use xpuslice_shm::{Segment, MAX_NODES, ROTATION_UNITS};

/// Timing knobs for the scheduler, injectable so tests run fail-over
/// scenarios without real wall-clock delays.
#[derive(Debug, Clone)]
pub struct SchedulerTiming {
    /// Base scheduling time unit; slice length = unit x quota share.
    pub time_unit: Duration,
    /// Heartbeat age past which a node is presumed dead.
    pub stale_timeout: Duration,
    /// Longer bound used when picking voluntary hand-off candidates.
    pub handoff_liveness: Duration,
    /// Background reconciliation loop period.
    pub poll_period: Duration,
    /// Admission tokens released per slice-loop pass.
    pub op_batch: u64,
}

impl Default for SchedulerTiming {
    fn default() -> Self {
        Self::from_config(&TimingConfig::default())
    }
}

impl SchedulerTiming {
    pub fn from_config(config: &TimingConfig) -> Self {
        Self {
            time_unit: Duration::from_millis(config.time_unit_ms),
            stale_timeout: Duration::from_millis(config.stale_timeout_ms),
            handoff_liveness: Duration::from_millis(config.handoff_liveness_ms),
            poll_period: Duration::from_millis(config.poll_period_ms),
            op_batch: config.op_batch,
        }
    }
}

/// Per-process view of the rotation: one slot, one quota share, and the
/// bookkeeping for post-slice accounting.
pub struct TimesliceScheduler {
    idx: u32,
    quota_percent: u32,
    slice: Duration,
    segment: Arc<Segment>,
    clock: Arc<dyn Clock>,
    timing: SchedulerTiming,
    last_used_units: u64,
    last_used_units_valid: bool,
}

impl std::fmt::Debug for TimesliceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimesliceScheduler")
            .field("idx", &self.idx)
            .field("quota_percent", &self.quota_percent)
            .field("slice", &self.slice)
            .field("timing", &self.timing)
            .field("last_used_units", &self.last_used_units)
            .field("last_used_units_valid", &self.last_used_units_valid)
            .finish_non_exhaustive()
    }
}

impl TimesliceScheduler {
    /// Bind to slot `idx` of the segment and drive first-touch setup.
    ///
    /// Fails without writing to the segment when `idx` is outside the tenant
    /// bound or the quota share is malformed.
    pub fn new(
        idx: u32,
        quota_percent: u32,
        segment: Arc<Segment>,
        clock: Arc<dyn Clock>,
        timing: SchedulerTiming,
    ) -> XpusliceResult<Self> {
        if idx as usize >= MAX_NODES {
            return Err(XpusliceError::SlotOutOfRange {
                idx,
                bound: MAX_NODES as u32,
            });
        }
        if quota_percent == 0 || quota_percent > 100 {
            return Err(XpusliceError::Config(format!(
                "quota_percent must be within 1-100, got {}",
                quota_percent
            )));
        }

        segment
            .context()
            .ensure_ready(clock.as_ref(), timing.stale_timeout);

        let slice = timing.time_unit * quota_percent;
        Ok(Self {
            idx,
            quota_percent,
            slice,
            segment,
            clock,
            timing,
            last_used_units: 0,
            last_used_units_valid: false,
        })
    }

    pub fn idx(&self) -> u32 {
        self.idx
    }

    /// Granted slice length for this node.
    pub fn slice_len(&self) -> Duration {
        self.slice
    }

    pub fn timing(&self) -> &SchedulerTiming {
        &self.timing
    }

    /// Stamp this node's heartbeat; returns the stamped time.
    pub fn update_timestamp(&self) -> u64 {
        let now = self.clock.now_millis();
        self.segment.context().node(self.idx).stamp(now);
        now
    }

    /// True iff this node holds scheduling authority. A negative answer
    /// doubles as the fail-over probe: every non-owner watches the owner's
    /// heartbeat and moves `current` when it goes stale.
    pub fn check_current(&self) -> bool {
        let cur = self.segment.context().current();
        if cur == self.idx {
            return true;
        }
        self.select_new_current(cur);
        false
    }

    /// Fail-over probe. Leaves `current` alone while the owner's heartbeat
    /// is within the staleness timeout; otherwise picks the live node with
    /// the freshest heartbeat (lowest index on ties) and makes one CAS
    /// attempt. A lost CAS means a peer already completed fail-over.
    fn select_new_current(&self, observed: u32) {
        let ctx = self.segment.context();
        let now = self.clock.now_millis();
        let stale_ms = self.timing.stale_timeout.as_millis() as u64;

        let owner_age = ctx.node(observed).age_ms(now);
        if owner_age <= stale_ms {
            return;
        }
        warn!(
            node = self.idx,
            owner = observed,
            age_ms = owner_age,
            "current owner stale, probing fail-over"
        );

        let mut best: Option<(u32, u64)> = None;
        for (i, node) in ctx.nodes().iter().enumerate() {
            let heartbeat = node.heartbeat();
            if now.saturating_sub(heartbeat) > stale_ms {
                continue;
            }
            // strict comparison keeps the lowest index on equal heartbeats
            if best.map_or(true, |(_, freshest)| heartbeat > freshest) {
                best = Some((i as u32, heartbeat));
            }
        }
        let Some((next, _)) = best else {
            // nobody is provably alive; never evict on ambiguity
            return;
        };

        match ctx.cas_current(observed, next) {
            Ok(_) => warn!(
                from = observed,
                to = next,
                by = self.idx,
                "fail-over complete"
            ),
            Err(current) => debug!(
                observed,
                current, "fail-over raced, a peer already moved current"
            ),
        }
    }

    /// Voluntary hand-off at slice end: scan successors round-robin starting
    /// after our own slot, skip nodes past the hand-off liveness bound, and
    /// CAS to the first live candidate. With no live successor, ownership is
    /// retained implicitly.
    pub fn release_current(&self) {
        let ctx = self.segment.context();
        let now = self.clock.now_millis();
        let live_ms = self.timing.handoff_liveness.as_millis() as u64;

        for offset in 1..MAX_NODES as u32 {
            let next = (self.idx + offset) % MAX_NODES as u32;
            if ctx.node(next).age_ms(now) > live_ms {
                continue;
            }
            match ctx.cas_current(self.idx, next) {
                Ok(_) => debug!(from = self.idx, to = next, "slice handed off"),
                Err(current) => debug!(
                    current,
                    from = self.idx,
                    "hand-off raced, current already moved"
                ),
            }
            // one attempt either way; the next pass re-evaluates
            return;
        }
    }

    /// Run one owned slice: push token batches through `release`, yield, and
    /// re-stamp the heartbeat until the granted slice length elapses.
    /// Returns the number of tokens released.
    pub fn execute_timeslice(&self, mut release: impl FnMut(u64)) -> u64 {
        let begin = self.update_timestamp();
        let slice_ms = self.slice.as_millis() as u64;
        let mut released = 0u64;
        loop {
            release(self.timing.op_batch);
            released += self.timing.op_batch;
            std::thread::yield_now();
            let now = self.update_timestamp();
            if now.saturating_sub(begin) >= slice_ms {
                return released;
            }
        }
    }

    /// Post-slice quota accounting. Over-consumption of the rotation budget
    /// is logged with no compensation; under-consumption yields an advisory
    /// idle allowance that is logged and not otherwise consumed.
    pub fn finish_slice(&mut self) {
        let total = self
            .segment
            .context()
            .add_used_units(self.quota_percent as u64);
        if !self.last_used_units_valid {
            self.last_used_units = total;
            self.last_used_units_valid = true;
            return;
        }
        let period_used = total.wrapping_sub(self.last_used_units);
        self.last_used_units = total;

        if period_used >= ROTATION_UNITS as u64 {
            warn!(
                period_used,
                budget = ROTATION_UNITS,
                "rotation budget over-consumed, no compensation applied"
            );
            return;
        }
        let idle_units = ROTATION_UNITS as u64 - period_used;
        if period_used > 0 {
            let allowance = idle_units * self.quota_percent as u64 / period_used;
            debug!(idle_units, allowance, "idle allowance computed");
        }
    }
}

impl Drop for TimesliceScheduler {
    fn drop(&mut self) {
        // courtesy hint; peers detect the exit through staleness either way
        self.segment.context().node(self.idx).clear();
    }
}
