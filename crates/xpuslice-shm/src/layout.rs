//! Shared scheduling context layout and initialization protocol
//!
//! Concurrency contract for the segment:
//! 1. One process per slot; a slot's heartbeat is written only by its owner.
//! 2. Every cross-process field is a single machine-word atomic; there are no
//!    locks on the segment and no process can block another through it.
//! 3. `current` moves only via compare-and-swap. A lost CAS means a peer
//!    completed the same transition; losers re-evaluate on their next pass.
//! 4. A node is alive iff `now - heartbeat <= stale_timeout`. A zero
//!    heartbeat (never stamped, or cleared on exit) reads as maximally stale.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tracing::warn;
use xpuslice_core::Clock;

/// Scheduling units in one full rotation.
pub const ROTATION_UNITS: u32 = 9_000;
/// Smallest grantable share, in rotation units.
pub const MIN_SHARE_UNITS: u32 = 300;
/// Compile-time bound on concurrent tenants.
pub const MAX_NODES: usize = (ROTATION_UNITS / MIN_SHARE_UNITS) as usize;

const STATE_UNINITIALIZED: u32 = 0;
const STATE_INITIALIZING: u32 = 1;
const STATE_READY: u32 = 2;

/// Segment lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Uninitialized,
    Initializing,
    Ready,
}

impl InitState {
    fn from_raw(raw: u32) -> Self {
        match raw {
            STATE_READY => InitState::Ready,
            STATE_INITIALIZING => InitState::Initializing,
            // any unknown value is treated as a segment needing setup
            _ => InitState::Uninitialized,
        }
    }
}

/// One tenant's heartbeat slot
#[repr(C)]
pub struct NodeSlot {
    heartbeat_ms: AtomicU64,
}

impl NodeSlot {
    pub fn heartbeat(&self) -> u64 {
        self.heartbeat_ms.load(Ordering::Acquire)
    }

    pub fn stamp(&self, now_ms: u64) {
        self.heartbeat_ms.store(now_ms, Ordering::Release);
    }

    /// Courtesy hint on process exit; fail-over does not depend on it.
    pub fn clear(&self) {
        self.heartbeat_ms.store(0, Ordering::Release);
    }

    /// Heartbeat age in milliseconds. A heartbeat in the future (clock skew)
    /// saturates to zero, which keeps the node alive: ambiguous liveness is
    /// treated as alive.
    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.heartbeat())
    }
}

/// Fixed-size scheduling state shared by all tenants of one device.
///
/// The segment file is sized exactly to this structure; all participants in
/// one deployment must agree on [`MAX_NODES`] and the field order.
#[repr(C)]
pub struct SharedSchedulingContext {
    init_state: AtomicU32,
    current: AtomicU32,
    used_units: AtomicU64,
    nodes: [NodeSlot; MAX_NODES],
}

impl SharedSchedulingContext {
    /// Exact byte size of the shared layout.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    pub fn init_state(&self) -> InitState {
        InitState::from_raw(self.init_state.load(Ordering::Acquire))
    }

    /// Index of the slot currently holding scheduling authority.
    pub fn current(&self) -> u32 {
        self.current.load(Ordering::Acquire)
    }

    /// Single CAS attempt on `current`; `Err` carries the value a racing
    /// peer already installed.
    pub fn cas_current(&self, from: u32, to: u32) -> Result<u32, u32> {
        self.current
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
    }

    pub fn node(&self, idx: u32) -> &NodeSlot {
        &self.nodes[idx as usize]
    }

    pub fn nodes(&self) -> &[NodeSlot] {
        &self.nodes
    }

    pub fn used_units(&self) -> u64 {
        self.used_units.load(Ordering::Relaxed)
    }

    /// Consume `units` from the rotation budget; returns the new total.
    pub fn add_used_units(&self, units: u64) -> u64 {
        self.used_units.fetch_add(units, Ordering::Relaxed) + units
    }

    /// First-touch initialization. Exactly one caller zeroes the heartbeat
    /// slots; everyone else converges on `Ready`. Safe to call any number of
    /// times: a `Ready` segment is returned untouched.
    ///
    /// A peer that crashed mid-initialization leaves the segment stuck in
    /// `Initializing`; after `stale_timeout` the state is forced back to
    /// `Uninitialized` and setup re-runs.
    pub fn ensure_ready(&self, clock: &dyn Clock, stale_timeout: Duration) {
        let stale_ms = stale_timeout.as_millis() as u64;
        let mut wait_started = clock.now_millis();
        loop {
            let state = self.init_state.load(Ordering::Acquire);
            match state {
                STATE_READY => return,
                STATE_INITIALIZING => {
                    if clock.now_millis().saturating_sub(wait_started) > stale_ms {
                        // initializer presumed dead; force a re-run
                        if self
                            .init_state
                            .compare_exchange(
                                STATE_INITIALIZING,
                                STATE_UNINITIALIZED,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            warn!("segment stuck in INITIALIZING, resetting for re-init");
                        }
                        wait_started = clock.now_millis();
                        continue;
                    }
                    std::thread::yield_now();
                }
                _ => {
                    if self
                        .init_state
                        .compare_exchange(
                            state,
                            STATE_INITIALIZING,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        warn!("initializing shared segment, clearing all heartbeats");
                        for node in &self.nodes {
                            node.clear();
                        }
                        self.used_units.store(0, Ordering::Relaxed);
                        self.init_state.store(STATE_READY, Ordering::Release);
                        return;
                    }
                    // lost the race; loop back and watch the winner
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn force_init_state(&self, raw: u32) {
        self.init_state.store(raw, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use std::sync::Arc;
    use xpuslice_core::ManualClock;

    const STALE: Duration = Duration::from_secs(1);

    #[test]
    fn test_tenant_bound_derivation() {
        assert_eq!(MAX_NODES, 30);
        assert!(SharedSchedulingContext::SIZE >= 16 + MAX_NODES * 8);
    }

    #[test]
    fn test_fresh_segment_initializes_once() {
        let segment = Segment::anonymous().expect("segment");
        let ctx = segment.context();
        assert_eq!(ctx.init_state(), InitState::Uninitialized);

        let clock = ManualClock::new(10_000);
        ctx.ensure_ready(&clock, STALE);
        assert_eq!(ctx.init_state(), InitState::Ready);
        for node in ctx.nodes() {
            assert_eq!(node.heartbeat(), 0);
        }
        assert_eq!(ctx.current(), 0);
    }

    #[test]
    fn test_ready_segment_left_untouched() {
        let segment = Segment::anonymous().expect("segment");
        let ctx = segment.context();
        let clock = ManualClock::new(10_000);
        ctx.ensure_ready(&clock, STALE);

        // a peer's heartbeat must survive a late joiner's init call
        ctx.node(5).stamp(9_999);
        ctx.ensure_ready(&clock, STALE);
        assert_eq!(ctx.node(5).heartbeat(), 9_999);
    }

    #[test]
    fn test_stuck_initializing_recovers() {
        let segment = Segment::anonymous().expect("segment");
        let ctx = segment.context();
        ctx.force_init_state(1); // INITIALIZING with no live initializer

        // auto-stepping clock walks past the staleness timeout
        let clock = ManualClock::with_step(10_000, 200);
        ctx.ensure_ready(&clock, STALE);
        assert_eq!(ctx.init_state(), InitState::Ready);
    }

    #[test]
    fn test_concurrent_init_converges() {
        let segment = Arc::new(Segment::anonymous().expect("segment"));
        // pre-init garbage that the single winner must clear
        segment.context().node(7).stamp(77);

        let clock = Arc::new(ManualClock::new(10_000));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let segment = Arc::clone(&segment);
                let clock = Arc::clone(&clock);
                std::thread::spawn(move || {
                    segment.context().ensure_ready(clock.as_ref(), STALE);
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("init thread");
        }

        let ctx = segment.context();
        assert_eq!(ctx.init_state(), InitState::Ready);
        assert_eq!(ctx.node(7).heartbeat(), 0);
    }

    #[test]
    fn test_node_age_saturates() {
        let segment = Segment::anonymous().expect("segment");
        let node = segment.context().node(0);
        node.stamp(5_000);
        assert_eq!(node.age_ms(5_400), 400);
        // heartbeat from the future reads as fresh, not as underflow
        assert_eq!(node.age_ms(4_000), 0);
        node.clear();
        assert_eq!(node.age_ms(5_400), 5_400);
    }
}
