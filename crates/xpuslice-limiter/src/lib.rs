//! xpuslice-limiter: Per-process admission gate for shared accelerators
//!
//! This crate turns the shared scheduling segment into a local throttle:
//! - `TimesliceScheduler` runs the cross-process ownership state machine
//! - `Semaphore` is the counting primitive behind admission tokens
//! - `CoreLimiter` exposes scoped request/release guards to call sites and
//!   drives the background reconciliation loop
//! - `MemoryLimiter` answers the device memory quota check

pub mod limiter;
pub mod memory;
pub mod semaphore;
pub mod timeslice;

pub use limiter::{CoreLimiter, ReleaseGuard, RequestGuard, StreamId};
pub use memory::{MemoryLimiter, MemoryProbe};
pub use semaphore::Semaphore;
pub use timeslice::{SchedulerTiming, TimesliceScheduler};
