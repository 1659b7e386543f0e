//! xpuslice-shm: Shared scheduling segment for xpuslice
//!
//! This crate provides the cross-process state all tenants of one device map:
//! - The fixed `#[repr(C)]` scheduling context layout
//! - The first-touch initialization protocol
//! - File-backed segment mapping at a well-known path

pub mod layout;
pub mod segment;

pub use layout::{InitState, NodeSlot, SharedSchedulingContext, MAX_NODES, MIN_SHARE_UNITS, ROTATION_UNITS};
pub use segment::Segment;
