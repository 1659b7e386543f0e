//! Shared segment mapping
//!
//! The segment is a plain file at a well-known path, sized exactly to the
//! scheduling layout and mapped by every tenant of the device. A fresh file
//! is zero-filled by the kernel, which is a valid `Uninitialized` state.

use std::fs::OpenOptions;
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use tracing::info;
use xpuslice_core::{XpusliceError, XpusliceResult};

use crate::layout::SharedSchedulingContext;

/// Mapped scheduling segment.
///
/// Holds the mapping alive; all access goes through [`Segment::context`],
/// which only ever hands out a shared reference. Mutation happens through
/// the atomics inside the layout.
#[derive(Debug)]
pub struct Segment {
    map: MmapMut,
}

impl Segment {
    /// Map the segment at `path`, creating and sizing it on first touch.
    ///
    /// An existing file of any other size belongs to an incompatible build
    /// and is rejected rather than resized underneath its tenants.
    pub fn open(path: &Path) -> XpusliceResult<Self> {
        let size = SharedSchedulingContext::SIZE as u64;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            file.set_len(size)?;
            info!(path = %path.display(), size, "created shared scheduling segment");
        } else if len != size {
            return Err(XpusliceError::Segment(format!(
                "segment {} has size {} but this build expects {}",
                path.display(),
                len,
                size
            )));
        }

        // SAFETY: the file is at least SIZE bytes and stays mapped for the
        // lifetime of `map`. Concurrent mutation from other processes only
        // touches the atomic fields of the layout.
        let map = unsafe { MmapOptions::new().len(SharedSchedulingContext::SIZE).map_mut(&file) }
            .map_err(|e| XpusliceError::Segment(format!("mmap {} failed: {}", path.display(), e)))?;

        Ok(Self { map })
    }

    /// Anonymous in-process segment, for tests and single-tenant runs.
    pub fn anonymous() -> XpusliceResult<Self> {
        let map = MmapOptions::new()
            .len(SharedSchedulingContext::SIZE)
            .map_anon()
            .map_err(|e| XpusliceError::Segment(format!("anonymous mmap failed: {}", e)))?;
        Ok(Self { map })
    }

    /// View the mapping as the scheduling layout.
    pub fn context(&self) -> &SharedSchedulingContext {
        // SAFETY: the mapping is SIZE bytes, page-aligned (exceeding the
        // layout's alignment), and every field is an atomic for which any
        // bit pattern is a valid value.
        unsafe { &*(self.map.as_ptr() as *const SharedSchedulingContext) }
    }
}
