//! Batched submission of MMU updates.

use arrayvec::ArrayVec;
use frames::{Mfn, Pfn};
use log::error;

use crate::error::{RestoreError, Result};
use crate::hv::{DomId, Hypervisor, MmuUpdate};

/// Most updates carried by one hypercall.
pub const MAX_MMU_UPDATES: usize = 1024;

/// Coalesces MMU updates into hypercall-sized groups.
///
/// Updates become visible only after a flush; callers sequence an
/// explicit [`flush`](Self::flush) before any operation that depends on
/// them.
pub struct MmuUpdateBatch {
    dom: DomId,
    queue: ArrayVec<MmuUpdate, MAX_MMU_UPDATES>,
}

impl MmuUpdateBatch {
    pub fn new(dom: DomId) -> Self {
        Self {
            dom,
            queue: ArrayVec::new(),
        }
    }

    pub fn push(&mut self, hv: &mut impl Hypervisor, update: MmuUpdate) -> Result<()> {
        self.queue.push(update);
        if self.queue.is_full() {
            self.flush(hv)?;
        }
        Ok(())
    }

    /// Enqueues the reverse-map install for `mfn`.
    pub fn machphys(&mut self, hv: &mut impl Hypervisor, mfn: Mfn, pfn: Pfn) -> Result<()> {
        self.push(hv, MmuUpdate::machphys(mfn, pfn))
    }

    pub fn flush(&mut self, hv: &mut impl Hypervisor) -> Result<()> {
        if self.queue.is_empty() {
            return Ok(());
        }
        hv.mmu_update(self.dom, &self.queue).map_err(|err| {
            error!("MMU update batch of {} rejected: {err}", self.queue.len());
            RestoreError::StreamInvalid("MMU update batch rejected")
        })?;
        self.queue.clear();
        Ok(())
    }
}
