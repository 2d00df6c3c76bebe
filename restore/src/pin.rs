//! Declaring the rebuilt page tables to the hypervisor.

use std::io::Read;

use arrayvec::ArrayVec;
use log::{debug, error};

use crate::engine::Restore;
use crate::error::{RestoreError, Result};
use crate::hv::{Hypervisor, MmuExtOp};
use crate::types::{PageTag, PtLevel};

/// Most pin operations carried by one hypercall.
pub const MAX_PIN_BATCH: usize = 1024;

impl<H: Hypervisor, R: Read> Restore<'_, H, R> {
    /// Pins every table the stream flagged, strictly bottom-up so the
    /// hypervisor's type system accepts each level in turn. Contents are
    /// final by now; a rejection means a table was rebuilt wrong and is
    /// fatal.
    pub(crate) fn pin_tables(&mut self) -> Result<()> {
        let mut batch: ArrayVec<MmuExtOp, MAX_PIN_BATCH> = ArrayVec::new();
        let mut pinned = 0u64;

        for level in PtLevel::ALL {
            for idx in 0..self.pfn_type.len() {
                let PageTag::Table {
                    level: l,
                    pinned: true,
                } = self.pfn_type[idx]
                else {
                    continue;
                };
                if l != level {
                    continue;
                }
                batch.push(MmuExtOp::pin(level, self.p2m[idx]));
                pinned += 1;
                if batch.is_full() {
                    self.submit_pins(&mut batch)?;
                }
            }
        }
        if !batch.is_empty() {
            self.submit_pins(&mut batch)?;
        }

        debug!("pinned {pinned} page tables");
        Ok(())
    }

    fn submit_pins(&mut self, batch: &mut ArrayVec<MmuExtOp, MAX_PIN_BATCH>) -> Result<()> {
        self.hv.mmuext_op(self.dom, batch).map_err(|err| {
            error!("pin batch of {} rejected: {err}", batch.len());
            RestoreError::StreamInvalid("page-table pin rejected")
        })?;
        batch.clear();
        Ok(())
    }
}
