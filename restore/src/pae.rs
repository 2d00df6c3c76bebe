//! Three-level paging fix-up for guests without the extended-cr3 assist.
//!
//! Such guests require every top-level directory to live below 4 GiB of
//! machine space. Directories allocated above the boundary are exchanged
//! for low frames first; only then can the deferred leaf tables be
//! rewritten, since their entries may reference the moved frames.

use std::io::Read;

use frames::{Mfn, Pfn, PAGE_SIZE};
use log::{debug, error, warn};

use crate::engine::{Restore, MAX_BATCH_SIZE};
use crate::error::{RestoreError, Result};
use crate::hv::Hypervisor;
use crate::types::PtLevel;
use crate::uncanon::rewrite_table;

/// Highest machine frame a three-level top directory may occupy.
const PAE_L3_MFN_LIMIT: u64 = 0xfffff;

/// A three-level top directory holds four 8-byte entries.
const L3_ENTRIES_BYTES: usize = 4 * 8;

impl<H: Hypervisor, R: Read> Restore<'_, H, R> {
    pub(crate) fn relocate_pae_tables(&mut self) -> Result<()> {
        self.relocate_l3_directories()?;
        self.rewrite_deferred_l1()?;
        self.updates.flush(self.hv)
    }

    fn relocate_l3_directories(&mut self) -> Result<()> {
        let mut moved = 0u64;
        for idx in 0..self.pfn_type.len() {
            if self.pfn_type[idx].table_level() != Some(PtLevel::L3) {
                continue;
            }
            let old = self.p2m[idx];
            if old.as_u64() <= PAE_L3_MFN_LIMIT {
                continue;
            }

            let mut entries = [0u8; L3_ENTRIES_BYTES];
            {
                let mapping = self
                    .hv
                    .map_foreign_range(self.dom, false, old, 1)
                    .map_err(|err| {
                        error!("mapping top directory {:#x} failed: {err}", old.as_u64());
                        RestoreError::OutOfMemory("top-directory mapping failed")
                    })?;
                entries.copy_from_slice(&mapping[..L3_ENTRIES_BYTES]);
            }

            let new = self.hv.make_page_below_4g(self.dom, old).map_err(|err| {
                error!("no replacement frame below 4 GiB for {:#x}: {err}", old.as_u64());
                RestoreError::OutOfMemory("no replacement frame below 4 GiB")
            })?;

            self.p2m[idx] = new;
            self.updates.machphys(self.hv, new, Pfn::new(idx as u64))?;

            {
                let mut mapping = self
                    .hv
                    .map_foreign_range(self.dom, true, new, 1)
                    .map_err(|err| {
                        error!("mapping replacement frame {:#x} failed: {err}", new.as_u64());
                        RestoreError::OutOfMemory("replacement frame mapping failed")
                    })?;
                mapping[..L3_ENTRIES_BYTES].copy_from_slice(&entries);
            }
            moved += 1;
        }

        if moved > 0 {
            debug!("relocated {moved} top directories below 4 GiB");
        }
        Ok(())
    }

    /// Second pass: the leaf tables skipped by the batch loop, rewritten
    /// against the now-final frame table.
    fn rewrite_deferred_l1(&mut self) -> Result<()> {
        let mut pending: Vec<Pfn> = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut scratch = vec![0u8; PAGE_SIZE];

        for idx in 0..self.pfn_type.len() {
            if self.pfn_type[idx].table_level() != Some(PtLevel::L1) {
                continue;
            }
            pending.push(Pfn::new(idx as u64));
            if pending.len() == MAX_BATCH_SIZE {
                self.rewrite_l1_batch(&pending, &mut scratch)?;
                pending.clear();
            }
        }
        if !pending.is_empty() {
            self.rewrite_l1_batch(&pending, &mut scratch)?;
        }
        Ok(())
    }

    fn rewrite_l1_batch(&mut self, pfns: &[Pfn], scratch: &mut [u8]) -> Result<()> {
        let mfns: Vec<Mfn> = pfns.iter().map(|pfn| self.p2m[pfn.as_usize()]).collect();
        let mut mapping = self
            .hv
            .map_foreign_batch(self.dom, true, &mfns)
            .map_err(|err| {
                error!("leaf-table batch mapping failed: {err}");
                RestoreError::OutOfMemory("leaf-table batch mapping failed")
            })?;

        for (i, &pfn) in pfns.iter().enumerate() {
            let frame = &mut mapping[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
            scratch.copy_from_slice(frame);
            match rewrite_table(scratch, self.platform.mode, &self.p2m) {
                Ok(()) => frame.copy_from_slice(scratch),
                Err(race) => {
                    warn!(
                        "page-table race on deferred frame {:#x} (entry named {:#x})",
                        pfn.as_u64(),
                        race.pfn
                    );
                    self.pt_races += 1;
                }
            }
        }
        Ok(())
    }
}
