//! End-of-stream fix-up: reservation trim, embedded frame translation,
//! and context submission.
//!
//! Everything here follows the stream order: the absent-frame table,
//! then the virtual-CPU context record, then the shared-info image. Each
//! embedded frame reference is validated before it is translated.

use std::io::Read;

use frames::{Mfn, PAGE_SIZE};
use log::{debug, error};

use crate::abi::{
    cr3_to_frame, frame_to_cr3, SharedInfo, StartInfo, Wire, DESCRIPTORS_PER_FRAME,
    GDT_MAX_ENTRIES,
};
use crate::engine::{Restore, RestoreOutcome};
use crate::error::{RestoreError, Result};
use crate::hv::Hypervisor;
use crate::sanitize::sanitize_context;
use crate::types::PageTag;

impl<H: Hypervisor, R: Read> Restore<'_, H, R> {
    /// Releases the frames backing PFNs the guest marked absent from its
    /// own pseudo-physical map.
    pub(crate) fn trim_reservation(&mut self) -> Result<()> {
        let count = self.stream.read_u32()? as usize;
        if count == 0 {
            return Ok(());
        }

        let mut table = vec![0u64; count];
        self.stream.read_words(&mut table)?;

        // Substitute each in-range slot with its machine frame and mark
        // the pseudo-physical slot invalid; out-of-range slots pass
        // through untranslated.
        let mut mfns: Vec<Mfn> = Vec::with_capacity(count);
        for &word in &table {
            match self.p2m.get_mut(word as usize) {
                Some(entry) => {
                    mfns.push(*entry);
                    *entry = Mfn::INVALID;
                }
                None => mfns.push(Mfn::new(word)),
            }
        }

        let released = self
            .hv
            .decrease_reservation(self.dom, &mfns)
            .map_err(|err| {
                error!("decrease-reservation failed: {err}");
                RestoreError::StreamInvalid("absent-frame release rejected")
            })?;
        if released != count as u64 {
            error!("released {released} of {count} absent frames");
            return Err(RestoreError::StreamInvalid(
                "absent-frame release came up short",
            ));
        }
        debug!("released {count} frames absent from the guest map");
        Ok(())
    }

    /// Reads the context record and shared-info image, resolves every
    /// embedded frame reference, installs the guest's live
    /// pseudo-physical map, and submits the final context.
    pub(crate) fn fix_tail(&mut self) -> Result<RestoreOutcome> {
        let mut ctx = self.stream.read_vcpu_context()?;

        // Suspend record: the resume path pokes it through this register.
        let suspend_mfn = self.lookup_plain_frame(ctx.user_regs.rdx, "suspend record")?;
        ctx.user_regs.rdx = suspend_mfn.as_u64();

        let (store_mfn, console_mfn) = self.patch_start_info(suspend_mfn)?;

        if ctx.gdt_ents > GDT_MAX_ENTRIES {
            error!("GDT claims {} entries", ctx.gdt_ents);
            return Err(RestoreError::StreamInvalid("GDT entry count out of bounds"));
        }
        let gdt_frames = ctx.gdt_ents.div_ceil(DESCRIPTORS_PER_FRAME) as usize;
        for slot in ctx.gdt_frames[..gdt_frames].iter_mut() {
            let mfn = self.lookup_plain_frame(*slot, "GDT frame")?;
            *slot = mfn.as_u64();
        }

        // Page-table root: must carry the type of the guest's top level.
        let root_pfn = cr3_to_frame(ctx.ctrlreg[3]);
        let top = self.platform.mode.top_level();
        match self.pfn_type.get(root_pfn.as_usize()) {
            Some(tag) if tag.table_level() == Some(top) => {}
            _ => {
                error!(
                    "page-table root {:#x} is not a level-{} table",
                    root_pfn.as_u64(),
                    top.number()
                );
                return Err(RestoreError::StreamInvalid(
                    "page-table root level mismatch",
                ));
            }
        }
        ctx.ctrlreg[3] = frame_to_cr3(self.p2m[root_pfn.as_usize()]);

        // Shared-info image: drop any pending event state, then install
        // it over the domain's live shared-info frame.
        let mut image = vec![0u8; PAGE_SIZE];
        self.stream.read_exact(&mut image)?;
        let mut shared = SharedInfo::read_from(&image);
        shared.evtchn_pending = [0; 64];
        for vcpu in shared.vcpu_info.iter_mut() {
            vcpu.evtchn_pending_sel = 0;
        }
        shared.write_to(&mut image);
        {
            let mut mapping = self
                .hv
                .map_foreign_range(self.dom, true, self.shared_info_mfn, 1)
                .map_err(|err| {
                    error!("shared-info mapping failed: {err}");
                    RestoreError::OutOfMemory("shared-info mapping failed")
                })?;
            mapping[..PAGE_SIZE].copy_from_slice(&image);
        }

        // The guest's own map: translate the frame list, then overwrite
        // the live table with the one built here.
        for i in 0..self.p2m_frame_list.len() {
            let mfn =
                self.lookup_plain_frame(self.p2m_frame_list[i], "pseudo-physical map frame")?;
            self.p2m_frame_list[i] = mfn.as_u64();
        }
        let list: Vec<Mfn> = self.p2m_frame_list.iter().map(|&w| Mfn::new(w)).collect();
        let mut mapping = self
            .hv
            .map_foreign_batch(self.dom, true, &list)
            .map_err(|err| {
                error!("pseudo-physical map mapping failed: {err}");
                RestoreError::OutOfMemory("pseudo-physical map mapping failed")
            })?;
        for (i, mfn) in self.p2m.iter().enumerate() {
            mapping[i * 8..(i + 1) * 8].copy_from_slice(&mfn.as_u64().to_le_bytes());
        }
        drop(mapping);

        sanitize_context(&mut ctx, &self.platform)?;

        self.hv
            .set_vcpu_context(self.dom, 0, &ctx)
            .map_err(|err| {
                error!("context submission failed: {err}");
                RestoreError::StreamInvalid("virtual-CPU context rejected")
            })?;

        Ok(RestoreOutcome {
            store_mfn,
            console_mfn,
            pt_races: self.pt_races,
        })
    }

    /// Rewrites the start-info page in place with post-restore values,
    /// returning the translated store and console ring frames.
    fn patch_start_info(&mut self, mfn: Mfn) -> Result<(Mfn, Mfn)> {
        let mut mapping = self
            .hv
            .map_foreign_range(self.dom, true, mfn, 1)
            .map_err(|err| {
                error!("start-info mapping failed: {err}");
                RestoreError::OutOfMemory("start-info mapping failed")
            })?;

        let mut si = StartInfo::read_from(&mapping);
        si.nr_pages = self.params.max_pfn;
        si.shared_info = self.shared_info_mfn.frame_addr();
        si.flags = 0;

        let store_mfn = self.lookup_plain_frame(si.store_mfn, "store ring")?;
        let console_mfn = self.lookup_plain_frame(si.console.mfn, "console ring")?;
        si.store_mfn = store_mfn.as_u64();
        si.store_evtchn = self.params.store_evtchn;
        si.console.mfn = console_mfn.as_u64();
        si.console.evtchn = self.params.console_evtchn;

        si.write_to(&mut mapping);
        Ok((store_mfn, console_mfn))
    }

    /// Validates that `word` names an in-range frame with no page-table
    /// type, then translates it.
    fn lookup_plain_frame(&self, word: u64, what: &'static str) -> Result<Mfn> {
        let idx = word as usize;
        match self.pfn_type.get(idx) {
            Some(PageTag::Normal) => Ok(self.p2m[idx]),
            Some(_) => {
                error!("{what} frame {word:#x} carries a page-table type");
                Err(RestoreError::StreamInvalid(
                    "embedded frame reference is a page table",
                ))
            }
            None => {
                error!("{what} frame {word:#x} is out of range");
                Err(RestoreError::StreamInvalid(
                    "embedded frame reference out of range",
                ))
            }
        }
    }
}
