//! Rewriting page-table entries from pseudo-physical back to machine
//! form.
//!
//! The save side canonicalized every present entry to carry the guest's
//! PFN; this pass substitutes the freshly allocated machine frame while
//! leaving every flag bit exactly as saved.

use frames::{Mfn, PAGE_SHIFT};

use crate::types::PagingMode;

/// Bits of an 8-byte entry that survive the rewrite: the low 12 flag
/// bits and the top 12 NX/reserved bits.
const PTE64_KEEP_MASK: u64 = 0xffff_ff00_0000_0fff;
const PTE32_KEEP_MASK: u32 = 0x0000_0fff;
const PTE_PRESENT: u64 = 1 << 0;
/// The canonicalized frame-number field is 32 bits wide.
const PTE_PFN_MASK: u64 = 0xffff_ffff;

/// A present entry named a frame outside the guest's pseudo-physical
/// range: the page was retyped on the save side after it was
/// canonicalized, and its content is not a page table any more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtRace {
    /// The out-of-range frame number found in the entry.
    pub pfn: u64,
}

/// Rewrites every present entry of `page` to machine form at the mode's
/// entry width. Non-present entries are left untouched. On failure the
/// buffer may be partially rewritten; callers discard it.
pub fn rewrite_table(page: &mut [u8], mode: PagingMode, p2m: &[Mfn]) -> Result<(), PtRace> {
    match mode.entry_bytes() {
        4 => rewrite_entries32(page, p2m),
        _ => rewrite_entries64(page, p2m),
    }
}

fn rewrite_entries64(page: &mut [u8], p2m: &[Mfn]) -> Result<(), PtRace> {
    for chunk in page.chunks_exact_mut(8) {
        let entry = u64::from_le_bytes(chunk.try_into().unwrap());
        if entry & PTE_PRESENT == 0 {
            continue;
        }
        let pfn = (entry >> PAGE_SHIFT) & PTE_PFN_MASK;
        let Some(mfn) = p2m.get(pfn as usize) else {
            return Err(PtRace { pfn });
        };
        let entry = (entry & PTE64_KEEP_MASK) | mfn.frame_addr();
        chunk.copy_from_slice(&entry.to_le_bytes());
    }
    Ok(())
}

fn rewrite_entries32(page: &mut [u8], p2m: &[Mfn]) -> Result<(), PtRace> {
    for chunk in page.chunks_exact_mut(4) {
        let entry = u32::from_le_bytes(chunk.try_into().unwrap());
        if u64::from(entry) & PTE_PRESENT == 0 {
            continue;
        }
        let pfn = entry >> PAGE_SHIFT;
        let Some(mfn) = p2m.get(pfn as usize) else {
            return Err(PtRace { pfn: u64::from(pfn) });
        };
        debug_assert!(mfn.as_u64() < 1 << 20, "machine frame beyond 32-bit reach");
        let entry = (entry & PTE32_KEEP_MASK) | mfn.frame_addr() as u32;
        chunk.copy_from_slice(&entry.to_le_bytes());
    }
    Ok(())
}
