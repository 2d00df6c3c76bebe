//! The hypercall boundary.
//!
//! The engine drives the hypervisor exclusively through [`Hypervisor`];
//! whatever transport sits behind it (privileged device nodes, ioctl
//! plumbing) is out of scope here. Implementations must keep any buffer
//! passed to a method resident for the duration of the call.

use std::ops::{Deref, DerefMut};

use frames::{Mfn, Pfn};

use crate::abi::VcpuContext;
use crate::error::HvError;
use crate::types::PtLevel;

pub type HvResult<T> = Result<T, HvError>;

pub const ENOMEM: i32 = 12;
pub const EINVAL: i32 = 22;

/// Domain identifier. Domain 0 is the control domain and is never
/// destroyed by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct DomId(pub u32);

/// MMU update command, carried in the low bits of `ptr`.
pub const MMU_NORMAL_PT_UPDATE: u64 = 0;
pub const MMU_MACHPHYS_UPDATE: u64 = 1;

/// One entry of a batched MMU update hypercall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MmuUpdate {
    pub ptr: u64,
    pub val: u64,
}

impl MmuUpdate {
    /// Install the reverse (machine-to-pseudo-physical) mapping for `mfn`.
    pub fn machphys(mfn: Mfn, pfn: Pfn) -> Self {
        Self {
            ptr: mfn.frame_addr() | MMU_MACHPHYS_UPDATE,
            val: pfn.as_u64(),
        }
    }
}

/// Extended MMU operation commands consumed by the engine.
pub const MMUEXT_PIN_L1_TABLE: u32 = 0;
pub const MMUEXT_PIN_L2_TABLE: u32 = 1;
pub const MMUEXT_PIN_L3_TABLE: u32 = 2;
pub const MMUEXT_PIN_L4_TABLE: u32 = 3;

/// One extended MMU operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MmuExtOp {
    pub cmd: u32,
    pub mfn: u64,
}

impl MmuExtOp {
    /// Declare `mfn` to the hypervisor as a page table of the given
    /// level, subjecting it to type enforcement.
    pub fn pin(level: PtLevel, mfn: Mfn) -> Self {
        let cmd = match level {
            PtLevel::L1 => MMUEXT_PIN_L1_TABLE,
            PtLevel::L2 => MMUEXT_PIN_L2_TABLE,
            PtLevel::L3 => MMUEXT_PIN_L3_TABLE,
            PtLevel::L4 => MMUEXT_PIN_L4_TABLE,
        };
        Self {
            cmd,
            mfn: mfn.as_u64(),
        }
    }
}

/// Snapshot returned by the get-domain-info operation.
#[derive(Debug, Clone, Copy)]
pub struct DomainInfo {
    /// Machine frame holding the domain's shared-info page.
    pub shared_info_mfn: Mfn,
}

/// The hypercall surface the engine consumes, one method per named
/// operation.
pub trait Hypervisor {
    /// A foreign mapping of guest frames into the caller. The borrow of
    /// the underlying slots ends when the value drops; mappings must not
    /// be retained across a later mapping call.
    type Mapping: Deref<Target = [u8]> + DerefMut;

    /// Machine frame ceiling: the first frame number past the host's
    /// physical memory.
    fn max_machine_frame(&mut self) -> HvResult<Mfn>;

    /// Lowest virtual address owned by the hypervisor.
    fn hypervisor_virt_start(&mut self) -> HvResult<u64>;

    /// Number of page-table levels the guest uses (2, 3, or 4).
    fn paging_levels(&mut self, dom: DomId) -> HvResult<u32>;

    fn domain_info(&mut self, dom: DomId) -> HvResult<DomainInfo>;

    /// Sets the domain's maximum-memory hint, in frames.
    fn set_max_memory(&mut self, dom: DomId, frames: u64) -> HvResult<()>;

    /// Grows the domain's reservation; returns the frames actually
    /// granted.
    fn increase_reservation(&mut self, dom: DomId, frames: u64) -> HvResult<u64>;

    /// Fills `out` with the domain's machine frames in pseudo-physical
    /// order; returns the count written.
    fn pfn_list(&mut self, dom: DomId, out: &mut [Mfn]) -> HvResult<usize>;

    fn mmu_update(&mut self, dom: DomId, updates: &[MmuUpdate]) -> HvResult<()>;

    fn mmuext_op(&mut self, dom: DomId, ops: &[MmuExtOp]) -> HvResult<()>;

    /// Maps the listed frames as one contiguous region in list order.
    fn map_foreign_batch(
        &mut self,
        dom: DomId,
        writable: bool,
        mfns: &[Mfn],
    ) -> HvResult<Self::Mapping>;

    /// Maps `count` machine-contiguous frames starting at `mfn`.
    fn map_foreign_range(
        &mut self,
        dom: DomId,
        writable: bool,
        mfn: Mfn,
        count: usize,
    ) -> HvResult<Self::Mapping>;

    /// Exchanges `mfn` for a frame below the 4 GiB boundary; the
    /// replacement's contents are undefined.
    fn make_page_below_4g(&mut self, dom: DomId, mfn: Mfn) -> HvResult<Mfn>;

    /// Returns the frames to the hypervisor; reports how many were
    /// released.
    fn decrease_reservation(&mut self, dom: DomId, mfns: &[Mfn]) -> HvResult<u64>;

    fn set_vcpu_context(&mut self, dom: DomId, vcpu: u32, ctx: &VcpuContext) -> HvResult<()>;

    fn destroy_domain(&mut self, dom: DomId) -> HvResult<()>;
}
