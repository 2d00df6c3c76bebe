//! Guest-visible ABI records exchanged with the hypervisor.
//!
//! These mirror the hypervisor's public interface layout; the stream
//! carries them byte-for-byte, so they are `repr(C)` and read/written
//! through [`Wire`] rather than field at a time.

use core::mem;

use bitflags::bitflags;
use frames::{Mfn, Pfn, PAGE_SHIFT, PAGE_SIZE};

use crate::types::PagingMode;

pub const TRAP_CTXT_ENTRIES: usize = 256;
pub const GDT_FRAME_SLOTS: usize = 16;
/// A descriptor table holds at most 8192 entries, 512 to a frame.
pub const GDT_MAX_ENTRIES: u64 = 8192;
pub const LDT_MAX_ENTRIES: u64 = 8192;
pub const DESCRIPTORS_PER_FRAME: u64 = PAGE_SIZE as u64 / 8;

pub const GUEST_MAGIC_SIZE: usize = 32;
pub const GUEST_CMDLINE_SIZE: usize = 1024;
pub const MAX_VCPUS: usize = 32;

/// Flat kernel selectors per guest width. 32-bit kernels run in ring 1,
/// 64-bit kernels in ring 3.
pub const FLAT_KERNEL_CS32: u16 = 0xe019;
pub const FLAT_KERNEL_DS32: u16 = 0xe021;
pub const FLAT_KERNEL_CS64: u16 = 0xe033;
pub const FLAT_KERNEL_DS64: u16 = 0xe02b;

pub fn flat_kernel_cs(mode: PagingMode) -> u16 {
    if mode.is_compat() {
        FLAT_KERNEL_CS32
    } else {
        FLAT_KERNEL_CS64
    }
}

pub fn flat_kernel_ds(mode: PagingMode) -> u16 {
    if mode.is_compat() {
        FLAT_KERNEL_DS32
    } else {
        FLAT_KERNEL_DS64
    }
}

bitflags! {
    /// Virtualization-assist features the guest opted into.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmAssist: u64 {
        const FOUR_GB_SEGMENTS = 1 << 0;
        const FOUR_GB_SEGMENTS_NOTIFY = 1 << 1;
        const WRITABLE_PAGETABLES = 1 << 2;
        /// The guest tolerates top-level directories anywhere in machine
        /// space on three-level paging.
        const PAE_EXTENDED_CR3 = 1 << 3;
    }
}

/// Packs a machine frame into the control-register-3 format.
pub fn frame_to_cr3(mfn: Mfn) -> u64 {
    mfn.as_u64() << PAGE_SHIFT
}

/// Extracts the frame number a control-register-3 value refers to.
pub fn cr3_to_frame(cr3: u64) -> Pfn {
    Pfn::new(cr3 >> PAGE_SHIFT)
}

/// Plain-old-data records that cross the stream or hypercall boundary.
///
/// # Safety
///
/// Implementors must be `repr(C)` with every field a plain integer (or
/// array/struct thereof), so that every bit pattern is a valid value.
pub unsafe trait Wire: Copy {
    fn read_from(buf: &[u8]) -> Self {
        assert!(buf.len() >= mem::size_of::<Self>());
        // Safety: trait contract makes any bit pattern valid;
        // `read_unaligned` tolerates the buffer's alignment.
        unsafe { (buf.as_ptr() as *const Self).read_unaligned() }
    }

    fn write_to(&self, buf: &mut [u8]) {
        assert!(buf.len() >= mem::size_of::<Self>());
        // Safety: same layout contract as `read_from`.
        unsafe { (buf.as_mut_ptr() as *mut Self).write_unaligned(*self) }
    }
}

/// One gate of the guest's trap table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct TrapInfo {
    pub vector: u8,
    pub flags: u8,
    pub cs: u16,
    pub _pad: u32,
    pub address: u64,
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct UserRegs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    /// Carries the suspend-record frame number across save and restore
    /// (the architectural EDX slot).
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub error_code: u32,
    pub entry_vector: u32,
    pub rip: u64,
    pub cs: u16,
    pub _pad0: [u16; 3],
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u16,
    pub _pad1: [u16; 3],
    pub es: u16,
    pub _pad2: [u16; 3],
    pub ds: u16,
    pub _pad3: [u16; 3],
    pub fs: u16,
    pub _pad4: [u16; 3],
    pub gs: u16,
    pub _pad5: [u16; 3],
}

/// Full virtual-CPU state record, as saved by the suspend side and
/// resubmitted on resume.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct VcpuContext {
    pub fpu_ctxt: [u8; 512],
    pub flags: u64,
    pub user_regs: UserRegs,
    pub trap_ctxt: [TrapInfo; TRAP_CTXT_ENTRIES],
    pub ldt_base: u64,
    pub ldt_ents: u64,
    pub gdt_frames: [u64; GDT_FRAME_SLOTS],
    pub gdt_ents: u64,
    pub kernel_ss: u64,
    pub kernel_sp: u64,
    pub ctrlreg: [u64; 8],
    pub debugreg: [u64; 8],
    pub event_callback_cs: u64,
    pub event_callback_eip: u64,
    pub failsafe_callback_cs: u64,
    pub failsafe_callback_eip: u64,
    pub syscall_callback_eip: u64,
    pub vm_assist: u64,
    pub fs_base: u64,
    pub gs_base_kernel: u64,
    pub gs_base_user: u64,
}

impl VcpuContext {
    pub const SIZE: usize = mem::size_of::<Self>();

    pub fn zeroed() -> Self {
        // Safety: every field is plain integer data; all-zero is valid.
        unsafe { mem::zeroed() }
    }

    pub fn vm_assist(&self) -> VmAssist {
        VmAssist::from_bits_truncate(self.vm_assist)
    }
}

impl Default for VcpuContext {
    fn default() -> Self {
        Self::zeroed()
    }
}

// Safety: repr(C), integer fields only.
unsafe impl Wire for VcpuContext {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(C)]
pub struct StartInfoConsole {
    pub mfn: u64,
    pub evtchn: u32,
    pub _pad: u32,
}

/// The guest's boot/resume information page.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct StartInfo {
    pub magic: [u8; GUEST_MAGIC_SIZE],
    pub nr_pages: u64,
    pub shared_info: u64,
    pub flags: u32,
    pub _pad0: u32,
    pub store_mfn: u64,
    pub store_evtchn: u32,
    pub _pad1: u32,
    pub console: StartInfoConsole,
    pub pt_base: u64,
    pub nr_pt_frames: u64,
    pub mfn_list: u64,
    pub mod_start: u64,
    pub mod_len: u64,
    pub cmdline: [u8; GUEST_CMDLINE_SIZE],
}

impl StartInfo {
    pub const SIZE: usize = mem::size_of::<Self>();
}

// Safety: repr(C), integer fields only.
unsafe impl Wire for StartInfo {}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct VcpuTime {
    pub version: u32,
    pub _pad0: u32,
    pub tsc_timestamp: u64,
    pub system_time: u64,
    pub tsc_to_system_mul: u32,
    pub tsc_shift: i8,
    pub flags: u8,
    pub _pad1: [u8; 2],
}

#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct VcpuInfo {
    pub evtchn_upcall_pending: u8,
    pub evtchn_upcall_mask: u8,
    pub _pad0: [u8; 6],
    pub evtchn_pending_sel: u64,
    pub cr2: u64,
    pub _pad1: u64,
    pub time: VcpuTime,
}

/// The page the hypervisor and all VCPUs share.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct SharedInfo {
    pub vcpu_info: [VcpuInfo; MAX_VCPUS],
    pub evtchn_pending: [u64; 64],
    pub evtchn_mask: [u64; 64],
    pub wc_version: u32,
    pub wc_sec: u32,
    pub wc_nsec: u32,
    pub _pad0: u32,
    pub max_pfn: u64,
    pub pfn_to_mfn_frame_list_list: u64,
    pub nmi_reason: u64,
}

impl SharedInfo {
    pub const SIZE: usize = mem::size_of::<Self>();
}

// Safety: repr(C), integer fields only.
unsafe impl Wire for SharedInfo {}
