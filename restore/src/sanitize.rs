//! Final privilege sanitation of the restored context.
//!
//! The save side cannot be trusted to produce ring-safe selectors, and a
//! hostile LDT could reach into hypervisor space; both are fixed or
//! rejected here, immediately before submission.

use frames::PAGE_SIZE;
use log::error;

use crate::abi::{flat_kernel_cs, flat_kernel_ds, VcpuContext, LDT_MAX_ENTRIES};
use crate::error::{RestoreError, Result};
use crate::platform::Platform;

const RPL_MASK: u64 = 3;

pub fn sanitize_context(ctx: &mut VcpuContext, platform: &Platform) -> Result<()> {
    let cs = flat_kernel_cs(platform.mode);
    let ds = flat_kernel_ds(platform.mode);

    for (i, trap) in ctx.trap_ctxt.iter_mut().enumerate() {
        trap.vector = i as u8;
        if u64::from(trap.cs) & RPL_MASK == 0 {
            trap.cs = cs;
        }
    }

    if ctx.kernel_ss & RPL_MASK == 0 {
        ctx.kernel_ss = u64::from(ds);
    }

    if platform.mode.is_compat() {
        if ctx.event_callback_cs & RPL_MASK == 0 {
            ctx.event_callback_cs = u64::from(cs);
        }
        if ctx.failsafe_callback_cs & RPL_MASK == 0 {
            ctx.failsafe_callback_cs = u64::from(cs);
        }
    }

    if ctx.ldt_base & (PAGE_SIZE as u64 - 1) != 0
        || ctx.ldt_ents > LDT_MAX_ENTRIES
        || ctx.ldt_base >= platform.hvirt_start
        || ctx.ldt_base + ctx.ldt_ents * 8 >= platform.hvirt_start
    {
        error!(
            "bad LDT: base {:#x}, {} entries",
            ctx.ldt_base, ctx.ldt_ents
        );
        return Err(RestoreError::LdtInvalid);
    }

    Ok(())
}
