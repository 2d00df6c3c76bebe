//! Host and guest constants gathered before any stream processing.

use frames::Mfn;
use log::debug;

use crate::error::{HvError, RestoreError, Result};
use crate::hv::{DomId, Hypervisor, EINVAL};
use crate::types::PagingMode;

/// Platform constants the rest of the restore is undefined without.
#[derive(Debug, Clone, Copy)]
pub struct Platform {
    /// Machine frame ceiling: the first frame number past the host's
    /// physical memory.
    pub max_mfn: Mfn,
    /// Lowest virtual address owned by the hypervisor.
    pub hvirt_start: u64,
    /// Paging mode the suspended guest was using.
    pub mode: PagingMode,
}

impl Platform {
    pub fn probe(hv: &mut impl Hypervisor, dom: DomId) -> Result<Self> {
        let max_mfn = hv
            .max_machine_frame()
            .map_err(RestoreError::PlatformUnavailable)?;
        let hvirt_start = hv
            .hypervisor_virt_start()
            .map_err(RestoreError::PlatformUnavailable)?;
        let levels = hv
            .paging_levels(dom)
            .map_err(RestoreError::PlatformUnavailable)?;
        let mode = PagingMode::from_levels(levels).ok_or_else(|| {
            RestoreError::PlatformUnavailable(HvError::new("get-paging-levels", EINVAL))
        })?;

        debug!(
            "platform: max_mfn={:#x}, hypervisor floor {:#x}, {}-level paging",
            max_mfn.as_u64(),
            hvirt_start,
            mode.levels()
        );
        Ok(Self {
            max_mfn,
            hvirt_start,
            mode,
        })
    }
}
