//! Guest restore engine for paravirtual domains.
//!
//! Consumes the checkpoint stream produced by the save side, provisions
//! machine frames for a new domain, replays every guest page into its
//! frame, rewrites embedded page-table entries from pseudo-physical to
//! machine frame numbers, pins the rebuilt tables bottom-up, patches the
//! startup records, and hands the hypervisor the final virtual-CPU
//! context.
//!
//! The hypercall transport is abstracted behind [`hv::Hypervisor`]. The
//! engine is single-threaded and synchronous; it runs to completion or
//! fails on a single terminal path that destroys the partially built
//! domain.

pub mod abi;
pub mod error;
pub mod hv;
pub mod mmu;
pub mod platform;
pub mod stream;
pub mod types;
pub mod uncanon;

mod engine;
mod pae;
mod pin;
mod sanitize;
mod tail;

use std::io::Read;

use log::error;

use hv::{DomId, Hypervisor};

pub use engine::{RestoreOutcome, RestoreParams, MAX_BATCH_SIZE};
pub use error::{HvError, RestoreError};
pub use pin::MAX_PIN_BATCH;
pub use sanitize::sanitize_context;

/// Restores a suspended guest from `stream` into domain `dom`.
///
/// On failure every owned table is released and, for a non-zero `dom`,
/// the partially constructed domain is destroyed before the error is
/// returned.
pub fn restore<H: Hypervisor, R: Read>(
    hv: &mut H,
    dom: DomId,
    stream: R,
    params: RestoreParams,
) -> Result<RestoreOutcome, RestoreError> {
    let result = engine::Restore::new(hv, dom, stream, params).and_then(|mut r| r.run());

    if let Err(err) = &result {
        error!("restore of domain {} failed: {err}", dom.0);
        if dom.0 != 0 {
            if let Err(destroy_err) = hv.destroy_domain(dom) {
                error!("failed to destroy partial domain {}: {destroy_err}", dom.0);
            }
        }
    }
    result
}
