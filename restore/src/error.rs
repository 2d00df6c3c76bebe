use std::io;

use thiserror::Error;

/// Failure of one named hypercall, as reported by the boundary.
#[derive(Debug, Clone, Error)]
#[error("{op} hypercall failed (code {code})")]
pub struct HvError {
    pub op: &'static str,
    pub code: i32,
}

impl HvError {
    pub fn new(op: &'static str, code: i32) -> Self {
        Self { op, code }
    }
}

/// Terminal restore failures.
///
/// Every variant funnels into the single cleanup path: owned tables are
/// dropped and the partially constructed domain is destroyed. Page-type
/// races are not represented here; they are tolerated, counted, and
/// reported in the final summary.
#[derive(Debug, Error)]
pub enum RestoreError {
    /// A platform probe failed; the restore is undefined without its
    /// constants.
    #[error("platform information unavailable: {0}")]
    PlatformUnavailable(#[source] HvError),

    /// The hypervisor could not provision or map the domain's memory.
    #[error("failed to provision domain memory: {0}")]
    OutOfMemory(&'static str),

    /// An exact read came up short outside the one tolerated boundary.
    #[error("checkpoint stream ended early")]
    StreamTruncated(#[source] io::Error),

    /// The stream violated its framing or an embedded frame reference
    /// failed validation.
    #[error("malformed checkpoint stream: {0}")]
    StreamInvalid(&'static str),

    /// The restored LDT is misaligned, oversized, or reaches into
    /// hypervisor space.
    #[error("restored LDT violates layout constraints")]
    LdtInvalid,
}

pub type Result<T> = std::result::Result<T, RestoreError>;
