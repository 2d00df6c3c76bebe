//! Framed reads from the checkpoint transport.
//!
//! Every read is exact: the transport either delivers the full record or
//! the restore dies with a truncation error. Interrupted reads are
//! retried by the underlying `read_exact`.

use std::io::Read;

use log::{debug, trace};

use crate::abi::{VcpuContext, Wire};
use crate::error::{RestoreError, Result};

/// Machine-word size of the stream producer.
pub const WORD_SIZE: usize = 8;

/// Value in the first pseudo-physical frame-list slot announcing an
/// extended-info preamble.
pub const EXTENDED_INFO_SENTINEL: u64 = !0;

const CHUNK_SIG_VCPU: [u8; 4] = *b"vcpu";

pub struct StreamReader<R> {
    inner: R,
}

impl<R: Read> StreamReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Reads exactly `buf.len()` bytes, failing on end-of-stream.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner
            .read_exact(buf)
            .map_err(RestoreError::StreamTruncated)
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_word(&mut self) -> Result<u64> {
        let mut buf = [0u8; WORD_SIZE];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_words(&mut self, out: &mut [u64]) -> Result<()> {
        for slot in out {
            *slot = self.read_word()?;
        }
        Ok(())
    }

    pub fn read_vcpu_context(&mut self) -> Result<VcpuContext> {
        let mut buf = vec![0u8; VcpuContext::SIZE];
        self.read_exact(&mut buf)?;
        Ok(VcpuContext::read_from(&buf))
    }

    /// Consumes the extended-info preamble that follows the sentinel.
    ///
    /// Returns the context carried by a `vcpu` chunk if one was present;
    /// chunks with any other signature are read and discarded. A chunk
    /// reaching past the declared total length is fatal.
    pub fn read_extended_info(&mut self) -> Result<Option<VcpuContext>> {
        let total = u64::from(self.read_u32()?);
        let mut consumed = 0u64;
        let mut ctx = None;

        while consumed < total {
            if total - consumed < 8 {
                return Err(RestoreError::StreamInvalid(
                    "extended-info chunk header overruns declared length",
                ));
            }
            let mut sig = [0u8; 4];
            self.read_exact(&mut sig)?;
            let len = u64::from(self.read_u32()?);
            consumed += 8;
            if consumed + len > total {
                return Err(RestoreError::StreamInvalid(
                    "extended-info chunk payload overruns declared length",
                ));
            }

            if sig == CHUNK_SIG_VCPU {
                if (len as usize) < VcpuContext::SIZE {
                    return Err(RestoreError::StreamInvalid(
                        "vcpu chunk shorter than a context record",
                    ));
                }
                debug!("extended info carries a vcpu context");
                ctx = Some(self.read_vcpu_context()?);
                self.skip(len as usize - VcpuContext::SIZE)?;
            } else {
                trace!(
                    "skipping extended-info chunk {:?} ({len} bytes)",
                    String::from_utf8_lossy(&sig)
                );
                self.skip(len as usize)?;
            }
            consumed += len;
        }

        Ok(ctx)
    }

    fn skip(&mut self, mut n: usize) -> Result<()> {
        let mut scratch = [0u8; 256];
        while n > 0 {
            let take = n.min(scratch.len());
            self.read_exact(&mut scratch[..take])?;
            n -= take;
        }
        Ok(())
    }
}
