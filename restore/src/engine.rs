//! Restore orchestration: domain provisioning and the page-stream loop.

use std::io::Read;

use frames::{Mfn, Pfn, FRAMES_PER_P2M_PAGE, PAGE_SIZE};
use log::{debug, error, info, warn};

use crate::abi::{VcpuContext, VmAssist};
use crate::error::{RestoreError, Result};
use crate::hv::{DomId, Hypervisor};
use crate::mmu::MmuUpdateBatch;
use crate::platform::Platform;
use crate::stream::{StreamReader, EXTENDED_INFO_SENTINEL};
use crate::types::{decode_tagged_pfn, PageTag, PagingMode, PtLevel};
use crate::uncanon::rewrite_table;

/// Most pages carried by one stream batch and one foreign mapping.
pub const MAX_BATCH_SIZE: usize = 1024;

/// Caller-supplied restore parameters.
#[derive(Debug, Clone, Copy)]
pub struct RestoreParams {
    /// Size of the guest's pseudo-physical space, in frames.
    pub max_pfn: u64,
    /// Event channel to wire into the store ring after resume.
    pub store_evtchn: u32,
    /// Event channel for the console ring.
    pub console_evtchn: u32,
}

/// Caller-visible results of a completed restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreOutcome {
    /// Machine frame of the store ring, post-translation.
    pub store_mfn: Mfn,
    /// Machine frame of the console ring, post-translation.
    pub console_mfn: Mfn,
    /// Page-type races tolerated while rewriting page tables.
    pub pt_races: u64,
}

/// All state owned by one restore run.
///
/// Every table lives here rather than in process-wide statics; dropping
/// the value releases them on success and failure alike.
pub(crate) struct Restore<'hv, H: Hypervisor, R> {
    pub(crate) hv: &'hv mut H,
    pub(crate) dom: DomId,
    pub(crate) stream: StreamReader<R>,
    pub(crate) platform: Platform,
    pub(crate) params: RestoreParams,
    pub(crate) shared_info_mfn: Mfn,

    /// Restore-side PFN-to-MFN table, one entry per guest frame.
    pub(crate) p2m: Vec<Mfn>,
    /// Page-type classification as received from the stream.
    pub(crate) pfn_type: Vec<PageTag>,
    /// Frames holding the guest's own pseudo-physical map; PFNs until
    /// the tail fix-up translates them.
    pub(crate) p2m_frame_list: Vec<u64>,
    pub(crate) updates: MmuUpdateBatch,
    pub(crate) pt_races: u64,
    pub(crate) verify: bool,
}

impl<'hv, H: Hypervisor, R: Read> Restore<'hv, H, R> {
    pub(crate) fn new(
        hv: &'hv mut H,
        dom: DomId,
        stream: R,
        params: RestoreParams,
    ) -> Result<Self> {
        let platform = Platform::probe(hv, dom)?;
        let info = hv
            .domain_info(dom)
            .map_err(RestoreError::PlatformUnavailable)?;
        info!(
            "restoring domain {}: {} frames, {}-level paging",
            dom.0,
            params.max_pfn,
            platform.mode.levels()
        );
        Ok(Self {
            hv,
            dom,
            stream: StreamReader::new(stream),
            platform,
            params,
            shared_info_mfn: info.shared_info_mfn,
            p2m: Vec::new(),
            pfn_type: Vec::new(),
            p2m_frame_list: Vec::new(),
            updates: MmuUpdateBatch::new(dom),
            pt_races: 0,
            verify: false,
        })
    }

    pub(crate) fn run(&mut self) -> Result<RestoreOutcome> {
        self.provision_domain()?;

        let early_ctx = self.read_p2m_frame_list()?;
        let extended_cr3 = early_ctx
            .map_or(false, |ctx| ctx.vm_assist().contains(VmAssist::PAE_EXTENDED_CR3));

        self.load_pages(extended_cr3)?;

        // Reverse-map installs must land before any frame is moved or
        // pinned.
        self.updates.flush(self.hv)?;

        if self.platform.mode == PagingMode::ThreeLevel && !extended_cr3 {
            self.relocate_pae_tables()?;
        }

        self.pin_tables()?;
        self.trim_reservation()?;
        let outcome = self.fix_tail()?;

        info!(
            "restore of domain {} complete ({} page-type races)",
            self.dom.0, outcome.pt_races
        );
        Ok(outcome)
    }

    /// Sizes the domain and acquires its machine frames, producing the
    /// initial PFN-to-MFN table.
    fn provision_domain(&mut self) -> Result<()> {
        let max_pfn = self.params.max_pfn;
        if max_pfn == 0 {
            error!("caller asked to restore a guest with no frames");
            return Err(RestoreError::StreamInvalid("guest has no frames"));
        }

        self.hv.set_max_memory(self.dom, max_pfn).map_err(|err| {
            error!("set-max-memory failed: {err}");
            RestoreError::OutOfMemory("maximum-memory hint rejected")
        })?;

        let granted = self
            .hv
            .increase_reservation(self.dom, max_pfn)
            .map_err(|err| {
                error!("increase-reservation failed: {err}");
                RestoreError::OutOfMemory("reservation request rejected")
            })?;
        if granted != max_pfn {
            error!("reservation granted {granted} of {max_pfn} frames");
            return Err(RestoreError::OutOfMemory("domain reservation came up short"));
        }

        self.p2m = vec![Mfn::INVALID; max_pfn as usize];
        let listed = self.hv.pfn_list(self.dom, &mut self.p2m).map_err(|err| {
            error!("get-pfn-list failed: {err}");
            RestoreError::OutOfMemory("frame list unavailable")
        })?;
        if listed != max_pfn as usize {
            error!("frame list returned {listed} of {max_pfn} entries");
            return Err(RestoreError::OutOfMemory("frame list came up short"));
        }
        if let Some(mfn) = self.p2m.iter().find(|mfn| **mfn >= self.platform.max_mfn) {
            error!("allocation handed out frame {:#x} beyond the machine ceiling", mfn.as_u64());
            return Err(RestoreError::OutOfMemory("frame beyond the machine ceiling"));
        }

        self.pfn_type = vec![PageTag::Normal; max_pfn as usize];
        debug!("provisioned {max_pfn} frames for domain {}", self.dom.0);
        Ok(())
    }

    fn p2m_list_len(&self) -> usize {
        (self.params.max_pfn as usize).div_ceil(FRAMES_PER_P2M_PAGE)
    }

    /// Reads the pseudo-physical frame list, honouring the extended-info
    /// preamble if the sentinel announces one.
    fn read_p2m_frame_list(&mut self) -> Result<Option<VcpuContext>> {
        let entries = self.p2m_list_len();
        let first = self.stream.read_word()?;

        let mut ctx = None;
        self.p2m_frame_list = vec![0u64; entries];
        if first == EXTENDED_INFO_SENTINEL {
            ctx = self.stream.read_extended_info()?;
            self.stream.read_words(&mut self.p2m_frame_list)?;
        } else {
            self.p2m_frame_list[0] = first;
            self.stream.read_words(&mut self.p2m_frame_list[1..])?;
        }
        Ok(ctx)
    }

    /// The main batch loop: maps each batch's frames, replays page
    /// bodies, classifies types, and rewrites page-table pages.
    fn load_pages(&mut self, extended_cr3: bool) -> Result<()> {
        // Without extended-cr3 the top-level directories may move below
        // 4 GiB after the stream ends, so leaf tables cannot be rewritten
        // until those moves are final.
        let defer_l1 =
            self.platform.mode == PagingMode::ThreeLevel && !extended_cr3;

        let mut batch_words = vec![0u64; MAX_BATCH_SIZE];
        let mut region: Vec<(Pfn, PageTag)> = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut region_mfn: Vec<Mfn> = Vec::with_capacity(MAX_BATCH_SIZE);
        let mut scratch = vec![0u8; PAGE_SIZE];
        let mut batches = 0u64;

        loop {
            let j = self.stream.read_i32()?;
            if j == 0 {
                break;
            }
            if j == -1 {
                self.verify = !self.verify;
                info!("verify mode {}", if self.verify { "on" } else { "off" });
                continue;
            }
            if j < 0 || j as usize > MAX_BATCH_SIZE {
                error!("batch of {j} pages exceeds the wire limit");
                return Err(RestoreError::StreamInvalid("batch length out of range"));
            }
            let count = j as usize;

            self.stream.read_words(&mut batch_words[..count])?;
            region.clear();
            region_mfn.clear();
            for &word in &batch_words[..count] {
                let (pfn, tag) = decode_tagged_pfn(word)?;
                let mfn = if tag == PageTag::Unmapped {
                    // Placeholder; the slot is never touched.
                    Mfn::new(0)
                } else {
                    let Some(mfn) = self.p2m.get(pfn.as_usize()) else {
                        error!("batch names frame {:#x} outside the guest", pfn.as_u64());
                        return Err(RestoreError::StreamInvalid(
                            "batch frame number out of range",
                        ));
                    };
                    *mfn
                };
                region.push((pfn, tag));
                region_mfn.push(mfn);
            }

            let mut mapping = self
                .hv
                .map_foreign_batch(self.dom, true, &region_mfn)
                .map_err(|err| {
                    error!("foreign batch mapping failed: {err}");
                    RestoreError::OutOfMemory("foreign batch mapping failed")
                })?;

            for (i, &(pfn, tag)) in region.iter().enumerate() {
                if tag == PageTag::Unmapped {
                    continue;
                }
                let idx = pfn.as_usize();
                self.pfn_type[idx] = tag;

                let frame = &mut mapping[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
                let deferred = defer_l1 && tag.table_level() == Some(PtLevel::L1);
                let rewrite = tag.table_level().is_some() && !deferred;

                if self.verify {
                    self.stream.read_exact(&mut scratch)?;
                    if rewrite {
                        if let Err(race) = rewrite_table(&mut scratch, self.platform.mode, &self.p2m)
                        {
                            warn!(
                                "page-table race on frame {:#x} (entry named {:#x})",
                                pfn.as_u64(),
                                race.pfn
                            );
                            self.pt_races += 1;
                            continue;
                        }
                    }
                    let differing = scratch
                        .iter()
                        .zip(frame.iter())
                        .filter(|(a, b)| a != b)
                        .count();
                    if differing != 0 {
                        warn!(
                            "verify: frame {:#x} differs in {differing} bytes",
                            pfn.as_u64()
                        );
                    }
                } else if rewrite {
                    self.stream.read_exact(&mut scratch)?;
                    match rewrite_table(&mut scratch, self.platform.mode, &self.p2m) {
                        Ok(()) => frame.copy_from_slice(&scratch),
                        Err(race) => {
                            // The save side retyped this page after
                            // canonicalizing it; a later batch resupplies
                            // it. Leave the frame untouched.
                            warn!(
                                "page-table race on frame {:#x} (entry named {:#x})",
                                pfn.as_u64(),
                                race.pfn
                            );
                            self.pt_races += 1;
                            continue;
                        }
                    }
                } else {
                    self.stream.read_exact(frame)?;
                }

                self.updates.machphys(self.hv, self.p2m[idx], pfn)?;
            }

            drop(mapping);
            batches += 1;
        }

        debug!("received all pages in {batches} batches");
        Ok(())
    }
}
