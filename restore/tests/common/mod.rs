//! Recording mock hypervisor and stream-building helpers shared by the
//! integration tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Cursor;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;

use frames::{Mfn, PAGE_SIZE};
use restore::abi::{StartInfo, VcpuContext, Wire};
use restore::error::HvError;
use restore::hv::{
    DomId, DomainInfo, HvResult, Hypervisor, MmuExtOp, MmuUpdate, ENOMEM, MMU_MACHPHYS_UPDATE,
};
use restore::types::{LPINTAB, LTAB_SHIFT, XTAB};

pub type PageStore = Rc<RefCell<HashMap<u64, Vec<u8>>>>;

/// Mock hypervisor backing domain memory with an mfn-indexed page store
/// and recording every operation the engine submits.
pub struct MockHv {
    pub mem: PageStore,
    /// Frames handed out in pseudo-physical order.
    pub frames: Vec<Mfn>,
    pub shared_info_mfn: Mfn,
    pub hvirt_start: u64,
    pub max_mfn: u64,
    pub levels: u32,
    pub next_low_mfn: u64,

    /// Flushed machphys installs, as `(mfn, pfn)` in submission order.
    pub machphys: Vec<(u64, u64)>,
    pub mmu_flushes: usize,
    pub pins: Vec<MmuExtOp>,
    pub decreases: Vec<Vec<u64>>,
    pub submitted: Vec<VcpuContext>,
    pub max_mem: Option<u64>,
    pub destroyed: bool,
    /// Coarse operation trace for ordering assertions.
    pub ops: Vec<&'static str>,

    pub fail_increase: bool,
}

impl MockHv {
    pub fn new(frames: &[u64], levels: u32) -> Self {
        let shared_info_mfn = Mfn::new(0x9999);
        let mem: PageStore = Rc::new(RefCell::new(HashMap::new()));
        mem.borrow_mut()
            .insert(shared_info_mfn.as_u64(), vec![0u8; PAGE_SIZE]);
        Self {
            mem,
            frames: frames.iter().copied().map(Mfn::new).collect(),
            shared_info_mfn,
            hvirt_start: 0xffff_8000_0000_0000,
            max_mfn: 1 << 36,
            levels,
            next_low_mfn: 0x500,
            machphys: Vec::new(),
            mmu_flushes: 0,
            pins: Vec::new(),
            decreases: Vec::new(),
            submitted: Vec::new(),
            max_mem: None,
            destroyed: false,
            ops: Vec::new(),
            fail_increase: false,
        }
    }

    pub fn page(&self, mfn: u64) -> Vec<u8> {
        self.mem.borrow()[&mfn].clone()
    }

    pub fn has_page(&self, mfn: u64) -> bool {
        self.mem.borrow().contains_key(&mfn)
    }

    fn map(&mut self, writable: bool, mfns: Vec<u64>) -> MockMapping {
        self.ops.push("map-foreign");
        let mut buf = vec![0u8; mfns.len() * PAGE_SIZE];
        {
            let mem = self.mem.borrow();
            for (i, mfn) in mfns.iter().enumerate() {
                if let Some(page) = mem.get(mfn) {
                    buf[i * PAGE_SIZE..(i + 1) * PAGE_SIZE].copy_from_slice(page);
                }
            }
        }
        MockMapping {
            mem: Rc::clone(&self.mem),
            mfns,
            buf,
            writable,
        }
    }
}

/// Foreign mapping over the page store; writable mappings copy back on
/// drop, like a real mapping going out of scope.
pub struct MockMapping {
    mem: PageStore,
    mfns: Vec<u64>,
    buf: Vec<u8>,
    writable: bool,
}

impl Deref for MockMapping {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for MockMapping {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

impl Drop for MockMapping {
    fn drop(&mut self) {
        if !self.writable {
            return;
        }
        let mut mem = self.mem.borrow_mut();
        for (i, mfn) in self.mfns.iter().enumerate() {
            if let Some(page) = mem.get_mut(mfn) {
                page.copy_from_slice(&self.buf[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]);
            }
        }
    }
}

impl Hypervisor for MockHv {
    type Mapping = MockMapping;

    fn max_machine_frame(&mut self) -> HvResult<Mfn> {
        Ok(Mfn::new(self.max_mfn))
    }

    fn hypervisor_virt_start(&mut self) -> HvResult<u64> {
        Ok(self.hvirt_start)
    }

    fn paging_levels(&mut self, _dom: DomId) -> HvResult<u32> {
        Ok(self.levels)
    }

    fn domain_info(&mut self, _dom: DomId) -> HvResult<DomainInfo> {
        Ok(DomainInfo {
            shared_info_mfn: self.shared_info_mfn,
        })
    }

    fn set_max_memory(&mut self, _dom: DomId, frames: u64) -> HvResult<()> {
        self.max_mem = Some(frames);
        Ok(())
    }

    fn increase_reservation(&mut self, _dom: DomId, frames: u64) -> HvResult<u64> {
        if self.fail_increase {
            return Err(HvError::new("increase-reservation", ENOMEM));
        }
        assert_eq!(frames as usize, self.frames.len());
        let mut mem = self.mem.borrow_mut();
        for mfn in &self.frames {
            mem.insert(mfn.as_u64(), vec![0u8; PAGE_SIZE]);
        }
        Ok(frames)
    }

    fn pfn_list(&mut self, _dom: DomId, out: &mut [Mfn]) -> HvResult<usize> {
        let count = out.len().min(self.frames.len());
        out[..count].copy_from_slice(&self.frames[..count]);
        Ok(count)
    }

    fn mmu_update(&mut self, _dom: DomId, updates: &[MmuUpdate]) -> HvResult<()> {
        self.ops.push("mmu-update");
        self.mmu_flushes += 1;
        for update in updates {
            assert_eq!(update.ptr & 3, MMU_MACHPHYS_UPDATE, "only machphys expected");
            self.machphys.push((update.ptr >> 12, update.val));
        }
        Ok(())
    }

    fn mmuext_op(&mut self, _dom: DomId, ops: &[MmuExtOp]) -> HvResult<()> {
        self.ops.push("mmuext-op");
        self.pins.extend_from_slice(ops);
        Ok(())
    }

    fn map_foreign_batch(
        &mut self,
        _dom: DomId,
        writable: bool,
        mfns: &[Mfn],
    ) -> HvResult<MockMapping> {
        Ok(self.map(writable, mfns.iter().map(|m| m.as_u64()).collect()))
    }

    fn map_foreign_range(
        &mut self,
        _dom: DomId,
        writable: bool,
        mfn: Mfn,
        count: usize,
    ) -> HvResult<MockMapping> {
        let mfns = (0..count as u64).map(|i| mfn.as_u64() + i).collect();
        Ok(self.map(writable, mfns))
    }

    fn make_page_below_4g(&mut self, _dom: DomId, mfn: Mfn) -> HvResult<Mfn> {
        self.ops.push("make-page-below-4g");
        let new = self.next_low_mfn;
        self.next_low_mfn += 1;
        let mut mem = self.mem.borrow_mut();
        mem.remove(&mfn.as_u64());
        mem.insert(new, vec![0u8; PAGE_SIZE]);
        Ok(Mfn::new(new))
    }

    fn decrease_reservation(&mut self, _dom: DomId, mfns: &[Mfn]) -> HvResult<u64> {
        self.ops.push("decrease-reservation");
        let list: Vec<u64> = mfns.iter().map(|m| m.as_u64()).collect();
        let mut mem = self.mem.borrow_mut();
        for mfn in &list {
            mem.remove(mfn);
        }
        self.decreases.push(list);
        Ok(mfns.len() as u64)
    }

    fn set_vcpu_context(&mut self, _dom: DomId, vcpu: u32, ctx: &VcpuContext) -> HvResult<()> {
        assert_eq!(vcpu, 0);
        self.ops.push("set-vcpu-context");
        self.submitted.push(*ctx);
        Ok(())
    }

    fn destroy_domain(&mut self, _dom: DomId) -> HvResult<()> {
        self.destroyed = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Stream building
// ---------------------------------------------------------------------

pub fn table_tag(pfn: u64, level: u64, pinned: bool) -> u64 {
    let mut nibble = level << LTAB_SHIFT;
    if pinned {
        nibble |= LPINTAB;
    }
    nibble | pfn
}

pub fn xtab_tag(pfn: u64) -> u64 {
    XTAB | pfn
}

#[derive(Default)]
pub struct StreamBuilder {
    buf: Vec<u8>,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn word(mut self, w: u64) -> Self {
        self.buf.extend_from_slice(&w.to_le_bytes());
        self
    }

    pub fn words(mut self, ws: &[u64]) -> Self {
        for &w in ws {
            self = self.word(w);
        }
        self
    }

    pub fn u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    pub fn i32(self, v: i32) -> Self {
        self.u32(v as u32)
    }

    pub fn bytes(mut self, b: &[u8]) -> Self {
        self.buf.extend_from_slice(b);
        self
    }

    /// One page body, zero-padded to a full page.
    pub fn page(mut self, body: &[u8]) -> Self {
        assert!(body.len() <= PAGE_SIZE);
        self.buf.extend_from_slice(body);
        self.buf.extend(std::iter::repeat(0u8).take(PAGE_SIZE - body.len()));
        self
    }

    /// A full batch: header, tagged words, then one body per non-absent
    /// entry.
    pub fn batch(mut self, entries: &[(u64, Option<&[u8]>)]) -> Self {
        self = self.i32(entries.len() as i32);
        for &(word, _) in entries {
            self = self.word(word);
        }
        for &(_, body) in entries {
            if let Some(body) = body {
                self = self.page(body);
            }
        }
        self
    }

    pub fn end_batches(self) -> Self {
        self.i32(0)
    }

    pub fn toggle_verify(self) -> Self {
        self.i32(-1)
    }

    pub fn absent_table(mut self, pfns: &[u64]) -> Self {
        self = self.u32(pfns.len() as u32);
        self.words(pfns)
    }

    pub fn context(mut self, ctx: &VcpuContext) -> Self {
        let mut body = vec![0u8; VcpuContext::SIZE];
        ctx.write_to(&mut body);
        self.buf.extend_from_slice(&body);
        self
    }

    /// Extended-info preamble: sentinel, total length, then the given
    /// chunks.
    pub fn extended_info(mut self, chunks: &[(&[u8; 4], Vec<u8>)]) -> Self {
        self = self.word(!0);
        let total: usize = chunks.iter().map(|(_, body)| 8 + body.len()).sum();
        self = self.u32(total as u32);
        for (sig, body) in chunks {
            self = self.bytes(&sig[..]).u32(body.len() as u32).bytes(body);
        }
        self
    }

    pub fn build(self) -> Cursor<Vec<u8>> {
        Cursor::new(self.buf)
    }
}

// ---------------------------------------------------------------------
// Guest page builders
// ---------------------------------------------------------------------

/// Page body with 8-byte entries at the given indices.
pub fn table_page64(entries: &[(usize, u64)]) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    for &(idx, val) in entries {
        page[idx * 8..(idx + 1) * 8].copy_from_slice(&val.to_le_bytes());
    }
    page
}

/// Page body with 4-byte entries at the given indices.
pub fn table_page32(entries: &[(usize, u32)]) -> Vec<u8> {
    let mut page = vec![0u8; PAGE_SIZE];
    for &(idx, val) in entries {
        page[idx * 4..(idx + 1) * 4].copy_from_slice(&val.to_le_bytes());
    }
    page
}

/// A start-info page whose ring frames still carry guest PFNs.
pub fn start_info_page(store_pfn: u64, console_pfn: u64) -> Vec<u8> {
    let mut si = unsafe { std::mem::zeroed::<StartInfo>() };
    si.magic[..8].copy_from_slice(b"xen-pv-\0");
    si.store_mfn = store_pfn;
    si.console.mfn = console_pfn;
    let mut page = vec![0u8; PAGE_SIZE];
    si.write_to(&mut page);
    page
}

/// A shared-info image with stale pending-event state that the restore
/// must clear.
pub fn dirty_shared_info() -> Vec<u8> {
    use restore::abi::SharedInfo;

    let mut shared = unsafe { std::mem::zeroed::<SharedInfo>() };
    shared.evtchn_pending[0] = 0xdead_beef;
    shared.vcpu_info[0].evtchn_pending_sel = 5;
    shared.evtchn_mask[1] = 0x77;
    shared.wc_sec = 1234;
    let mut page = vec![0u8; PAGE_SIZE];
    shared.write_to(&mut page);
    page
}
