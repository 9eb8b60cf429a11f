//! PRP construction: turning a byte count into (PRP1, PRP2) plus the DMA
//! pages behind them.
//!
//! Layouts follow the NVMe data-pointer rules: one page → PRP1 only; two
//! pages → PRP1 + PRP2; more → PRP1 is the first data page and PRP2 points
//! at a PRP list page. A list page holds `MPS / 8` entries; whenever more
//! entries remain than fit, the final slot chains to the next list page.
//! Chains extend to arbitrary transfer sizes.
//!
//! [`Prp::from_parts`] builds a zero-copy view from addresses already in a
//! command, for the simulator side where IOVAs are host addresses.

use core::ptr;

use crate::error::Result;
use crate::memory::{DmaRegion, MemoryManager};
use crate::platform::DmaDirection;

pub struct Prp {
    num_bytes: usize,
    mps: usize,
    prp1: u64,
    prp2: u64,
    data_regions: Vec<DmaRegion>,
    list_regions: Vec<DmaRegion>,
    /// View mode: addresses came from a command and are dereferenced
    /// directly (only valid where IOVA == vaddr).
    view: bool,
}

impl core::fmt::Debug for Prp {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Prp")
            .field("num_bytes", &self.num_bytes)
            .field("prp1", &format_args!("0x{:x}", self.prp1))
            .field("prp2", &format_args!("0x{:x}", self.prp2))
            .field("data_pages", &self.data_page_count())
            .field("list_pages", &self.list_regions.len())
            .field("view", &self.view)
            .finish()
    }
}

impl Prp {
    /// Data pages needed for `num_bytes`.
    fn data_pages(num_bytes: usize, mps: usize) -> usize {
        num_bytes.max(1).div_ceil(mps)
    }

    /// List pages needed on top of the data pages. Each list page carries
    /// `MPS/8 - 1` data entries; the final slot is reserved for the chain
    /// pointer and written only when entries remain.
    fn list_pages(num_bytes: usize, mps: usize) -> usize {
        let data = Self::data_pages(num_bytes, mps);
        if data <= 2 {
            return 0;
        }
        let per_page = mps / 8 - 1;
        (data - 1).div_ceil(per_page)
    }

    /// Total pages an allocation of `num_bytes` consumes.
    pub fn pages_needed(num_bytes: usize, mps: usize) -> usize {
        Self::data_pages(num_bytes, mps) + Self::list_pages(num_bytes, mps)
    }

    /// Allocates data (and list) pages from `mem` and lays out the PRP
    /// entries. Data pages map with `direction`; list pages are always
    /// host-to-device since the controller reads them.
    pub fn alloc(
        mem: &mut MemoryManager,
        num_bytes: usize,
        direction: DmaDirection,
        tag: &str,
    ) -> Result<Prp> {
        let mps = mem.page_size();
        let data_count = Self::data_pages(num_bytes, mps);

        let mut data_regions = Vec::with_capacity(data_count);
        for _ in 0..data_count {
            data_regions.push(mem.malloc(mps, direction, tag)?);
        }

        let mut prp = Prp {
            num_bytes,
            mps,
            prp1: data_regions[0].iova,
            prp2: 0,
            data_regions,
            list_regions: Vec::new(),
            view: false,
        };

        match data_count {
            1 => {}
            2 => prp.prp2 = prp.data_regions[1].iova,
            _ => {
                let list_count = Self::list_pages(num_bytes, mps);
                for _ in 0..list_count {
                    prp.list_regions
                        .push(mem.malloc(mps, DmaDirection::HostToDevice, tag)?);
                }
                prp.fill_lists();
                prp.prp2 = prp.list_regions[0].iova;
            }
        }
        Ok(prp)
    }

    fn fill_lists(&mut self) {
        let per_page = self.mps / 8 - 1;
        let mut entries: Vec<u64> = self.data_regions[1..].iter().map(|r| r.iova).collect();
        for (page_idx, list) in self.list_regions.iter().enumerate() {
            let take = entries.len().min(per_page);
            for (slot, iova) in entries.drain(..take).enumerate() {
                unsafe {
                    ptr::write((list.vaddr + slot * 8) as *mut u64, iova);
                }
            }
            if !entries.is_empty() {
                let next = &self.list_regions[page_idx + 1];
                unsafe {
                    ptr::write((list.vaddr + per_page * 8) as *mut u64, next.iova);
                }
            }
        }
        debug_assert!(self.list_regions.is_empty() || self.data_regions.len() > 2);
    }

    /// Zero-copy view from the addresses carried in a command. Only valid
    /// where device addresses are host addresses (the simulator side).
    pub fn from_parts(prp1: u64, prp2: u64, num_bytes: usize, mps: usize) -> Prp {
        Prp {
            num_bytes,
            mps,
            prp1,
            prp2,
            data_regions: Vec::new(),
            list_regions: Vec::new(),
            view: true,
        }
    }

    pub fn prp1(&self) -> u64 {
        self.prp1
    }

    pub fn prp2(&self) -> u64 {
        self.prp2
    }

    pub fn num_bytes(&self) -> usize {
        self.num_bytes
    }

    fn data_page_count(&self) -> usize {
        Self::data_pages(self.num_bytes, self.mps)
    }

    /// Host addresses of the data pages, in transfer order.
    fn page_addrs(&self) -> Vec<usize> {
        if !self.view {
            return self.data_regions.iter().map(|r| r.vaddr).collect();
        }

        let total = self.data_page_count();
        let mut addrs = Vec::with_capacity(total);
        addrs.push(self.prp1 as usize);
        match total {
            0 | 1 => {}
            2 => addrs.push(self.prp2 as usize),
            _ => {
                let per_page = self.mps / 8 - 1;
                let mut remaining = total - 1;
                let mut list = self.prp2 as usize;
                while remaining > 0 {
                    let take = remaining.min(per_page);
                    for slot in 0..take {
                        let entry = unsafe { ptr::read((list + slot * 8) as *const u64) };
                        addrs.push(entry as usize);
                    }
                    remaining -= take;
                    if remaining > 0 {
                        list = unsafe { ptr::read((list + per_page * 8) as *const u64) } as usize;
                    }
                }
            }
        }
        addrs
    }

    /// Concatenates the visible bytes across the data pages.
    pub fn get_data_buffer(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.num_bytes);
        let mut remaining = self.num_bytes;
        for addr in self.page_addrs() {
            let take = remaining.min(self.mps);
            unsafe {
                out.extend_from_slice(core::slice::from_raw_parts(addr as *const u8, take));
            }
            remaining -= take;
            if remaining == 0 {
                break;
            }
        }
        out
    }

    /// Writes `data` into the data pages in order. Writing fewer bytes
    /// than the transfer size leaves the tail untouched.
    pub fn set_data_buffer(&self, data: &[u8]) {
        let mut offset = 0;
        let limit = data.len().min(self.num_bytes);
        for addr in self.page_addrs() {
            if offset >= limit {
                break;
            }
            let take = (limit - offset).min(self.mps);
            unsafe {
                ptr::copy_nonoverlapping(data[offset..].as_ptr(), addr as *mut u8, take);
            }
            offset += take;
        }
    }

    /// Releases every page this PRP allocated.
    pub fn free_all_memory(&mut self, mem: &mut MemoryManager) -> Result<()> {
        for region in self.data_regions.drain(..).chain(self.list_regions.drain(..)) {
            mem.free(&region)?;
        }
        Ok(())
    }

    /// Regions owned by this PRP (empty for views).
    pub fn regions(&self) -> impl Iterator<Item = &DmaRegion> {
        self.data_regions.iter().chain(self.list_regions.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::SimPlatform;
    use crate::sim::bars::SimBars;

    const MPS: usize = 4096;

    fn manager() -> MemoryManager {
        MemoryManager::new(SimPlatform::new(SimBars::new().unwrap()), MPS).unwrap()
    }

    #[test]
    fn pages_needed_matches_layout_rules() {
        assert_eq!(Prp::pages_needed(MPS, MPS), 1);
        assert_eq!(Prp::pages_needed(2 * MPS, MPS), 2);
        assert_eq!(Prp::pages_needed(3 * MPS, MPS), 4);
        assert_eq!(Prp::pages_needed(4 * MPS, MPS), 5);
        assert_eq!(Prp::pages_needed(16 * MPS, MPS), 17);
        // 2 MiB: 512 data pages, the 511 list entries fit one list page.
        assert_eq!(Prp::pages_needed(2 * 1024 * 1024, MPS), 513);
        // One byte past 2 MiB forces a chained second list page.
        assert_eq!(Prp::pages_needed(2 * 1024 * 1024 + 1, MPS), 515);
    }

    #[test]
    fn single_page_has_no_prp2() {
        let mut mem = manager();
        let prp = Prp::alloc(&mut mem, 512, DmaDirection::DeviceToHost, "t").unwrap();
        assert_ne!(prp.prp1(), 0);
        assert_eq!(prp.prp2(), 0);
    }

    #[test]
    fn two_pages_are_distinct() {
        let mut mem = manager();
        let prp = Prp::alloc(&mut mem, MPS + 1, DmaDirection::DeviceToHost, "t").unwrap();
        assert_ne!(prp.prp1(), 0);
        assert_ne!(prp.prp2(), 0);
        assert_ne!(prp.prp1(), prp.prp2());
        assert_eq!(mem.allocated_list().len(), 2);
    }

    #[test]
    fn chained_list_round_trips_data() {
        let mut mem = manager();
        let bytes = 5 * MPS;
        let prp = Prp::alloc(&mut mem, bytes, DmaDirection::HostToDevice, "t").unwrap();
        assert_eq!(mem.allocated_list().len(), 6);

        let pattern: Vec<u8> = (0..bytes).map(|i| (i % 251) as u8).collect();
        prp.set_data_buffer(&pattern);

        // The simulator-side view over the same addresses sees the same
        // bytes (identity IOVAs in tests).
        let view = Prp::from_parts(prp.prp1(), prp.prp2(), bytes, MPS);
        assert_eq!(view.get_data_buffer(), pattern);

        // And writes through the view land in the allocation.
        let inverse: Vec<u8> = pattern.iter().map(|b| !b).collect();
        view.set_data_buffer(&inverse);
        assert_eq!(prp.get_data_buffer(), inverse);
    }

    #[test]
    fn partial_set_leaves_tail() {
        let mut mem = manager();
        let prp = Prp::alloc(&mut mem, 2 * MPS, DmaDirection::HostToDevice, "t").unwrap();
        prp.set_data_buffer(&vec![0xED; 2 * MPS]);
        prp.set_data_buffer(&vec![0x11; MPS]);
        let buf = prp.get_data_buffer();
        assert!(buf[..MPS].iter().all(|b| *b == 0x11));
        assert!(buf[MPS..].iter().all(|b| *b == 0xED));
    }

    #[test]
    fn free_all_memory_releases_pages() {
        let mut mem = manager();
        let mut prp = Prp::alloc(&mut mem, 10 * MPS, DmaDirection::HostToDevice, "t").unwrap();
        assert_eq!(mem.allocated_list().len(), 11);
        prp.free_all_memory(&mut mem).unwrap();
        assert!(mem.allocated_list().is_empty());
    }

    #[test]
    fn beyond_two_mebibytes_chains() {
        let mut mem = manager();
        let bytes = 2 * 1024 * 1024 + MPS;
        let prp = Prp::alloc(&mut mem, bytes, DmaDirection::HostToDevice, "t").unwrap();
        assert_eq!(mem.allocated_list().len(), 513 + 2);
        // The view walks the chain to the last page.
        let view = Prp::from_parts(prp.prp1(), prp.prp2(), bytes, MPS);
        assert_eq!(view.get_data_buffer().len(), bytes);
    }
}
