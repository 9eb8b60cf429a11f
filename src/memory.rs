//! DMA-safe memory: backing chunks, sub-page accounting and IOVA
//! assignment.
//!
//! Backing memory comes in 2 MiB physically-contiguous chunks (hugepages
//! when the system grants them, anonymous pages otherwise) and is split
//! into host-MPS-sized sub-pages. An allocation is a contiguous run of free
//! sub-pages with one IOVA mapped through the platform for the whole run.
//! Freed memory is unmapped, zeroed and returned to the pool.

use std::sync::Arc;

use log::{debug, warn};

use crate::error::{NvmeError, Result};
use crate::platform::{DmaDirection, DmaMapper, IovaMode, IovaRange};

/// Backing chunk size; also the upper bound for one allocation.
pub const BACKING_CHUNK_SIZE: usize = 2 * 1024 * 1024;

/// Pool growth limit.
const MAX_BACKING_CHUNKS: usize = 64;

/// Fixed IOVA slot size handed out by the range allocator.
const IOVA_SLOT_SIZE: u64 = BACKING_CHUNK_SIZE as u64;

/// Upper bound on pre-computed IOVA slots.
const MAX_IOVA_SLOTS: usize = 4096;

/// Zero reads poorly in a debugger; the allocator starts ranges here.
const IOVA_FLOOR: u64 = 0x2370_0000;

/// One DMA region handed out by [`MemoryManager::malloc`]. The manager
/// retains ownership of the pages; the region is the caller's handle for
/// access and for freeing.
#[derive(Debug, Clone)]
pub struct DmaRegion {
    pub vaddr: usize,
    pub iova: u64,
    pub size: usize,
    pub direction: DmaDirection,
    pub tag: String,
    pub mapped: bool,
}

impl DmaRegion {
    /// The region's bytes. Valid until the region is freed.
    ///
    /// # Safety
    /// The caller must not hold this slice across `free`/`free_all`, and
    /// must not race device writes into the same region.
    pub unsafe fn bytes_mut(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(self.vaddr as *mut u8, self.size)
    }
}

struct BackingChunk {
    base: *mut u8,
    size: usize,
}

unsafe impl Send for BackingChunk {}

impl BackingChunk {
    fn alloc() -> Result<Self> {
        // Prefer hugepage backing; fall back to anonymous pages so the
        // simulator works on unconfigured hosts.
        let flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
        let mut base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                BACKING_CHUNK_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                flags | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            debug!(target: "memory", "hugepage mmap failed, using anonymous pages");
            base = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    BACKING_CHUNK_SIZE,
                    libc::PROT_READ | libc::PROT_WRITE,
                    flags,
                    -1,
                    0,
                )
            };
        }
        if base == libc::MAP_FAILED {
            return Err(NvmeError::last_os("mmap backing chunk"));
        }
        Ok(BackingChunk {
            base: base as *mut u8,
            size: BACKING_CHUNK_SIZE,
        })
    }
}

impl Drop for BackingChunk {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base as *mut libc::c_void, self.size) };
    }
}

struct SubPage {
    vaddr: usize,
    in_use: bool,
}

struct Allocation {
    region: DmaRegion,
    first_page: usize,
    num_pages: usize,
}

enum IovaAllocator {
    /// IOVA == vaddr (simulator).
    Identity,
    /// Fixed 2 MiB slots drawn from the platform's reported ranges.
    Slots { free: Vec<u64> },
}

impl IovaAllocator {
    fn from_mode(mode: IovaMode) -> Self {
        match mode {
            IovaMode::Identity => IovaAllocator::Identity,
            IovaMode::Ranges(ranges) => IovaAllocator::Slots {
                free: Self::build_slots(&ranges),
            },
        }
    }

    fn build_slots(ranges: &[IovaRange]) -> Vec<u64> {
        let mut slots = Vec::new();
        for range in ranges {
            let mut next = if range.start == 0 { IOVA_FLOOR } else { range.start };
            while next + IOVA_SLOT_SIZE <= range.end && slots.len() < MAX_IOVA_SLOTS {
                slots.push(next);
                next += IOVA_SLOT_SIZE;
            }
            if slots.len() >= MAX_IOVA_SLOTS {
                break;
            }
        }
        slots
    }

    fn get(&mut self, vaddr: usize, size: usize) -> Result<u64> {
        match self {
            IovaAllocator::Identity => Ok(vaddr as u64),
            IovaAllocator::Slots { free } => {
                debug_assert!(size as u64 <= IOVA_SLOT_SIZE);
                if free.is_empty() {
                    return Err(NvmeError::OutOfMemory);
                }
                Ok(free.remove(0))
            }
        }
    }

    fn put(&mut self, iova: u64) {
        if let IovaAllocator::Slots { free } = self {
            free.push(iova);
        }
    }
}

/// The DMA memory manager (one per controller handle).
pub struct MemoryManager {
    mapper: Arc<dyn DmaMapper>,
    page_size: usize,
    chunks: Vec<BackingChunk>,
    pages: Vec<SubPage>,
    allocations: Vec<Allocation>,
    iova: IovaAllocator,
}

impl MemoryManager {
    /// Creates a manager splitting backing chunks into `page_size` pages,
    /// with one chunk allocated up front.
    pub fn new(mapper: Arc<dyn DmaMapper>, page_size: usize) -> Result<Self> {
        assert!(page_size.is_power_of_two() && page_size >= 4096);
        let iova = IovaAllocator::from_mode(mapper.iova_mode());
        let mut mgr = MemoryManager {
            mapper,
            page_size,
            chunks: Vec::new(),
            pages: Vec::new(),
            allocations: Vec::new(),
            iova,
        };
        mgr.grow(1)?;
        Ok(mgr)
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    fn grow(&mut self, num_chunks: usize) -> Result<()> {
        for _ in 0..num_chunks {
            if self.chunks.len() >= MAX_BACKING_CHUNKS {
                return Err(NvmeError::OutOfMemory);
            }
            let chunk = BackingChunk::alloc()?;
            for page_idx in 0..chunk.size / self.page_size {
                self.pages.push(SubPage {
                    vaddr: chunk.base as usize + page_idx * self.page_size,
                    in_use: false,
                });
            }
            self.chunks.push(chunk);
        }
        Ok(())
    }

    fn free_page_count(&self) -> usize {
        self.pages.iter().filter(|p| !p.in_use).count()
    }

    /// Finds a run of `n` free pages at adjacent vaddrs.
    fn find_run(&self, n: usize) -> Option<usize> {
        if n == 0 || n > self.pages.len() {
            return None;
        }
        'outer: for start in 0..=(self.pages.len() - n) {
            for i in 0..n {
                let page = &self.pages[start + i];
                if page.in_use {
                    continue 'outer;
                }
                if i > 0 && self.pages[start + i - 1].vaddr + self.page_size != page.vaddr {
                    continue 'outer;
                }
            }
            return Some(start);
        }
        None
    }

    /// Allocates a contiguous region of at least `size` bytes, assigns an
    /// IOVA and maps it through the platform for `direction`.
    pub fn malloc(&mut self, size: usize, direction: DmaDirection, tag: &str) -> Result<DmaRegion> {
        if matches!(direction, DmaDirection::Bidirectional) {
            return Err(NvmeError::UnsupportedDirection);
        }

        let rounded = size.max(1).div_ceil(self.page_size) * self.page_size;
        if rounded > BACKING_CHUNK_SIZE {
            return Err(NvmeError::OutOfMemory);
        }
        let pages_needed = rounded / self.page_size;

        let first_page = loop {
            if let Some(start) = self.find_run(pages_needed) {
                break start;
            }
            // Grow the pool and retry; grow fails once the limit is hit.
            let missing = pages_needed.saturating_sub(self.free_page_count());
            let chunks = missing.div_ceil(BACKING_CHUNK_SIZE / self.page_size).max(1);
            self.grow(chunks)?;
        };

        for page in &mut self.pages[first_page..first_page + pages_needed] {
            page.in_use = true;
        }
        let vaddr = self.pages[first_page].vaddr;

        let iova = match self.iova.get(vaddr, rounded) {
            Ok(iova) => iova,
            Err(e) => {
                for page in &mut self.pages[first_page..first_page + pages_needed] {
                    page.in_use = false;
                }
                return Err(e);
            }
        };

        if let Err(e) = self.mapper.map_dma(vaddr, iova, rounded, direction) {
            for page in &mut self.pages[first_page..first_page + pages_needed] {
                page.in_use = false;
            }
            self.iova.put(iova);
            return Err(e);
        }

        let region = DmaRegion {
            vaddr,
            iova,
            size: rounded,
            direction,
            tag: tag.to_string(),
            mapped: true,
        };
        self.allocations.push(Allocation {
            region: region.clone(),
            first_page,
            num_pages: pages_needed,
        });
        Ok(region)
    }

    /// Unmaps, zeroes and returns a region to the pool.
    pub fn free(&mut self, region: &DmaRegion) -> Result<()> {
        let idx = match self
            .allocations
            .iter()
            .position(|a| a.region.vaddr == region.vaddr)
        {
            Some(idx) => idx,
            None => {
                warn!(target: "memory", "free of untracked region 0x{:x}", region.vaddr);
                return Ok(());
            }
        };
        let alloc = self.allocations.remove(idx);

        if alloc.region.mapped {
            self.mapper
                .unmap_dma(alloc.region.iova, alloc.region.size)?;
        }
        unsafe {
            core::ptr::write_bytes(alloc.region.vaddr as *mut u8, 0, alloc.region.size);
        }
        for page in &mut self.pages[alloc.first_page..alloc.first_page + alloc.num_pages] {
            page.in_use = false;
        }
        self.iova.put(alloc.region.iova);
        Ok(())
    }

    /// Frees every outstanding region.
    pub fn free_all(&mut self) -> Result<()> {
        let regions: Vec<DmaRegion> = self.allocations.iter().map(|a| a.region.clone()).collect();
        for region in &regions {
            self.free(region)?;
        }
        Ok(())
    }

    /// Outstanding regions, for diagnostics.
    pub fn allocated_list(&self) -> Vec<DmaRegion> {
        self.allocations.iter().map(|a| a.region.clone()).collect()
    }
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        if !self.allocations.is_empty() {
            let _ = self.free_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::SimPlatform;
    use crate::sim::bars::SimBars;

    fn manager() -> MemoryManager {
        MemoryManager::new(SimPlatform::new(SimBars::new().unwrap()), 4096).unwrap()
    }

    #[test]
    fn malloc_rounds_to_page_size() {
        let mut mgr = manager();
        let region = mgr.malloc(100, DmaDirection::HostToDevice, "test").unwrap();
        assert_eq!(region.size, 4096);
        assert_eq!(region.iova, region.vaddr as u64);
        assert_eq!(mgr.allocated_list().len(), 1);
        mgr.free(&region).unwrap();
        assert!(mgr.allocated_list().is_empty());
    }

    #[test]
    fn multi_page_runs_are_vaddr_contiguous() {
        let mut mgr = manager();
        let region = mgr
            .malloc(3 * 4096, DmaDirection::DeviceToHost, "test")
            .unwrap();
        assert_eq!(region.size, 3 * 4096);
        // Whole run is addressable as one slice.
        unsafe {
            let bytes = region.bytes_mut();
            bytes[0] = 0xAA;
            bytes[3 * 4096 - 1] = 0xBB;
        }
        mgr.free(&region).unwrap();
    }

    #[test]
    fn free_zeroes_memory() {
        let mut mgr = manager();
        let region = mgr.malloc(4096, DmaDirection::HostToDevice, "test").unwrap();
        unsafe { region.bytes_mut()[10] = 0xED };
        let vaddr = region.vaddr;
        mgr.free(&region).unwrap();

        let again = mgr.malloc(4096, DmaDirection::HostToDevice, "test").unwrap();
        assert_eq!(again.vaddr, vaddr, "pool reuses the freed run first");
        assert_eq!(unsafe { again.bytes_mut()[10] }, 0);
        mgr.free(&again).unwrap();
    }

    #[test]
    fn bidirectional_is_rejected() {
        let mut mgr = manager();
        assert_eq!(
            mgr.malloc(4096, DmaDirection::Bidirectional, "test").err(),
            Some(NvmeError::UnsupportedDirection)
        );
    }

    #[test]
    fn oversized_request_fails() {
        let mut mgr = manager();
        assert_eq!(
            mgr.malloc(BACKING_CHUNK_SIZE + 1, DmaDirection::HostToDevice, "test")
                .err(),
            Some(NvmeError::OutOfMemory)
        );
    }

    #[test]
    fn pool_grows_on_demand() {
        let mut mgr = manager();
        // More than one chunk's worth of pages.
        let mut regions = Vec::new();
        for i in 0..3 {
            regions.push(
                mgr.malloc(BACKING_CHUNK_SIZE, DmaDirection::HostToDevice, &format!("r{}", i))
                    .unwrap(),
            );
        }
        assert_eq!(mgr.allocated_list().len(), 3);
        mgr.free_all().unwrap();
        assert!(mgr.allocated_list().is_empty());
    }
}
