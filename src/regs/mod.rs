//! Typed register access.
//!
//! Submodules overlay the PCIe configuration space and the NVMe controller
//! BAR0. All accesses go through [`MmioRegion`], which emits single aligned
//! volatile loads and stores; register values are never cached.

pub mod nvme;
pub mod pcie;

use core::ptr;
use std::sync::Arc;

/// A memory-mapped register window.
///
/// The region optionally keeps its backing storage alive (the simulator's
/// register file, or a VFIO BAR mapping owned by the platform handle).
/// Cloning yields another view onto the same window.
#[derive(Clone)]
pub struct MmioRegion {
    base: *mut u8,
    len: usize,
    _backing: Option<Arc<dyn core::any::Any + Send + Sync>>,
}

// The window is shared with the device by definition; all accesses are
// volatile and the driver serializes its own side.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// View over raw memory kept alive by `backing`.
    pub fn new(base: *mut u8, len: usize, backing: Arc<dyn core::any::Any + Send + Sync>) -> Self {
        MmioRegion {
            base,
            len,
            _backing: Some(backing),
        }
    }

    /// View over memory the caller guarantees outlives the region
    /// (e.g. an mmap held by the platform device handle).
    ///
    /// # Safety
    /// `base..base+len` must remain valid and mapped for the lifetime of the
    /// returned region and every clone of it.
    pub unsafe fn from_raw(base: *mut u8, len: usize) -> Self {
        MmioRegion {
            base,
            len,
            _backing: None,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base address of the window, for doorbell pointer math.
    pub(crate) fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    fn addr(&self, offset: usize, width: usize) -> *mut u8 {
        debug_assert!(offset + width <= self.len, "register access out of window");
        debug_assert!(offset % width == 0, "unaligned register access");
        unsafe { self.base.add(offset) }
    }

    #[inline]
    pub fn read8(&self, offset: usize) -> u8 {
        unsafe { ptr::read_volatile(self.addr(offset, 1)) }
    }

    #[inline]
    pub fn read16(&self, offset: usize) -> u16 {
        unsafe { ptr::read_volatile(self.addr(offset, 2) as *const u16) }
    }

    #[inline]
    pub fn read32(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile(self.addr(offset, 4) as *const u32) }
    }

    #[inline]
    pub fn read64(&self, offset: usize) -> u64 {
        unsafe { ptr::read_volatile(self.addr(offset, 8) as *const u64) }
    }

    #[inline]
    pub fn write8(&self, offset: usize, value: u8) {
        unsafe { ptr::write_volatile(self.addr(offset, 1), value) }
    }

    #[inline]
    pub fn write16(&self, offset: usize, value: u16) {
        unsafe { ptr::write_volatile(self.addr(offset, 2) as *mut u16, value) }
    }

    #[inline]
    pub fn write32(&self, offset: usize, value: u32) {
        unsafe { ptr::write_volatile(self.addr(offset, 4) as *mut u32, value) }
    }

    #[inline]
    pub fn write64(&self, offset: usize, value: u64) {
        unsafe { ptr::write_volatile(self.addr(offset, 8) as *mut u64, value) }
    }

    /// Volatile byte-wise snapshot of the whole window. Used by the
    /// simulator to diff register state between loop iterations.
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for i in 0..self.len {
            out.push(self.read8(i));
        }
        out
    }
}
