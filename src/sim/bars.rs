//! Register backing storage for the simulated controller.
//!
//! The driver's "device" side and the simulator's "host" side share these
//! buffers: the driver sees them as BAR0 / config space through
//! [`MmioRegion`] views, the simulator diffs them byte-wise on its thread.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::Arc;

use crate::error::{NvmeError, Result};
use crate::regs::nvme::BAR0_SIZE;
use crate::regs::pcie::CONFIG_SPACE_SIZE;
use crate::regs::MmioRegion;

/// A page-aligned, zero-initialized register file.
pub struct RegisterFile {
    ptr: *mut u8,
    len: usize,
    layout: Layout,
}

unsafe impl Send for RegisterFile {}
unsafe impl Sync for RegisterFile {}

impl RegisterFile {
    pub fn new(len: usize) -> Result<Self> {
        let layout = Layout::from_size_align(len, 4096)
            .map_err(|_| NvmeError::UnsupportedConfig(format!("{} byte register window", len)))?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(NvmeError::OutOfMemory);
        }
        Ok(RegisterFile { ptr, len, layout })
    }

    /// A volatile view of the whole file; keeps the file alive.
    pub fn mmio(self: &Arc<Self>) -> MmioRegion {
        MmioRegion::new(self.ptr, self.len, self.clone())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Clears the file to all zeroes (volatile, the driver may be watching).
    pub fn clear(self: &Arc<Self>) {
        let mmio = self.mmio();
        for i in 0..self.len {
            mmio.write8(i, 0);
        }
    }
}

impl Drop for RegisterFile {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

/// The simulated controller's two register windows plus the mutex the
/// simulator holds around each diff-and-handle pass.
pub struct SimBars {
    pub pcie: Arc<RegisterFile>,
    pub nvme: Arc<RegisterFile>,
    pub lock: spin::Mutex<()>,
}

impl SimBars {
    pub fn new() -> Result<Arc<Self>> {
        Ok(Arc::new(SimBars {
            pcie: Arc::new(RegisterFile::new(CONFIG_SPACE_SIZE)?),
            nvme: Arc::new(RegisterFile::new(BAR0_SIZE)?),
            lock: spin::Mutex::new(()),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_file_starts_zeroed_and_round_trips() {
        let file = Arc::new(RegisterFile::new(4096).unwrap());
        let mmio = file.mmio();
        assert_eq!(mmio.read32(0x14), 0);
        mmio.write32(0x14, 0x0046_0001);
        assert_eq!(mmio.read32(0x14), 0x0046_0001);
        file.clear();
        assert_eq!(mmio.read32(0x14), 0);
    }

    #[test]
    fn views_share_backing() {
        let file = Arc::new(RegisterFile::new(64).unwrap());
        let a = file.mmio();
        let b = file.mmio();
        a.write8(7, 0xED);
        assert_eq!(b.read8(7), 0xED);
    }
}
