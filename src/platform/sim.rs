//! In-process platform backing for the controller simulator.
//!
//! DMA mapping is a no-op and IOVAs are host virtual addresses; MSI-X
//! vectors are eventfd-like pending counters the simulator increments and
//! the driver reads-and-clears.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use crate::error::{NvmeError, Result};
use crate::platform::{DmaDirection, DmaMapper, IovaMode, PciUserspaceDevice};
use crate::regs::nvme::NvmeRegs;
use crate::regs::pcie::{MemConfig, PcieRegs};
use crate::sim::bars::SimBars;

/// Vectors the simulated MSI-X table can hold.
pub const SIM_MSIX_VECTORS: usize = 128;

pub struct SimPlatform {
    bars: Arc<SimBars>,
    msix_enabled: AtomicBool,
    msix_count: AtomicU64,
    pending: Vec<AtomicU64>,
}

impl SimPlatform {
    pub fn new(bars: Arc<SimBars>) -> Arc<Self> {
        let mut pending = Vec::with_capacity(SIM_MSIX_VECTORS);
        pending.resize_with(SIM_MSIX_VECTORS, || AtomicU64::new(0));
        Arc::new(SimPlatform {
            bars,
            msix_enabled: AtomicBool::new(false),
            msix_count: AtomicU64::new(0),
            pending,
        })
    }

    pub fn msix_enabled(&self) -> bool {
        self.msix_enabled.load(Ordering::Acquire)
    }

    /// Simulator side: record one interrupt on `vector`. Vectors beyond
    /// what the host armed are dropped, like an unprogrammed table entry.
    pub fn pend_vector(&self, vector: u16) {
        if !self.msix_enabled() || vector as u64 >= self.msix_count.load(Ordering::Acquire) {
            return;
        }
        if let Some(slot) = self.pending.get(vector as usize) {
            slot.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl DmaMapper for SimPlatform {
    fn map_dma(
        &self,
        _vaddr: usize,
        _iova: u64,
        _size: usize,
        direction: DmaDirection,
    ) -> Result<()> {
        if matches!(direction, DmaDirection::Bidirectional) {
            return Err(NvmeError::UnsupportedDirection);
        }
        Ok(())
    }

    fn unmap_dma(&self, _iova: u64, _size: usize) -> Result<()> {
        Ok(())
    }

    fn iova_mode(&self) -> IovaMode {
        IovaMode::Identity
    }
}

impl PciUserspaceDevice for SimPlatform {
    fn slot(&self) -> &str {
        crate::NVSIM_SLOT
    }

    fn pci_regs(&self) -> PcieRegs {
        PcieRegs::new(Arc::new(MemConfig::new(self.bars.pcie.mmio())))
    }

    fn nvme_regs(&self) -> NvmeRegs {
        NvmeRegs::new(self.bars.nvme.mmio())
    }

    fn enable_msix(&self, nvec: u16, start: u16) -> Result<()> {
        debug!(
            target: "platform",
            "nvsim: enabling {} msix vectors starting at {}", nvec, start
        );
        self.msix_count.store((start + nvec) as u64, Ordering::Release);
        self.msix_enabled.store(true, Ordering::Release);
        Ok(())
    }

    fn msix_pending_count(&self, vector: u16) -> Result<u64> {
        match self.pending.get(vector as usize) {
            Some(slot) => Ok(slot.swap(0, Ordering::AcqRel)),
            None => Ok(0),
        }
    }

    fn reset(&self) -> Result<()> {
        // Function-level reset is driven through the config-space IFLR bit;
        // the simulator thread reacts to the register change itself.
        let regs = self.pci_regs();
        regs.initiate_flr();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_counts_clear_on_read() {
        let platform = SimPlatform::new(SimBars::new().unwrap());
        platform.enable_msix(4, 0).unwrap();
        platform.pend_vector(2);
        platform.pend_vector(2);
        platform.pend_vector(3);
        assert_eq!(platform.msix_pending_count(2).unwrap(), 2);
        assert_eq!(platform.msix_pending_count(2).unwrap(), 0);
        assert_eq!(platform.msix_pending_count(3).unwrap(), 1);
    }

    #[test]
    fn pend_is_noop_until_enabled() {
        let platform = SimPlatform::new(SimBars::new().unwrap());
        platform.pend_vector(0);
        assert_eq!(platform.msix_pending_count(0).unwrap(), 0);
    }

    #[test]
    fn bidirectional_mapping_rejected() {
        let platform = SimPlatform::new(SimBars::new().unwrap());
        assert_eq!(
            platform.map_dma(0x1000, 0x1000, 4096, DmaDirection::Bidirectional),
            Err(NvmeError::UnsupportedDirection)
        );
        assert!(platform
            .map_dma(0x1000, 0x1000, 4096, DmaDirection::HostToDevice)
            .is_ok());
    }
}
