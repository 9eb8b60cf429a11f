//! Platform abstraction: a uniform view over the OS mechanism that exposes
//! a PCI device to userspace.
//!
//! Two implementations exist: [`vfio`] binds a real device through the
//! Linux VFIO character devices, and [`sim`] backs the same interface with
//! in-process memory for the controller simulator. Errors from this layer
//! are non-retryable.

pub mod sim;
pub mod vfio;

use std::sync::Arc;

use crate::error::Result;
use crate::regs::nvme::NvmeRegs;
use crate::regs::pcie::PcieRegs;

/// DMA transfer direction, as mapped through the IOMMU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    HostToDevice,
    DeviceToHost,
    Bidirectional,
}

/// One usable IOVA window reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IovaRange {
    pub start: u64,
    pub end: u64,
}

/// How the platform assigns IOVAs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IovaMode {
    /// Device addresses are host virtual addresses (simulator).
    Identity,
    /// IOVAs are drawn from the listed windows (IOMMU-backed binding).
    Ranges(Vec<IovaRange>),
}

/// DMA mapping operations the memory manager needs from a device binding.
pub trait DmaMapper: Send + Sync {
    fn map_dma(&self, vaddr: usize, iova: u64, size: usize, direction: DmaDirection)
        -> Result<()>;
    fn unmap_dma(&self, iova: u64, size: usize) -> Result<()>;
    fn iova_mode(&self) -> IovaMode;
}

/// One PCI device owned from userspace.
pub trait PciUserspaceDevice: DmaMapper {
    /// Platform slot identifier (PCI BDF, or the `nvsim` sentinel).
    fn slot(&self) -> &str;

    /// Typed view of the device's configuration space.
    fn pci_regs(&self) -> PcieRegs;

    /// Typed view of the NVMe register block at BAR0.
    fn nvme_regs(&self) -> NvmeRegs;

    /// Arms `nvec` MSI-X vectors starting at `start`.
    fn enable_msix(&self, nvec: u16, start: u16) -> Result<()>;

    /// Events pending on one vector since the last call; reading clears.
    fn msix_pending_count(&self, vector: u16) -> Result<u64>;

    /// Resets the device function through the binding.
    fn reset(&self) -> Result<()>;
}

/// Slots currently bound to the userspace driver.
pub fn exposed_devices() -> Vec<String> {
    vfio::exposed_devices()
}

/// Opens a physical device by slot. The `nvsim` sentinel is handled a layer
/// up, by [`crate::device::NvmeController::open`].
pub fn open_device(slot: &str) -> Result<Arc<dyn PciUserspaceDevice>> {
    Ok(Arc::new(vfio::VfioPciDevice::open(slot)?))
}
