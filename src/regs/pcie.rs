//! PCIe configuration space overlay and capability enumeration.
//!
//! Config space is not memory-mappable on every binding (VFIO exposes it as
//! a pread/pwrite region), so access goes through [`ConfigAccess`] instead
//! of a bare pointer. The simulator backs it with plain memory; the VFIO
//! platform backs it with the device fd.

use std::sync::Arc;

use super::MmioRegion;

/// Size of the config space window the crate cares about (extended space).
pub const CONFIG_SPACE_SIZE: usize = 4096;

// Standard header offsets.
pub const CFG_VID: usize = 0x00;
pub const CFG_DID: usize = 0x02;
pub const CFG_CMD: usize = 0x04;
pub const CFG_STS: usize = 0x06;
pub const CFG_RID: usize = 0x08;
pub const CFG_CAP_PTR: usize = 0x34;

/// First generic capability lands here; the chain grows upward.
pub const CFG_CAP_BASE: u8 = 0x40;
/// Extended capabilities start at a fixed offset.
pub const CFG_EXT_CAP_BASE: u16 = 0x100;

// Generic capability IDs.
pub const CAP_ID_POWER_MGMT: u8 = 0x01;
pub const CAP_ID_MSI: u8 = 0x05;
pub const CAP_ID_EXPRESS: u8 = 0x10;
pub const CAP_ID_MSIX: u8 = 0x11;

// Extended capability IDs.
pub const EXT_CAP_ID_AER: u16 = 0x0001;
pub const EXT_CAP_ID_SERIAL: u16 = 0x0003;

// Capability structure sizes, used when the simulator lays out its chain.
pub const CAP_LEN_POWER_MGMT: u8 = 8;
pub const CAP_LEN_MSI: u8 = 24;
pub const CAP_LEN_EXPRESS: u8 = 0x3C;
pub const CAP_LEN_MSIX: u8 = 12;
pub const EXT_CAP_LEN_AER: u16 = 0x48;
pub const EXT_CAP_LEN_SERIAL: u16 = 12;

/// Device Control register within the express capability; bit 15 is
/// Initiate Function Level Reset.
pub const EXPRESS_DEVCTL_OFFSET: usize = 0x08;
pub const DEVCTL_IFLR: u16 = 1 << 15;

bitflags::bitflags! {
    /// CMD — PCI command register.
    pub struct PciCommand: u16 {
        const IO_SPACE = 1 << 0;
        const MEM_SPACE = 1 << 1;
        const BUS_MASTER = 1 << 2;
        const PARITY_ERR_RESPONSE = 1 << 6;
        const SERR_ENABLE = 1 << 8;
        const INTX_DISABLE = 1 << 10;
    }
}

bitflags::bitflags! {
    /// STS — PCI status register.
    pub struct PciStatus: u16 {
        const INTERRUPT = 1 << 3;
        const CAP_LIST = 1 << 4;
        const MASTER_DATA_PARITY_ERR = 1 << 8;
        const SIGNALED_TARGET_ABORT = 1 << 11;
        const RECEIVED_TARGET_ABORT = 1 << 12;
        const RECEIVED_MASTER_ABORT = 1 << 13;
        const SIGNALED_SYSTEM_ERR = 1 << 14;
        const DETECTED_PARITY_ERR = 1 << 15;
    }
}

/// Raw config-space accessor. Widths match what the bus supports; there is
/// no read-modify-write on status registers.
pub trait ConfigAccess: Send + Sync {
    fn read8(&self, offset: usize) -> u8;
    fn read16(&self, offset: usize) -> u16;
    fn read32(&self, offset: usize) -> u32;
    fn write8(&self, offset: usize, value: u8);
    fn write16(&self, offset: usize, value: u16);
    fn write32(&self, offset: usize, value: u32);
}

/// Memory-backed config space (simulator side).
pub struct MemConfig {
    mmio: MmioRegion,
}

impl MemConfig {
    pub fn new(mmio: MmioRegion) -> Self {
        MemConfig { mmio }
    }
}

impl ConfigAccess for MemConfig {
    fn read8(&self, offset: usize) -> u8 {
        self.mmio.read8(offset)
    }

    fn read16(&self, offset: usize) -> u16 {
        self.mmio.read16(offset)
    }

    fn read32(&self, offset: usize) -> u32 {
        self.mmio.read32(offset)
    }

    fn write8(&self, offset: usize, value: u8) {
        self.mmio.write8(offset, value)
    }

    fn write16(&self, offset: usize, value: u16) {
        self.mmio.write16(offset, value)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.mmio.write32(offset, value)
    }
}

/// A generic capability found by walking the chain at CAP_PTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub id: u8,
    pub offset: u8,
}

/// An extended capability found by walking the chain at 0x100.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtCapability {
    pub id: u16,
    pub offset: u16,
}

/// Typed view over one device's configuration space.
#[derive(Clone)]
pub struct PcieRegs {
    access: Arc<dyn ConfigAccess>,
}

impl PcieRegs {
    pub fn new(access: Arc<dyn ConfigAccess>) -> Self {
        PcieRegs { access }
    }

    pub fn vid(&self) -> u16 {
        self.access.read16(CFG_VID)
    }

    pub fn did(&self) -> u16 {
        self.access.read16(CFG_DID)
    }

    pub fn command(&self) -> PciCommand {
        PciCommand::from_bits_truncate(self.access.read16(CFG_CMD))
    }

    pub fn set_command(&self, cmd: PciCommand) {
        self.access.write16(CFG_CMD, cmd.bits())
    }

    pub fn status(&self) -> PciStatus {
        PciStatus::from_bits_truncate(self.access.read16(CFG_STS))
    }

    /// Sets or clears Bus Master Enable.
    pub fn set_bus_master(&self, enable: bool) {
        let mut cmd = self.command();
        cmd.set(PciCommand::BUS_MASTER, enable);
        self.set_command(cmd);
    }

    pub fn cap_ptr(&self) -> u8 {
        self.access.read8(CFG_CAP_PTR)
    }

    /// Walks the generic capability chain until the null terminator.
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        let mut offset = self.cap_ptr();
        // A malformed chain could loop; config space bounds the real count.
        for _ in 0..64 {
            if offset == 0 {
                break;
            }
            let id = self.access.read8(offset as usize);
            caps.push(Capability { id, offset });
            offset = self.access.read8(offset as usize + 1);
        }
        caps
    }

    pub fn find_capability(&self, id: u8) -> Option<Capability> {
        self.capabilities().into_iter().find(|c| c.id == id)
    }

    /// Walks the extended capability chain starting at 0x100.
    pub fn extended_capabilities(&self) -> Vec<ExtCapability> {
        let mut caps = Vec::new();
        let mut offset = CFG_EXT_CAP_BASE;
        for _ in 0..64 {
            if offset == 0 || offset as usize >= CONFIG_SPACE_SIZE {
                break;
            }
            let header = self.access.read32(offset as usize);
            let id = (header & 0xFFFF) as u16;
            if id == 0 {
                break;
            }
            caps.push(ExtCapability { id, offset });
            offset = (header >> 20) as u16 & 0xFFC;
        }
        caps
    }

    /// Sets the Initiate Function Level Reset bit in the express
    /// capability's device control register. The caller is responsible for
    /// the post-reset recovery sleep.
    pub fn initiate_flr(&self) -> bool {
        match self.find_capability(CAP_ID_EXPRESS) {
            Some(cap) => {
                let devctl_off = cap.offset as usize + EXPRESS_DEVCTL_OFFSET;
                let devctl = self.access.read16(devctl_off);
                self.access.write16(devctl_off, devctl | DEVCTL_IFLR);
                true
            }
            None => false,
        }
    }

    // Raw accessors for code that lays out config space (the simulator).
    pub fn raw(&self) -> &dyn ConfigAccess {
        &*self.access
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn mem_config() -> (PcieRegs, Arc<crate::sim::bars::RegisterFile>) {
        let file = Arc::new(crate::sim::bars::RegisterFile::new(CONFIG_SPACE_SIZE).unwrap());
        let regs = PcieRegs::new(Arc::new(MemConfig::new(file.mmio())));
        (regs, file)
    }

    #[test]
    fn command_register_bus_master() {
        let (regs, _file) = mem_config();
        assert!(!regs.command().contains(PciCommand::BUS_MASTER));
        regs.set_bus_master(true);
        assert!(regs.command().contains(PciCommand::BUS_MASTER));
        regs.set_bus_master(false);
        assert!(!regs.command().contains(PciCommand::BUS_MASTER));
    }

    #[test]
    fn capability_walk_terminates_on_null() {
        let (regs, _file) = mem_config();
        // CAP_PTR -> 0x40 (PM) -> 0x48 (express) -> null
        regs.raw().write8(CFG_CAP_PTR, 0x40);
        regs.raw().write8(0x40, CAP_ID_POWER_MGMT);
        regs.raw().write8(0x41, 0x48);
        regs.raw().write8(0x48, CAP_ID_EXPRESS);
        regs.raw().write8(0x49, 0x00);

        let caps = regs.capabilities();
        assert_eq!(caps.len(), 2);
        assert_eq!(caps[0].id, CAP_ID_POWER_MGMT);
        assert_eq!(caps[1].id, CAP_ID_EXPRESS);
        assert_eq!(
            regs.find_capability(CAP_ID_EXPRESS).map(|c| c.offset),
            Some(0x48)
        );
    }

    #[test]
    fn iflr_bit_set_through_express_cap() {
        let (regs, _file) = mem_config();
        regs.raw().write8(CFG_CAP_PTR, 0x40);
        regs.raw().write8(0x40, CAP_ID_EXPRESS);
        regs.raw().write8(0x41, 0x00);

        assert!(regs.initiate_flr());
        let devctl = regs.raw().read16(0x40 + EXPRESS_DEVCTL_OFFSET);
        assert_ne!(devctl & DEVCTL_IFLR, 0);
    }
}
