//! In-process NVMe controller simulator (`nvsim`).
//!
//! The simulator owns the register backing for one controller and runs the
//! device side of the MMIO contract on a background thread: it diffs the
//! register files, reacts to CC.EN transitions and FLR, drains submission
//! queues through the doorbells and posts completions with inverted phase.
//! The host-side driver code runs against it unmodified.

pub mod bars;
pub mod handlers;
pub mod namespace;
pub mod thread;

use std::sync::Arc;

use log::{debug, info};

use crate::cmd::admin::{
    IdentifyController, IdentifyNamespace, LbaFormat, NamespaceList, UuidList,
};
use crate::cmd::{Cqe, StatusField};
use crate::error::Result;
use crate::platform::sim::SimPlatform;
use crate::queue::CompQueue;
use crate::regs::nvme::{Cap, NvmeRegs, Vs};
use crate::regs::pcie::{
    self, MemConfig, PcieRegs, CAP_ID_EXPRESS, CAP_ID_MSI, CAP_ID_MSIX, CAP_ID_POWER_MGMT,
    CAP_LEN_EXPRESS, CAP_LEN_MSI, CAP_LEN_POWER_MGMT, EXT_CAP_ID_AER, EXT_CAP_ID_SERIAL,
    EXT_CAP_LEN_AER,
};
use crate::registry::QueueRegistry;
use crate::sim::bars::SimBars;
use crate::sim::handlers::{admin_table, nvm_table, HandlerFn};
use crate::sim::namespace::{idema_lbas_512, SimNamespace, SimNamespaceConfig};

pub use thread::{NvSim, NvSimHandle};

/// PCI identity of the simulated controller.
pub const SIM_VID: u16 = 0xEDDA;
pub const SIM_DID: u16 = 0xE771;

/// NVM commands handled per drain pass across the I/O queues.
const NVM_CMDS_PER_PASS: u32 = 100;

/// Configuration of one simulated controller.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub namespaces: Vec<SimNamespaceConfig>,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            serial: "EDDAE771".into(),
            model: "nvsim_0.1".into(),
            firmware: "0.001".into(),
            namespaces: vec![SimNamespaceConfig {
                block_size: 512,
                num_lbas: idema_lbas_512(50),
                path: None,
            }],
        }
    }
}

/// The simulator's internal controller state, owned by its thread.
pub struct SimState {
    pub bars: Arc<SimBars>,
    pub platform: Arc<SimPlatform>,
    pub config: SimConfig,
    pub pcie: PcieRegs,
    pub nvme: NvmeRegs,
    pub mps: usize,
    /// Device-side queue bookkeeping.
    pub registry: QueueRegistry,
    /// CQs created but not yet claimed by a Create I/O SQ.
    pub pending_cqs: Vec<CompQueue>,
    /// Index = NSID; 0 is never valid.
    pub namespaces: Vec<Option<SimNamespace>>,
    pub id_ctrl: IdentifyController,
    pub id_ns: Vec<Option<IdentifyNamespace>>,
    pub id_ns_list: NamespaceList,
    pub id_uuid: UuidList,
    pub power_state: u8,
    pub express_cap_offset: u8,
    admin_handlers: [HandlerFn; 256],
    nvm_handlers: [HandlerFn; 256],
}

impl SimState {
    pub fn new(
        bars: Arc<SimBars>,
        platform: Arc<SimPlatform>,
        config: SimConfig,
    ) -> Result<SimState> {
        let pcie = PcieRegs::new(Arc::new(MemConfig::new(bars.pcie.mmio())));
        let nvme = NvmeRegs::new(bars.nvme.mmio());

        let mut namespaces: Vec<Option<SimNamespace>> = vec![None];
        for (idx, ns_config) in config.namespaces.iter().enumerate() {
            namespaces.push(Some(SimNamespace::new(idx as u32 + 1, ns_config)?));
        }

        let mut state = SimState {
            bars,
            platform,
            config,
            pcie,
            nvme,
            mps: 4096,
            registry: QueueRegistry::new(),
            pending_cqs: Vec::new(),
            namespaces,
            id_ctrl: IdentifyController::zeroed(),
            id_ns: Vec::new(),
            id_ns_list: NamespaceList::zeroed(),
            id_uuid: UuidList::zeroed(),
            power_state: 0,
            express_cap_offset: 0,
            admin_handlers: admin_table(),
            nvm_handlers: nvm_table(),
        };
        state.init_registers();
        state.init_identify_data();
        Ok(state)
    }

    /// Hardware-FLR equivalent: registers cleared and re-initialized,
    /// queue state dropped, namespace backings re-created.
    pub fn reset(&mut self) -> Result<()> {
        info!(target: "nvsim", "function level reset");
        self.registry = QueueRegistry::new();
        self.pending_cqs.clear();
        self.power_state = 0;
        for ns in self.namespaces.iter_mut().flatten() {
            ns.init_storage()?;
        }
        self.init_registers();
        self.init_identify_data();
        Ok(())
    }

    fn init_registers(&mut self) {
        self.bars.pcie.clear();
        self.bars.nvme.clear();
        self.init_pcie_capabilities();

        let raw = self.pcie.raw();
        raw.write16(pcie::CFG_VID, SIM_VID);
        raw.write16(pcie::CFG_DID, SIM_DID);

        self.nvme
            .set_cap(Cap(0).with_mqes(4095).with_css(0x40).with_to(20));
        self.nvme.set_vs(Vs::from_parts(2, 1, 0));
        // CC comes up zeroed: MPS 0 means 4 KiB pages.
        self.mps = 4096;
    }

    /// Lays out the generic capability chain at 0x40 and the extended
    /// chain at 0x100.
    fn init_pcie_capabilities(&mut self) {
        let raw = self.pcie.raw();

        let caps: [(u8, u8); 4] = [
            (CAP_ID_POWER_MGMT, CAP_LEN_POWER_MGMT),
            (CAP_ID_MSI, CAP_LEN_MSI),
            (CAP_ID_EXPRESS, CAP_LEN_EXPRESS),
            (CAP_ID_MSIX, pcie::CAP_LEN_MSIX),
        ];
        let mut offset = pcie::CFG_CAP_BASE;
        raw.write8(pcie::CFG_CAP_PTR, offset);
        for (i, (id, len)) in caps.iter().enumerate() {
            if *id == CAP_ID_EXPRESS {
                self.express_cap_offset = offset;
            }
            let next = if i + 1 == caps.len() { 0 } else { offset + len };
            raw.write8(offset as usize, *id);
            raw.write8(offset as usize + 1, next);
            offset += len;
        }

        let ext_caps: [(u16, u16); 2] = [
            (EXT_CAP_ID_AER, EXT_CAP_LEN_AER),
            (EXT_CAP_ID_SERIAL, pcie::EXT_CAP_LEN_SERIAL),
        ];
        let mut offset = pcie::CFG_EXT_CAP_BASE;
        for (i, (id, len)) in ext_caps.iter().enumerate() {
            let next = if i + 1 == ext_caps.len() { 0 } else { offset + len };
            let header = *id as u32 | 1 << 16 | (next as u32) << 20;
            raw.write32(offset as usize, header);
            offset += len;
        }

        // Capability list present.
        raw.write16(pcie::CFG_STS, pcie::PciStatus::CAP_LIST.bits());
    }

    fn init_identify_data(&mut self) {
        let mut id = IdentifyController::zeroed();
        id.vid = SIM_VID;
        id.ssvid = SIM_VID;
        id.set_serial(&self.config.serial);
        id.set_model(&self.config.model);
        id.set_firmware(&self.config.firmware);
        id.nn = (self.namespaces.len() - 1) as u32;
        id.mdts = 5;
        id.sqes = 0x66;
        id.cqes = 0x44;
        // Five power states.
        id.npss = 4;
        for (i, mp) in [2500u16, 2200, 2000, 1500, 1000].iter().enumerate() {
            id.psd[i].mp = *mp;
        }
        self.id_ctrl = id;

        self.id_ns = vec![None];
        self.id_ns_list = NamespaceList::zeroed();
        let mut list_slot = 0;
        for (idx, slot) in self.namespaces.iter().enumerate().skip(1) {
            let ns = match slot {
                Some(ns) => ns,
                None => {
                    self.id_ns.push(None);
                    continue;
                }
            };
            let mut data = IdentifyNamespace::zeroed();
            data.nsze = ns.num_lbas();
            data.ncap = ns.num_lbas();
            data.nuse = 0;
            data.nlbaf = 1;
            data.flbas = if ns.block_size() == 512 { 0 } else { 1 };
            data.set_lbaf(0, LbaFormat::new(0, 9, 0));
            data.set_lbaf(1, LbaFormat::new(0, 12, 0));
            self.id_ns.push(Some(data));
            self.id_ns_list.ids[list_slot] = idx as u32;
            list_slot += 1;
        }

        self.id_uuid = UuidList::zeroed();
        for i in 0..16 {
            self.id_uuid.entries[i].uuid[0] = i as u8 + 1;
        }
    }

    /// CC.EN 0 → 1: validate the admin queue addresses and go ready.
    pub fn enable(&mut self) -> Result<()> {
        let aqa = self.nvme.aqa();
        let asq = self.nvme.asq();
        let acq = self.nvme.acq();
        debug!(
            target: "nvsim",
            "enable: ASQS {} ASQB 0x{:x} ACQS {} ACQB 0x{:x}",
            aqa.asqs(), asq, aqa.acqs(), acq
        );

        let asq_entries = aqa.asqs() as u32 + 1;
        let acq_entries = aqa.acqs() as u32 + 1;
        Self::touch(asq as usize, asq_entries as usize * 64);
        Self::touch(acq as usize, acq_entries as usize * 16);

        let sq = crate::queue::SubQueue::new(
            asq as usize,
            asq,
            asq_entries,
            0,
            self.nvme.sq_tail_doorbell(0),
        );
        let cq = CompQueue::new(
            acq as usize,
            acq,
            acq_entries,
            0,
            self.nvme.cq_head_doorbell(0),
            Some(0),
        );
        self.registry.add(sq, cq);

        let mut csts = self.nvme.csts();
        csts.set_rdy(true);
        self.nvme.set_csts(csts);
        debug!(target: "nvsim", "ready (CSTS.RDY = 1)");
        Ok(())
    }

    /// Reads the first and last byte so a bad queue address faults here,
    /// at the point of programming, not mid-drain.
    pub(crate) fn touch(vaddr: usize, size: usize) {
        unsafe {
            core::ptr::read_volatile(vaddr as *const u8);
            core::ptr::read_volatile((vaddr + size - 1) as *const u8);
        }
    }

    /// CC.EN 1 → 0: drop ready and all queue state; the host re-inits
    /// admin queues after a disable.
    pub fn disable(&mut self) {
        let mut csts = self.nvme.csts();
        csts.set_rdy(false);
        self.nvme.set_csts(csts);
        self.registry = QueueRegistry::new();
        self.pending_cqs.clear();
        debug!(target: "nvsim", "disabled (CSTS.RDY = 0)");
    }

    /// Drains the admin SQ to completion, then round-robins the I/O SQs
    /// under a per-pass quota.
    pub fn check_commands(&mut self) -> Result<()> {
        loop {
            let sqe = match self.registry.get(Some(0), Some(0)) {
                Ok(row) => row.0.as_mut().and_then(|sq| sq.get_command()),
                Err(_) => None,
            };
            match sqe {
                Some(sqe) => {
                    let handler = self.admin_handlers[sqe.opc() as usize];
                    handler(self, &sqe, 0, 0)?;
                }
                None => break,
            }
        }

        let io_keys: Vec<(u16, u16)> = self
            .registry
            .keys()
            .into_iter()
            .filter(|(sqid, _)| *sqid != 0)
            .collect();
        if io_keys.is_empty() {
            return Ok(());
        }

        let mut quota = {
            let mut pending = 0;
            for &(sqid, cqid) in &io_keys {
                if let Ok(row) = self.registry.get(Some(sqid), Some(cqid)) {
                    if let Some(sq) = row.0.as_ref() {
                        pending += sq.pending();
                    }
                }
            }
            pending.min(NVM_CMDS_PER_PASS)
        };

        while quota > 0 {
            let mut progressed = false;
            for &(sqid, cqid) in &io_keys {
                let sqe = match self.registry.get(Some(sqid), Some(cqid)) {
                    Ok(row) => row.0.as_mut().and_then(|sq| sq.get_command()),
                    Err(_) => None,
                };
                if let Some(sqe) = sqe {
                    let handler = self.nvm_handlers[sqe.opc() as usize];
                    handler(self, &sqe, sqid, cqid)?;
                    progressed = true;
                    quota -= 1;
                    if quota == 0 {
                        break;
                    }
                }
            }
            if !progressed {
                break;
            }
        }
        Ok(())
    }

    /// Posts a completion for `cid` on the (sqid, cqid) pair, carrying the
    /// simulator SQ's current head and pending the CQ's MSI-X vector.
    pub fn complete(
        &mut self,
        cid: u16,
        sqid: u16,
        cqid: u16,
        status: crate::cmd::status::Status,
        dw0: u32,
    ) -> Result<()> {
        let sqhd = self
            .registry
            .get(Some(sqid), None)?
            .0
            .as_ref()
            .map(|sq| sq.head_value() as u16)
            .unwrap_or(0);

        let vector = {
            let row = self.registry.get(None, Some(cqid))?;
            let cq = row
                .1
                .as_mut()
                .ok_or(crate::error::NvmeError::UnknownQueuePair(sqid, cqid))?;
            let mut sf = StatusField(0);
            sf.set_sct(status.0);
            sf.set_sc(status.1);
            cq.post_completion(Cqe {
                dw0,
                dw1: 0,
                sqhd,
                sqid,
                cid,
                status: sf.0,
            })?;
            cq.int_vector()
        };
        if let Some(v) = vector {
            self.platform.pend_vector(v);
        }

        if status != crate::cmd::status::SUCCESS {
            info!(
                target: "nvsim",
                "command CID 0x{:x} completed with \"{}\"",
                cid,
                crate::cmd::status::name(status.0, status.1)
            );
        }
        Ok(())
    }

    /// NSID validity against the configured namespaces.
    pub fn valid_nsid(&self, nsid: u32) -> bool {
        nsid != 0 && (nsid as usize) < self.namespaces.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> SimState {
        let bars = SimBars::new().unwrap();
        let platform = SimPlatform::new(bars.clone());
        let config = SimConfig {
            namespaces: vec![SimNamespaceConfig::with_num_lbas(64, 512)],
            ..SimConfig::default()
        };
        SimState::new(bars, platform, config).unwrap()
    }

    #[test]
    fn test_identity_registers_after_init() {
        let state = state();
        assert_eq!(state.pcie.vid(), SIM_VID);
        assert_eq!(state.pcie.did(), SIM_DID);
        assert_eq!(state.id_ctrl.serial_string(), "EDDAE771");
        assert_eq!(state.id_ctrl.model_string(), "nvsim_0.1");
        assert_eq!(state.id_ctrl.firmware_string(), "0.001");
        assert_eq!(state.id_ctrl.nn, 1);
    }

    #[test]
    fn test_capability_chain_after_init() {
        let state = state();
        let express = state.pcie.find_capability(CAP_ID_EXPRESS);
        assert_eq!(express.map(|c| c.offset), Some(state.express_cap_offset));
        assert!(state.pcie.find_capability(CAP_ID_MSIX).is_some());
        assert_eq!(state.pcie.extended_capabilities().len(), 2);
    }

    #[test]
    fn test_nvme_registers_after_init() {
        let state = state();
        assert_eq!(state.nvme.cap().css(), 0x40);
        assert_eq!(state.nvme.cap().mqes(), 4095);
        assert_eq!(state.nvme.vs().major(), 2);
        assert!(!state.nvme.cc().en());
        assert!(!state.nvme.csts().rdy());
    }

    #[test]
    fn test_reset_restores_identity() {
        let mut state = state();
        state.power_state = 3;
        let mut csts = state.nvme.csts();
        csts.set_rdy(true);
        state.nvme.set_csts(csts);

        state.reset().unwrap();
        assert_eq!(state.power_state, 0);
        assert!(!state.nvme.csts().rdy());
        assert_eq!(state.id_ctrl.serial_string(), "EDDAE771");
    }
}
