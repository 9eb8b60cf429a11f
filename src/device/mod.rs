//! Controller driver: lifecycle state machine, queue bring-up and the
//! synchronous command path.
//!
//! One `NvmeController` owns one controller function and is driven from a
//! single thread. Commands are owned by the controller while outstanding
//! and handed back on completion; a timed-out command stays in the
//! outstanding table (its CID belongs to the device) until a late
//! completion surfaces it or `cc_disable` reclaims everything.

pub mod identify;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use crate::cmd::{status, Command};
use crate::error::{NvmeError, Result};
use crate::memory::{DmaRegion, MemoryManager};
use crate::platform::{self, DmaDirection, DmaMapper, IovaMode, PciUserspaceDevice};
use crate::prp::Prp;
use crate::queue::{CompQueue, SubQueue};
use crate::regs::nvme::{Aqa, NvmeRegs};
use crate::regs::pcie::PcieRegs;
use crate::registry::QueueRegistry;
use crate::sim::{NvSim, NvSimHandle, SimConfig};
use crate::NVSIM_SLOT;

pub use identify::{IdentifyData, NamespaceInfo};

use crate::cmd::{CQ_ENTRY_SIZE, SQ_ENTRY_SIZE};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Twice the PCIe worst-case FLR recovery time.
const FLR_RECOVERY_SLEEP: Duration = Duration::from_millis(200);

const CID_INIT: u16 = 0x1000;
const CID_MAX: u16 = 0xFFFE;

/// Completion delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntMode {
    Polling,
    Msix { vectors: u16, start: u16 },
}

/// Library-level configuration for one controller handle.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub asq_entries: u32,
    pub acq_entries: u32,
    pub num_io_queues: u16,
    pub queue_entries: u32,
    pub int_mode: IntMode,
    pub timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            asq_entries: 64,
            acq_entries: 256,
            num_io_queues: 10,
            queue_entries: 256,
            int_mode: IntMode::Polling,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Options for [`NvmeController::sync_cmd_with`].
#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub sqid: Option<u16>,
    pub cqid: Option<u16>,
    pub timeout: Duration,
    pub check: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        SyncOptions {
            sqid: None,
            cqid: None,
            timeout: DEFAULT_TIMEOUT,
            check: true,
        }
    }
}

/// Monotonic CID window with an in-use check against the outstanding
/// table; wrapping onto a still-outstanding CID skips it.
struct CidAllocator {
    next: u16,
}

impl CidAllocator {
    fn new() -> Self {
        CidAllocator { next: CID_INIT }
    }

    fn alloc(&mut self, outstanding: &BTreeMap<(u16, u16), Command>) -> Result<u16> {
        let window = (CID_MAX - CID_INIT) as usize;
        for _ in 0..window {
            let cid = self.next;
            self.next = if self.next + 1 >= CID_MAX {
                CID_INIT
            } else {
                self.next + 1
            };
            if !outstanding.keys().any(|(c, _)| *c == cid) {
                return Ok(cid);
            }
        }
        Err(NvmeError::CidExhausted)
    }
}

/// Forwards DMA mapping to the platform device without requiring trait
/// upcasting.
struct MapperAdapter(Arc<dyn PciUserspaceDevice>);

impl DmaMapper for MapperAdapter {
    fn map_dma(
        &self,
        vaddr: usize,
        iova: u64,
        size: usize,
        direction: DmaDirection,
    ) -> Result<()> {
        self.0.map_dma(vaddr, iova, size, direction)
    }

    fn unmap_dma(&self, iova: u64, size: usize) -> Result<()> {
        self.0.unmap_dma(iova, size)
    }

    fn iova_mode(&self) -> IovaMode {
        self.0.iova_mode()
    }
}

/// A userspace-owned NVMe controller.
pub struct NvmeController {
    slot: String,
    // Dropped first so the simulator thread is joined before DMA memory
    // and register backing go away.
    sim: Option<NvSimHandle>,
    platform: Arc<dyn PciUserspaceDevice>,
    pcie: PcieRegs,
    nvme: NvmeRegs,
    mem: MemoryManager,
    registry: QueueRegistry,
    outstanding: BTreeMap<(u16, u16), Command>,
    completed: Vec<Command>,
    cid: CidAllocator,
    int_mode: IntMode,
    num_msix_vectors: u16,
    mps: usize,
    queue_regions: Vec<DmaRegion>,
    identify: Option<IdentifyData>,
}

impl NvmeController {
    /// Opens a controller by slot; the `nvsim` sentinel selects the
    /// in-process simulator with its default configuration.
    pub fn open(slot: &str) -> Result<NvmeController> {
        if slot == NVSIM_SLOT {
            Self::open_sim(SimConfig::default())
        } else {
            let device = platform::open_device(slot)?;
            Self::from_platform(slot, device, None)
        }
    }

    /// Opens the in-process simulator with an explicit configuration.
    pub fn open_sim(config: SimConfig) -> Result<NvmeController> {
        let handle = NvSim::spawn(config)?;
        let device = handle.platform();
        Self::from_platform(NVSIM_SLOT, device, Some(handle))
    }

    fn from_platform(
        slot: &str,
        device: Arc<dyn PciUserspaceDevice>,
        sim: Option<NvSimHandle>,
    ) -> Result<NvmeController> {
        let pcie = device.pci_regs();
        let nvme = device.nvme_regs();
        let mps = 1usize << (12 + nvme.cc().mps() as usize);
        let mem = MemoryManager::new(Arc::new(MapperAdapter(device.clone())), mps)?;

        info!(target: "nvme", "{}: opened (MPS {} bytes)", slot, mps);
        Ok(NvmeController {
            slot: slot.to_string(),
            sim,
            platform: device,
            pcie,
            nvme,
            mem,
            registry: QueueRegistry::new(),
            outstanding: BTreeMap::new(),
            completed: Vec::new(),
            cid: CidAllocator::new(),
            int_mode: IntMode::Polling,
            num_msix_vectors: 0,
            mps,
            queue_regions: Vec::new(),
            identify: None,
        })
    }

    pub fn slot(&self) -> &str {
        &self.slot
    }

    /// Memory page size derived from CC.MPS.
    pub fn mps(&self) -> usize {
        self.mps
    }

    pub fn nvme_regs(&self) -> &NvmeRegs {
        &self.nvme
    }

    pub fn pci_regs(&self) -> &PcieRegs {
        &self.pcie
    }

    /// Commands currently owned by the device.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    pub fn io_sq_count(&self) -> usize {
        self.registry.io_sqids().len()
    }

    pub fn identify_data(&self) -> Option<&IdentifyData> {
        self.identify.as_ref()
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Disables the controller: clears BME and CC.EN, waits for RDY to
    /// fall, zeroes every doorbell and drops all queue and command state.
    /// With CSTS.CFS set the controller is treated as disabled after an
    /// error-level log.
    pub fn cc_disable(&mut self) -> Result<()> {
        self.cc_disable_timeout(DEFAULT_TIMEOUT)
    }

    pub fn cc_disable_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.pcie.set_bus_master(false);
        let mut cc = self.nvme.cc();
        cc.set_en(false);
        self.nvme.set_cc(cc);

        let deadline = Instant::now() + timeout;
        loop {
            let csts = self.nvme.csts();
            if csts.cfs() {
                error!(target: "nvme", "{}: disabling with CFS=1, not waiting for RDY", self.slot);
                break;
            }
            if !csts.rdy() {
                break;
            }
            if Instant::now() > deadline {
                return Err(NvmeError::DisableTimeout);
            }
            thread::yield_now();
        }

        self.nvme.zero_all_doorbells();
        self.drop_queue_state()?;
        Ok(())
    }

    /// All queues and outstanding commands are gone after a disable or an
    /// FLR; reclaim their memory.
    fn drop_queue_state(&mut self) -> Result<()> {
        self.registry = QueueRegistry::new();

        let outstanding = core::mem::take(&mut self.outstanding);
        for (_, mut cmd) in outstanding {
            if let Some(mut prp) = cmd.prp.take() {
                prp.free_all_memory(&mut self.mem)?;
            }
        }
        for mut cmd in self.completed.drain(..).collect::<Vec<_>>() {
            if let Some(mut prp) = cmd.prp.take() {
                prp.free_all_memory(&mut self.mem)?;
            }
        }
        for region in core::mem::take(&mut self.queue_regions) {
            self.mem.free(&region)?;
        }
        Ok(())
    }

    /// Enables the controller and waits for CSTS.RDY.
    pub fn cc_enable(&mut self) -> Result<()> {
        self.cc_enable_timeout(DEFAULT_TIMEOUT)
    }

    pub fn cc_enable_timeout(&mut self, timeout: Duration) -> Result<()> {
        let mut cc = self.nvme.cc();
        cc.set_en(true);
        self.nvme.set_cc(cc);

        let deadline = Instant::now() + timeout;
        loop {
            let csts = self.nvme.csts();
            if csts.cfs() {
                return Err(NvmeError::ControllerFatal);
            }
            if csts.rdy() {
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(NvmeError::EnableTimeout);
            }
            thread::yield_now();
        }
    }

    /// Function Level Reset through the express capability. Sleeps twice
    /// the PCIe worst-case recovery time; afterwards the controller is in
    /// RESET and all local queue state is dropped.
    pub fn initiate_flr(&mut self) -> Result<()> {
        info!(target: "nvme", "{}: initiating FLR", self.slot);
        if !self.pcie.initiate_flr() {
            warn!(target: "nvme", "{}: no express capability, cannot FLR", self.slot);
            return Err(NvmeError::PlatformUnavailable(self.slot.clone()));
        }
        thread::sleep(FLR_RECOVERY_SLEEP);

        self.drop_queue_state()?;
        self.identify = None;
        Ok(())
    }

    // =========================================================================
    // Queue bring-up
    // =========================================================================

    /// Disables the controller, allocates and programs the admin queue
    /// pair, and registers it at (0, 0). The caller enables afterwards.
    pub fn init_admin_queues(&mut self, asq_entries: u32, acq_entries: u32) -> Result<()> {
        assert!(asq_entries >= 2 && asq_entries <= 4096);
        assert!(acq_entries >= 2 && acq_entries <= 4096);

        self.cc_disable()?;

        let asq_mem = self
            .mem
            .malloc(SQ_ENTRY_SIZE * asq_entries as usize, DmaDirection::HostToDevice, "asq")?;
        let acq_mem = self
            .mem
            .malloc(CQ_ENTRY_SIZE * acq_entries as usize, DmaDirection::DeviceToHost, "acq")?;

        // Quiesce bus mastering while the admin queue registers change.
        self.pcie.set_bus_master(false);

        let mut aqa = Aqa(0);
        aqa.set_asqs(asq_entries as u16 - 1);
        aqa.set_acqs(acq_entries as u16 - 1);
        self.nvme.set_aqa(aqa);
        self.nvme.set_asq(asq_mem.iova);
        self.nvme.set_acq(acq_mem.iova);

        let mut cc = self.nvme.cc();
        cc.set_iosqes(6);
        cc.set_iocqes(4);
        if self.nvme.cap().css() == 0x40 {
            cc.set_css(0x06);
        }
        self.nvme.set_cc(cc);

        self.pcie.set_bus_master(true);

        let sq = SubQueue::new(
            asq_mem.vaddr,
            asq_mem.iova,
            asq_entries,
            0,
            self.nvme.sq_tail_doorbell(0),
        );
        let cq = CompQueue::new(
            acq_mem.vaddr,
            acq_mem.iova,
            acq_entries,
            0,
            self.nvme.cq_head_doorbell(0),
            Some(0),
        );
        self.registry.add(sq, cq);
        self.queue_regions.push(asq_mem);
        self.queue_regions.push(acq_mem);
        Ok(())
    }

    /// Arms MSI-X and switches completion waiting to the vector counters.
    pub fn init_msix_interrupts(&mut self, vectors: u16, start: u16) -> Result<()> {
        self.platform.enable_msix(vectors, start)?;
        self.num_msix_vectors = start + vectors;
        self.int_mode = IntMode::Msix { vectors, start };
        Ok(())
    }

    /// Creates one I/O queue pair: CQ first, then the SQ bound to it.
    /// Either command failure propagates after freeing what this call
    /// allocated.
    pub fn create_io_queue_pair(
        &mut self,
        cq_entries: u32,
        cq_id: u16,
        cq_iv: u16,
        sq_entries: u32,
        sq_id: u16,
    ) -> Result<()> {
        let iv = match self.int_mode {
            IntMode::Msix { .. } => {
                assert!(
                    cq_iv < self.num_msix_vectors,
                    "interrupt vector {} beyond the {} armed",
                    cq_iv,
                    self.num_msix_vectors
                );
                Some(cq_iv)
            }
            IntMode::Polling => None,
        };

        let cq_mem = self.mem.malloc(
            CQ_ENTRY_SIZE * cq_entries as usize,
            DmaDirection::DeviceToHost,
            &format!("iocq_{}", cq_id),
        )?;
        let create_cq = Command::create_io_cq(cq_id, cq_entries, cq_mem.iova, iv, true);
        if let Err(e) = self.sync_cmd(create_cq) {
            self.mem.free(&cq_mem)?;
            return Err(e);
        }

        let sq_mem = match self.mem.malloc(
            SQ_ENTRY_SIZE * sq_entries as usize,
            DmaDirection::HostToDevice,
            &format!("iosq_{}", sq_id),
        ) {
            Ok(mem) => mem,
            Err(e) => {
                self.mem.free(&cq_mem)?;
                return Err(e);
            }
        };
        let create_sq = Command::create_io_sq(sq_id, sq_entries, sq_mem.iova, cq_id, 0, true, 0);
        if let Err(e) = self.sync_cmd_with(
            create_sq,
            SyncOptions {
                timeout: Duration::from_secs(1),
                ..Default::default()
            },
        ) {
            self.mem.free(&sq_mem)?;
            self.mem.free(&cq_mem)?;
            return Err(e);
        }

        let sq = SubQueue::new(
            sq_mem.vaddr,
            sq_mem.iova,
            sq_entries,
            sq_id,
            self.nvme.sq_tail_doorbell(sq_id),
        );
        let cq = CompQueue::new(
            cq_mem.vaddr,
            cq_mem.iova,
            cq_entries,
            cq_id,
            self.nvme.cq_head_doorbell(cq_id),
            iv,
        );
        self.registry.add(sq, cq);
        self.queue_regions.push(sq_mem);
        self.queue_regions.push(cq_mem);
        Ok(())
    }

    /// Creates `num_queues` I/O pairs with qid = vector = 1..=n.
    pub fn create_io_queues(&mut self, num_queues: u16, queue_entries: u32) -> Result<()> {
        let aqa = self.nvme.aqa();
        assert!(
            aqa.asqs() != 0 && aqa.acqs() != 0 && self.nvme.asq() != 0 && self.nvme.acq() != 0,
            "admin queues are not initialized"
        );

        for qid in 1..=num_queues {
            self.create_io_queue_pair(queue_entries, qid, qid, queue_entries, qid)?;
        }
        Ok(())
    }

    /// Deletes every non-admin queue: all SQs first, then the CQs.
    pub fn delete_io_queues(&mut self) -> Result<()> {
        let opts = || SyncOptions {
            timeout: Duration::from_secs(1),
            ..Default::default()
        };

        for (sqid, cqid) in self.registry.keys() {
            if sqid == 0 && cqid == 0 {
                continue;
            }
            self.sync_cmd_with(Command::delete_io_sq(sqid), opts())?;
            self.registry.remove_sq(sqid);
        }
        for (sqid, cqid) in self.registry.keys() {
            if sqid == 0 && cqid == 0 {
                continue;
            }
            self.sync_cmd_with(Command::delete_io_cq(cqid), opts())?;
            self.registry.remove_cq(cqid);
        }
        Ok(())
    }

    // =========================================================================
    // Command path
    // =========================================================================

    /// Attaches PRP-backed transfer buffers sized from the command's
    /// declared data lengths; data-out bytes are copied in.
    pub fn alloc(&mut self, cmd: &mut Command) -> Result<()> {
        if cmd.prp.is_some() {
            return Ok(());
        }
        if let Some(data) = cmd.data_out.as_ref() {
            let prp = Prp::alloc(
                &mut self.mem,
                data.len(),
                DmaDirection::HostToDevice,
                cmd.kind().name(),
            )?;
            prp.set_data_buffer(data);
            cmd.sqe.prp1 = prp.prp1();
            cmd.sqe.prp2 = prp.prp2();
            cmd.prp = Some(prp);
        } else if cmd.data_in_len() > 0 {
            let prp = Prp::alloc(
                &mut self.mem,
                cmd.data_in_len(),
                DmaDirection::DeviceToHost,
                cmd.kind().name(),
            )?;
            cmd.sqe.prp1 = prp.prp1();
            cmd.sqe.prp2 = prp.prp2();
            cmd.prp = Some(prp);
        }
        Ok(())
    }

    /// Submits without waiting. Picks the SQ (admin, or round-robin I/O),
    /// assigns a CID, posts, rings the tail doorbell and records the
    /// command as outstanding. Returns (sqid, cqid, cid).
    pub fn start_cmd(
        &mut self,
        mut cmd: Command,
        sqid: Option<u16>,
        cqid: Option<u16>,
    ) -> Result<(u16, u16, u16)> {
        assert!(!cmd.posted && !cmd.complete, "command already used");
        self.alloc(&mut cmd)?;

        let sqid = match sqid {
            Some(s) => s,
            None if cmd.is_admin() => 0,
            None => self
                .registry
                .next_iosq_id()
                .ok_or(NvmeError::UnknownQueuePair(u16::MAX, u16::MAX))?,
        };

        let cid = self.cid.alloc(&self.outstanding)?;
        cmd.sqe.set_cid(cid);

        let mut full = false;
        let resolved_cqid;
        {
            let row = self.registry.get(Some(sqid), cqid)?;
            let cq = row
                .1
                .as_ref()
                .ok_or(NvmeError::UnknownQueuePair(sqid, cqid.unwrap_or(u16::MAX)))?;
            resolved_cqid = cq.qid();
            let sq = row
                .0
                .as_mut()
                .ok_or(NvmeError::UnknownQueuePair(sqid, resolved_cqid))?;

            match sq.post_command(&cmd.sqe) {
                Ok(()) => sq.ring_tail(),
                Err(NvmeError::QueueFull(_)) => full = true,
                Err(e) => return Err(e),
            }
        }
        if full {
            if let Some(mut prp) = cmd.prp.take() {
                prp.free_all_memory(&mut self.mem)?;
            }
            return Err(NvmeError::QueueFull(sqid));
        }

        let key = (cid, sqid);
        assert!(
            !self.outstanding.contains_key(&key),
            "CID 0x{:x} already outstanding on SQ {}",
            cid,
            sqid
        );
        cmd.posted = true;
        cmd.sqid = Some(sqid);
        cmd.cqid = Some(resolved_cqid);
        cmd.start_time = Some(Instant::now());
        self.outstanding.insert(key, cmd);
        Ok((sqid, resolved_cqid, cid))
    }

    /// One reap attempt on `cqid`, honoring the interrupt mode.
    fn reap_once(&mut self, cqid: u16) {
        match self.int_mode {
            IntMode::Polling => {
                self.get_completion(cqid);
            }
            IntMode::Msix { .. } => {
                let vector = self
                    .registry
                    .get(None, Some(cqid))
                    .ok()
                    .and_then(|row| row.1.as_ref().and_then(|cq| cq.int_vector()));
                match vector {
                    Some(v) => {
                        if self.platform.msix_pending_count(v).unwrap_or(0) > 0 {
                            while self.get_completion(cqid) {}
                        }
                    }
                    None => {
                        self.get_completion(cqid);
                    }
                }
            }
        }
    }

    /// Reaps up to `max_completions` across `cqids` (all CQs when empty),
    /// waiting at most `timeout`. Returns the number of tracked commands
    /// completed.
    pub fn process_completions(
        &mut self,
        cqids: &[u16],
        max_completions: usize,
        timeout: Duration,
    ) -> usize {
        let cqids = if cqids.is_empty() {
            self.registry.cqids()
        } else {
            cqids.to_vec()
        };

        let deadline = Instant::now() + timeout;
        let mut completed = 0;
        loop {
            let before = self.completed.len();
            for &cqid in &cqids {
                self.reap_once(cqid);
            }
            completed += self.completed.len() - before;

            if completed >= max_completions || Instant::now() > deadline {
                break;
            }
            thread::yield_now();
        }
        completed
    }

    /// Processes one completion on `cqid` if its phase has flipped.
    /// Returns true when a tracked command completed.
    fn get_completion(&mut self, cqid: u16) -> bool {
        let cqe = {
            let row = if cqid == 0 {
                self.registry.get(Some(0), Some(0))
            } else {
                self.registry.get(None, Some(cqid))
            };
            let row = match row {
                Ok(row) => row,
                Err(_) => return false,
            };
            let cq = match row.1.as_mut() {
                Some(cq) => cq,
                None => return false,
            };

            let cqe = cq.get_next_completion();
            if cqe.status_field().phase() != cq.phase() {
                return false;
            }
            cq.consume_completion();
            cq.ring_head();
            cqe
        };

        // Mirror the device's SQ head regardless of who owns the CID.
        if let Ok(row) = self.registry.get(Some(cqe.sqid), None) {
            if let Some(sq) = row.0.as_mut() {
                sq.set_head(cqe.sqhd);
            }
        }

        match self.outstanding.remove(&(cqe.cid, cqe.sqid)) {
            Some(mut cmd) => {
                cmd.end_time = Some(Instant::now());
                cmd.posted = false;
                cmd.complete = true;
                cmd.cqe = Some(cqe);
                if cmd.data_in_len() > 0 {
                    if let Some(prp) = cmd.prp.as_ref() {
                        let mut data = prp.get_data_buffer();
                        data.truncate(cmd.data_in_len());
                        cmd.data_in = Some(data);
                    }
                }
                self.completed.push(cmd);
                true
            }
            None => {
                error!(
                    target: "nvme",
                    "{}: orphan completion CID 0x{:x} SQID {} dropped",
                    self.slot, cqe.cid, cqe.sqid
                );
                false
            }
        }
    }

    /// Submits `cmd` and waits for its completion with default options
    /// (10 s timeout, status checked).
    pub fn sync_cmd(&mut self, cmd: Command) -> Result<Command> {
        self.sync_cmd_with(cmd, SyncOptions::default())
    }

    /// Submits `cmd` and waits for its completion. On timeout the command
    /// stays outstanding — the device still owns the CID. With
    /// `opts.check`, a non-success status frees the command's buffers and
    /// surfaces `CommandFailed`.
    pub fn sync_cmd_with(&mut self, cmd: Command, opts: SyncOptions) -> Result<Command> {
        let (sqid, cqid, cid) = self.start_cmd(cmd, opts.sqid, opts.cqid)?;
        debug!(
            target: "nvme",
            "{}: posted CID 0x{:x} on SQ {} (CQ {})", self.slot, cid, sqid, cqid
        );

        let deadline = Instant::now() + opts.timeout;
        loop {
            self.reap_once(cqid);

            if let Some(pos) = self
                .completed
                .iter()
                .position(|c| c.cid() == cid && c.sqid == Some(sqid))
            {
                let mut cmd = self.completed.remove(pos);
                if opts.check {
                    if let Some(cqe) = cmd.cqe {
                        if let Err(e) = status::check(&cqe) {
                            if let Some(mut prp) = cmd.prp.take() {
                                prp.free_all_memory(&mut self.mem)?;
                            }
                            return Err(e);
                        }
                    }
                }
                return Ok(cmd);
            }

            if Instant::now() > deadline {
                warn!(
                    target: "nvme",
                    "{}: CID 0x{:x} on SQ {} timed out; device still owns it",
                    self.slot, cid, sqid
                );
                return Err(NvmeError::Timeout);
            }
            thread::yield_now();
        }
    }

    /// Returns a completed command's transfer buffers to the pool.
    pub fn release_command(&mut self, mut cmd: Command) -> Result<()> {
        if let Some(mut prp) = cmd.prp.take() {
            prp.free_all_memory(&mut self.mem)?;
        }
        Ok(())
    }

    // =========================================================================
    // Higher-level operations
    // =========================================================================

    /// Full bring-up from RESET per a [`ControllerConfig`]: admin queues,
    /// enable, interrupts, I/O queues.
    pub fn bring_up(&mut self, config: &ControllerConfig) -> Result<()> {
        self.init_admin_queues(config.asq_entries, config.acq_entries)?;
        self.cc_enable_timeout(config.timeout)?;
        if let IntMode::Msix { vectors, start } = config.int_mode {
            self.init_msix_interrupts(vectors, start)?;
        }
        if config.num_io_queues > 0 {
            self.create_io_queues(config.num_io_queues, config.queue_entries)?;
        }
        Ok(())
    }

    /// Sends the identify suite and caches the result.
    pub fn identify(&mut self) -> Result<()> {
        let data = IdentifyData::build(self)?;
        self.identify = Some(data);
        Ok(())
    }

    /// Current power state via Get Feature.
    pub fn power_state(&mut self) -> Result<u8> {
        let cmd = self.sync_cmd(Command::get_feature_power_management())?;
        let dw0 = cmd.cqe().map(|c| c.dw0).unwrap_or(0);
        self.release_command(cmd)?;
        Ok(crate::cmd::admin::FeaturePowerManagement(dw0).ps())
    }

    pub fn set_power_state(&mut self, ps: u8) -> Result<()> {
        let cmd = self.sync_cmd(Command::set_feature_power_management(ps))?;
        self.release_command(cmd)?;
        Ok(())
    }

    pub(crate) fn mem_mut(&mut self) -> &mut MemoryManager {
        &mut self.mem
    }

    /// Outstanding DMA regions, for diagnostics.
    pub fn allocated_dma(&self) -> Vec<DmaRegion> {
        self.mem.allocated_list()
    }
}

impl Drop for NvmeController {
    fn drop(&mut self) {
        // The simulator handle (dropped first by field order) joins its
        // thread; the memory manager then releases every DMA region.
        debug!(target: "nvme", "{}: controller handle dropped", self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cid_allocator_window_and_wrap() {
        let outstanding = BTreeMap::new();
        let mut cids = CidAllocator::new();
        assert_eq!(cids.alloc(&outstanding).unwrap(), CID_INIT);
        assert_eq!(cids.alloc(&outstanding).unwrap(), CID_INIT + 1);

        cids.next = CID_MAX - 1;
        assert_eq!(cids.alloc(&outstanding).unwrap(), CID_MAX - 1);
        assert_eq!(cids.alloc(&outstanding).unwrap(), CID_INIT);
    }

    #[test]
    fn test_cid_allocator_skips_outstanding() {
        let mut outstanding = BTreeMap::new();
        outstanding.insert((CID_INIT, 0u16), Command::flush(1));
        outstanding.insert((CID_INIT + 1, 3u16), Command::flush(1));

        let mut cids = CidAllocator::new();
        assert_eq!(cids.alloc(&outstanding).unwrap(), CID_INIT + 2);
    }

    #[test]
    fn test_cid_allocator_exhaustion() {
        let mut outstanding = BTreeMap::new();
        for cid in CID_INIT..CID_MAX {
            outstanding.insert((cid, 0u16), Command::flush(1));
        }
        let mut cids = CidAllocator::new();
        assert_eq!(cids.alloc(&outstanding), Err(NvmeError::CidExhausted));
    }

    #[test]
    fn test_controller_config_defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.asq_entries, 64);
        assert_eq!(config.acq_entries, 256);
        assert_eq!(config.int_mode, IntMode::Polling);
    }
}
