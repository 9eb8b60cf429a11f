//! The simulator's background thread: a cooperative diff-and-drain loop
//! with a stop token.
//!
//! Each pass runs under the register mutex: diff the PCIe bytes (FLR
//! detection), diff the NVMe bytes (CC.EN transitions), then drain the
//! submission queues while ready. A handler error sets CSTS.CFS and ends
//! the loop; the host observes the fatal status, never a dead thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info};

use crate::error::{NvmeError, Result};
use crate::platform::sim::SimPlatform;
use crate::platform::PciUserspaceDevice;
use crate::regs::nvme::REG_CC;
use crate::regs::pcie::EXPRESS_DEVCTL_OFFSET;
use crate::sim::bars::SimBars;
use crate::sim::{SimConfig, SimState};

/// Pause between loop passes.
const LOOP_SLEEP: Duration = Duration::from_micros(50);

/// Spawner for one simulated controller.
pub struct NvSim;

impl NvSim {
    /// Builds the simulator state and starts its thread. The returned
    /// handle stops and joins the thread on drop.
    pub fn spawn(config: SimConfig) -> Result<NvSimHandle> {
        let bars = SimBars::new()?;
        let platform = SimPlatform::new(bars.clone());
        let state = SimState::new(bars.clone(), platform.clone(), config)?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_token = stop.clone();
        let join = thread::Builder::new()
            .name("nvsim".into())
            .spawn(move || run(state, stop_token))
            .map_err(|_| NvmeError::last_os("spawn simulator thread"))?;

        info!(target: "nvsim", "simulator thread started");
        Ok(NvSimHandle {
            platform,
            bars,
            stop,
            join: Some(join),
        })
    }
}

/// Owner handle for a running simulator.
pub struct NvSimHandle {
    platform: Arc<SimPlatform>,
    bars: Arc<SimBars>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl NvSimHandle {
    /// The platform-device view of the simulated controller.
    pub fn platform(&self) -> Arc<dyn PciUserspaceDevice> {
        self.platform.clone()
    }

    pub fn bars(&self) -> Arc<SimBars> {
        self.bars.clone()
    }

    /// Asks the thread to stop and joins it.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for NvSimHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut state: SimState, stop: Arc<AtomicBool>) {
    let mut last_pcie = state.bars.pcie.mmio().snapshot();
    let mut last_nvme = state.bars.nvme.mmio().snapshot();

    while !stop.load(Ordering::Acquire) {
        let result = {
            let bars = state.bars.clone();
            let _guard = bars.lock.lock();
            step(&mut state, &mut last_pcie, &mut last_nvme)
        };
        if let Err(e) = result {
            error!(target: "nvsim", "handler failed ({}); setting CSTS.CFS", e);
            let mut csts = state.nvme.csts();
            csts.set_cfs(true);
            state.nvme.set_csts(csts);
            break;
        }
        thread::sleep(LOOP_SLEEP);
    }
    debug!(target: "nvsim", "simulator thread exiting");
}

fn step(state: &mut SimState, last_pcie: &mut Vec<u8>, last_nvme: &mut Vec<u8>) -> Result<()> {
    // PCIe side: a 0 -> 1 edge on the express capability's Initiate FLR
    // bit resets the whole simulated function.
    let pcie_now = state.bars.pcie.mmio().snapshot();
    if pcie_now != *last_pcie {
        let iflr_byte = state.express_cap_offset as usize + EXPRESS_DEVCTL_OFFSET + 1;
        let was = last_pcie[iflr_byte] & 0x80 != 0;
        let now = pcie_now[iflr_byte] & 0x80 != 0;
        if !was && now {
            debug!(target: "nvsim", "initiate FLR requested");
            state.reset()?;
        }
    }
    *last_pcie = state.bars.pcie.mmio().snapshot();

    // NVMe side: CC.EN transitions.
    let nvme_now = state.bars.nvme.mmio().snapshot();
    let was_enabled = last_nvme[REG_CC] & 1 != 0;
    let is_enabled = nvme_now[REG_CC] & 1 != 0;
    if !was_enabled && is_enabled {
        state.enable()?;
    } else if was_enabled && !is_enabled {
        state.disable();
    }

    // Doorbell writes land in the register file; while ready, drain.
    if state.nvme.csts().rdy() {
        state.check_commands()?;
    }
    *last_nvme = state.bars.nvme.mmio().snapshot();
    Ok(())
}
