//! Sends a Flush to every active namespace of one controller.
//!
//! ```text
//! cargo run --features demos --bin nvme-flush -- [slot]
//! ```

use nvme_host::{Command, ControllerConfig, NvmeController, NVSIM_SLOT};

fn main() -> Result<(), nvme_host::NvmeError> {
    env_logger::init();
    let slot = std::env::args().nth(1).unwrap_or_else(|| NVSIM_SLOT.into());

    let mut ctrl = NvmeController::open(&slot)?;
    ctrl.bring_up(&ControllerConfig {
        num_io_queues: 1,
        ..ControllerConfig::default()
    })?;
    ctrl.identify()?;

    let nsids: Vec<u32> = ctrl
        .identify_data()
        .map(|d| d.namespaces.iter().map(|ns| ns.nsid).collect())
        .unwrap_or_default();
    for nsid in nsids {
        let done = ctrl.sync_cmd(Command::flush(nsid))?;
        println!(
            "{}: flush nsid {} completed in {:?}",
            slot,
            nsid,
            done.latency().unwrap_or_default()
        );
        ctrl.release_command(done)?;
    }
    Ok(())
}
