//! Walks the controller's advertised power states: print the descriptor
//! table, then set and read back each state.
//!
//! ```text
//! cargo run --features demos --bin nvme-power-states -- [slot]
//! ```

use nvme_host::{ControllerConfig, NvmeController, NVSIM_SLOT};

fn main() -> Result<(), nvme_host::NvmeError> {
    env_logger::init();
    let slot = std::env::args().nth(1).unwrap_or_else(|| NVSIM_SLOT.into());

    let mut ctrl = NvmeController::open(&slot)?;
    ctrl.bring_up(&ControllerConfig {
        num_io_queues: 0,
        ..ControllerConfig::default()
    })?;
    ctrl.identify()?;

    let npss = ctrl
        .identify_data()
        .map(|d| d.controller.npss)
        .unwrap_or(0);
    println!("{}: {} power states", slot, npss as u16 + 1);
    if let Some(data) = ctrl.identify_data() {
        for ps in 0..=npss {
            let psd = &data.controller.psd[ps as usize];
            println!("  PS{}: MP {} ENLAT {} EXLAT {}", ps, psd.mp, psd.enlat, psd.exlat);
        }
    }

    let initial = ctrl.power_state()?;
    println!("{}: current power state PS{}", slot, initial);

    for ps in 0..=npss {
        ctrl.set_power_state(ps)?;
        let now = ctrl.power_state()?;
        println!("  set PS{} -> read back PS{}", ps, now);
    }
    ctrl.set_power_state(initial)?;
    Ok(())
}
