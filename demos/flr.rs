//! Function Level Reset demonstration: identify, reset, re-initialize and
//! verify the controller identity survived.
//!
//! ```text
//! cargo run --features demos --bin nvme-flr -- [slot]
//! ```

use nvme_host::{ControllerConfig, IdentifyData, NvmeController, NVSIM_SLOT};

fn main() -> Result<(), nvme_host::NvmeError> {
    env_logger::init();
    let slot = std::env::args().nth(1).unwrap_or_else(|| NVSIM_SLOT.into());

    let mut ctrl = NvmeController::open(&slot)?;
    let config = ControllerConfig {
        num_io_queues: 0,
        ..ControllerConfig::default()
    };
    ctrl.bring_up(&config)?;
    let data = IdentifyData::build(&mut ctrl)?;
    let before = (data.serial, data.model, data.firmware);
    println!("{}: {} {} {}", slot, before.0, before.1, before.2);

    println!("{}: initiating FLR", slot);
    ctrl.initiate_flr()?;

    ctrl.bring_up(&config)?;
    let data = IdentifyData::build(&mut ctrl)?;
    let after = (data.serial, data.model, data.firmware);

    if before == after {
        println!("{}: identity stable across FLR", slot);
        Ok(())
    } else {
        println!("{}: identity CHANGED across FLR: {:?}", slot, after);
        std::process::exit(1);
    }
}
