//! Lists every NVMe device exposed to userspace, plus the simulator.
//!
//! ```text
//! cargo run --features demos --bin nvme-list
//! ```

fn main() {
    env_logger::init();

    println!(
        "{:<16} {:<20} {:<20} {:<8} {:>4} {:<20}",
        "Slot", "Model", "Serial", "FW", "NS", "Usage"
    );
    for row in nvme_host::list_devices() {
        if let Some(error) = &row.error {
            println!("{:<16} unavailable: {}", row.slot, error);
            continue;
        }
        println!(
            "{:<16} {:<20} {:<20} {:<8} {:>4} {:<20}",
            row.slot,
            row.model,
            row.serial,
            row.firmware,
            row.namespace_count,
            row.usage.as_deref().unwrap_or("-"),
        );
    }
}
