//! Identify cache: controller data, per-namespace geometry and the UUID
//! list, populated on demand and invalidated by FLR.

use byteorder::{ByteOrder, LittleEndian};
use log::info;

use crate::cmd::admin::{IdentifyController, IdentifyNamespace, UuidList};
use crate::cmd::Command;
use crate::device::NvmeController;
use crate::error::{NvmeError, Result};

/// Geometry and usage for one active namespace.
#[derive(Debug, Clone)]
pub struct NamespaceInfo {
    pub nsid: u32,
    pub nsze: u64,
    pub nuse: u64,
    pub flbas: u8,
    /// LBA data size exponent from the formatted LBAF entry.
    pub lba_ds: u8,
    pub ms_bytes: u16,
    pub block_size: u32,
    /// Human-readable usage, e.g. "0 / 50.02 GB".
    pub usage: String,
    /// Human-readable block size, e.g. "512 B" or "4 KiB".
    pub lba_size: String,
}

/// Cached identify results for one controller.
pub struct IdentifyData {
    pub controller: IdentifyController,
    pub serial: String,
    pub model: String,
    pub firmware: String,
    pub namespaces: Vec<NamespaceInfo>,
    /// Absent when the device rejects the UUID list identify.
    pub uuid_list: Option<UuidList>,
}

/// Scales a byte count into decimal storage units.
fn ns_size(lba_ds_bytes: u64, nsze: u64, nuse: u64) -> (f64, f64, &'static str) {
    let total = lba_ds_bytes * nsze;
    let (unit, divisor) = if total < 10u64.pow(3) {
        ("B", 1u64)
    } else if total < 10u64.pow(6) {
        ("KB", 10u64.pow(3))
    } else if total < 10u64.pow(9) {
        ("MB", 10u64.pow(6))
    } else if total < 10u64.pow(12) {
        ("GB", 10u64.pow(9))
    } else {
        ("TB", 10u64.pow(12))
    };
    let usage = (lba_ds_bytes * nuse) as f64 / divisor as f64;
    let total = total as f64 / divisor as f64;
    (round2(usage), round2(total), unit)
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Presents a block size in B or KiB.
fn lba_ds_size(lba_ds_bytes: u32) -> (u32, &'static str) {
    if lba_ds_bytes > 1024 {
        (lba_ds_bytes / 1024, "KiB")
    } else {
        (lba_ds_bytes, "B")
    }
}

/// Runs one identify command and hands back the data-in bytes; a success
/// completion without data is a wire-contract violation.
fn identify_payload(ctrl: &mut NvmeController, cmd: Command, what: &str) -> Result<Vec<u8>> {
    let done = ctrl.sync_cmd(cmd)?;
    let data = done.data_in().map(|d| d.to_vec());
    ctrl.release_command(done)?;
    data.ok_or_else(|| NvmeError::MalformedResponse(format!("{} returned no data", what)))
}

impl IdentifyData {
    /// Sends Identify Namespace List, Identify Namespace per active NSID,
    /// Identify Controller and Identify UUID List (failure tolerated).
    pub fn build(ctrl: &mut NvmeController) -> Result<IdentifyData> {
        let namespaces = Self::identify_namespaces(ctrl)?;

        let raw = identify_payload(ctrl, Command::identify_controller(), "identify controller")?;
        let controller = IdentifyController::from_bytes(&raw);

        let uuid_list = Self::identify_uuid_list(ctrl)?;

        Ok(IdentifyData {
            serial: controller.serial_string(),
            model: controller.model_string(),
            firmware: controller.firmware_string(),
            controller,
            namespaces,
            uuid_list,
        })
    }

    fn identify_namespaces(ctrl: &mut NvmeController) -> Result<Vec<NamespaceInfo>> {
        let raw = identify_payload(
            ctrl,
            Command::identify_namespace_list(),
            "identify namespace list",
        )?;
        let mut nsids = Vec::new();
        for i in 0..raw.len() / 4 {
            let nsid = LittleEndian::read_u32(&raw[i * 4..]);
            if nsid == 0 {
                break;
            }
            nsids.push(nsid);
        }

        let mut namespaces = Vec::with_capacity(nsids.len());
        for nsid in nsids {
            let raw = identify_payload(
                ctrl,
                Command::identify_namespace(nsid),
                "identify namespace",
            )?;
            let data = IdentifyNamespace::from_bytes(&raw);

            let lbaf = data.formatted_lbaf();
            if lbaf.lbads() == 0 {
                return Err(NvmeError::MalformedResponse(format!(
                    "namespace {} reports LBADS 0",
                    nsid
                )));
            }
            let block_size = lbaf.block_size();

            let (usage, total, unit) = ns_size(block_size as u64, data.nsze, data.nuse);
            let (lba_size, lba_unit) = lba_ds_size(block_size);
            namespaces.push(NamespaceInfo {
                nsid,
                nsze: data.nsze,
                nuse: data.nuse,
                flbas: data.flbas,
                lba_ds: lbaf.lbads(),
                ms_bytes: lbaf.ms(),
                block_size,
                usage: format!("{} / {} {}", usage, total, unit),
                lba_size: format!("{} {}", lba_size, lba_unit),
            });
        }
        Ok(namespaces)
    }

    fn identify_uuid_list(ctrl: &mut NvmeController) -> Result<Option<UuidList>> {
        match ctrl.sync_cmd(Command::identify_uuid_list()) {
            Ok(cmd) => {
                let data = cmd.data_in().map(|d| d.to_vec());
                ctrl.release_command(cmd)?;
                match data {
                    Some(raw) => Ok(Some(UuidList::from_bytes(&raw))),
                    None => Err(NvmeError::MalformedResponse(
                        "identify UUID list returned no data".into(),
                    )),
                }
            }
            Err(NvmeError::CommandFailed { sct, sc, .. }) => {
                info!(
                    target: "nvme",
                    "{}: device failed identify UUID list (SCT 0x{:x} SC 0x{:02x})",
                    ctrl.slot(), sct, sc
                );
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Info for one NSID, if active.
    pub fn namespace(&self, nsid: u32) -> Option<&NamespaceInfo> {
        self.namespaces.iter().find(|ns| ns.nsid == nsid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ns_size_picks_decimal_units() {
        let (usage, total, unit) = ns_size(512, 97_696_368, 0);
        assert_eq!(unit, "GB");
        assert_eq!(usage, 0.0);
        assert!((total - 50.02).abs() < 0.01);

        let (_, total, unit) = ns_size(512, 100, 0);
        assert_eq!(unit, "KB");
        assert!((total - 51.2).abs() < 0.01);
    }

    #[test]
    fn lba_size_units() {
        assert_eq!(lba_ds_size(512), (512, "B"));
        assert_eq!(lba_ds_size(4096), (4, "KiB"));
    }
}
