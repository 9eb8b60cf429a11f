//! Completion status codes and the SCT/SC → name table.
//!
//! Covers the generic (SCT 0) and command-specific (SCT 1) namespaces the
//! driver and simulator exchange, plus the media/integrity codes (SCT 2)
//! a real device may return.

use std::collections::BTreeMap;

use lazy_static::lazy_static;

use crate::cmd::Cqe;
use crate::error::{NvmeError, Result};

/// A (SCT, SC) pair, convenient for simulator handlers.
pub type Status = (u8, u8);

pub const SUCCESS: Status = (0, 0x00);
pub const INVALID_OPCODE: Status = (0, 0x01);
pub const INVALID_FIELD: Status = (0, 0x02);
pub const DATA_TRANSFER_ERROR: Status = (0, 0x04);
pub const INTERNAL_ERROR: Status = (0, 0x06);
pub const INVALID_NAMESPACE_OR_FORMAT: Status = (0, 0x0B);

pub const COMPLETION_QUEUE_INVALID: Status = (1, 0x00);
pub const INVALID_QUEUE_IDENTIFIER: Status = (1, 0x01);
pub const INVALID_QUEUE_SIZE: Status = (1, 0x02);
pub const INVALID_INTERRUPT_VECTOR: Status = (1, 0x08);
pub const INVALID_LOG_PAGE: Status = (1, 0x09);
pub const INVALID_FORMAT: Status = (1, 0x0A);
/// NVM command set encoding used for out-of-range reads and writes.
pub const LBA_OUT_OF_RANGE: Status = (1, 0x80);

lazy_static! {
    static ref STATUS_NAMES: BTreeMap<Status, &'static str> = {
        let mut map = BTreeMap::new();
        // SCT 0 — generic.
        map.insert((0, 0x00), "Successful Completion");
        map.insert((0, 0x01), "Invalid Command Opcode");
        map.insert((0, 0x02), "Invalid Field in Command");
        map.insert((0, 0x03), "Command ID Conflict");
        map.insert((0, 0x04), "Data Transfer Error");
        map.insert((0, 0x05), "Commands Aborted due to Power Loss Notification");
        map.insert((0, 0x06), "Internal Error");
        map.insert((0, 0x07), "Command Abort Requested");
        map.insert((0, 0x08), "Command Aborted due to SQ Deletion");
        map.insert((0, 0x09), "Command Aborted due to Failed Fused Command");
        map.insert((0, 0x0A), "Command Aborted due to Missing Fused Command");
        map.insert((0, 0x0B), "Invalid Namespace or Format");
        map.insert((0, 0x0C), "Command Sequence Error");
        map.insert((0, 0x12), "PRP Offset Invalid");
        map.insert((0, 0x15), "Operation Denied");
        map.insert((0, 0x19), "Keep Alive Timer Expired");
        map.insert((0, 0x1C), "Command Interrupted");
        map.insert((0, 0x80), "LBA Out of Range");
        map.insert((0, 0x81), "Capacity Exceeded");
        map.insert((0, 0x82), "Namespace Not Ready");
        map.insert((0, 0x83), "Reservation Conflict");
        map.insert((0, 0x84), "Format In Progress");
        // SCT 1 — command specific.
        map.insert((1, 0x00), "Completion Queue Invalid");
        map.insert((1, 0x01), "Invalid Queue Identifier");
        map.insert((1, 0x02), "Invalid Queue Size");
        map.insert((1, 0x03), "Abort Command Limit Exceeded");
        map.insert((1, 0x05), "Asynchronous Event Request Limit Exceeded");
        map.insert((1, 0x06), "Invalid Firmware Slot");
        map.insert((1, 0x07), "Invalid Firmware Image");
        map.insert((1, 0x08), "Invalid Interrupt Vector");
        map.insert((1, 0x09), "Invalid Log Page");
        map.insert((1, 0x0A), "Invalid Format");
        map.insert((1, 0x0B), "Firmware Activation Requires Conventional Reset");
        map.insert((1, 0x0C), "Invalid Queue Deletion");
        map.insert((1, 0x0D), "Feature Identifier Not Saveable");
        map.insert((1, 0x0E), "Feature Not Changeable");
        map.insert((1, 0x0F), "Feature Not Namespace Specific");
        map.insert((1, 0x10), "Firmware Activation Requires NVM Subsystem Reset");
        map.insert((1, 0x11), "Firmware Activation Requires Controller Level Reset");
        map.insert((1, 0x14), "Overlapping Range");
        map.insert((1, 0x1D), "Sanitize Failed");
        map.insert((1, 0x1E), "Sanitize In Progress");
        map.insert((1, 0x23), "Sanitize Prohibited While Persistent Memory Region is Enabled");
        map.insert((1, 0x80), "LBA Out of Range");
        map.insert((1, 0x81), "Invalid Protection Information");
        map.insert((1, 0x82), "Attempted Write to Read Only Range");
        // SCT 2 — media and data integrity.
        map.insert((2, 0x80), "Write Fault");
        map.insert((2, 0x81), "Unrecovered Read Error");
        map.insert((2, 0x82), "End-to-end Guard Check Error");
        map.insert((2, 0x83), "End-to-end Application Tag Check Error");
        map.insert((2, 0x84), "End-to-end Reference Tag Check Error");
        map.insert((2, 0x85), "Compare Failure");
        map.insert((2, 0x86), "Access Denied");
        map.insert((2, 0x87), "Deallocated or Unwritten Logical Block");
        map
    };
}

/// Human name for a status pair.
pub fn name(sct: u8, sc: u8) -> &'static str {
    STATUS_NAMES
        .get(&(sct, sc))
        .copied()
        .unwrap_or("Unknown Status")
}

/// Raises `CommandFailed` for any non-success completion.
pub fn check(cqe: &Cqe) -> Result<()> {
    let sf = cqe.status_field();
    if sf.is_success() {
        return Ok(());
    }
    Err(NvmeError::CommandFailed {
        sct: sf.sct(),
        sc: sf.sc(),
        name: name(sf.sct(), sf.sc()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::StatusField;

    #[test]
    fn known_and_unknown_names() {
        assert_eq!(name(0, 0x00), "Successful Completion");
        assert_eq!(name(1, 0x80), "LBA Out of Range");
        assert_eq!(name(0, 0x0B), "Invalid Namespace or Format");
        assert_eq!(name(7, 0x7F), "Unknown Status");
    }

    #[test]
    fn check_passes_success_and_flags_failure() {
        let mut cqe = Cqe::default();
        let mut sf = StatusField(0);
        sf.set_phase(true);
        cqe.status = sf.0;
        assert!(check(&cqe).is_ok());

        sf.set_sct(1);
        sf.set_sc(0x80);
        cqe.status = sf.0;
        match check(&cqe) {
            Err(NvmeError::CommandFailed { sct, sc, name }) => {
                assert_eq!(sct, 1);
                assert_eq!(sc, 0x80);
                assert_eq!(name, "LBA Out of Range");
            }
            other => panic!("expected CommandFailed, got {:?}", other),
        }
    }
}
