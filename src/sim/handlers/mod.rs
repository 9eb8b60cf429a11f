//! Per-opcode command handlers for the simulated controller.
//!
//! Dispatch is a 256-slot table per command set, indexed by OPC; every
//! unclaimed slot answers Invalid Field in Command. Handlers complete
//! through [`SimState::complete`], which posts the CQE with inverted phase
//! and pends the CQ's MSI-X vector.

pub mod admin;
pub mod nvm;

use log::error;

use crate::cmd::status;
use crate::cmd::Sqe;
use crate::error::Result;
use crate::sim::SimState;

/// One handler: the simulator state, the fetched entry and the queue pair
/// it arrived on.
pub type HandlerFn = fn(&mut SimState, &Sqe, u16, u16) -> Result<()>;

pub fn not_supported(state: &mut SimState, sqe: &Sqe, sqid: u16, cqid: u16) -> Result<()> {
    error!(target: "nvsim", "command OPC 0x{:02x} not supported", sqe.opc());
    state.complete(sqe.cid(), sqid, cqid, status::INVALID_FIELD, 0)
}

/// Admin command set dispatch table.
pub fn admin_table() -> [HandlerFn; 256] {
    let mut table: [HandlerFn; 256] = [not_supported as HandlerFn; 256];
    table[crate::cmd::OPC_IDENTIFY as usize] = admin::identify;
    table[crate::cmd::OPC_CREATE_IO_CQ as usize] = admin::create_io_cq;
    table[crate::cmd::OPC_CREATE_IO_SQ as usize] = admin::create_io_sq;
    table[crate::cmd::OPC_DELETE_IO_CQ as usize] = admin::delete_io_cq;
    table[crate::cmd::OPC_DELETE_IO_SQ as usize] = admin::delete_io_sq;
    table[crate::cmd::OPC_GET_LOG_PAGE as usize] = admin::get_log_page;
    table[crate::cmd::OPC_FORMAT_NVM as usize] = admin::format_nvm;
    table[crate::cmd::OPC_GET_FEATURE as usize] = admin::get_feature;
    table[crate::cmd::OPC_SET_FEATURE as usize] = admin::set_feature;
    table
}

/// NVM command set dispatch table.
pub fn nvm_table() -> [HandlerFn; 256] {
    let mut table: [HandlerFn; 256] = [not_supported as HandlerFn; 256];
    table[crate::cmd::OPC_FLUSH as usize] = nvm::flush;
    table[crate::cmd::OPC_WRITE as usize] = nvm::write;
    table[crate::cmd::OPC_READ as usize] = nvm::read;
    table
}
