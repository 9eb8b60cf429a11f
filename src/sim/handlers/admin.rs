//! Admin command handlers.

use log::{debug, info};

use crate::cmd::admin::{
    LogSupportedPages, CNS_CONTROLLER, CNS_NAMESPACE, CNS_NAMESPACE_LIST, CNS_UUID_LIST,
    FID_POWER_MANAGEMENT, IDENTIFY_DATA_SIZE,
};
use crate::cmd::status;
use crate::cmd::Sqe;
use crate::error::Result;
use crate::prp::Prp;
use crate::queue::{CompQueue, SubQueue};
use crate::sim::SimState;

pub fn identify(state: &mut SimState, sqe: &Sqe, sqid: u16, cqid: u16) -> Result<()> {
    let cns = (sqe.cdw10 & 0xFF) as u8;
    debug!(target: "nvsim", "identify CNS 0x{:02x} NSID {}", cns, sqe.nsid);

    let prp = Prp::from_parts(sqe.prp1, sqe.prp2, IDENTIFY_DATA_SIZE, state.mps);
    let result = match cns {
        CNS_CONTROLLER => {
            prp.set_data_buffer(state.id_ctrl.as_bytes());
            status::SUCCESS
        }
        CNS_NAMESPACE => match state.id_ns.get(sqe.nsid as usize).and_then(|d| d.as_ref()) {
            Some(data) => {
                prp.set_data_buffer(data.as_bytes());
                status::SUCCESS
            }
            None => status::INVALID_NAMESPACE_OR_FORMAT,
        },
        CNS_NAMESPACE_LIST => {
            prp.set_data_buffer(state.id_ns_list.as_bytes());
            status::SUCCESS
        }
        CNS_UUID_LIST => {
            prp.set_data_buffer(state.id_uuid.as_bytes());
            status::SUCCESS
        }
        _ => {
            info!(target: "nvsim", "identify CNS 0x{:02x} not supported", cns);
            status::INVALID_FIELD
        }
    };
    state.complete(sqe.cid(), sqid, cqid, result, 0)
}

pub fn create_io_cq(state: &mut SimState, sqe: &Sqe, sqid: u16, cqid: u16) -> Result<()> {
    let qid = (sqe.cdw10 & 0xFFFF) as u16;
    let qsize = sqe.cdw10 >> 16;
    let pc = sqe.cdw11 & 1 != 0;
    let ien = sqe.cdw11 >> 1 & 1 != 0;
    let iv = (sqe.cdw11 >> 16) as u16;

    if !pc || qid == 0 {
        return state.complete(sqe.cid(), sqid, cqid, status::INVALID_FIELD, 0);
    }
    if iv as usize >= crate::platform::sim::SIM_MSIX_VECTORS {
        return state.complete(sqe.cid(), sqid, cqid, status::INVALID_INTERRUPT_VECTOR, 0);
    }

    let entries = qsize + 1;
    SimState::touch(sqe.prp1 as usize, entries as usize * 16);

    let cq = CompQueue::new(
        sqe.prp1 as usize,
        sqe.prp1,
        entries,
        qid,
        state.nvme.cq_head_doorbell(qid),
        if ien { Some(iv) } else { None },
    );
    // Held here until a Create I/O SQ pairs with it.
    state.pending_cqs.push(cq);
    state.complete(sqe.cid(), sqid, cqid, status::SUCCESS, 0)
}

pub fn create_io_sq(state: &mut SimState, sqe: &Sqe, sqid: u16, cqid: u16) -> Result<()> {
    let qid = (sqe.cdw10 & 0xFFFF) as u16;
    let qsize = sqe.cdw10 >> 16;
    let pc = sqe.cdw11 & 1 != 0;
    let bound_cqid = (sqe.cdw11 >> 16) as u16;

    if !pc || qid == 0 {
        return state.complete(sqe.cid(), sqid, cqid, status::INVALID_FIELD, 0);
    }
    let cq_index = match state.pending_cqs.iter().position(|c| c.qid() == bound_cqid) {
        Some(index) => index,
        None => return state.complete(sqe.cid(), sqid, cqid, status::INVALID_FIELD, 0),
    };

    let entries = qsize + 1;
    SimState::touch(sqe.prp1 as usize, entries as usize * 64);

    let sq = SubQueue::new(
        sqe.prp1 as usize,
        sqe.prp1,
        entries,
        qid,
        state.nvme.sq_tail_doorbell(qid),
    );
    let cq = state.pending_cqs.remove(cq_index);
    state.registry.add(sq, cq);
    debug!(target: "nvsim", "io queue pair ({}, {}) live", qid, bound_cqid);
    state.complete(sqe.cid(), sqid, cqid, status::SUCCESS, 0)
}

pub fn delete_io_sq(state: &mut SimState, sqe: &Sqe, sqid: u16, cqid: u16) -> Result<()> {
    let del_qid = (sqe.cdw10 & 0xFFFF) as u16;
    if del_qid == 0 {
        return state.complete(sqe.cid(), sqid, cqid, status::INVALID_QUEUE_IDENTIFIER, 0);
    }
    state.registry.remove_sq(del_qid);
    state.complete(sqe.cid(), sqid, cqid, status::SUCCESS, 0)
}

pub fn delete_io_cq(state: &mut SimState, sqe: &Sqe, sqid: u16, cqid: u16) -> Result<()> {
    let del_qid = (sqe.cdw10 & 0xFFFF) as u16;
    if del_qid == 0 {
        return state.complete(sqe.cid(), sqid, cqid, status::INVALID_QUEUE_IDENTIFIER, 0);
    }
    // The paired SQ must be gone first.
    let mut sq_present = false;
    for (row_sqid, row_cqid) in state.registry.keys() {
        if row_cqid != del_qid {
            continue;
        }
        if let Ok(row) = state.registry.get(Some(row_sqid), Some(row_cqid)) {
            sq_present |= row.0.is_some();
        }
    }
    if sq_present {
        return state.complete(sqe.cid(), sqid, cqid, (1, 0x0C), 0);
    }
    state.registry.remove_cq(del_qid);
    state.complete(sqe.cid(), sqid, cqid, status::SUCCESS, 0)
}

pub fn get_log_page(state: &mut SimState, sqe: &Sqe, sqid: u16, cqid: u16) -> Result<()> {
    let lid = (sqe.cdw10 & 0xFF) as u8;
    if lid != 0 {
        return state.complete(sqe.cid(), sqid, cqid, status::INVALID_LOG_PAGE, 0);
    }

    let numd = ((sqe.cdw11 & 0xFFFF) << 16 | sqe.cdw10 >> 16) as u64 + 1;
    let num_bytes = (numd * 4) as usize;
    let offset = (sqe.cdw13 as u64) << 32 | sqe.cdw12 as u64;
    let index_offset = sqe.cdw14 >> 23 & 1 != 0;
    if index_offset {
        info!(target: "nvsim", "get log page with index offset not implemented");
        return state.complete(sqe.cid(), sqid, cqid, status::INVALID_FIELD, 0);
    }

    // Claim support for every page, index offsets included.
    let mut data = LogSupportedPages::zeroed();
    for lid in 0..=255u8 {
        data.mark_supported(lid, true);
    }
    let bytes = data.as_bytes();
    let start = (offset as usize).min(bytes.len());
    let end = (start + num_bytes).min(bytes.len());

    let prp = Prp::from_parts(sqe.prp1, sqe.prp2, num_bytes, state.mps);
    prp.set_data_buffer(&bytes[start..end]);
    state.complete(sqe.cid(), sqid, cqid, status::SUCCESS, 0)
}

pub fn format_nvm(state: &mut SimState, sqe: &Sqe, sqid: u16, cqid: u16) -> Result<()> {
    let result = match state
        .namespaces
        .get_mut(sqe.nsid as usize)
        .and_then(|n| n.as_mut())
    {
        Some(ns) => {
            info!(target: "nvsim", "format NVM namespace {}", sqe.nsid);
            ns.init_storage()?;
            status::SUCCESS
        }
        None => status::INVALID_NAMESPACE_OR_FORMAT,
    };
    state.complete(sqe.cid(), sqid, cqid, result, 0)
}

pub fn get_feature(state: &mut SimState, sqe: &Sqe, sqid: u16, cqid: u16) -> Result<()> {
    let fid = (sqe.cdw10 & 0xFF) as u8;
    if fid != FID_POWER_MANAGEMENT {
        info!(target: "nvsim", "get feature FID 0x{:02x} not supported", fid);
        return state.complete(sqe.cid(), sqid, cqid, status::INVALID_FIELD, 0);
    }
    let value = crate::cmd::admin::FeaturePowerManagement::new(state.power_state, 0).0;
    state.complete(sqe.cid(), sqid, cqid, status::SUCCESS, value)
}

pub fn set_feature(state: &mut SimState, sqe: &Sqe, sqid: u16, cqid: u16) -> Result<()> {
    let fid = (sqe.cdw10 & 0xFF) as u8;
    let save = sqe.cdw10 >> 31 != 0;
    if fid != FID_POWER_MANAGEMENT || save {
        info!(
            target: "nvsim",
            "set feature FID 0x{:02x} (SV={}) not supported", fid, save as u8
        );
        return state.complete(sqe.cid(), sqid, cqid, status::INVALID_FIELD, 0);
    }
    state.power_state = crate::cmd::admin::FeaturePowerManagement(sqe.cdw11).ps();
    state.complete(sqe.cid(), sqid, cqid, status::SUCCESS, 0)
}
