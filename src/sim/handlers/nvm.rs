//! NVM command set handlers: Write, Read, Flush against the file-backed
//! namespaces.

use log::debug;

use crate::cmd::nvm::{nlb_of, slba_of};
use crate::cmd::status;
use crate::cmd::Sqe;
use crate::error::Result;
use crate::prp::Prp;
use crate::sim::SimState;

/// Broadcast NSID accepted by Flush.
const NSID_BROADCAST: u32 = 0xFFFF_FFFF;

pub fn write(state: &mut SimState, sqe: &Sqe, sqid: u16, cqid: u16) -> Result<()> {
    let slba = slba_of(sqe);
    let blocks = nlb_of(sqe) as u64 + 1;

    let result = match state.namespaces.get(sqe.nsid as usize).and_then(|n| n.as_ref()) {
        None => status::INVALID_NAMESPACE_OR_FORMAT,
        Some(ns) => {
            debug!(
                target: "nvsim",
                "write SLBA 0x{:x} NLB {} NSID {}", slba, blocks - 1, sqe.nsid
            );
            if slba + blocks > ns.num_lbas() {
                status::LBA_OUT_OF_RANGE
            } else {
                let prp = Prp::from_parts(
                    sqe.prp1,
                    sqe.prp2,
                    (blocks * ns.block_size() as u64) as usize,
                    state.mps,
                );
                ns.write(slba, blocks, &prp);
                status::SUCCESS
            }
        }
    };
    state.complete(sqe.cid(), sqid, cqid, result, 0)
}

pub fn read(state: &mut SimState, sqe: &Sqe, sqid: u16, cqid: u16) -> Result<()> {
    let slba = slba_of(sqe);
    let blocks = nlb_of(sqe) as u64 + 1;

    let result = match state.namespaces.get(sqe.nsid as usize).and_then(|n| n.as_ref()) {
        None => status::INVALID_NAMESPACE_OR_FORMAT,
        Some(ns) => {
            debug!(
                target: "nvsim",
                "read SLBA 0x{:x} NLB {} NSID {}", slba, blocks - 1, sqe.nsid
            );
            if slba + blocks > ns.num_lbas() {
                status::LBA_OUT_OF_RANGE
            } else {
                let prp = Prp::from_parts(
                    sqe.prp1,
                    sqe.prp2,
                    (blocks * ns.block_size() as u64) as usize,
                    state.mps,
                );
                ns.read(slba, blocks, &prp);
                status::SUCCESS
            }
        }
    };
    state.complete(sqe.cid(), sqid, cqid, result, 0)
}

pub fn flush(state: &mut SimState, sqe: &Sqe, sqid: u16, cqid: u16) -> Result<()> {
    let result = if sqe.nsid == NSID_BROADCAST || state.valid_nsid(sqe.nsid) {
        status::SUCCESS
    } else {
        status::INVALID_NAMESPACE_OR_FORMAT
    };
    state.complete(sqe.cid(), sqid, cqid, result, 0)
}
