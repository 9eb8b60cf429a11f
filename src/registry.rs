//! Queue registry: (SQID, CQID) rows plus round-robin I/O SQ selection.
//!
//! The admin pair is always row (0, 0). Deleting an SQ leaves the CQ in
//! place (its slot becomes absent); deleting a CQ requires the SQ to be
//! absent already and drops the row.

use std::collections::BTreeMap;

use crate::error::{NvmeError, Result};
use crate::queue::{CompQueue, SubQueue};

type Row = (Option<SubQueue>, Option<CompQueue>);

#[derive(Default)]
pub struct QueueRegistry {
    queues: BTreeMap<(u16, u16), Row>,
    io_sqids: Vec<u16>,
    io_cursor: usize,
}

impl QueueRegistry {
    pub fn new() -> Self {
        QueueRegistry::default()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    /// Inserts a queue pair. Pairs with both qids non-zero join the I/O
    /// round-robin list.
    pub fn add(&mut self, sq: SubQueue, cq: CompQueue) {
        let key = (sq.qid(), cq.qid());
        self.queues.insert(key, (Some(sq), Some(cq)));
        self.rebuild_io_list();
    }

    fn rebuild_io_list(&mut self) {
        self.io_sqids = self
            .queues
            .keys()
            .filter(|(sqid, cqid)| *sqid != 0 && *cqid != 0)
            .map(|(sqid, _)| *sqid)
            .collect();
        if self.io_cursor >= self.io_sqids.len() {
            self.io_cursor = 0;
        }
    }

    /// Marks the SQ absent in every row carrying `sqid` and drops it from
    /// the round-robin list.
    pub fn remove_sq(&mut self, sqid: u16) {
        for ((row_sqid, _), row) in self.queues.iter_mut() {
            if *row_sqid == sqid {
                row.0 = None;
            }
        }
        self.io_sqids.retain(|id| *id != sqid);
        if self.io_cursor >= self.io_sqids.len() {
            self.io_cursor = 0;
        }
    }

    /// Removes the CQ with `cqid`. The paired SQ must already be absent;
    /// rows left with neither queue are dropped.
    pub fn remove_cq(&mut self, cqid: u16) {
        for ((_, row_cqid), row) in self.queues.iter_mut() {
            if *row_cqid == cqid {
                assert!(row.0.is_none(), "removing CQ {} with SQ still present", cqid);
                row.1 = None;
            }
        }
        self.queues
            .retain(|_, row| row.0.is_some() || row.1.is_some());
        self.rebuild_io_list();
    }

    /// Looks up a row. Both keys present demands an exact match; one key
    /// returns the first matching row; neither returns the first row.
    pub fn get(&mut self, sqid: Option<u16>, cqid: Option<u16>) -> Result<&mut Row> {
        match (sqid, cqid) {
            (Some(s), Some(c)) => self
                .queues
                .get_mut(&(s, c))
                .ok_or(NvmeError::UnknownQueuePair(s, c)),
            (Some(s), None) => self
                .queues
                .iter_mut()
                .find(|((row_s, _), _)| *row_s == s)
                .map(|(_, row)| row)
                .ok_or(NvmeError::UnknownQueuePair(s, u16::MAX)),
            (None, Some(c)) => self
                .queues
                .iter_mut()
                .find(|((_, row_c), _)| *row_c == c)
                .map(|(_, row)| row)
                .ok_or(NvmeError::UnknownQueuePair(u16::MAX, c)),
            (None, None) => self
                .queues
                .values_mut()
                .next()
                .ok_or(NvmeError::UnknownQueuePair(u16::MAX, u16::MAX)),
        }
    }

    /// The next I/O SQID under round-robin, or `None` when no I/O SQs exist.
    pub fn next_iosq_id(&mut self) -> Option<u16> {
        if self.io_sqids.is_empty() {
            return None;
        }
        let id = self.io_sqids[self.io_cursor];
        self.io_cursor = (self.io_cursor + 1) % self.io_sqids.len();
        Some(id)
    }

    /// Every CQID with a live CQ, admin first.
    pub fn cqids(&self) -> Vec<u16> {
        self.queues
            .values()
            .filter_map(|(_, cq)| cq.as_ref().map(|c| c.qid()))
            .collect()
    }

    /// Keys of all rows, for iteration that mutates the registry.
    pub fn keys(&self) -> Vec<(u16, u16)> {
        self.queues.keys().copied().collect()
    }

    pub fn io_sqids(&self) -> &[u16] {
        &self.io_sqids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::Doorbell;

    fn pair(sqid: u16, cqid: u16) -> (SubQueue, CompQueue, Vec<u8>, Vec<u8>, Box<(u32, u32)>) {
        let mut dbs = Box::new((0u32, 0u32));
        let mut sq_mem = vec![0u8; 4 * 64];
        let mut cq_mem = vec![0u8; 4 * 16];
        let sq = SubQueue::new(
            sq_mem.as_mut_ptr() as usize,
            0,
            4,
            sqid,
            Doorbell::new(&mut dbs.0 as *mut u32),
        );
        let cq = CompQueue::new(
            cq_mem.as_mut_ptr() as usize,
            0,
            4,
            cqid,
            Doorbell::new(&mut dbs.1 as *mut u32),
            None,
        );
        (sq, cq, sq_mem, cq_mem, dbs)
    }

    #[test]
    fn admin_pair_is_not_io() {
        let mut reg = QueueRegistry::new();
        let (sq, cq, _m1, _m2, _dbs) = pair(0, 0);
        reg.add(sq, cq);
        assert_eq!(reg.len(), 1);
        assert!(reg.io_sqids().is_empty());
        assert_eq!(reg.next_iosq_id(), None);
    }

    #[test]
    fn round_robin_wraps() {
        let mut reg = QueueRegistry::new();
        let mut mems = Vec::new();
        for qid in [0u16, 1, 2, 3] {
            let (sq, cq, m1, m2, dbs) = pair(qid, qid);
            reg.add(sq, cq);
            mems.push((m1, m2, dbs));
        }
        assert_eq!(reg.io_sqids(), &[1, 2, 3]);
        assert_eq!(reg.next_iosq_id(), Some(1));
        assert_eq!(reg.next_iosq_id(), Some(2));
        assert_eq!(reg.next_iosq_id(), Some(3));
        assert_eq!(reg.next_iosq_id(), Some(1));
    }

    #[test]
    fn exact_lookup_fails_on_unknown_pair() {
        let mut reg = QueueRegistry::new();
        let (sq, cq, _m1, _m2, _dbs) = pair(1, 1);
        reg.add(sq, cq);
        assert!(reg.get(Some(1), Some(1)).is_ok());
        assert_eq!(
            reg.get(Some(1), Some(2)).err(),
            Some(NvmeError::UnknownQueuePair(1, 2))
        );
    }

    #[test]
    fn remove_sq_keeps_cq_then_remove_cq_drops_row() {
        let mut reg = QueueRegistry::new();
        let (sq, cq, _m1, _m2, _dbs) = pair(1, 1);
        reg.add(sq, cq);

        reg.remove_sq(1);
        assert_eq!(reg.len(), 1);
        assert!(reg.io_sqids().is_empty());
        {
            let row = reg.get(None, Some(1)).unwrap();
            assert!(row.0.is_none());
            assert!(row.1.is_some());
        }

        reg.remove_cq(1);
        assert!(reg.is_empty());
    }

    #[test]
    fn single_key_lookup_finds_first_match() {
        let mut reg = QueueRegistry::new();
        let (sq, cq, _m1, _m2, _dbs) = pair(2, 5);
        reg.add(sq, cq);
        let row = reg.get(None, Some(5)).unwrap();
        assert_eq!(row.0.as_ref().unwrap().qid(), 2);
        let row = reg.get(Some(2), None).unwrap();
        assert_eq!(row.1.as_ref().unwrap().qid(), 5);
    }
}
