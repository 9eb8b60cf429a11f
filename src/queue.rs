//! Submission and completion ring buffers.
//!
//! Both sides of the MMIO contract use these types: the driver posts into a
//! [`SubQueue`] and reaps a [`CompQueue`]; the simulator drains the same
//! [`SubQueue`] through the tail doorbell and posts completions with the
//! phase bit inverted on every ring wrap.
//!
//! Ring capacity is `entries - 1`; one slot stays unused so an empty ring
//! and a full ring are distinguishable. Posting never touches a doorbell;
//! doorbell writes are explicit and carry a release fence so the slot write
//! is visible first.

use core::ptr;
use core::sync::atomic::{fence, Ordering};

use crate::cmd::{Cqe, Sqe, CQ_ENTRY_SIZE, SQ_ENTRY_SIZE};
use crate::error::{NvmeError, Result};

/// A doorbell register in the BAR0 doorbell array.
#[derive(Debug, Clone, Copy)]
pub struct Doorbell {
    ptr: *mut u32,
}

unsafe impl Send for Doorbell {}

impl Doorbell {
    pub fn new(ptr: *mut u32) -> Self {
        Doorbell { ptr }
    }

    /// Host side: publish a new head/tail value. Ordered after any prior
    /// queue-slot memory writes.
    pub fn write(&self, value: u32) {
        fence(Ordering::Release);
        unsafe { ptr::write_volatile(self.ptr, value) };
    }

    /// Device side: observe the host's last published value.
    pub fn read(&self) -> u32 {
        let v = unsafe { ptr::read_volatile(self.ptr) };
        fence(Ordering::Acquire);
        v
    }
}

/// A head or tail position over a ring of `entries` slots.
#[derive(Debug, Clone, Copy)]
pub struct QueuePointer {
    value: u32,
    entries: u32,
}

impl QueuePointer {
    pub fn new(entries: u32) -> Self {
        QueuePointer { value: 0, entries }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn set(&mut self, value: u32) {
        debug_assert!(value < self.entries);
        self.value = value;
    }

    /// The position after this one, with wrap.
    pub fn peek(&self) -> u32 {
        let next = self.value + 1;
        if next == self.entries {
            0
        } else {
            next
        }
    }

    /// Advances one slot; returns true when the pointer wrapped to 0.
    pub fn advance(&mut self) -> bool {
        self.value = self.peek();
        self.value == 0
    }
}

// =============================================================================
// Submission queue
// =============================================================================

/// One submission queue ring.
///
/// Host role: `tail` is the local producer position, `head` mirrors the
/// device's consumer position as reported in CQE.SQHD. Device role (the
/// simulator): `head` is the local consumer position and the producer
/// position is read from the tail doorbell.
pub struct SubQueue {
    base: usize,
    iova: u64,
    entries: u32,
    qid: u16,
    head: QueuePointer,
    tail: QueuePointer,
    tail_doorbell: Doorbell,
}

unsafe impl Send for SubQueue {}

impl SubQueue {
    pub fn new(base: usize, iova: u64, entries: u32, qid: u16, tail_doorbell: Doorbell) -> Self {
        debug_assert!(entries >= 2);
        SubQueue {
            base,
            iova,
            entries,
            qid,
            head: QueuePointer::new(entries),
            tail: QueuePointer::new(entries),
            tail_doorbell,
        }
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn head_value(&self) -> u32 {
        self.head.value()
    }

    pub fn tail_value(&self) -> u32 {
        self.tail.value()
    }

    /// Mirrors the device-reported SQ head from a completion entry.
    pub fn set_head(&mut self, sqhd: u16) {
        self.head.set(sqhd as u32 % self.entries);
    }

    pub fn is_full(&self) -> bool {
        self.tail.peek() == self.head.value()
    }

    /// Entries currently queued, as seen from this side's pointers.
    pub fn num_entries(&self) -> u32 {
        if self.tail.peek() == self.head.value() {
            self.entries - 1
        } else if self.tail.value() >= self.head.value() {
            self.tail.value() - self.head.value()
        } else {
            self.entries - self.head.value() + self.tail.value()
        }
    }

    #[inline]
    fn slot(&self, index: u32) -> *mut Sqe {
        (self.base + index as usize * SQ_ENTRY_SIZE) as *mut Sqe
    }

    /// Copies the 64-byte entry into the tail slot and advances the local
    /// tail. Does not ring the doorbell.
    pub fn post_command(&mut self, sqe: &Sqe) -> Result<()> {
        if self.is_full() {
            return Err(NvmeError::QueueFull(self.qid));
        }
        unsafe { ptr::write_volatile(self.slot(self.tail.value()), *sqe) };
        self.tail.advance();
        Ok(())
    }

    /// Publishes the local tail to the tail doorbell.
    pub fn ring_tail(&self) {
        self.tail_doorbell.write(self.tail.value());
    }

    /// Device side: takes the next entry if the host has published one.
    pub fn get_command(&mut self) -> Option<Sqe> {
        let tail = self.tail_doorbell.read() % self.entries;
        if self.head.value() == tail {
            return None;
        }
        let sqe = unsafe { ptr::read_volatile(self.slot(self.head.value())) };
        self.head.advance();
        Some(sqe)
    }

    /// Device side: entries the host has published but we have not consumed.
    pub fn pending(&self) -> u32 {
        let tail = self.tail_doorbell.read() % self.entries;
        (tail + self.entries - self.head.value()) % self.entries
    }
}

// =============================================================================
// Completion queue
// =============================================================================

/// One completion queue ring.
///
/// Host role: `head` is the local consumer position and `phase` is the
/// phase value the next valid entry must carry. Device role: `tail` is the
/// local producer position; the host's consumer position is read from the
/// head doorbell.
pub struct CompQueue {
    base: usize,
    iova: u64,
    entries: u32,
    qid: u16,
    head: QueuePointer,
    tail: QueuePointer,
    head_doorbell: Doorbell,
    phase: bool,
    int_vector: Option<u16>,
}

unsafe impl Send for CompQueue {}

impl CompQueue {
    pub fn new(
        base: usize,
        iova: u64,
        entries: u32,
        qid: u16,
        head_doorbell: Doorbell,
        int_vector: Option<u16>,
    ) -> Self {
        debug_assert!(entries >= 2);
        CompQueue {
            base,
            iova,
            entries,
            qid,
            head: QueuePointer::new(entries),
            tail: QueuePointer::new(entries),
            head_doorbell,
            phase: true,
            int_vector,
        }
    }

    pub fn qid(&self) -> u16 {
        self.qid
    }

    pub fn entries(&self) -> u32 {
        self.entries
    }

    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn phase(&self) -> bool {
        self.phase
    }

    pub fn int_vector(&self) -> Option<u16> {
        self.int_vector
    }

    pub fn head_value(&self) -> u32 {
        self.head.value()
    }

    #[inline]
    fn slot(&self, index: u32) -> usize {
        self.base + index as usize * CQ_ENTRY_SIZE
    }

    /// Reads the entry at the head slot without consuming it. The status
    /// halfword (carrying the phase bit) is read first; the caller decides
    /// validity by comparing the phase against [`CompQueue::phase`].
    pub fn get_next_completion(&self) -> Cqe {
        let slot = self.slot(self.head.value());
        let status = unsafe { ptr::read_volatile((slot + 14) as *const u16) };
        fence(Ordering::Acquire);
        let mut cqe = unsafe { ptr::read_volatile(slot as *const Cqe) };
        cqe.status = status;
        cqe
    }

    /// Consumes the head slot; flips the expected phase when the head wraps
    /// back to slot 0.
    pub fn consume_completion(&mut self) {
        if self.head.advance() {
            self.phase = !self.phase;
        }
    }

    /// Publishes the local head to the head doorbell.
    pub fn ring_head(&self) {
        self.head_doorbell.write(self.head.value());
    }

    /// Device side: posts an entry at the tail with the phase bit set to
    /// the inverse of whatever the slot currently holds, so each wrap flips
    /// the phase the host observes.
    pub fn post_completion(&mut self, mut cqe: Cqe) -> Result<()> {
        let host_head = self.head_doorbell.read() % self.entries;
        if self.tail.peek() == host_head {
            return Err(NvmeError::QueueFull(self.qid));
        }

        let slot = self.slot(self.tail.value());
        let current = StatusByte(unsafe { ptr::read_volatile((slot + 14) as *const u16) });
        let mut sf = cqe.status_field();
        sf.set_phase(!current.phase());
        cqe.status = sf.0;

        // Payload first, status halfword (with the phase bit) last, so the
        // host cannot observe a valid phase ahead of the payload.
        unsafe {
            let bytes = &cqe as *const Cqe as *const u8;
            ptr::copy_nonoverlapping(bytes, slot as *mut u8, 14);
            fence(Ordering::Release);
            ptr::write_volatile((slot + 14) as *mut u16, cqe.status);
        }
        self.tail.advance();
        Ok(())
    }
}

struct StatusByte(u16);

impl StatusByte {
    fn phase(&self) -> bool {
        self.0 & 1 != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::StatusField;

    fn ring(entries: u32, entry_size: usize) -> Vec<u8> {
        vec![0u8; entries as usize * entry_size]
    }

    fn doorbell(storage: &mut u32) -> Doorbell {
        Doorbell::new(storage as *mut u32)
    }

    #[test]
    fn sq_capacity_is_entries_minus_one() {
        let mut mem = ring(4, SQ_ENTRY_SIZE);
        let mut db = 0u32;
        let mut sq = SubQueue::new(mem.as_mut_ptr() as usize, 0, 4, 1, doorbell(&mut db));

        let sqe = Sqe::zeroed();
        for _ in 0..3 {
            sq.post_command(&sqe).unwrap();
        }
        assert!(sq.is_full());
        assert_eq!(sq.num_entries(), 3);
        assert_eq!(sq.post_command(&sqe), Err(NvmeError::QueueFull(1)));
    }

    #[test]
    fn sq_pointers_stay_in_range_across_wraps() {
        let mut mem = ring(4, SQ_ENTRY_SIZE);
        let mut db = 0u32;
        let mut sq = SubQueue::new(mem.as_mut_ptr() as usize, 0, 4, 1, doorbell(&mut db));

        let sqe = Sqe::zeroed();
        for i in 0..64u16 {
            sq.post_command(&sqe).unwrap();
            sq.ring_tail();
            // Device consumes immediately; mirror its head.
            sq.set_head(((i as u32 + 1) % 4) as u16);
            assert!(sq.head_value() < 4);
            assert!(sq.tail_value() < 4);
            assert!(sq.num_entries() <= 3);
        }
    }

    #[test]
    fn sq_doorbell_is_explicit() {
        let mut mem = ring(8, SQ_ENTRY_SIZE);
        let mut db = 0u32;
        let mut sq = SubQueue::new(mem.as_mut_ptr() as usize, 0, 8, 1, doorbell(&mut db));

        sq.post_command(&Sqe::zeroed()).unwrap();
        assert_eq!(db, 0, "post must not ring");
        sq.ring_tail();
        assert_eq!(db, 1);
    }

    #[test]
    fn sq_device_side_drains_through_doorbell() {
        let mut mem = ring(4, SQ_ENTRY_SIZE);
        let mut db = 0u32;
        let base = mem.as_mut_ptr() as usize;

        let mut host = SubQueue::new(base, 0, 4, 1, doorbell(&mut db));
        let mut dev = SubQueue::new(base, 0, 4, 1, Doorbell::new(&mut db as *mut u32));

        assert!(dev.get_command().is_none());

        let mut sqe = Sqe::zeroed();
        sqe.set_opc(0x02);
        sqe.set_cid(7);
        host.post_command(&sqe).unwrap();
        host.ring_tail();

        assert_eq!(dev.pending(), 1);
        let got = dev.get_command().unwrap();
        assert_eq!(got.opc(), 0x02);
        assert_eq!(got.cid(), 7);
        assert!(dev.get_command().is_none());
    }

    #[test]
    fn cq_phase_flips_exactly_on_wrap() {
        let mut mem = ring(3, CQ_ENTRY_SIZE);
        let mut host_db = 0u32;
        let base = mem.as_mut_ptr() as usize;

        let mut host = CompQueue::new(base, 0, 3, 1, doorbell(&mut host_db), None);
        let mut dev = CompQueue::new(base, 0, 3, 1, Doorbell::new(&mut host_db as *mut u32), None);

        let mut flips = 0;
        let mut last_phase = host.phase();
        for i in 0..12u16 {
            dev.post_completion(Cqe {
                cid: i,
                sqid: 1,
                ..Default::default()
            })
            .unwrap();

            let cqe = host.get_next_completion();
            assert_eq!(cqe.status_field().phase(), host.phase(), "entry {} visible", i);
            assert_eq!(cqe.cid, i);
            host.consume_completion();
            host.ring_head();

            if host.phase() != last_phase {
                flips += 1;
                last_phase = host.phase();
                assert_eq!(host.head_value(), 0, "phase may only flip on wrap");
            }
        }
        assert_eq!(flips, 4, "one flip per wrap");
    }

    #[test]
    fn cq_entry_not_visible_before_post() {
        let mut mem = ring(4, CQ_ENTRY_SIZE);
        let mut host_db = 0u32;
        let base = mem.as_mut_ptr() as usize;

        let host = CompQueue::new(base, 0, 4, 1, doorbell(&mut host_db), None);
        let cqe = host.get_next_completion();
        // Fresh ring holds phase 0 entries; host expects phase 1.
        assert_ne!(cqe.status_field().phase(), host.phase());
    }

    #[test]
    fn cq_post_inverts_slot_phase() {
        let mut mem = ring(2, CQ_ENTRY_SIZE);
        let mut host_db = 0u32;
        let base = mem.as_mut_ptr() as usize;

        let mut host = CompQueue::new(base, 0, 2, 1, doorbell(&mut host_db), None);
        let mut dev = CompQueue::new(base, 0, 2, 1, Doorbell::new(&mut host_db as *mut u32), None);

        // First pass writes phase 1 into slot 0.
        dev.post_completion(Cqe::default()).unwrap();
        assert!(host.get_next_completion().status_field().phase());
        host.consume_completion();
        host.ring_head();

        // Fill slot 1, wrap, and the second pass over slot 0 writes phase 0.
        dev.post_completion(Cqe::default()).unwrap();
        host.consume_completion();
        host.ring_head();
        dev.post_completion(Cqe::default()).unwrap();

        let cqe = host.get_next_completion();
        assert!(!cqe.status_field().phase());
        // After the wrap the host expects phase 0, so the entry is visible.
        assert_eq!(cqe.status_field().phase(), host.phase());
    }

    #[test]
    fn cq_full_rejects_post() {
        let mut mem = ring(2, CQ_ENTRY_SIZE);
        let mut host_db = 0u32;
        let base = mem.as_mut_ptr() as usize;

        let mut dev = CompQueue::new(base, 0, 2, 1, Doorbell::new(&mut host_db as *mut u32), None);
        dev.post_completion(Cqe::default()).unwrap();
        assert_eq!(dev.post_completion(Cqe::default()), Err(NvmeError::QueueFull(1)));
    }

    #[test]
    fn status_field_written_with_inverted_phase_only() {
        // post_completion must not otherwise disturb SC/SCT.
        let mut mem = ring(4, CQ_ENTRY_SIZE);
        let mut host_db = 0u32;
        let base = mem.as_mut_ptr() as usize;
        let mut dev = CompQueue::new(base, 0, 4, 1, Doorbell::new(&mut host_db as *mut u32), None);

        let mut sf = StatusField(0);
        sf.set_sc(0x80);
        sf.set_sct(1);
        dev.post_completion(Cqe {
            status: sf.0,
            ..Default::default()
        })
        .unwrap();

        let host = CompQueue::new(base, 0, 4, 1, doorbell(&mut host_db), None);
        let cqe = host.get_next_completion();
        assert_eq!(cqe.status_field().sc(), 0x80);
        assert_eq!(cqe.status_field().sct(), 1);
        assert!(cqe.status_field().phase());
    }
}
