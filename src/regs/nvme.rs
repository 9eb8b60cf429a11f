//! NVMe controller register block (BAR0).
//!
//! Offsets and field positions follow the NVMe 1.4+ controller register
//! layout. The [`Layout`] struct exists only so the offsets can be asserted
//! at compile time; live access always goes through the volatile
//! [`MmioRegion`] in [`NvmeRegs`].

use super::MmioRegion;
use crate::queue::Doorbell;

// Register offsets within BAR0.
pub const REG_CAP: usize = 0x00;
pub const REG_VS: usize = 0x08;
pub const REG_INTMS: usize = 0x0C;
pub const REG_INTMC: usize = 0x10;
pub const REG_CC: usize = 0x14;
pub const REG_CSTS: usize = 0x1C;
pub const REG_NSSR: usize = 0x20;
pub const REG_AQA: usize = 0x24;
pub const REG_ASQ: usize = 0x28;
pub const REG_ACQ: usize = 0x30;
pub const REG_CMBLOC: usize = 0x38;
pub const REG_CMBSZ: usize = 0x3C;
pub const REG_BPINFO: usize = 0x40;
pub const REG_BPRSEL: usize = 0x44;
pub const REG_BPMBL: usize = 0x48;
pub const REG_CMBMSC: usize = 0x50;
pub const REG_CMBSTS: usize = 0x58;
pub const REG_CMBEBS: usize = 0x5C;
pub const REG_CMBSWTP: usize = 0x60;
pub const REG_NSSD: usize = 0x64;
pub const REG_CRTO: usize = 0x68;
pub const REG_PMRCAP: usize = 0xE00;
pub const REG_PMRCTL: usize = 0xE04;
pub const REG_PMRSTS: usize = 0xE08;
pub const REG_PMREBS: usize = 0xE0C;
pub const REG_PMRSWTP: usize = 0xE10;
pub const REG_PMRMSCL: usize = 0xE14;
pub const REG_PMRMSCU: usize = 0xE18;
pub const REG_DOORBELL_BASE: usize = 0x1000;

/// Doorbell pairs defined by the register map.
pub const NUM_DOORBELL_PAIRS: usize = 1024;

/// Smallest BAR0 window that covers every register above.
pub const BAR0_SIZE: usize = REG_DOORBELL_BASE + NUM_DOORBELL_PAIRS * 8;

/// Compile-time image of the register block. Never instantiated; the
/// assertions below pin the layout against the offsets used for access.
#[repr(C)]
#[allow(dead_code)]
pub struct Layout {
    cap: u64,
    vs: u32,
    intms: u32,
    intmc: u32,
    cc: u32,
    _rsvd0: u32,
    csts: u32,
    nssr: u32,
    aqa: u32,
    asq: u64,
    acq: u64,
    cmbloc: u32,
    cmbsz: u32,
    bpinfo: u32,
    bprsel: u32,
    bpmbl: u64,
    cmbmsc: u64,
    cmbsts: u32,
    cmbebs: u32,
    cmbswtp: u32,
    nssd: u32,
    crto: u32,
    _rsvd1: [u32; 869],
    pmrcap: u32,
    pmrctl: u32,
    pmrsts: u32,
    pmrebs: u32,
    pmrswtp: u32,
    pmrmscl: u32,
    pmrmscu: u32,
    _rsvd2: [u32; 121],
    sqndbs: [[u32; 2]; NUM_DOORBELL_PAIRS],
}

const _: () = {
    assert!(core::mem::offset_of!(Layout, cc) == REG_CC);
    assert!(core::mem::offset_of!(Layout, csts) == REG_CSTS);
    assert!(core::mem::offset_of!(Layout, aqa) == REG_AQA);
    assert!(core::mem::offset_of!(Layout, asq) == REG_ASQ);
    assert!(core::mem::offset_of!(Layout, acq) == REG_ACQ);
    assert!(core::mem::offset_of!(Layout, crto) == REG_CRTO);
    assert!(core::mem::offset_of!(Layout, pmrcap) == REG_PMRCAP);
    assert!(core::mem::offset_of!(Layout, pmrmscu) == REG_PMRMSCU);
    assert!(core::mem::offset_of!(Layout, sqndbs) == REG_DOORBELL_BASE);
    assert!(core::mem::size_of::<Layout>() == BAR0_SIZE);
};

// =============================================================================
// Field views
// =============================================================================

/// CAP — Controller Capabilities (64 bits, read-only for the host).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cap(pub u64);

impl Cap {
    /// Maximum Queue Entries Supported (zero-based).
    pub fn mqes(&self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Contiguous Queues Required.
    pub fn cqr(&self) -> bool {
        self.0 >> 16 & 1 != 0
    }

    /// Worst-case ready transition time, in 500 ms units.
    pub fn to(&self) -> u8 {
        (self.0 >> 24 & 0xFF) as u8
    }

    /// Doorbell stride: stride bytes are `4 << DSTRD`.
    pub fn dstrd(&self) -> u8 {
        (self.0 >> 32 & 0xF) as u8
    }

    pub fn nssrs(&self) -> bool {
        self.0 >> 36 & 1 != 0
    }

    /// Command Sets Supported.
    pub fn css(&self) -> u8 {
        (self.0 >> 37 & 0xFF) as u8
    }

    pub fn mpsmin(&self) -> u8 {
        (self.0 >> 48 & 0xF) as u8
    }

    pub fn mpsmax(&self) -> u8 {
        (self.0 >> 52 & 0xF) as u8
    }

    pub fn with_mqes(mut self, v: u16) -> Self {
        self.0 = (self.0 & !0xFFFF) | v as u64;
        self
    }

    pub fn with_css(mut self, v: u8) -> Self {
        self.0 = (self.0 & !(0xFF << 37)) | ((v as u64) << 37);
        self
    }

    pub fn with_to(mut self, v: u8) -> Self {
        self.0 = (self.0 & !(0xFF << 24)) | ((v as u64) << 24);
        self
    }
}

/// VS — controller version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Vs(pub u32);

impl Vs {
    pub fn major(&self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn minor(&self) -> u8 {
        (self.0 >> 8 & 0xFF) as u8
    }

    pub fn tertiary(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    pub fn from_parts(major: u16, minor: u8, tertiary: u8) -> Self {
        Vs((major as u32) << 16 | (minor as u32) << 8 | tertiary as u32)
    }
}

/// CC — Controller Configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cc(pub u32);

impl Cc {
    pub fn en(&self) -> bool {
        self.0 & 1 != 0
    }

    pub fn set_en(&mut self, v: bool) {
        self.0 = (self.0 & !1) | v as u32;
    }

    /// I/O Command Set Selected.
    pub fn css(&self) -> u8 {
        (self.0 >> 4 & 0x7) as u8
    }

    pub fn set_css(&mut self, v: u8) {
        self.0 = (self.0 & !(0x7 << 4)) | ((v as u32 & 0x7) << 4);
    }

    /// Memory Page Size; page bytes are `2^(12 + MPS)`.
    pub fn mps(&self) -> u8 {
        (self.0 >> 7 & 0xF) as u8
    }

    pub fn set_mps(&mut self, v: u8) {
        self.0 = (self.0 & !(0xF << 7)) | ((v as u32 & 0xF) << 7);
    }

    pub fn ams(&self) -> u8 {
        (self.0 >> 11 & 0x7) as u8
    }

    pub fn shn(&self) -> u8 {
        (self.0 >> 14 & 0x3) as u8
    }

    pub fn iosqes(&self) -> u8 {
        (self.0 >> 16 & 0xF) as u8
    }

    pub fn set_iosqes(&mut self, v: u8) {
        self.0 = (self.0 & !(0xF << 16)) | ((v as u32 & 0xF) << 16);
    }

    pub fn iocqes(&self) -> u8 {
        (self.0 >> 20 & 0xF) as u8
    }

    pub fn set_iocqes(&mut self, v: u8) {
        self.0 = (self.0 & !(0xF << 20)) | ((v as u32 & 0xF) << 20);
    }
}

/// CSTS — Controller Status. Device-owned; the host never writes back what
/// it read (no read-modify-write on `*_STS` registers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Csts(pub u32);

impl Csts {
    pub fn rdy(&self) -> bool {
        self.0 & 1 != 0
    }

    pub fn set_rdy(&mut self, v: bool) {
        self.0 = (self.0 & !1) | v as u32;
    }

    /// Controller Fatal Status.
    pub fn cfs(&self) -> bool {
        self.0 >> 1 & 1 != 0
    }

    pub fn set_cfs(&mut self, v: bool) {
        self.0 = (self.0 & !(1 << 1)) | ((v as u32) << 1);
    }

    pub fn shst(&self) -> u8 {
        (self.0 >> 2 & 0x3) as u8
    }

    pub fn nssro(&self) -> bool {
        self.0 >> 4 & 1 != 0
    }
}

/// AQA — Admin Queue Attributes (both sizes zero-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Aqa(pub u32);

impl Aqa {
    pub fn asqs(&self) -> u16 {
        (self.0 & 0xFFF) as u16
    }

    pub fn set_asqs(&mut self, v: u16) {
        self.0 = (self.0 & !0xFFF) | (v as u32 & 0xFFF);
    }

    pub fn acqs(&self) -> u16 {
        (self.0 >> 16 & 0xFFF) as u16
    }

    pub fn set_acqs(&mut self, v: u16) {
        self.0 = (self.0 & !(0xFFF << 16)) | ((v as u32 & 0xFFF) << 16);
    }
}

// =============================================================================
// Register block
// =============================================================================

/// Volatile view of the controller registers at BAR0.
#[derive(Clone)]
pub struct NvmeRegs {
    mmio: MmioRegion,
}

impl NvmeRegs {
    pub fn new(mmio: MmioRegion) -> Self {
        NvmeRegs { mmio }
    }

    pub fn mmio(&self) -> &MmioRegion {
        &self.mmio
    }

    pub fn cap(&self) -> Cap {
        Cap(self.mmio.read64(REG_CAP))
    }

    pub fn set_cap(&self, v: Cap) {
        self.mmio.write64(REG_CAP, v.0)
    }

    pub fn vs(&self) -> Vs {
        Vs(self.mmio.read32(REG_VS))
    }

    pub fn set_vs(&self, v: Vs) {
        self.mmio.write32(REG_VS, v.0)
    }

    pub fn cc(&self) -> Cc {
        Cc(self.mmio.read32(REG_CC))
    }

    pub fn set_cc(&self, v: Cc) {
        self.mmio.write32(REG_CC, v.0)
    }

    pub fn csts(&self) -> Csts {
        Csts(self.mmio.read32(REG_CSTS))
    }

    pub fn set_csts(&self, v: Csts) {
        self.mmio.write32(REG_CSTS, v.0)
    }

    pub fn aqa(&self) -> Aqa {
        Aqa(self.mmio.read32(REG_AQA))
    }

    pub fn set_aqa(&self, v: Aqa) {
        self.mmio.write32(REG_AQA, v.0)
    }

    pub fn asq(&self) -> u64 {
        self.mmio.read64(REG_ASQ)
    }

    pub fn set_asq(&self, v: u64) {
        self.mmio.write64(REG_ASQ, v)
    }

    pub fn acq(&self) -> u64 {
        self.mmio.read64(REG_ACQ)
    }

    pub fn set_acq(&self, v: u64) {
        self.mmio.write64(REG_ACQ, v)
    }

    pub fn intms(&self) -> u32 {
        self.mmio.read32(REG_INTMS)
    }

    pub fn intmc(&self) -> u32 {
        self.mmio.read32(REG_INTMC)
    }

    /// Byte offset of the SQ tail doorbell for `qid`.
    fn sq_doorbell_offset(&self, qid: u16) -> usize {
        let stride = 4usize << self.cap().dstrd();
        REG_DOORBELL_BASE + (qid as usize * 2) * stride
    }

    /// Byte offset of the CQ head doorbell for `qid`.
    fn cq_doorbell_offset(&self, qid: u16) -> usize {
        let stride = 4usize << self.cap().dstrd();
        REG_DOORBELL_BASE + (qid as usize * 2 + 1) * stride
    }

    /// SQ tail doorbell for `qid`, as a raw pointer into the window.
    pub fn sq_tail_doorbell(&self, qid: u16) -> Doorbell {
        let off = self.sq_doorbell_offset(qid);
        debug_assert!(off + 4 <= self.mmio.len());
        Doorbell::new(unsafe { self.mmio.base().add(off) } as *mut u32)
    }

    /// CQ head doorbell for `qid`.
    pub fn cq_head_doorbell(&self, qid: u16) -> Doorbell {
        let off = self.cq_doorbell_offset(qid);
        debug_assert!(off + 4 <= self.mmio.len());
        Doorbell::new(unsafe { self.mmio.base().add(off) } as *mut u32)
    }

    /// Writes zero to every doorbell pair. Done on disable, after which no
    /// queue exists.
    pub fn zero_all_doorbells(&self) {
        for qid in 0..NUM_DOORBELL_PAIRS as u16 {
            self.sq_tail_doorbell(qid).write(0);
            self.cq_head_doorbell(qid).write(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_fields_round_trip() {
        let cap = Cap(0).with_mqes(255).with_css(0x40).with_to(20);
        assert_eq!(cap.mqes(), 255);
        assert_eq!(cap.css(), 0x40);
        assert_eq!(cap.to(), 20);
        assert_eq!(cap.dstrd(), 0);
    }

    #[test]
    fn cc_fields_round_trip() {
        let mut cc = Cc(0);
        cc.set_en(true);
        cc.set_iosqes(6);
        cc.set_iocqes(4);
        cc.set_css(0x06);
        assert!(cc.en());
        assert_eq!(cc.iosqes(), 6);
        assert_eq!(cc.iocqes(), 4);
        assert_eq!(cc.css(), 0x06);
        cc.set_en(false);
        assert!(!cc.en());
        assert_eq!(cc.iosqes(), 6);
    }

    #[test]
    fn aqa_is_zero_based_pair() {
        let mut aqa = Aqa(0);
        aqa.set_asqs(63);
        aqa.set_acqs(255);
        assert_eq!(aqa.asqs(), 63);
        assert_eq!(aqa.acqs(), 255);
    }

    #[test]
    fn version_packing() {
        let vs = Vs::from_parts(2, 1, 0);
        assert_eq!(vs.major(), 2);
        assert_eq!(vs.minor(), 1);
        assert_eq!(vs.tertiary(), 0);
    }
}
