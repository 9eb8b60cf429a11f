//! Admin command constructors and their data-in/data-out structures.
//!
//! Structure layouts follow the NVMe 1.4 identify, log and feature data
//! formats; sizes and the load-bearing offsets are asserted at compile
//! time. Raw buffers convert through `from_bytes`/`as_bytes` so no caller
//! ever aliases device-owned memory.

use crate::cmd::{Command, CommandKind};

/// Identify CNS selectors.
pub const CNS_NAMESPACE: u8 = 0x00;
pub const CNS_CONTROLLER: u8 = 0x01;
pub const CNS_NAMESPACE_LIST: u8 = 0x02;
pub const CNS_UUID_LIST: u8 = 0x03;

/// Log page identifiers the crate has typed payloads for.
pub const LID_SUPPORTED_PAGES: u8 = 0x00;
pub const LID_ERROR_INFO: u8 = 0x01;
pub const LID_SMART: u8 = 0x02;
pub const LID_FIRMWARE_SLOT: u8 = 0x03;
pub const LID_CHANGED_NAMESPACES: u8 = 0x04;
pub const LID_COMMANDS_SUPPORTED: u8 = 0x05;
pub const LID_DEVICE_SELF_TEST: u8 = 0x06;

/// Feature identifiers the crate has typed payloads for.
pub const FID_ARBITRATION: u8 = 0x01;
pub const FID_POWER_MANAGEMENT: u8 = 0x02;
pub const FID_TEMPERATURE_THRESHOLD: u8 = 0x04;
pub const FID_ERROR_RECOVERY: u8 = 0x05;
pub const FID_VOLATILE_WRITE_CACHE: u8 = 0x06;
pub const FID_NUMBER_OF_QUEUES: u8 = 0x07;

/// All identify data structures are one 4 KiB page.
pub const IDENTIFY_DATA_SIZE: usize = 4096;

// =============================================================================
// Constructors
// =============================================================================

impl Command {
    pub fn identify_controller() -> Command {
        let mut cmd = Command::new(CommandKind::Identify {
            cns: CNS_CONTROLLER,
        })
        .with_data_in(IDENTIFY_DATA_SIZE);
        cmd.sqe.cdw10 = CNS_CONTROLLER as u32;
        cmd
    }

    pub fn identify_namespace(nsid: u32) -> Command {
        let mut cmd = Command::new(CommandKind::Identify { cns: CNS_NAMESPACE })
            .with_data_in(IDENTIFY_DATA_SIZE);
        cmd.sqe.nsid = nsid;
        cmd.sqe.cdw10 = CNS_NAMESPACE as u32;
        cmd
    }

    pub fn identify_namespace_list() -> Command {
        let mut cmd = Command::new(CommandKind::Identify {
            cns: CNS_NAMESPACE_LIST,
        })
        .with_data_in(IDENTIFY_DATA_SIZE);
        cmd.sqe.cdw10 = CNS_NAMESPACE_LIST as u32;
        cmd
    }

    pub fn identify_uuid_list() -> Command {
        let mut cmd = Command::new(CommandKind::Identify { cns: CNS_UUID_LIST })
            .with_data_in(IDENTIFY_DATA_SIZE);
        cmd.sqe.cdw10 = CNS_UUID_LIST as u32;
        cmd
    }

    /// Create I/O Completion Queue. `entries` is the one-based depth;
    /// `prp1` the queue memory IOVA; `iv` the MSI-X vector (None when
    /// polling); `pc` physically contiguous.
    pub fn create_io_cq(qid: u16, entries: u32, prp1: u64, iv: Option<u16>, pc: bool) -> Command {
        let mut cmd = Command::new(CommandKind::CreateIoCq);
        cmd.sqe.prp1 = prp1;
        cmd.sqe.cdw10 = (entries - 1) << 16 | qid as u32;
        let ien = iv.is_some();
        let vector = iv.unwrap_or(0);
        cmd.sqe.cdw11 = (vector as u32) << 16 | (ien as u32) << 1 | pc as u32;
        cmd
    }

    /// Create I/O Submission Queue bound to `cqid`.
    pub fn create_io_sq(
        qid: u16,
        entries: u32,
        prp1: u64,
        cqid: u16,
        qprio: u8,
        pc: bool,
        nvmsetid: u16,
    ) -> Command {
        let mut cmd = Command::new(CommandKind::CreateIoSq);
        cmd.sqe.prp1 = prp1;
        cmd.sqe.cdw10 = (entries - 1) << 16 | qid as u32;
        cmd.sqe.cdw11 = (cqid as u32) << 16 | ((qprio as u32) & 0x3) << 1 | pc as u32;
        cmd.sqe.cdw12 = nvmsetid as u32;
        cmd
    }

    pub fn delete_io_sq(qid: u16) -> Command {
        let mut cmd = Command::new(CommandKind::DeleteIoSq);
        cmd.sqe.cdw10 = qid as u32;
        cmd
    }

    pub fn delete_io_cq(qid: u16) -> Command {
        let mut cmd = Command::new(CommandKind::DeleteIoCq);
        cmd.sqe.cdw10 = qid as u32;
        cmd
    }

    /// Get Log Page for `lid`, transferring `num_bytes` (dword granular).
    pub fn get_log_page(lid: u8, num_bytes: usize, nsid: u32) -> Command {
        debug_assert!(num_bytes % 4 == 0 && num_bytes > 0);
        let mut cmd =
            Command::new(CommandKind::GetLogPage { lid }).with_data_in(num_bytes);
        let numd = (num_bytes / 4 - 1) as u32;
        cmd.sqe.nsid = nsid;
        cmd.sqe.cdw10 = (numd & 0xFFFF) << 16 | lid as u32;
        cmd.sqe.cdw11 = numd >> 16;
        cmd
    }

    pub fn get_log_supported_pages() -> Command {
        Command::get_log_page(
            LID_SUPPORTED_PAGES,
            core::mem::size_of::<LogSupportedPages>(),
            0,
        )
    }

    pub fn get_log_error_info(entries: usize) -> Command {
        Command::get_log_page(
            LID_ERROR_INFO,
            entries * core::mem::size_of::<ErrorInfoEntry>(),
            0,
        )
    }

    pub fn get_log_smart() -> Command {
        Command::get_log_page(LID_SMART, core::mem::size_of::<SmartLog>(), 0xFFFF_FFFF)
    }

    pub fn get_log_firmware_slot() -> Command {
        Command::get_log_page(
            LID_FIRMWARE_SLOT,
            core::mem::size_of::<FirmwareSlotLog>(),
            0,
        )
    }

    pub fn get_log_changed_namespaces() -> Command {
        Command::get_log_page(
            LID_CHANGED_NAMESPACES,
            core::mem::size_of::<ChangedNamespaceList>(),
            0,
        )
    }

    pub fn get_log_commands_supported() -> Command {
        Command::get_log_page(
            LID_COMMANDS_SUPPORTED,
            core::mem::size_of::<CommandEffectsLog>(),
            0,
        )
    }

    pub fn get_log_device_self_test() -> Command {
        Command::get_log_page(
            LID_DEVICE_SELF_TEST,
            core::mem::size_of::<SelfTestLog>(),
            0,
        )
    }

    /// Get Feature; the result arrives in CQE dword 0.
    pub fn get_feature(fid: u8, sel: u8) -> Command {
        let mut cmd = Command::new(CommandKind::GetFeature { fid });
        cmd.sqe.cdw10 = ((sel as u32) & 0x7) << 8 | fid as u32;
        cmd
    }

    /// Set Feature with the feature value in dword 11.
    pub fn set_feature(fid: u8, value: u32, save: bool) -> Command {
        let mut cmd = Command::new(CommandKind::SetFeature { fid });
        cmd.sqe.cdw10 = (save as u32) << 31 | fid as u32;
        cmd.sqe.cdw11 = value;
        cmd
    }

    pub fn get_feature_power_management() -> Command {
        Command::get_feature(FID_POWER_MANAGEMENT, 0)
    }

    pub fn set_feature_power_management(ps: u8) -> Command {
        Command::set_feature(
            FID_POWER_MANAGEMENT,
            FeaturePowerManagement::new(ps, 0).0,
            false,
        )
    }

    pub fn get_feature_arbitration() -> Command {
        Command::get_feature(FID_ARBITRATION, 0)
    }

    pub fn set_feature_arbitration(ab: u8, lpw: u8, mpw: u8, hpw: u8) -> Command {
        Command::set_feature(
            FID_ARBITRATION,
            FeatureArbitration::new(ab, lpw, mpw, hpw).0,
            false,
        )
    }

    pub fn get_feature_temperature_threshold() -> Command {
        Command::get_feature(FID_TEMPERATURE_THRESHOLD, 0)
    }

    /// Temperature threshold in kelvins for the composite sensor.
    pub fn set_feature_temperature_threshold(tmpth: u16) -> Command {
        Command::set_feature(
            FID_TEMPERATURE_THRESHOLD,
            FeatureTemperatureThreshold::new(tmpth, 0, 0).0,
            false,
        )
    }

    pub fn get_feature_volatile_write_cache() -> Command {
        Command::get_feature(FID_VOLATILE_WRITE_CACHE, 0)
    }

    pub fn set_feature_volatile_write_cache(enable: bool) -> Command {
        Command::set_feature(FID_VOLATILE_WRITE_CACHE, enable as u32, false)
    }

    /// Requests `nsq` submission and `ncq` completion queues (one-based);
    /// the controller answers with the allocated counts in CQE dword 0.
    pub fn set_feature_number_of_queues(nsq: u16, ncq: u16) -> Command {
        Command::set_feature(
            FID_NUMBER_OF_QUEUES,
            FeatureNumberOfQueues::new(nsq, ncq).0,
            false,
        )
    }

    /// Format NVM. `ses` is the secure-erase setting (0 = none).
    pub fn format_nvm(nsid: u32, lbaf: u8, ses: u8) -> Command {
        let mut cmd = Command::new(CommandKind::FormatNvm);
        cmd.sqe.nsid = nsid;
        cmd.sqe.cdw10 = ((ses as u32) & 0x7) << 9 | (lbaf as u32) & 0xF;
        cmd
    }

    pub fn sanitize(action: SanitizeAction) -> Command {
        let mut cmd = Command::new(CommandKind::Sanitize);
        cmd.sqe.cdw10 = action as u32 & 0x7;
        cmd
    }
}

/// Sanitize operation selector (SANACT).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SanitizeAction {
    ExitFailureMode = 1,
    BlockErase = 2,
    Overwrite = 3,
    CryptoErase = 4,
}

// =============================================================================
// Feature payloads (CQE dword 0 / command dword 11)
// =============================================================================

/// Power Management feature value: PS in bits 0..4, WH in bits 5..7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeaturePowerManagement(pub u32);

impl FeaturePowerManagement {
    pub fn new(ps: u8, wh: u8) -> Self {
        FeaturePowerManagement((ps as u32 & 0xF) | ((wh as u32) & 0x7) << 5)
    }

    pub fn ps(&self) -> u8 {
        (self.0 & 0xF) as u8
    }

    pub fn wh(&self) -> u8 {
        (self.0 >> 5 & 0x7) as u8
    }
}

/// Arbitration feature value: burst plus the three weight fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureArbitration(pub u32);

impl FeatureArbitration {
    pub fn new(ab: u8, lpw: u8, mpw: u8, hpw: u8) -> Self {
        FeatureArbitration(
            (ab as u32 & 0x7)
                | (lpw as u32) << 8
                | (mpw as u32) << 16
                | (hpw as u32) << 24,
        )
    }

    pub fn ab(&self) -> u8 {
        (self.0 & 0x7) as u8
    }

    pub fn lpw(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn mpw(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn hpw(&self) -> u8 {
        (self.0 >> 24) as u8
    }
}

/// Temperature Threshold feature value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureTemperatureThreshold(pub u32);

impl FeatureTemperatureThreshold {
    pub fn new(tmpth: u16, tmpsel: u8, thsel: u8) -> Self {
        FeatureTemperatureThreshold(
            tmpth as u32 | ((tmpsel as u32) & 0xF) << 16 | ((thsel as u32) & 0x3) << 20,
        )
    }

    pub fn tmpth(&self) -> u16 {
        self.0 as u16
    }

    pub fn tmpsel(&self) -> u8 {
        (self.0 >> 16 & 0xF) as u8
    }

    pub fn thsel(&self) -> u8 {
        (self.0 >> 20 & 0x3) as u8
    }
}

/// Error Recovery feature value: retry limit plus deallocated-block error
/// reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureErrorRecovery(pub u32);

impl FeatureErrorRecovery {
    pub fn new(tler: u16, dulbe: bool) -> Self {
        FeatureErrorRecovery(tler as u32 | (dulbe as u32) << 16)
    }

    pub fn tler(&self) -> u16 {
        self.0 as u16
    }

    pub fn dulbe(&self) -> bool {
        self.0 >> 16 & 1 != 0
    }
}

/// Number of Queues feature value; the same layout carries the requested
/// counts on submit and the allocated counts in CQE dword 0 (zero-based
/// on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeatureNumberOfQueues(pub u32);

impl FeatureNumberOfQueues {
    pub fn new(nsq: u16, ncq: u16) -> Self {
        FeatureNumberOfQueues((nsq as u32 - 1) | (ncq as u32 - 1) << 16)
    }

    pub fn nsq(&self) -> u16 {
        (self.0 & 0xFFFF) as u16 + 1
    }

    pub fn ncq(&self) -> u16 {
        (self.0 >> 16) as u16 + 1
    }
}

// =============================================================================
// Identify data
// =============================================================================

fn string_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\0', ' '])
        .to_string()
}

fn fill_string_field(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
    for b in field[n..].iter_mut() {
        *b = b' ';
    }
}

macro_rules! raw_struct_impl {
    ($ty:ty) => {
        impl $ty {
            pub fn zeroed() -> Self {
                unsafe { core::mem::zeroed() }
            }

            pub fn from_bytes(bytes: &[u8]) -> Self {
                assert!(bytes.len() >= core::mem::size_of::<Self>());
                unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
            }

            pub fn as_bytes(&self) -> &[u8] {
                unsafe {
                    core::slice::from_raw_parts(
                        self as *const Self as *const u8,
                        core::mem::size_of::<Self>(),
                    )
                }
            }
        }
    };
}

/// Power state descriptor within the identify controller data (32 bytes).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct PowerStateDescriptor {
    /// Maximum power, in units selected by MXPS.
    pub mp: u16,
    pub _rsvd2: u8,
    /// Bit 0: MXPS (0.01 W scale when set); bit 1: NOPS.
    pub flags: u8,
    pub enlat: u32,
    pub exlat: u32,
    pub rrt: u8,
    pub rrl: u8,
    pub rwt: u8,
    pub rwl: u8,
    pub idlp: u16,
    pub ips: u8,
    pub _rsvd17: u8,
    pub actp: u16,
    pub apw_aps: u8,
    pub _rsvd21: [u8; 9],
}

const _: () = assert!(core::mem::size_of::<PowerStateDescriptor>() == 32);

/// Identify Controller data (CNS 0x01), 4096 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IdentifyController {
    pub vid: u16,
    pub ssvid: u16,
    pub sn: [u8; 20],
    pub mn: [u8; 40],
    pub fr: [u8; 8],
    pub rab: u8,
    pub ieee: [u8; 3],
    pub cmic: u8,
    /// Maximum Data Transfer Size, as a power of two of the minimum page.
    pub mdts: u8,
    pub cntlid: u16,
    pub ver: u32,
    pub rtd3r: u32,
    pub rtd3e: u32,
    pub oaes: u32,
    pub ctratt: u32,
    pub rrls: u16,
    pub _rsvd102: [u8; 9],
    pub cntrltype: u8,
    pub fguid: [u8; 16],
    pub crdt1: u16,
    pub crdt2: u16,
    pub crdt3: u16,
    pub _rsvd134: [u8; 122],
    pub oacs: u16,
    pub acl: u8,
    pub aerl: u8,
    pub frmw: u8,
    pub lpa: u8,
    pub elpe: u8,
    /// Number of power states supported (zero-based).
    pub npss: u8,
    pub avscc: u8,
    pub apsta: u8,
    pub wctemp: u16,
    pub cctemp: u16,
    pub mtfa: u16,
    pub hmpre: u32,
    pub hmmin: u32,
    pub tnvmcap: [u8; 16],
    pub unvmcap: [u8; 16],
    pub rpmbs: u32,
    pub edstt: u16,
    pub dsto: u8,
    pub fwug: u8,
    pub kas: u16,
    pub hctma: u16,
    pub mntmt: u16,
    pub mxtmt: u16,
    pub sanicap: u32,
    pub _rsvd332: [u8; 180],
    pub sqes: u8,
    pub cqes: u8,
    pub maxcmd: u16,
    /// Number of namespaces.
    pub nn: u32,
    pub oncs: u16,
    pub fuses: u16,
    pub fna: u8,
    pub vwc: u8,
    pub awun: u16,
    pub awupf: u16,
    pub nvscc: u8,
    pub nwpc: u8,
    pub acwu: u16,
    pub _rsvd534: u16,
    pub sgls: u32,
    pub mnan: u32,
    pub _rsvd544: [u8; 224],
    pub subnqn: [u8; 256],
    pub _rsvd1024: [u8; 1024],
    pub psd: [PowerStateDescriptor; 32],
    pub vs: [u8; 1024],
}

const _: () = {
    assert!(core::mem::size_of::<IdentifyController>() == IDENTIFY_DATA_SIZE);
    assert!(core::mem::offset_of!(IdentifyController, sn) == 4);
    assert!(core::mem::offset_of!(IdentifyController, mn) == 24);
    assert!(core::mem::offset_of!(IdentifyController, fr) == 64);
    assert!(core::mem::offset_of!(IdentifyController, mdts) == 77);
    assert!(core::mem::offset_of!(IdentifyController, oacs) == 256);
    assert!(core::mem::offset_of!(IdentifyController, npss) == 263);
    assert!(core::mem::offset_of!(IdentifyController, sqes) == 512);
    assert!(core::mem::offset_of!(IdentifyController, nn) == 516);
    assert!(core::mem::offset_of!(IdentifyController, psd) == 2048);
};

raw_struct_impl!(IdentifyController);

impl IdentifyController {
    pub fn serial_string(&self) -> String {
        string_field(&self.sn)
    }

    pub fn model_string(&self) -> String {
        string_field(&self.mn)
    }

    pub fn firmware_string(&self) -> String {
        string_field(&self.fr)
    }

    pub fn set_serial(&mut self, sn: &str) {
        fill_string_field(&mut self.sn, sn);
    }

    pub fn set_model(&mut self, mn: &str) {
        fill_string_field(&mut self.mn, mn);
    }

    pub fn set_firmware(&mut self, fr: &str) {
        fill_string_field(&mut self.fr, fr);
    }

    /// Maximum transfer size in bytes given the CAP minimum page size;
    /// `None` when the device reports no limit.
    pub fn max_transfer_bytes(&self, mpsmin_bytes: usize) -> Option<usize> {
        if self.mdts == 0 {
            None
        } else {
            Some(mpsmin_bytes << self.mdts)
        }
    }
}

/// One LBA format descriptor (identify namespace LBAF table entry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LbaFormat(pub u32);

impl LbaFormat {
    pub fn new(ms: u16, lbads: u8, rp: u8) -> Self {
        LbaFormat((ms as u32) | (lbads as u32) << 16 | ((rp as u32) & 0x3) << 24)
    }

    /// Metadata bytes per block.
    pub fn ms(&self) -> u16 {
        self.0 as u16
    }

    /// LBA data size as a power of two.
    pub fn lbads(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn rp(&self) -> u8 {
        (self.0 >> 24 & 0x3) as u8
    }

    pub fn block_size(&self) -> u32 {
        1 << self.lbads()
    }
}

/// Identify Namespace data (CNS 0x00), 4096 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct IdentifyNamespace {
    pub nsze: u64,
    pub ncap: u64,
    pub nuse: u64,
    pub nsfeat: u8,
    /// Number of LBA formats (zero-based).
    pub nlbaf: u8,
    /// Formatted LBA size: index into the LBAF table in bits 0..4.
    pub flbas: u8,
    pub mc: u8,
    pub dpc: u8,
    pub dps: u8,
    pub nmic: u8,
    pub rescap: u8,
    pub fpi: u8,
    pub dlfeat: u8,
    pub nawun: u16,
    pub nawupf: u16,
    pub nacwu: u16,
    pub nabsn: u16,
    pub nabo: u16,
    pub nabspf: u16,
    pub noiob: u16,
    pub nvmcap: [u8; 16],
    pub npwg: u16,
    pub npwa: u16,
    pub npdg: u16,
    pub npda: u16,
    pub nows: u16,
    pub _rsvd74: [u8; 18],
    pub anagrpid: u32,
    pub _rsvd96: [u8; 3],
    pub nsattr: u8,
    pub nvmsetid: u16,
    pub endgid: u16,
    pub nguid: [u8; 16],
    pub eui64: [u8; 8],
    pub lbaf: [u32; 16],
    pub _rsvd192: [u8; 3904],
}

const _: () = {
    assert!(core::mem::size_of::<IdentifyNamespace>() == IDENTIFY_DATA_SIZE);
    assert!(core::mem::offset_of!(IdentifyNamespace, nlbaf) == 25);
    assert!(core::mem::offset_of!(IdentifyNamespace, flbas) == 26);
    assert!(core::mem::offset_of!(IdentifyNamespace, lbaf) == 128);
};

raw_struct_impl!(IdentifyNamespace);

impl IdentifyNamespace {
    pub fn formatted_lbaf(&self) -> LbaFormat {
        LbaFormat(self.lbaf[(self.flbas & 0xF) as usize])
    }

    pub fn set_lbaf(&mut self, index: usize, format: LbaFormat) {
        self.lbaf[index] = format.0;
    }

    pub fn block_size(&self) -> u32 {
        self.formatted_lbaf().block_size()
    }
}

/// Identify active namespace list (CNS 0x02): 1024 NSIDs.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NamespaceList {
    pub ids: [u32; 1024],
}

const _: () = assert!(core::mem::size_of::<NamespaceList>() == IDENTIFY_DATA_SIZE);

raw_struct_impl!(NamespaceList);

impl NamespaceList {
    pub fn active(&self) -> impl Iterator<Item = u32> + '_ {
        self.ids.iter().copied().take_while(|id| *id != 0)
    }
}

/// One UUID list entry (CNS 0x03).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UuidEntry {
    /// Association in bits 0..2.
    pub header: u8,
    pub _rsvd1: [u8; 15],
    pub uuid: [u8; 16],
}

/// Identify UUID list: 128 entries.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct UuidList {
    pub entries: [UuidEntry; 128],
}

const _: () = assert!(core::mem::size_of::<UuidList>() == IDENTIFY_DATA_SIZE);

raw_struct_impl!(UuidList);

// =============================================================================
// Log page data
// =============================================================================

/// Supported Log Pages (LID 0x00): one dword per LID. Bit 0 LSUPP,
/// bit 1 IOS.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LogSupportedPages {
    pub lids: [u32; 256],
}

const _: () = assert!(core::mem::size_of::<LogSupportedPages>() == 1024);

raw_struct_impl!(LogSupportedPages);

impl LogSupportedPages {
    pub fn supported(&self, lid: u8) -> bool {
        self.lids[lid as usize] & 1 != 0
    }

    pub fn mark_supported(&mut self, lid: u8, index_offset: bool) {
        self.lids[lid as usize] = 1 | (index_offset as u32) << 1;
    }
}

/// Error Information log entry (LID 0x01), 64 bytes.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct ErrorInfoEntry {
    pub error_count: u64,
    pub sqid: u16,
    pub cid: u16,
    pub status: u16,
    pub param_error_location: u16,
    pub lba: u64,
    pub nsid: u32,
    pub vs_info: u8,
    pub trtype: u8,
    pub _rsvd30: u16,
    pub cmd_specific: u64,
    pub trtype_specific: u16,
    pub _rsvd42: [u8; 22],
}

const _: () = assert!(core::mem::size_of::<ErrorInfoEntry>() == 64);

raw_struct_impl!(ErrorInfoEntry);

/// SMART / Health Information log (LID 0x02), 512 bytes. Several fields
/// are unaligned; access is by-value through the packed layout.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SmartLog {
    pub critical_warning: u8,
    pub composite_temperature: u16,
    pub available_spare: u8,
    pub available_spare_threshold: u8,
    pub percentage_used: u8,
    pub endurance_group_summary: u8,
    pub _rsvd7: [u8; 25],
    pub data_units_read: [u8; 16],
    pub data_units_written: [u8; 16],
    pub host_reads: [u8; 16],
    pub host_writes: [u8; 16],
    pub controller_busy_time: [u8; 16],
    pub power_cycles: [u8; 16],
    pub power_on_hours: [u8; 16],
    pub unsafe_shutdowns: [u8; 16],
    pub media_errors: [u8; 16],
    pub error_log_entries: [u8; 16],
    pub warning_temp_time: u32,
    pub critical_temp_time: u32,
    pub temperature_sensors: [u16; 8],
    pub _rsvd216: [u8; 296],
}

const _: () = assert!(core::mem::size_of::<SmartLog>() == 512);

raw_struct_impl!(SmartLog);

/// Firmware Slot Information log (LID 0x03), 512 bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FirmwareSlotLog {
    /// Active Firmware Info: active slot in bits 0..3.
    pub afi: u8,
    pub _rsvd1: [u8; 7],
    pub frs: [[u8; 8]; 7],
    pub _rsvd64: [u8; 448],
}

const _: () = assert!(core::mem::size_of::<FirmwareSlotLog>() == 512);

raw_struct_impl!(FirmwareSlotLog);

/// Changed Namespace List log (LID 0x04): up to 1024 NSIDs.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ChangedNamespaceList {
    pub ids: [u32; 1024],
}

const _: () = assert!(core::mem::size_of::<ChangedNamespaceList>() == 4096);

raw_struct_impl!(ChangedNamespaceList);

/// Commands Supported and Effects log (LID 0x05): one effects dword per
/// admin and per I/O opcode. Bit 0 CSUPP, bit 1 LBCC, bit 2 NCC, bit 3
/// NIC, bit 4 CCC.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CommandEffectsLog {
    pub acs: [u32; 256],
    pub iocs: [u32; 256],
    pub _rsvd2048: [u8; 2048],
}

const _: () = assert!(core::mem::size_of::<CommandEffectsLog>() == 4096);

raw_struct_impl!(CommandEffectsLog);

impl CommandEffectsLog {
    pub fn admin_supported(&self, opc: u8) -> bool {
        self.acs[opc as usize] & 1 != 0
    }

    pub fn io_supported(&self, opc: u8) -> bool {
        self.iocs[opc as usize] & 1 != 0
    }
}

/// One device self-test result (28 bytes).
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SelfTestResult {
    /// Operation in bits 4..7, result in bits 0..3.
    pub status: u8,
    pub segment: u8,
    pub valid_info: u8,
    pub _rsvd3: u8,
    pub power_on_hours: u64,
    pub nsid: u32,
    pub failing_lba: u64,
    pub status_code_type: u8,
    pub status_code: u8,
    pub vendor_specific: u16,
}

const _: () = assert!(core::mem::size_of::<SelfTestResult>() == 28);

/// Device Self-test log (LID 0x06): current operation plus the last 20
/// results, newest first.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct SelfTestLog {
    pub current_operation: u8,
    pub current_completion: u8,
    pub _rsvd2: [u8; 2],
    pub results: [SelfTestResult; 20],
}

const _: () = assert!(core::mem::size_of::<SelfTestLog>() == 564);

raw_struct_impl!(SelfTestLog);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_constructors_set_cns() {
        let cmd = Command::identify_controller();
        assert_eq!(cmd.sqe().cdw10 & 0xFF, CNS_CONTROLLER as u32);
        assert_eq!(cmd.data_in_len(), IDENTIFY_DATA_SIZE);

        let cmd = Command::identify_namespace(3);
        assert_eq!(cmd.sqe().cdw10 & 0xFF, CNS_NAMESPACE as u32);
        assert_eq!(cmd.nsid(), 3);
    }

    #[test]
    fn create_io_queue_dword_packing() {
        let cmd = Command::create_io_cq(2, 256, 0xABC000, Some(5), true);
        assert_eq!(cmd.sqe().cdw10, 255 << 16 | 2);
        assert_eq!(cmd.sqe().cdw11, 5 << 16 | 1 << 1 | 1);
        assert_eq!(cmd.sqe().prp1, 0xABC000);

        let cmd = Command::create_io_sq(2, 256, 0xDEF000, 2, 0, true, 0);
        assert_eq!(cmd.sqe().cdw10, 255 << 16 | 2);
        assert_eq!(cmd.sqe().cdw11, 2 << 16 | 1);
    }

    #[test]
    fn get_log_page_numd_split() {
        // 16384 bytes = 4096 dwords, NUMD = 4095.
        let cmd = Command::get_log_page(0x01, 16384, 0);
        assert_eq!(cmd.sqe().cdw10 & 0xFF, 0x01);
        assert_eq!(cmd.sqe().cdw10 >> 16, 4095);
        assert_eq!(cmd.sqe().cdw11, 0);
        assert_eq!(cmd.data_in_len(), 16384);
    }

    #[test]
    fn feature_payload_packing() {
        let pm = FeaturePowerManagement::new(3, 1);
        assert_eq!(pm.ps(), 3);
        assert_eq!(pm.wh(), 1);

        let arb = FeatureArbitration::new(7, 10, 20, 30);
        assert_eq!(arb.ab(), 7);
        assert_eq!(arb.lpw(), 10);
        assert_eq!(arb.mpw(), 20);
        assert_eq!(arb.hpw(), 30);

        let cmd = Command::set_feature_power_management(2);
        assert_eq!(cmd.sqe().cdw10 & 0xFF, FID_POWER_MANAGEMENT as u32);
        assert_eq!(FeaturePowerManagement(cmd.sqe().cdw11).ps(), 2);
    }

    #[test]
    fn test_number_of_queues_is_zero_based_on_the_wire() {
        let v = FeatureNumberOfQueues::new(4, 8);
        assert_eq!(v.0, 3 | 7 << 16);
        assert_eq!(v.nsq(), 4);
        assert_eq!(v.ncq(), 8);

        let cmd = Command::set_feature_number_of_queues(16, 16);
        assert_eq!(cmd.sqe().cdw10 & 0xFF, FID_NUMBER_OF_QUEUES as u32);
        assert_eq!(cmd.sqe().cdw11, 15 | 15 << 16);
    }

    #[test]
    fn test_temperature_threshold_packing() {
        let v = FeatureTemperatureThreshold::new(353, 0, 1);
        assert_eq!(v.tmpth(), 353);
        assert_eq!(v.thsel(), 1);
    }

    #[test]
    fn test_command_effects_lookup() {
        let mut log = CommandEffectsLog::zeroed();
        log.acs[0x06] = 1;
        log.iocs[0x01] = 1 | 1 << 1;
        assert!(log.admin_supported(0x06));
        assert!(!log.admin_supported(0x07));
        assert!(log.io_supported(0x01));
    }

    #[test]
    fn identify_strings_trim_padding() {
        let mut id = IdentifyController::zeroed();
        id.set_serial("EDDAE771");
        id.set_model("nvsim_0.1");
        id.set_firmware("0.001");
        assert_eq!(id.serial_string(), "EDDAE771");
        assert_eq!(id.model_string(), "nvsim_0.1");
        assert_eq!(id.firmware_string(), "0.001");
        // Padded with spaces on the wire.
        assert_eq!(id.sn[8], b' ');
    }

    #[test]
    fn identify_round_trips_through_bytes() {
        let mut id = IdentifyController::zeroed();
        id.set_serial("S123");
        id.nn = 2;
        id.mdts = 5;
        let restored = IdentifyController::from_bytes(id.as_bytes());
        assert_eq!(restored.serial_string(), "S123");
        assert_eq!(restored.nn, 2);
        assert_eq!(restored.max_transfer_bytes(4096), Some(4096 << 5));
    }

    #[test]
    fn lba_format_fields() {
        let f = LbaFormat::new(0, 9, 0);
        assert_eq!(f.lbads(), 9);
        assert_eq!(f.block_size(), 512);
        let f = LbaFormat::new(8, 12, 1);
        assert_eq!(f.ms(), 8);
        assert_eq!(f.block_size(), 4096);
    }

    #[test]
    fn namespace_list_stops_at_zero() {
        let mut list = NamespaceList::zeroed();
        list.ids[0] = 1;
        list.ids[1] = 2;
        let active: Vec<u32> = list.active().collect();
        assert_eq!(active, vec![1, 2]);
    }

    #[test]
    fn formatted_lbaf_follows_flbas() {
        let mut ns = IdentifyNamespace::zeroed();
        ns.set_lbaf(0, LbaFormat::new(0, 9, 0));
        ns.set_lbaf(1, LbaFormat::new(0, 12, 0));
        ns.flbas = 1;
        assert_eq!(ns.block_size(), 4096);
        ns.flbas = 0;
        assert_eq!(ns.block_size(), 512);
    }
}
