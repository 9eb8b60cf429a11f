//! Crate-wide error taxonomy.
//!
//! Every fallible operation in the crate returns [`Result`]. Recovery policy
//! is part of the contract: only `QueueFull`, `Timeout` and `CidExhausted`
//! are recoverable in place; `ControllerFatal` is recoverable via FLR plus a
//! full re-init; everything else is fatal to the caller.

use core::fmt;

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, NvmeError>;

/// Error kinds surfaced by the driver, the DMA manager, the platform layer
/// and the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NvmeError {
    /// The slot is not bound to a userspace driver.
    PlatformUnavailable(String),
    /// The process does not own the device.
    PermissionDenied(String),
    /// No IOMMU group is present for the device.
    IommuUnavailable(String),
    /// CSTS.RDY did not rise within the timeout after setting CC.EN.
    EnableTimeout,
    /// CSTS.RDY did not fall within the timeout after clearing CC.EN.
    DisableTimeout,
    /// CSTS.CFS = 1 was observed.
    ControllerFatal,
    /// The DMA manager could not find a contiguous sub-page run.
    OutOfMemory,
    /// Bidirectional DMA mappings are not supported.
    UnsupportedDirection,
    /// No (SQID, CQID) row matches the lookup.
    UnknownQueuePair(u16, u16),
    /// The submission queue has no free slot; reap completions and retry.
    QueueFull(u16),
    /// The controller completed the command with a non-success status.
    CommandFailed {
        sct: u8,
        sc: u8,
        name: &'static str,
    },
    /// No completion arrived within the deadline; the CID remains owned by
    /// the device until it completes or the controller is disabled.
    Timeout,
    /// Every CID in the allocation window is still outstanding.
    CidExhausted,
    /// The device returned data that violates the wire contract.
    MalformedResponse(String),
    /// A configuration value is outside what the crate supports.
    UnsupportedConfig(String),
    /// An OS call failed underneath the platform layer.
    Os { op: &'static str, errno: i32 },
}

impl fmt::Display for NvmeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NvmeError::PlatformUnavailable(slot) => {
                write!(f, "no userspace binding for device {}", slot)
            }
            NvmeError::PermissionDenied(slot) => {
                write!(f, "not owner of device {}", slot)
            }
            NvmeError::IommuUnavailable(slot) => {
                write!(f, "no iommu group for device {}", slot)
            }
            NvmeError::EnableTimeout => write!(f, "controller did not become ready"),
            NvmeError::DisableTimeout => write!(f, "controller did not disable"),
            NvmeError::ControllerFatal => write!(f, "controller fatal status (CSTS.CFS=1)"),
            NvmeError::OutOfMemory => write!(f, "no contiguous DMA pages available"),
            NvmeError::UnsupportedDirection => {
                write!(f, "bidirectional DMA mapping not supported")
            }
            NvmeError::UnknownQueuePair(sqid, cqid) => {
                write!(f, "SQID {} CQID {} is not a valid queue pair", sqid, cqid)
            }
            NvmeError::QueueFull(qid) => write!(f, "submission queue {} is full", qid),
            NvmeError::CommandFailed { sct, sc, name } => {
                write!(f, "command failed: SCT 0x{:x} SC 0x{:02x} ({})", sct, sc, name)
            }
            NvmeError::Timeout => write!(f, "timed out waiting for completion"),
            NvmeError::CidExhausted => write!(f, "all command identifiers outstanding"),
            NvmeError::MalformedResponse(what) => {
                write!(f, "malformed device response: {}", what)
            }
            NvmeError::UnsupportedConfig(what) => {
                write!(f, "unsupported configuration: {}", what)
            }
            NvmeError::Os { op, errno } => write!(f, "{} failed (errno {})", op, errno),
        }
    }
}

impl std::error::Error for NvmeError {}

impl NvmeError {
    /// Last OS error, tagged with the operation that produced it.
    pub(crate) fn last_os(op: &'static str) -> NvmeError {
        NvmeError::Os {
            op,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }
}
