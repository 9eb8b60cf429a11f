//! Linux VFIO binding for physical devices.
//!
//! The device must be bound to `vfio-pci` and owned by the calling user.
//! BAR0 is mmap'd from the device fd; config space is a pread/pwrite
//! region; DMA windows are programmed with `VFIO_IOMMU_MAP_DMA`; MSI-X
//! vectors are wired to nonblocking eventfds.

use std::fs;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;

use log::{debug, warn};

use crate::error::{NvmeError, Result};
use crate::platform::{DmaDirection, DmaMapper, IovaMode, IovaRange, PciUserspaceDevice};
use crate::regs::nvme::{NvmeRegs, BAR0_SIZE};
use crate::regs::pcie::{ConfigAccess, PcieRegs};
use crate::regs::MmioRegion;

// VFIO ioctl numbers: _IO(';', 100 + n).
const VFIO_TYPE: u64 = b';' as u64;
const fn vfio_ioctl(n: u64) -> u64 {
    (VFIO_TYPE << 8) | (100 + n)
}

const VFIO_GET_API_VERSION: u64 = vfio_ioctl(0);
const VFIO_SET_IOMMU: u64 = vfio_ioctl(2);
const VFIO_GROUP_GET_STATUS: u64 = vfio_ioctl(3);
const VFIO_GROUP_SET_CONTAINER: u64 = vfio_ioctl(4);
const VFIO_GROUP_GET_DEVICE_FD: u64 = vfio_ioctl(6);
const VFIO_DEVICE_GET_REGION_INFO: u64 = vfio_ioctl(8);
const VFIO_DEVICE_SET_IRQS: u64 = vfio_ioctl(10);
const VFIO_DEVICE_RESET: u64 = vfio_ioctl(11);
const VFIO_IOMMU_GET_INFO: u64 = vfio_ioctl(12);
const VFIO_IOMMU_MAP_DMA: u64 = vfio_ioctl(13);
const VFIO_IOMMU_UNMAP_DMA: u64 = vfio_ioctl(14);

const VFIO_API_VERSION: i32 = 0;
const VFIO_TYPE1_IOMMU: u64 = 1;
const VFIO_GROUP_FLAGS_VIABLE: u32 = 1 << 0;

const VFIO_PCI_BAR0_REGION_INDEX: u32 = 0;
const VFIO_PCI_CONFIG_REGION_INDEX: u32 = 7;
const VFIO_PCI_MSIX_IRQ_INDEX: u32 = 2;

const VFIO_DMA_MAP_FLAG_READ: u32 = 1 << 0;
const VFIO_DMA_MAP_FLAG_WRITE: u32 = 1 << 1;

const VFIO_IRQ_SET_DATA_EVENTFD: u32 = 1 << 2;
const VFIO_IRQ_SET_ACTION_TRIGGER: u32 = 1 << 5;

const VFIO_IOMMU_TYPE1_INFO_CAP_IOVA_RANGE: u16 = 1;

#[repr(C)]
struct VfioGroupStatus {
    argsz: u32,
    flags: u32,
}

#[repr(C)]
struct VfioRegionInfo {
    argsz: u32,
    flags: u32,
    index: u32,
    cap_offset: u32,
    size: u64,
    offset: u64,
}

#[repr(C)]
struct VfioIommuType1DmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

#[repr(C)]
struct VfioIommuType1DmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

#[repr(C)]
struct VfioIrqSetHeader {
    argsz: u32,
    flags: u32,
    index: u32,
    start: u32,
    count: u32,
}

#[repr(C)]
struct VfioIommuType1Info {
    argsz: u32,
    flags: u32,
    iova_pgsizes: u64,
    cap_offset: u32,
    pad: u32,
}

const VFIO_IOMMU_INFO_CAPS: u32 = 1 << 1;

fn read_le_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn ioctl(fd: RawFd, request: u64, arg: usize, op: &'static str) -> Result<i32> {
    let rc = unsafe { libc::ioctl(fd, request as libc::c_ulong, arg) };
    if rc < 0 {
        return Err(NvmeError::last_os(op));
    }
    Ok(rc)
}

/// Slots currently bound to vfio-pci.
pub fn exposed_devices() -> Vec<String> {
    let mut slots = Vec::new();
    if let Ok(entries) = fs::read_dir("/sys/bus/pci/drivers/vfio-pci") {
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains(':') && name.contains('.') {
                slots.push(name);
            }
        }
    }
    slots.sort();
    slots
}

/// A physical PCI function owned through VFIO.
pub struct VfioPciDevice {
    slot: String,
    container_fd: RawFd,
    group_fd: RawFd,
    device_fd: RawFd,
    bar0: *mut u8,
    bar0_size: usize,
    config_offset: u64,
    iova_ranges: Vec<IovaRange>,
    msix_eventfds: spin::Mutex<Vec<RawFd>>,
}

unsafe impl Send for VfioPciDevice {}
unsafe impl Sync for VfioPciDevice {}

impl VfioPciDevice {
    pub fn open(slot: &str) -> Result<Self> {
        let sys_path = format!("/sys/bus/pci/devices/{}", slot);
        if !Path::new(&sys_path).exists() {
            return Err(NvmeError::PlatformUnavailable(slot.into()));
        }

        // The device must be bound to vfio-pci to be usable from here.
        let driver = fs::read_link(format!("{}/driver", sys_path))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));
        if driver.as_deref() != Some("vfio-pci") {
            return Err(NvmeError::PlatformUnavailable(slot.into()));
        }

        let group = fs::read_link(format!("{}/iommu_group", sys_path))
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .ok_or_else(|| NvmeError::IommuUnavailable(slot.into()))?;

        let group_path = format!("/dev/vfio/{}\0", group);
        let group_fd =
            unsafe { libc::open(group_path.as_ptr() as *const libc::c_char, libc::O_RDWR) };
        if group_fd < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(match errno {
                libc::EACCES | libc::EPERM => NvmeError::PermissionDenied(slot.into()),
                libc::ENOENT => NvmeError::IommuUnavailable(slot.into()),
                _ => NvmeError::Os {
                    op: "open vfio group",
                    errno,
                },
            });
        }

        let container_fd = unsafe {
            libc::open(
                b"/dev/vfio/vfio\0".as_ptr() as *const libc::c_char,
                libc::O_RDWR,
            )
        };
        if container_fd < 0 {
            unsafe { libc::close(group_fd) };
            return Err(NvmeError::last_os("open vfio container"));
        }

        let result = Self::bind(slot, container_fd, group_fd);
        if result.is_err() {
            unsafe {
                libc::close(group_fd);
                libc::close(container_fd);
            }
        }
        result
    }

    fn bind(slot: &str, container_fd: RawFd, group_fd: RawFd) -> Result<Self> {
        let version = ioctl(container_fd, VFIO_GET_API_VERSION, 0, "vfio api version")?;
        if version != VFIO_API_VERSION {
            return Err(NvmeError::PlatformUnavailable(slot.into()));
        }

        let mut status = VfioGroupStatus {
            argsz: core::mem::size_of::<VfioGroupStatus>() as u32,
            flags: 0,
        };
        ioctl(
            group_fd,
            VFIO_GROUP_GET_STATUS,
            &mut status as *mut _ as usize,
            "vfio group status",
        )?;
        if status.flags & VFIO_GROUP_FLAGS_VIABLE == 0 {
            return Err(NvmeError::IommuUnavailable(slot.into()));
        }

        ioctl(
            group_fd,
            VFIO_GROUP_SET_CONTAINER,
            &container_fd as *const _ as usize,
            "vfio set container",
        )?;
        ioctl(
            container_fd,
            VFIO_SET_IOMMU,
            VFIO_TYPE1_IOMMU as usize,
            "vfio set iommu",
        )?;

        let slot_cstr = format!("{}\0", slot);
        let device_fd = ioctl(
            group_fd,
            VFIO_GROUP_GET_DEVICE_FD,
            slot_cstr.as_ptr() as usize,
            "vfio get device fd",
        )?;

        // BAR0 must be mmap-able; config space is fd-relative I/O.
        let bar0_info = Self::region_info(device_fd, VFIO_PCI_BAR0_REGION_INDEX)?;
        let config_info = Self::region_info(device_fd, VFIO_PCI_CONFIG_REGION_INDEX)?;

        let bar0_size = (bar0_info.size as usize).max(BAR0_SIZE);
        let bar0 = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                bar0_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                device_fd,
                bar0_info.offset as libc::off_t,
            )
        };
        if bar0 == libc::MAP_FAILED {
            return Err(NvmeError::last_os("mmap bar0"));
        }

        let iova_ranges = Self::query_iova_ranges(container_fd);
        debug!(target: "platform", "{}: {} iova ranges", slot, iova_ranges.len());

        Ok(VfioPciDevice {
            slot: slot.into(),
            container_fd,
            group_fd,
            device_fd,
            bar0: bar0 as *mut u8,
            bar0_size,
            config_offset: config_info.offset,
            iova_ranges,
            msix_eventfds: spin::Mutex::new(Vec::new()),
        })
    }

    fn region_info(device_fd: RawFd, index: u32) -> Result<VfioRegionInfo> {
        let mut info = VfioRegionInfo {
            argsz: core::mem::size_of::<VfioRegionInfo>() as u32,
            flags: 0,
            index,
            cap_offset: 0,
            size: 0,
            offset: 0,
        };
        ioctl(
            device_fd,
            VFIO_DEVICE_GET_REGION_INFO,
            &mut info as *mut _ as usize,
            "vfio region info",
        )?;
        Ok(info)
    }

    fn query_iova_ranges(container_fd: RawFd) -> Vec<IovaRange> {
        // First call sizes the buffer, second fills the capability chain.
        let mut info = VfioIommuType1Info {
            argsz: core::mem::size_of::<VfioIommuType1Info>() as u32,
            flags: 0,
            iova_pgsizes: 0,
            cap_offset: 0,
            pad: 0,
        };
        if ioctl(
            container_fd,
            VFIO_IOMMU_GET_INFO,
            &mut info as *mut _ as usize,
            "vfio iommu info",
        )
        .is_err()
            || info.flags & VFIO_IOMMU_INFO_CAPS == 0
            || info.argsz as usize <= core::mem::size_of::<VfioIommuType1Info>()
        {
            return vec![IovaRange {
                start: 0x10000,
                end: 1 << 39,
            }];
        }

        let mut buf = vec![0u8; info.argsz as usize];
        unsafe {
            core::ptr::copy_nonoverlapping(
                &info as *const _ as *const u8,
                buf.as_mut_ptr(),
                core::mem::size_of::<VfioIommuType1Info>(),
            );
        }
        if ioctl(
            container_fd,
            VFIO_IOMMU_GET_INFO,
            buf.as_mut_ptr() as usize,
            "vfio iommu info caps",
        )
        .is_err()
        {
            return vec![IovaRange {
                start: 0x10000,
                end: 1 << 39,
            }];
        }

        let mut ranges = Vec::new();
        let full = unsafe { &*(buf.as_ptr() as *const VfioIommuType1Info) };
        let mut cap_offset = full.cap_offset as usize;
        while cap_offset != 0 && cap_offset + 8 <= buf.len() {
            let id = u16::from_le_bytes([buf[cap_offset], buf[cap_offset + 1]]);
            let next = u32::from_le_bytes([
                buf[cap_offset + 4],
                buf[cap_offset + 5],
                buf[cap_offset + 6],
                buf[cap_offset + 7],
            ]) as usize;
            if id == VFIO_IOMMU_TYPE1_INFO_CAP_IOVA_RANGE {
                let nr = u32::from_le_bytes([
                    buf[cap_offset + 8],
                    buf[cap_offset + 9],
                    buf[cap_offset + 10],
                    buf[cap_offset + 11],
                ]) as usize;
                let mut entry = cap_offset + 16;
                for _ in 0..nr {
                    if entry + 16 > buf.len() {
                        break;
                    }
                    ranges.push(IovaRange {
                        start: read_le_u64(&buf, entry),
                        end: read_le_u64(&buf, entry + 8),
                    });
                    entry += 16;
                }
            }
            cap_offset = next;
        }

        if ranges.is_empty() {
            ranges.push(IovaRange {
                start: 0x10000,
                end: 1 << 39,
            });
        }
        ranges
    }
}

impl DmaMapper for VfioPciDevice {
    fn map_dma(
        &self,
        vaddr: usize,
        iova: u64,
        size: usize,
        direction: DmaDirection,
    ) -> Result<()> {
        let flags = match direction {
            DmaDirection::HostToDevice => VFIO_DMA_MAP_FLAG_READ,
            DmaDirection::DeviceToHost => VFIO_DMA_MAP_FLAG_WRITE,
            DmaDirection::Bidirectional => return Err(NvmeError::UnsupportedDirection),
        };
        let mut map = VfioIommuType1DmaMap {
            argsz: core::mem::size_of::<VfioIommuType1DmaMap>() as u32,
            flags,
            vaddr: vaddr as u64,
            iova,
            size: size as u64,
        };
        ioctl(
            self.container_fd,
            VFIO_IOMMU_MAP_DMA,
            &mut map as *mut _ as usize,
            "vfio map dma",
        )?;
        Ok(())
    }

    fn unmap_dma(&self, iova: u64, size: usize) -> Result<()> {
        let mut unmap = VfioIommuType1DmaUnmap {
            argsz: core::mem::size_of::<VfioIommuType1DmaUnmap>() as u32,
            flags: 0,
            iova,
            size: size as u64,
        };
        ioctl(
            self.container_fd,
            VFIO_IOMMU_UNMAP_DMA,
            &mut unmap as *mut _ as usize,
            "vfio unmap dma",
        )?;
        Ok(())
    }

    fn iova_mode(&self) -> IovaMode {
        IovaMode::Ranges(self.iova_ranges.clone())
    }
}

impl PciUserspaceDevice for VfioPciDevice {
    fn slot(&self) -> &str {
        &self.slot
    }

    fn pci_regs(&self) -> PcieRegs {
        PcieRegs::new(Arc::new(VfioConfigAccess {
            device_fd: self.device_fd,
            offset: self.config_offset,
        }))
    }

    fn nvme_regs(&self) -> NvmeRegs {
        // The mapping lives as long as this device handle; the controller
        // owns both.
        NvmeRegs::new(unsafe { MmioRegion::from_raw(self.bar0, self.bar0_size) })
    }

    fn enable_msix(&self, nvec: u16, start: u16) -> Result<()> {
        let mut fds = Vec::with_capacity(nvec as usize);
        for _ in 0..nvec {
            let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
            if fd < 0 {
                for fd in &fds {
                    unsafe { libc::close(*fd) };
                }
                return Err(NvmeError::last_os("eventfd"));
            }
            fds.push(fd);
        }

        let header_len = core::mem::size_of::<VfioIrqSetHeader>();
        let data_len = fds.len() * core::mem::size_of::<i32>();
        let mut buf = vec![0u8; header_len + data_len];
        let header = VfioIrqSetHeader {
            argsz: (header_len + data_len) as u32,
            flags: VFIO_IRQ_SET_DATA_EVENTFD | VFIO_IRQ_SET_ACTION_TRIGGER,
            index: VFIO_PCI_MSIX_IRQ_INDEX,
            start: start as u32,
            count: nvec as u32,
        };
        unsafe {
            core::ptr::copy_nonoverlapping(
                &header as *const _ as *const u8,
                buf.as_mut_ptr(),
                header_len,
            );
            core::ptr::copy_nonoverlapping(
                fds.as_ptr() as *const u8,
                buf.as_mut_ptr().add(header_len),
                data_len,
            );
        }
        ioctl(
            self.device_fd,
            VFIO_DEVICE_SET_IRQS,
            buf.as_mut_ptr() as usize,
            "vfio set irqs",
        )?;

        *self.msix_eventfds.lock() = fds;
        Ok(())
    }

    fn msix_pending_count(&self, vector: u16) -> Result<u64> {
        let fds = self.msix_eventfds.lock();
        let fd = match fds.get(vector as usize) {
            Some(fd) => *fd,
            None => return Ok(0),
        };
        let mut count = 0u64;
        let rc = unsafe {
            libc::read(
                fd,
                &mut count as *mut u64 as *mut libc::c_void,
                core::mem::size_of::<u64>(),
            )
        };
        if rc < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EAGAIN {
                return Ok(0);
            }
            return Err(NvmeError::Os {
                op: "eventfd read",
                errno,
            });
        }
        Ok(count)
    }

    fn reset(&self) -> Result<()> {
        ioctl(self.device_fd, VFIO_DEVICE_RESET, 0, "vfio device reset")?;
        Ok(())
    }
}

/// Config space accessor over the VFIO config region.
struct VfioConfigAccess {
    device_fd: RawFd,
    offset: u64,
}

impl VfioConfigAccess {
    fn read(&self, offset: usize, buf: &mut [u8]) {
        let rc = unsafe {
            libc::pread(
                self.device_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                (self.offset + offset as u64) as libc::off_t,
            )
        };
        if rc != buf.len() as isize {
            warn!(target: "platform", "config read at 0x{:x} failed", offset);
        }
    }

    fn write(&self, offset: usize, buf: &[u8]) {
        let rc = unsafe {
            libc::pwrite(
                self.device_fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                (self.offset + offset as u64) as libc::off_t,
            )
        };
        if rc != buf.len() as isize {
            warn!(target: "platform", "config write at 0x{:x} failed", offset);
        }
    }
}

impl ConfigAccess for VfioConfigAccess {
    fn read8(&self, offset: usize) -> u8 {
        let mut buf = [0u8; 1];
        self.read(offset, &mut buf);
        buf[0]
    }

    fn read16(&self, offset: usize) -> u16 {
        let mut buf = [0u8; 2];
        self.read(offset, &mut buf);
        u16::from_le_bytes(buf)
    }

    fn read32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        self.read(offset, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn write8(&self, offset: usize, value: u8) {
        self.write(offset, &value.to_le_bytes());
    }

    fn write16(&self, offset: usize, value: u16) {
        self.write(offset, &value.to_le_bytes());
    }

    fn write32(&self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }
}

impl Drop for VfioPciDevice {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.bar0 as *mut libc::c_void, self.bar0_size);
            for fd in self.msix_eventfds.lock().iter() {
                libc::close(*fd);
            }
            libc::close(self.device_fd);
            libc::close(self.group_fd);
            libc::close(self.container_fd);
        }
    }
}
