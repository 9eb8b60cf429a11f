//! File-backed namespaces for the simulated controller.
//!
//! Each namespace is exactly `num_lbas * block_size` bytes in a sparse
//! host file, mmap'd for LBA-addressed access: LBA n lives at byte range
//! `[n * block_size, (n + 1) * block_size)`. No metadata sidecar.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;

use crate::error::{NvmeError, Result};
use crate::prp::Prp;

/// IDEMA LBA count for a marketed capacity in GB at 512 B blocks.
pub fn idema_lbas_512(marketed_gb: u64) -> u64 {
    97_696_368 + 1_953_504 * (marketed_gb - 50)
}

/// IDEMA LBA count for a marketed capacity in GB at 4096 B blocks.
pub fn idema_lbas_4096(marketed_gb: u64) -> u64 {
    12_212_046 + 244_188 * (marketed_gb - 50)
}

static BACKING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Configuration for one simulated namespace.
#[derive(Debug, Clone)]
pub struct SimNamespaceConfig {
    pub block_size: u32,
    pub num_lbas: u64,
    /// Backing file; a unique file under the temp directory by default.
    pub path: Option<PathBuf>,
}

impl SimNamespaceConfig {
    /// IDEMA-sized namespace for a marketed capacity; only 512 and 4096
    /// byte blocks have IDEMA formulas.
    pub fn with_capacity_gb(marketed_gb: u64, block_size: u32) -> Result<Self> {
        let num_lbas = match block_size {
            512 => idema_lbas_512(marketed_gb),
            4096 => idema_lbas_4096(marketed_gb),
            other => {
                return Err(NvmeError::UnsupportedConfig(format!(
                    "{} byte blocks",
                    other
                )))
            }
        };
        Ok(SimNamespaceConfig {
            block_size,
            num_lbas,
            path: None,
        })
    }

    /// Explicitly sized namespace, for small test backings.
    pub fn with_num_lbas(num_lbas: u64, block_size: u32) -> Self {
        SimNamespaceConfig {
            block_size,
            num_lbas,
            path: None,
        }
    }

    fn resolve_path(&self, nsid: u32) -> PathBuf {
        match &self.path {
            Some(path) => path.clone(),
            None => {
                let seq = BACKING_SEQ.fetch_add(1, Ordering::Relaxed);
                std::env::temp_dir().join(format!(
                    "nvsim_{}_{}_ns{}.dat",
                    std::process::id(),
                    seq,
                    nsid
                ))
            }
        }
    }
}

/// One simulated namespace and its mmap'd backing file.
pub struct SimNamespace {
    num_lbas: u64,
    block_size: u32,
    path: PathBuf,
    file: Option<File>,
    map: *mut u8,
    map_len: usize,
}

unsafe impl Send for SimNamespace {}

impl SimNamespace {
    pub fn new(nsid: u32, config: &SimNamespaceConfig) -> Result<SimNamespace> {
        if !matches!(config.block_size, 512 | 4096) {
            return Err(NvmeError::UnsupportedConfig(format!(
                "{} byte blocks",
                config.block_size
            )));
        }
        let mut ns = SimNamespace {
            num_lbas: config.num_lbas,
            block_size: config.block_size,
            path: config.resolve_path(nsid),
            file: None,
            map: core::ptr::null_mut(),
            map_len: 0,
        };
        ns.init_storage()?;
        Ok(ns)
    }

    /// (Re)creates the backing file at full size, sparse, and maps it.
    /// Also services Format NVM.
    pub fn init_storage(&mut self) -> Result<()> {
        self.unmap();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|_| NvmeError::last_os("open namespace backing"))?;
        let len = self.num_lbas * self.block_size as u64;
        file.set_len(len)
            .map_err(|_| NvmeError::last_os("size namespace backing"))?;

        let map = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(NvmeError::last_os("mmap namespace backing"));
        }

        debug!(
            target: "nvsim",
            "namespace backing {} ({} LBAs x {} B)",
            self.path.display(), self.num_lbas, self.block_size
        );
        self.file = Some(file);
        self.map = map as *mut u8;
        self.map_len = len as usize;
        Ok(())
    }

    fn unmap(&mut self) {
        if !self.map.is_null() {
            unsafe { libc::munmap(self.map as *mut libc::c_void, self.map_len) };
            self.map = core::ptr::null_mut();
            self.map_len = 0;
        }
        self.file = None;
    }

    pub fn num_lbas(&self) -> u64 {
        self.num_lbas
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Copies `num_blocks` starting at `lba` into the host's PRP pages.
    /// The caller has range-checked.
    pub fn read(&self, lba: u64, num_blocks: u64, prp: &Prp) {
        let start = (lba * self.block_size as u64) as usize;
        let len = (num_blocks * self.block_size as u64) as usize;
        let data = unsafe { core::slice::from_raw_parts(self.map.add(start), len) };
        prp.set_data_buffer(data);
    }

    /// Copies `num_blocks` out of the host's PRP pages into the backing.
    pub fn write(&self, lba: u64, num_blocks: u64, prp: &Prp) {
        let start = (lba * self.block_size as u64) as usize;
        let len = (num_blocks * self.block_size as u64) as usize;
        let data = prp.get_data_buffer();
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.map.add(start), len.min(data.len()));
        }
    }
}

impl Drop for SimNamespace {
    fn drop(&mut self) {
        self.unmap();
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryManager;
    use crate::platform::sim::SimPlatform;
    use crate::platform::DmaDirection;
    use crate::sim::bars::SimBars;

    #[test]
    fn idema_formulas() {
        assert_eq!(idema_lbas_512(50), 97_696_368);
        assert_eq!(idema_lbas_512(512), 97_696_368 + 1_953_504 * 462);
        assert_eq!(idema_lbas_4096(50), 12_212_046);
    }

    #[test]
    fn backing_round_trip_through_prp() {
        let config = SimNamespaceConfig::with_num_lbas(64, 512);
        let ns = SimNamespace::new(1, &config).unwrap();

        let mut mem = MemoryManager::new(SimPlatform::new(SimBars::new().unwrap()), 4096).unwrap();
        let prp = Prp::alloc(&mut mem, 4096, DmaDirection::HostToDevice, "t").unwrap();
        prp.set_data_buffer(&[0xED; 4096]);

        // Host wrote 8 blocks; read them back through a second PRP.
        ns.write(0, 8, &prp);
        let out = Prp::alloc(&mut mem, 4096, DmaDirection::DeviceToHost, "t").unwrap();
        ns.read(0, 8, &out);
        assert_eq!(out.get_data_buffer(), vec![0xED; 4096]);
    }

    #[test]
    fn format_clears_contents() {
        let config = SimNamespaceConfig::with_num_lbas(16, 512);
        let mut ns = SimNamespace::new(1, &config).unwrap();

        let mut mem = MemoryManager::new(SimPlatform::new(SimBars::new().unwrap()), 4096).unwrap();
        let prp = Prp::alloc(&mut mem, 512, DmaDirection::HostToDevice, "t").unwrap();
        prp.set_data_buffer(&[0x55; 512]);
        ns.write(0, 1, &prp);

        ns.init_storage().unwrap();
        let out = Prp::alloc(&mut mem, 512, DmaDirection::DeviceToHost, "t").unwrap();
        ns.read(0, 1, &out);
        assert_eq!(out.get_data_buffer(), vec![0u8; 512]);
    }
}
