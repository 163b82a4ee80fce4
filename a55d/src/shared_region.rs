//! Shared buffer reader
//!
//! The co-processor deposits file payloads in a DMA region exposed by the
//! notification device. The region is described once by an ioctl, mapped
//! read-only once, and never remapped. Callers only ever get copies.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use a55lib::{LinkError, LinkResult};
use memmap2::{Mmap, MmapOptions};

/// Region descriptor returned by the driver
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DmaInfo {
    /// Physical base address
    pub phys_addr: u64,
    /// Region size in bytes
    pub size: u64,
}

nix::ioctl_read!(rpmsg_get_dma_info, b'R', 1, DmaInfo);

/// Open the notification/shared-region device
pub fn open_device<P: AsRef<Path>>(path: P) -> LinkResult<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)?)
}

/// Ask the driver where the shared region is and how large it is
pub fn query_dma_info(device: &File) -> LinkResult<DmaInfo> {
    let mut info = DmaInfo::default();
    // SAFETY: DmaInfo matches the driver's two-u64 layout and outlives the call
    unsafe { rpmsg_get_dma_info(device.as_raw_fd(), &mut info) }
        .map_err(|e| LinkError::Io(std::io::Error::from_raw_os_error(e as i32)))?;
    Ok(info)
}

/// Read-only view of the shared region
pub struct SharedRegion {
    map: Mmap,
    phys_addr: u64,
}

impl SharedRegion {
    /// Map the region described by `info`
    pub fn map(device: &File, info: DmaInfo) -> LinkResult<Self> {
        if info.size == 0 {
            return Err(LinkError::config("shared region reports size 0"));
        }
        let len = usize::try_from(info.size)
            .map_err(|_| LinkError::config(format!("shared region of {} bytes cannot be mapped", info.size)))?;

        // SAFETY: the mapping is read-only and its bytes are only copied out
        let map = unsafe { MmapOptions::new().len(len).map(device)? };

        Ok(Self {
            map,
            phys_addr: info.phys_addr,
        })
    }

    /// Map a whole regular file as a region
    pub fn from_file(file: &File) -> LinkResult<Self> {
        let size = file.metadata()?.len();
        Self::map(file, DmaInfo { phys_addr: 0, size })
    }

    pub fn size(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn phys_addr(&self) -> u64 {
        self.phys_addr
    }

    fn range(&self, offset: u64, size: u64) -> LinkResult<&[u8]> {
        let out_of_bounds = || LinkError::OutOfBounds {
            offset,
            size,
            region: self.size(),
        };

        let end = offset.checked_add(size).ok_or_else(out_of_bounds)?;
        if end > self.size() {
            return Err(out_of_bounds());
        }
        // Both fit in the mapped length, which is a usize
        Ok(&self.map[offset as usize..end as usize])
    }

    /// Copy a byte range out of the region
    pub fn read_range(&self, offset: u64, size: u64) -> LinkResult<Vec<u8>> {
        Ok(self.range(offset, size)?.to_vec())
    }

    /// Copy a byte range into a new file at `dest`. Returns bytes written.
    pub fn copy_to_file(&self, offset: u64, size: u64, dest: &Path) -> LinkResult<u64> {
        let bytes = self.range(offset, size)?;
        let mut writer = BufWriter::new(File::create(dest)?);
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(size)
    }
}
