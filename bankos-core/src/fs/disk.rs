//! Raw sector devices and volume formatting.

use std::io;

use super::fat::CLUSTER_EOF;
use super::geometry::Geometry;
use crate::error::{KernelError, KernelResult};

/// Sector-addressed storage the filesystem is mounted on.
pub trait BlockDevice: Send {
    /// Size of one sector in bytes.
    fn sector_size(&self) -> usize;

    /// Number of sectors on the device.
    fn sector_count(&self) -> u32;

    /// Read one sector into `buf` (at least `sector_size` bytes).
    fn read_sector(&self, sector: u32, buf: &mut [u8]) -> KernelResult<()>;

    /// Write one sector from `data` (at least `sector_size` bytes).
    fn write_sector(&mut self, sector: u32, data: &[u8]) -> KernelResult<()>;
}

fn out_of_range(sector: u32) -> KernelError {
    KernelError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("sector {} out of range", sector),
    ))
}

/// Error for a transfer buffer smaller than one sector.
pub(crate) fn short_buffer(len: usize, sector_size: usize) -> KernelError {
    KernelError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("{}-byte buffer for {}-byte sectors", len, sector_size),
    ))
}

/// Disk image held in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryDisk {
    sector_size: usize,
    data: Vec<u8>,
}

impl MemoryDisk {
    /// Zero-filled disk. Fails with `Init` for a zero sector size.
    pub fn blank(sector_count: u32, sector_size: usize) -> KernelResult<Self> {
        if sector_size == 0 {
            return Err(KernelError::Init);
        }
        Ok(Self {
            sector_size,
            data: vec![0; sector_count as usize * sector_size],
        })
    }

    /// Wrap an existing image. A trailing partial sector is zero padded.
    pub fn from_bytes(mut data: Vec<u8>, sector_size: usize) -> KernelResult<Self> {
        if sector_size == 0 {
            return Err(KernelError::Init);
        }
        let rem = data.len() % sector_size;
        if rem != 0 {
            data.resize(data.len() + sector_size - rem, 0);
        }
        Ok(Self { sector_size, data })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    fn range(&self, sector: u32) -> KernelResult<std::ops::Range<usize>> {
        let start = sector as usize * self.sector_size;
        let end = start + self.sector_size;
        if end > self.data.len() {
            return Err(out_of_range(sector));
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemoryDisk {
    fn sector_size(&self) -> usize {
        self.sector_size
    }

    fn sector_count(&self) -> u32 {
        (self.data.len() / self.sector_size) as u32
    }

    fn read_sector(&self, sector: u32, buf: &mut [u8]) -> KernelResult<()> {
        if buf.len() < self.sector_size {
            return Err(short_buffer(buf.len(), self.sector_size));
        }
        let range = self.range(sector)?;
        buf[..self.sector_size].copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_sector(&mut self, sector: u32, data: &[u8]) -> KernelResult<()> {
        if data.len() < self.sector_size {
            return Err(short_buffer(data.len(), self.sector_size));
        }
        let range = self.range(sector)?;
        self.data[range].copy_from_slice(&data[..self.sector_size]);
        Ok(())
    }
}

/// Layout choices for [`format_volume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatOptions {
    pub sectors_per_cluster: u8,
    pub reserved_sectors: u16,
    pub fat_count: u8,
    pub root_entries: u16,
    /// Computed from the volume size when `None`.
    pub sectors_per_fat: Option<u16>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            sectors_per_cluster: 8,
            reserved_sectors: 1,
            fat_count: 2,
            root_entries: 512,
            sectors_per_fat: None,
        }
    }
}

/// Write an empty FAT16 volume onto `disk` and return its geometry.
pub fn format_volume<D: BlockDevice>(disk: &mut D, options: &FormatOptions) -> KernelResult<Geometry> {
    let bps = disk.sector_size();
    let total = disk.sector_count();

    if bps < 64 || bps % 32 != 0 || bps > u16::MAX as usize || options.sectors_per_cluster == 0 {
        return Err(KernelError::Init);
    }
    if options.fat_count == 0 || options.root_entries == 0 {
        return Err(KernelError::Init);
    }

    let root_sectors = (options.root_entries as u32 * 32).div_ceil(bps as u32);
    let sectors_per_fat = match options.sectors_per_fat {
        Some(spf) => spf,
        None => {
            let overhead = options.reserved_sectors as u32 + root_sectors;
            let clusters = total.saturating_sub(overhead) / options.sectors_per_cluster as u32;
            let clusters = clusters.min(0xFFEF);
            ((clusters + 2) * 2).div_ceil(bps as u32) as u16
        }
    };

    let mut boot = vec![0u8; bps];
    boot[0..3].copy_from_slice(&[0xEB, 0x3C, 0x90]);
    boot[3..11].copy_from_slice(b"BANKOS  ");
    boot[0x0B..0x0D].copy_from_slice(&(bps as u16).to_le_bytes());
    boot[0x0D] = options.sectors_per_cluster;
    boot[0x0E..0x10].copy_from_slice(&options.reserved_sectors.to_le_bytes());
    boot[0x10] = options.fat_count;
    boot[0x11..0x13].copy_from_slice(&options.root_entries.to_le_bytes());
    if total <= u16::MAX as u32 {
        boot[0x13..0x15].copy_from_slice(&(total as u16).to_le_bytes());
    } else {
        boot[0x20..0x24].copy_from_slice(&total.to_le_bytes());
    }
    boot[0x15] = 0xF8;
    boot[0x16..0x18].copy_from_slice(&sectors_per_fat.to_le_bytes());
    if bps >= 512 {
        boot[0x36..0x3E].copy_from_slice(b"FAT16   ");
        boot[510] = 0x55;
        boot[511] = 0xAA;
    }

    let geometry = Geometry::parse(&boot)?;
    disk.write_sector(0, &boot)?;

    let zero = vec![0u8; bps];
    for sector in geometry.fat_region..geometry.data_region {
        disk.write_sector(sector, &zero)?;
    }

    // Clusters 0 and 1 are reserved
    let mut first = vec![0u8; bps];
    first[0..2].copy_from_slice(&0xFFF8u16.to_le_bytes());
    first[2..4].copy_from_slice(&CLUSTER_EOF.to_le_bytes());
    for copy in 0..geometry.fat_count as u32 {
        disk.write_sector(geometry.fat_region + copy * geometry.sectors_per_fat as u32, &first)?;
    }

    Ok(geometry)
}
