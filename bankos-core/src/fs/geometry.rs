//! Volume geometry derived from the boot sector.
//!
//! Boot sector fields used (little-endian):
//! - `0x0B`: bytes per sector (u16)
//! - `0x0D`: sectors per cluster (u8)
//! - `0x0E`: reserved sectors, i.e. start of the FAT region (u16)
//! - `0x10`: number of FATs (u8)
//! - `0x11`: root directory entries (u16)
//! - `0x13`: total sectors (u16), `0x20` (u32) when zero
//! - `0x16`: sectors per FAT (u16)

use super::dirent::ENTRY_SIZE;
use crate::error::{KernelError, KernelResult};

/// Cluster numbers at or above this value are never data clusters.
const CLUSTER_RESERVED: u32 = 0xFFF0;

fn le16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Layout of a mounted volume. Immutable once mounted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub bytes_per_sector: u16,
    pub sectors_per_cluster: u8,
    pub fat_region: u32,
    pub root_region: u32,
    pub data_region: u32,
    pub num_sectors: u32,
    pub sectors_per_fat: u16,
    pub fat_count: u8,
    pub root_entries: u16,
}

impl Geometry {
    /// Derive the geometry from a boot sector image.
    pub fn parse(boot: &[u8]) -> KernelResult<Self> {
        if boot.len() < 0x24 {
            return Err(KernelError::Init);
        }

        let bytes_per_sector = le16(boot, 0x0B);
        let sectors_per_cluster = boot[0x0D];
        let fat_region = le16(boot, 0x0E) as u32;
        let fat_count = boot[0x10];
        let root_entries = le16(boot, 0x11);
        let sectors_per_fat = le16(boot, 0x16);

        let mut num_sectors = le16(boot, 0x13) as u32;
        if num_sectors == 0 {
            num_sectors = le32(boot, 0x20);
        }

        if bytes_per_sector < ENTRY_SIZE as u16
            || bytes_per_sector as usize % ENTRY_SIZE != 0
            || sectors_per_cluster == 0
        {
            return Err(KernelError::Init);
        }

        let root_region = fat_region + sectors_per_fat as u32 * fat_count as u32;
        let root_sectors =
            (root_entries as u32 * ENTRY_SIZE as u32).div_ceil(bytes_per_sector as u32);
        let data_region = root_region + root_sectors;

        if data_region > num_sectors {
            return Err(KernelError::Init);
        }

        Ok(Self {
            bytes_per_sector,
            sectors_per_cluster,
            fat_region,
            root_region,
            data_region,
            num_sectors,
            sectors_per_fat,
            fat_count,
            root_entries,
        })
    }

    pub fn bytes_per_cluster(&self) -> u32 {
        self.bytes_per_sector as u32 * self.sectors_per_cluster as u32
    }

    /// Directory entries per sector.
    pub fn entries_per_sector(&self) -> usize {
        self.bytes_per_sector as usize / ENTRY_SIZE
    }

    /// First sector of a data cluster.
    pub fn cluster_sector(&self, cluster: u16) -> u32 {
        self.data_region + (cluster as u32 - 2) * self.sectors_per_cluster as u32
    }

    /// One past the highest usable cluster number.
    ///
    /// Bounded by the data region, the FAT size and the reserved range.
    pub fn cluster_limit(&self) -> u32 {
        let data_clusters = (self.num_sectors - self.data_region) / self.sectors_per_cluster as u32;
        let fat_entries = self.sectors_per_fat as u32 * self.bytes_per_sector as u32 / 2;
        (2 + data_clusters).min(fat_entries).min(CLUSTER_RESERVED)
    }

    /// Whether `cluster` names a cluster in the data region.
    pub fn is_data_cluster(&self, cluster: u16) -> bool {
        cluster >= 2 && (cluster as u32) < self.cluster_limit()
    }
}
