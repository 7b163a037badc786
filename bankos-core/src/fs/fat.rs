//! FAT16 cluster chains.
//!
//! Each cluster has a 2-byte little-endian entry at `cluster * 2` from the
//! start of the FAT region. Updates are mirrored to every FAT copy; lookups
//! read the first copy.

use super::disk::BlockDevice;
use super::Filesystem;
use crate::error::{KernelError, KernelResult};

/// Free cluster.
pub const CLUSTER_FREE: u16 = 0x0000;

/// End of a cluster chain.
pub const CLUSTER_EOF: u16 = 0xFFFF;

/// Lowest data cluster.
pub const FIRST_CLUSTER: u16 = 2;

impl<D: BlockDevice> Filesystem<D> {
    /// FAT sector (relative to a copy) and byte offset of a cluster's entry.
    fn fat_position(&self, cluster: u16) -> (u32, usize) {
        let bps = self.geometry.bytes_per_sector as u32;
        let bytes = cluster as u32 * 2;
        (bytes / bps, (bytes % bps) as usize)
    }

    /// Value of a cluster's FAT entry: the next cluster, free or end of chain.
    pub fn next_cluster(&mut self, cluster: u16) -> KernelResult<u16> {
        let (sector, offset) = self.fat_position(cluster);
        self.load(self.geometry.fat_region + sector)?;
        Ok(u16::from_le_bytes([self.cache[offset], self.cache[offset + 1]]))
    }

    pub(crate) fn set_cluster(&mut self, cluster: u16, value: u16) -> KernelResult<()> {
        let (sector, offset) = self.fat_position(cluster);
        for copy in 0..self.geometry.fat_count as u32 {
            let sector = self.geometry.fat_region + copy * self.geometry.sectors_per_fat as u32 + sector;
            self.load(sector)?;
            self.cache[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
            self.disk.write_sector(sector, &self.cache)?;
        }
        Ok(())
    }

    /// Lowest free data cluster.
    fn find_free_cluster(&mut self) -> KernelResult<Option<u16>> {
        for cluster in FIRST_CLUSTER as u32..self.geometry.cluster_limit() {
            let cluster = cluster as u16;
            if self.next_cluster(cluster)? == CLUSTER_FREE {
                return Ok(Some(cluster));
            }
        }
        Ok(None)
    }

    /// Claim a free cluster as the new end of a chain, linking it after
    /// `previous` when given.
    pub(crate) fn allocate_cluster(&mut self, previous: Option<u16>) -> KernelResult<u16> {
        let cluster = self.find_free_cluster()?.ok_or(KernelError::DiskFull)?;
        self.set_cluster(cluster, CLUSTER_EOF)?;
        if let Some(previous) = previous {
            self.set_cluster(previous, cluster)?;
        }

        if self.trace {
            eprintln!("[FS] Allocated cluster {} after {:?}", cluster, previous);
        }
        Ok(cluster)
    }

    /// Return every cluster of a chain to the free pool.
    ///
    /// Stops at the end marker, at anything that is not a data cluster, at
    /// an already free entry, and after at most as many steps as the volume
    /// has clusters.
    pub(crate) fn free_chain(&mut self, start: u16) -> KernelResult<usize> {
        let limit = self.geometry.cluster_limit() as usize;
        let mut cluster = start;
        let mut freed = 0;

        while self.geometry.is_data_cluster(cluster) && freed < limit {
            let next = self.next_cluster(cluster)?;
            if next == CLUSTER_FREE {
                break;
            }
            self.set_cluster(cluster, CLUSTER_FREE)?;
            freed += 1;
            cluster = next;
        }
        Ok(freed)
    }

    /// Clusters of a chain in order, bounded like [`Self::free_chain`].
    pub fn chain(&mut self, start: u16) -> KernelResult<Vec<u16>> {
        let limit = self.geometry.cluster_limit() as usize;
        let mut chain = Vec::new();
        let mut cluster = start;

        while self.geometry.is_data_cluster(cluster) && chain.len() < limit {
            chain.push(cluster);
            cluster = self.next_cluster(cluster)?;
        }
        Ok(chain)
    }

    /// Number of free data clusters.
    pub fn free_clusters(&mut self) -> KernelResult<usize> {
        let mut free = 0;
        for cluster in FIRST_CLUSTER as u32..self.geometry.cluster_limit() {
            if self.next_cluster(cluster as u16)? == CLUSTER_FREE {
                free += 1;
            }
        }
        Ok(free)
    }
}

#[cfg(test)]
mod tests {
    use crate::error::KernelError;
    use crate::fs::tests::mock_volume;
    use crate::fs::*;

    #[test]
    fn test_fresh_volume_is_free() {
        let mut fs = mock_volume();
        assert_eq!(fs.next_cluster(FIRST_CLUSTER).unwrap(), CLUSTER_FREE);
        let limit = fs.geometry().cluster_limit() as usize;
        assert_eq!(fs.free_clusters().unwrap(), limit - 2);
    }

    #[test]
    fn test_allocate_lowest_first() {
        let mut fs = mock_volume();
        let a = fs.allocate_cluster(None).unwrap();
        let b = fs.allocate_cluster(Some(a)).unwrap();
        assert_eq!((a, b), (2, 3));
        assert_eq!(fs.next_cluster(a).unwrap(), b);
        assert_eq!(fs.next_cluster(b).unwrap(), CLUSTER_EOF);
        assert_eq!(fs.chain(a).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_fat_copies_mirrored() {
        let mut fs = mock_volume();
        let cluster = fs.allocate_cluster(None).unwrap();

        let geometry = *fs.geometry();
        let bps = geometry.bytes_per_sector as usize;
        let mut buf = vec![0u8; bps];
        for copy in 0..geometry.fat_count as u32 {
            let sector = geometry.fat_region + copy * geometry.sectors_per_fat as u32;
            fs.disk_read(sector, &mut buf).unwrap();
            let at = cluster as usize * 2;
            assert_eq!(&buf[at..at + 2], &[0xFF, 0xFF]);
        }
    }

    #[test]
    fn test_free_chain() {
        let mut fs = mock_volume();
        let a = fs.allocate_cluster(None).unwrap();
        let b = fs.allocate_cluster(Some(a)).unwrap();
        let c = fs.allocate_cluster(Some(b)).unwrap();

        assert_eq!(fs.free_chain(a).unwrap(), 3);
        for cluster in [a, b, c] {
            assert_eq!(fs.next_cluster(cluster).unwrap(), CLUSTER_FREE);
        }
    }

    #[test]
    fn test_cyclic_chain_is_bounded() {
        let mut fs = mock_volume();
        let a = fs.allocate_cluster(None).unwrap();
        let b = fs.allocate_cluster(Some(a)).unwrap();
        fs.set_cluster(b, a).unwrap();

        let limit = fs.geometry().cluster_limit() as usize;
        assert_eq!(fs.chain(a).unwrap().len(), limit);
        assert_eq!(fs.free_chain(a).unwrap(), 2);
    }

    #[test]
    fn test_disk_full() {
        let mut fs = mock_volume();
        let limit = fs.geometry().cluster_limit();
        for _ in 2..limit {
            fs.allocate_cluster(None).unwrap();
        }
        assert!(matches!(
            fs.allocate_cluster(None),
            Err(KernelError::DiskFull)
        ));
    }
}
