//! Open file descriptors.

use super::dirent::{DirEntry, ShortName};
use crate::error::KernelError;

/// Index into the descriptor table.
pub type Fd = usize;

/// Largest descriptor table a volume can be mounted with.
pub const MAX_FILE_LIMIT: usize = 8;

/// Open mode. The discriminant is the syscall ABI value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileMode {
    Read = 1,
    /// Creates the file; fails if it already exists.
    Write = 2,
}

impl TryFrom<u8> for FileMode {
    type Error = KernelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Read),
            2 => Ok(Self::Write),
            _ => Err(KernelError::InvalidMode(value)),
        }
    }
}

/// Location of a directory entry on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirSlot {
    pub sector: u32,
    pub offset: usize,
}

/// Cursor over an open file.
///
/// A write-mode cursor may rest with `sector_in_cluster` equal to the
/// cluster size; the next cluster is only linked when another byte is
/// written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileDescriptor {
    pub mode: FileMode,
    pub name: ShortName,
    pub slot: DirSlot,
    pub size: u32,
    pub fpos: u32,
    pub start_cluster: u16,
    pub current_cluster: u16,
    pub sector_in_cluster: u8,
    pub byte_in_sector: u16,
}

impl FileDescriptor {
    /// Cursor at the start of `entry`.
    pub fn new(mode: FileMode, slot: DirSlot, entry: &DirEntry) -> Self {
        Self {
            mode,
            name: entry.name,
            slot,
            size: entry.size,
            fpos: 0,
            start_cluster: entry.start_cluster,
            current_cluster: entry.start_cluster,
            sector_in_cluster: 0,
            byte_in_sector: 0,
        }
    }

    /// Bytes between the cursor and the end of the file.
    pub fn remaining(&self) -> u32 {
        self.size.saturating_sub(self.fpos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_from_abi() {
        assert_eq!(FileMode::try_from(1).unwrap(), FileMode::Read);
        assert_eq!(FileMode::try_from(2).unwrap(), FileMode::Write);
        assert!(matches!(
            FileMode::try_from(3),
            Err(KernelError::InvalidMode(3))
        ));
    }

    #[test]
    fn test_new_cursor() {
        let mut entry = DirEntry::new(ShortName::parse("a.txt").unwrap(), 5);
        entry.size = 100;
        let slot = DirSlot { sector: 3, offset: 64 };
        let fd = FileDescriptor::new(FileMode::Read, slot, &entry);

        assert_eq!(fd.current_cluster, 5);
        assert_eq!(fd.remaining(), 100);
        assert_eq!(fd.slot, slot);
    }
}
