//! FAT16 filesystem layer.
//!
//! A single root directory (no subdirectories), cluster chains in the FAT
//! and a fixed table of open file descriptors. All metadata access goes
//! through a one-sector cache that is written through on every update:
//! - `disk`: sector devices and [`format_volume`]
//! - `geometry`: boot sector decoding
//! - `dirent`: directory entries and 8.3 names
//! - `fat`: cluster chain operations
//! - `fd`: descriptor cursors

mod dirent;
mod disk;
mod fat;
mod fd;
mod geometry;

pub use dirent::{
    Attributes, Date, DirEntry, ShortName, END_MARKER, ENTRY_SIZE, FREE_MARKER, MAX_FILENAME_LEN,
};
pub use disk::{format_volume, BlockDevice, FormatOptions, MemoryDisk};
pub use fat::{CLUSTER_EOF, CLUSTER_FREE, FIRST_CLUSTER};
pub use fd::{DirSlot, Fd, FileDescriptor, FileMode, MAX_FILE_LIMIT};
pub use geometry::Geometry;

use crate::error::{KernelError, KernelResult};

/// Result of [`Filesystem::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileInfo {
    pub attributes: Attributes,
    pub size: u32,
    pub created: Date,
}

/// A mounted volume.
pub struct Filesystem<D: BlockDevice> {
    disk: D,
    geometry: Geometry,
    cache: Vec<u8>,
    cache_sector: Option<u32>,
    /// Buffer for uncached full-sector reads.
    scratch: Vec<u8>,
    fds: Vec<Option<FileDescriptor>>,
    /// Enable filesystem tracing.
    pub trace: bool,
}

impl<D: BlockDevice> Filesystem<D> {
    /// Read the boot sector of `disk` and mount it with `file_limit`
    /// descriptors.
    pub fn mount(disk: D, file_limit: usize) -> KernelResult<Self> {
        if file_limit == 0 || file_limit > MAX_FILE_LIMIT {
            return Err(KernelError::Init);
        }

        let mut boot = vec![0u8; disk.sector_size()];
        disk.read_sector(0, &mut boot)?;
        let geometry = Geometry::parse(&boot)?;

        if geometry.bytes_per_sector as usize != disk.sector_size()
            || geometry.num_sectors > disk.sector_count()
        {
            return Err(KernelError::Init);
        }

        let bps = geometry.bytes_per_sector as usize;
        Ok(Self {
            disk,
            geometry,
            cache: boot,
            cache_sector: Some(0),
            scratch: vec![0; bps],
            fds: vec![None; file_limit],
            trace: false,
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn disk(&self) -> &D {
        &self.disk
    }

    /// Unmount, handing back the device.
    pub fn into_disk(self) -> D {
        self.disk
    }

    /// Size of the descriptor table.
    pub fn file_limit(&self) -> usize {
        self.fds.len()
    }

    /// Bring `sector` into the cache unless it is already there.
    fn load(&mut self, sector: u32) -> KernelResult<()> {
        if self.cache_sector != Some(sector) {
            self.cache_sector = None;
            self.disk.read_sector(sector, &mut self.cache)?;
            self.cache_sector = Some(sector);
        }
        Ok(())
    }

    /// Raw sector read through the cache.
    pub fn disk_read(&mut self, sector: u32, buf: &mut [u8]) -> KernelResult<()> {
        self.load(sector)?;
        let n = buf.len().min(self.cache.len());
        buf[..n].copy_from_slice(&self.cache[..n]);
        Ok(())
    }

    /// Raw sector write. Refreshes the cache if it holds `sector`.
    /// `data` must hold a whole sector.
    pub fn disk_write(&mut self, sector: u32, data: &[u8]) -> KernelResult<()> {
        if data.len() < self.cache.len() {
            return Err(disk::short_buffer(data.len(), self.cache.len()));
        }
        self.disk.write_sector(sector, data)?;
        if self.cache_sector == Some(sector) {
            let n = self.cache.len();
            self.cache.copy_from_slice(&data[..n]);
        }
        Ok(())
    }

    // Directory

    /// Visit every file entry in on-disk order until `visit` returns a value.
    fn scan_directory<T, F>(&mut self, mut visit: F) -> KernelResult<Option<T>>
    where
        F: FnMut(DirSlot, DirEntry) -> Option<T>,
    {
        for sector in self.geometry.root_region..self.geometry.data_region {
            self.load(sector)?;
            for index in 0..self.geometry.entries_per_sector() {
                let offset = index * ENTRY_SIZE;
                let raw = &self.cache[offset..offset + ENTRY_SIZE];
                match raw[0] {
                    END_MARKER => return Ok(None),
                    FREE_MARKER => continue,
                    _ => {}
                }

                let entry = DirEntry::parse(raw);
                if !entry.attributes.is_file() {
                    continue;
                }
                if let Some(found) = visit(DirSlot { sector, offset }, entry) {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    fn locate(&mut self, name: &ShortName) -> KernelResult<Option<(DirSlot, DirEntry)>> {
        self.scan_directory(|slot, entry| (entry.name == *name).then_some((slot, entry)))
    }

    fn locate_or_err(&mut self, name: &str) -> KernelResult<(DirSlot, DirEntry)> {
        let short = ShortName::parse(name)?;
        self.locate(&short)?.ok_or(KernelError::FileNotFound)
    }

    /// Look up a file by name (case-insensitive 8.3).
    pub fn find_entry(&mut self, name: &str) -> KernelResult<DirEntry> {
        self.locate_or_err(name).map(|(_, entry)| entry)
    }

    fn store_entry(&mut self, slot: DirSlot, entry: &DirEntry, fresh: bool) -> KernelResult<()> {
        self.load(slot.sector)?;
        let raw = &mut self.cache[slot.offset..slot.offset + ENTRY_SIZE];
        if fresh {
            raw.fill(0);
        }
        entry.encode_into(raw);
        self.disk.write_sector(slot.sector, &self.cache)
    }

    /// First unused or deleted directory slot.
    fn free_slot(&mut self) -> KernelResult<DirSlot> {
        for sector in self.geometry.root_region..self.geometry.data_region {
            self.load(sector)?;
            for index in 0..self.geometry.entries_per_sector() {
                let offset = index * ENTRY_SIZE;
                if matches!(self.cache[offset], END_MARKER | FREE_MARKER) {
                    return Ok(DirSlot { sector, offset });
                }
            }
        }
        Err(KernelError::DirFull)
    }

    fn create(&mut self, name: ShortName) -> KernelResult<(DirSlot, DirEntry)> {
        if self.locate(&name)?.is_some() {
            return Err(KernelError::FileExist);
        }

        let slot = self.free_slot()?;
        let cluster = self.allocate_cluster(None)?;
        let entry = DirEntry::new(name, cluster);
        self.store_entry(slot, &entry, true)?;

        if self.trace {
            eprintln!("[FS] Created {} at cluster {}", name, cluster);
        }
        Ok((slot, entry))
    }

    /// Create an empty file without keeping it open.
    pub fn file_new(&mut self, name: &str) -> KernelResult<()> {
        let short = ShortName::parse(name)?;
        self.create(short).map(|_| ())
    }

    /// Remove a file and free its cluster chain.
    pub fn delete(&mut self, name: &str) -> KernelResult<()> {
        let (slot, entry) = self.locate_or_err(name)?;

        if entry.attributes.is_read_only() || self.is_open(slot) {
            return Err(KernelError::AccessMode);
        }

        let freed = self.free_chain(entry.start_cluster)?;

        self.load(slot.sector)?;
        self.cache[slot.offset] = FREE_MARKER;
        self.disk.write_sector(slot.sector, &self.cache)?;

        if self.trace {
            eprintln!("[FS] Deleted {} ({} clusters)", entry.name, freed);
        }
        Ok(())
    }

    /// Attributes, size and creation date of a file.
    pub fn info(&mut self, name: &str) -> KernelResult<FileInfo> {
        let entry = self.find_entry(name)?;
        Ok(FileInfo {
            attributes: entry.attributes,
            size: entry.size,
            created: entry.created,
        })
    }

    /// Replace the read-only, hidden and system bits of a file.
    pub fn set_attributes(&mut self, name: &str, attributes: Attributes) -> KernelResult<()> {
        let (slot, mut entry) = self.locate_or_err(name)?;
        entry.attributes = entry.attributes.with_user_bits(attributes.bits());
        self.store_entry(slot, &entry, false)
    }

    /// Number of files in the root directory.
    pub fn entries(&mut self) -> KernelResult<usize> {
        let mut count = 0;
        self.scan_directory(|_, _| {
            count += 1;
            None::<()>
        })?;
        Ok(count)
    }

    /// The `n`th file in on-disk order.
    pub fn entry(&mut self, n: usize) -> KernelResult<DirEntry> {
        let mut seen = 0;
        self.scan_directory(|_, entry| {
            if seen == n {
                return Some(entry);
            }
            seen += 1;
            None
        })?
        .ok_or(KernelError::FileNotFound)
    }

    /// Every file in on-disk order.
    pub fn list(&mut self) -> KernelResult<Vec<DirEntry>> {
        let mut all = Vec::new();
        self.scan_directory(|_, entry| {
            all.push(entry);
            None::<()>
        })?;
        Ok(all)
    }

    // Descriptors

    fn is_open(&self, slot: DirSlot) -> bool {
        self.fds.iter().flatten().any(|fd| fd.slot == slot)
    }

    /// Open descriptor `fd`.
    pub fn descriptor(&self, fd: Fd) -> KernelResult<&FileDescriptor> {
        self.fds
            .get(fd)
            .and_then(|f| f.as_ref())
            .ok_or(KernelError::InvalidDescriptor(fd))
    }

    /// Copy of an open descriptor, checked against `mode`.
    fn handle(&self, fd: Fd, mode: FileMode) -> KernelResult<FileDescriptor> {
        let file = *self.descriptor(fd)?;
        if file.mode != mode {
            return Err(KernelError::AccessMode);
        }
        Ok(file)
    }

    /// Open a file. `Write` creates it.
    pub fn open(&mut self, name: &str, mode: FileMode) -> KernelResult<Fd> {
        let short = ShortName::parse(name)?;
        let fd = self
            .fds
            .iter()
            .position(|f| f.is_none())
            .ok_or(KernelError::FileLimit)?;

        let (slot, entry) = match mode {
            FileMode::Read => self.locate(&short)?.ok_or(KernelError::FileNotFound)?,
            FileMode::Write => self.create(short)?,
        };

        self.fds[fd] = Some(FileDescriptor::new(mode, slot, &entry));
        if self.trace {
            eprintln!("[FS] Opened {} as fd {} ({:?})", short, fd, mode);
        }
        Ok(fd)
    }

    /// Release a descriptor. A write-mode file's size is committed to its
    /// directory entry.
    pub fn close(&mut self, fd: Fd) -> KernelResult<()> {
        let file = *self.descriptor(fd)?;

        if file.mode == FileMode::Write {
            self.load(file.slot.sector)?;
            let mut entry = DirEntry::parse(&self.cache[file.slot.offset..file.slot.offset + ENTRY_SIZE]);
            entry.size = file.size;
            self.store_entry(file.slot, &entry, false)?;
        }

        self.fds[fd] = None;
        if self.trace {
            eprintln!("[FS] Closed fd {} ({} bytes)", fd, file.size);
        }
        Ok(())
    }

    /// Close every open descriptor.
    pub fn close_all(&mut self) -> KernelResult<()> {
        for fd in 0..self.fds.len() {
            if self.fds[fd].is_some() {
                self.close(fd)?;
            }
        }
        Ok(())
    }

    // Read path

    fn at_eof(&self, file: &FileDescriptor) -> bool {
        file.fpos >= file.size || !self.geometry.is_data_cluster(file.current_cluster)
    }

    fn current_sector(&self, file: &FileDescriptor) -> u32 {
        self.geometry.cluster_sector(file.current_cluster) + file.sector_in_cluster as u32
    }

    /// Move a read cursor `n` bytes forward within its sector, following
    /// the chain when a cluster is used up.
    fn advance_read(&mut self, file: &mut FileDescriptor, n: usize) -> KernelResult<()> {
        file.fpos += n as u32;
        file.byte_in_sector += n as u16;

        if file.byte_in_sector == self.geometry.bytes_per_sector {
            file.byte_in_sector = 0;
            file.sector_in_cluster += 1;

            if file.sector_in_cluster == self.geometry.sectors_per_cluster {
                file.current_cluster = self.next_cluster(file.current_cluster)?;
                file.sector_in_cluster = 0;
            }
        }
        Ok(())
    }

    /// Next byte of a read-mode file, or `Eof`.
    pub fn read_byte(&mut self, fd: Fd) -> KernelResult<u8> {
        let mut file = self.handle(fd, FileMode::Read)?;
        if self.at_eof(&file) {
            return Err(KernelError::Eof);
        }

        let sector = self.current_sector(&file);
        self.load(sector)?;
        let byte = self.cache[file.byte_in_sector as usize];

        self.advance_read(&mut file, 1)?;
        self.fds[fd] = Some(file);
        Ok(byte)
    }

    /// Rest of the current sector, bypassing the cache.
    ///
    /// Copies at most to the end of the sector and never past the end of
    /// the file. Returns the number of bytes copied, or `Eof`.
    pub fn read_sector(&mut self, fd: Fd, buf: &mut [u8]) -> KernelResult<usize> {
        let mut file = self.handle(fd, FileMode::Read)?;
        if self.at_eof(&file) {
            return Err(KernelError::Eof);
        }

        let start = file.byte_in_sector as usize;
        let count = (self.geometry.bytes_per_sector as usize - start)
            .min(file.remaining() as usize)
            .min(buf.len());

        let sector = self.current_sector(&file);
        self.disk.read_sector(sector, &mut self.scratch)?;
        buf[..count].copy_from_slice(&self.scratch[start..start + count]);

        self.advance_read(&mut file, count)?;
        self.fds[fd] = Some(file);
        Ok(count)
    }

    /// Read up to `buf.len()` bytes. Short only at end of file; bytes of
    /// `buf` past the count returned are left untouched.
    pub fn read(&mut self, fd: Fd, buf: &mut [u8]) -> KernelResult<usize> {
        let file = self.handle(fd, FileMode::Read)?;
        let bps = self.geometry.bytes_per_sector as usize;
        let n = buf.len().min(file.remaining() as usize);
        let mut done = 0;

        // Up to the next sector boundary
        while done < n && self.descriptor(fd)?.byte_in_sector != 0 {
            match self.read_byte(fd) {
                Ok(byte) => buf[done] = byte,
                Err(KernelError::Eof) => return Ok(done),
                Err(e) => return Err(e),
            }
            done += 1;
        }

        // Whole sectors
        while n - done >= bps {
            match self.read_sector(fd, &mut buf[done..done + bps]) {
                Ok(count) => done += count,
                Err(KernelError::Eof) => return Ok(done),
                Err(e) => return Err(e),
            }
        }

        // Tail
        while done < n {
            match self.read_byte(fd) {
                Ok(byte) => buf[done] = byte,
                Err(KernelError::Eof) => return Ok(done),
                Err(e) => return Err(e),
            }
            done += 1;
        }

        Ok(done)
    }

    // Write path

    /// Write as much of `data` as fits in the cursor's current sector.
    fn write_chunk(&mut self, file: &mut FileDescriptor, data: &[u8]) -> KernelResult<usize> {
        let bps = self.geometry.bytes_per_sector as usize;

        if file.sector_in_cluster == self.geometry.sectors_per_cluster {
            file.current_cluster = self.allocate_cluster(Some(file.current_cluster))?;
            file.sector_in_cluster = 0;
        }

        let sector = self.current_sector(file);
        let start = file.byte_in_sector as usize;
        let count = (bps - start).min(data.len());

        if count == bps {
            self.disk_write(sector, &data[..bps])?;
        } else {
            self.load(sector)?;
            self.cache[start..start + count].copy_from_slice(&data[..count]);
            self.disk.write_sector(sector, &self.cache)?;
        }

        file.fpos += count as u32;
        file.size = file.size.max(file.fpos);
        file.byte_in_sector += count as u16;
        if file.byte_in_sector as usize == bps {
            file.byte_in_sector = 0;
            file.sector_in_cluster += 1;
        }
        Ok(count)
    }

    /// Append `data` to a write-mode file.
    ///
    /// Returns the number of bytes written. Running out of clusters part way
    /// gives a short count; with nothing written it is `DiskFull`.
    pub fn write(&mut self, fd: Fd, data: &[u8]) -> KernelResult<usize> {
        let mut file = self.handle(fd, FileMode::Write)?;
        let mut written = 0;
        let mut failure = None;

        while written < data.len() {
            match self.write_chunk(&mut file, &data[written..]) {
                Ok(count) => written += count,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        self.fds[fd] = Some(file);
        match failure {
            Some(KernelError::DiskFull) if written > 0 => Ok(written),
            Some(e) => Err(e),
            None => Ok(written),
        }
    }
}
