//! Volumes that survive an unmount, and layouts other than the default.

use bankos_core::fs::Attributes;
use bankos_core::{format_volume, FileMode, Filesystem, FormatOptions, KernelError, MemoryDisk};

fn write_file(fs: &mut Filesystem<MemoryDisk>, name: &str, data: &[u8]) {
    let fd = fs.open(name, FileMode::Write).unwrap();
    assert_eq!(fs.write(fd, data).unwrap(), data.len());
    fs.close(fd).unwrap();
}

fn read_file(fs: &mut Filesystem<MemoryDisk>, name: &str) -> Vec<u8> {
    let fd = fs.open(name, FileMode::Read).unwrap();
    let mut out = Vec::new();
    let mut buf = [0u8; 100];
    loop {
        let n = fs.read(fd, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    fs.close(fd).unwrap();
    out
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[test]
fn test_image_survives_remount() {
    let mut disk = MemoryDisk::blank(2048, 512).unwrap();
    format_volume(&mut disk, &FormatOptions::default()).unwrap();
    let mut fs = Filesystem::mount(disk, 4).unwrap();

    write_file(&mut fs, "small.txt", b"tiny");
    write_file(&mut fs, "big.bin", &pattern(10_000, 7));
    write_file(&mut fs, "empty.dat", b"");
    fs.set_attributes("small.txt", Attributes::from_bits(Attributes::READ_ONLY))
        .unwrap();

    // Round trip through raw bytes, as the CLI does with image files
    let bytes = fs.into_disk().into_bytes();
    let mut fs = Filesystem::mount(MemoryDisk::from_bytes(bytes, 512).unwrap(), 4).unwrap();

    assert_eq!(fs.entries().unwrap(), 3);
    assert_eq!(read_file(&mut fs, "SMALL.TXT"), b"tiny");
    assert_eq!(read_file(&mut fs, "big.bin"), pattern(10_000, 7));
    assert!(read_file(&mut fs, "empty.dat").is_empty());

    let info = fs.info("small.txt").unwrap();
    assert!(info.attributes.is_read_only());
    assert!(matches!(fs.delete("small.txt"), Err(KernelError::AccessMode)));
}

#[test]
fn test_single_sector_clusters() {
    let mut disk = MemoryDisk::blank(512, 512).unwrap();
    let options = FormatOptions {
        sectors_per_cluster: 1,
        root_entries: 64,
        ..Default::default()
    };
    let geometry = format_volume(&mut disk, &options).unwrap();
    assert_eq!(geometry.bytes_per_cluster(), 512);

    let mut fs = Filesystem::mount(disk, 2).unwrap();
    write_file(&mut fs, "a.bin", &pattern(1500, 1));
    write_file(&mut fs, "b.bin", &pattern(700, 2));
    fs.delete("a.bin").unwrap();
    // Reuses the clusters a.bin gave back
    write_file(&mut fs, "c.bin", &pattern(2100, 3));

    assert_eq!(read_file(&mut fs, "b.bin"), pattern(700, 2));
    assert_eq!(read_file(&mut fs, "c.bin"), pattern(2100, 3));
    assert_eq!(fs.info("c.bin").unwrap().size, 2100);
}

#[test]
fn test_small_sectors() {
    let mut disk = MemoryDisk::blank(4096, 128).unwrap();
    let options = FormatOptions {
        sectors_per_cluster: 4,
        root_entries: 32,
        ..Default::default()
    };
    format_volume(&mut disk, &options).unwrap();

    let mut fs = Filesystem::mount(disk, 1).unwrap();
    write_file(&mut fs, "log.txt", &pattern(3000, 9));
    assert_eq!(read_file(&mut fs, "log.txt"), pattern(3000, 9));

    // One descriptor only
    let fd = fs.open("log.txt", FileMode::Read).unwrap();
    assert!(matches!(
        fs.open("log.txt", FileMode::Read),
        Err(KernelError::FileLimit)
    ));
    fs.close(fd).unwrap();
}

#[test]
fn test_mount_rejects_mismatched_sector_size() {
    let mut disk = MemoryDisk::blank(2048, 512).unwrap();
    format_volume(&mut disk, &FormatOptions::default()).unwrap();
    let bytes = disk.into_bytes();

    assert!(matches!(
        Filesystem::mount(MemoryDisk::from_bytes(bytes, 256).unwrap(), 4),
        Err(KernelError::Init)
    ));
}

#[test]
fn test_directory_listing_after_churn() {
    let mut disk = MemoryDisk::blank(1024, 512).unwrap();
    format_volume(&mut disk, &FormatOptions::default()).unwrap();
    let mut fs = Filesystem::mount(disk, 4).unwrap();

    for i in 0..6 {
        write_file(&mut fs, &format!("f{}.txt", i), &[i as u8]);
    }
    fs.delete("f1.txt").unwrap();
    fs.delete("f4.txt").unwrap();
    // Fills the first free slot
    write_file(&mut fs, "new.txt", b"n");

    let names: Vec<String> = fs.list().unwrap().iter().map(|e| e.filename()).collect();
    assert_eq!(
        names,
        vec!["F0.TXT", "NEW.TXT", "F2.TXT", "F3.TXT", "F5.TXT"]
    );
    assert_eq!(fs.entry(1).unwrap().filename(), "NEW.TXT");
}
