//! Integration tests for package loading with real ZIP files.

use std::io::Write;
use std::path::PathBuf;

use bankos_core::{
    format_volume, load_package_from_path, provision, FileMode, FormatOptions, HeadlessConsole,
    KernelConfig, KernelError, Machine, MemoryDisk, RunExit,
};

/// Write a ZIP archive under the system temp directory.
fn write_package(name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
    let path = std::env::temp_dir().join(format!("bankos-{}-{}.zip", std::process::id(), name));
    let file = std::fs::File::create(&path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for (entry, data) in entries {
        zip.start_file::<_, ()>(*entry, Default::default()).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
    path
}

fn machine() -> Machine<HeadlessConsole, MemoryDisk> {
    let mut disk = MemoryDisk::blank(2048, 512).unwrap();
    format_volume(&mut disk, &FormatOptions::default()).unwrap();
    let config = KernelConfig {
        banks: 4,
        ..Default::default()
    };
    Machine::with_config(disk, HeadlessConsole::new(), &config).unwrap()
}

#[test]
fn test_provision_and_autorun() {
    let manifest = r#"{
        "name": "Greeter",
        "version": "0.3",
        "files": [
            { "src": "bin/greet.exe", "dst": "GREET.EXE", "attributes": { "readOnly": true } },
            { "src": "motd.txt" }
        ],
        "autorun": { "program": "greet.exe", "args": ["x"] }
    }"#;
    // Print "hi", exit with argc
    let greet = [
        0x0A, 0x80, //       header: load at 0x8000
        0xD5, //             PUSH DE
        0x0E, 0x01, //       LD C,1
        0x1E, b'h', //       LD E,'h'
        0xCD, 0x05, 0x00, // CALL 5
        0x0E, 0x01, //       LD C,1
        0x1E, b'i', //       LD E,'i'
        0xCD, 0x05, 0x00, // CALL 5
        0xE1, //             POP HL
        0xC9, //             RET
    ];
    let path = write_package(
        "greeter",
        &[
            ("manifest.json", manifest.as_bytes()),
            ("bin/greet.exe", &greet[..]),
            ("motd.txt", &b"welcome"[..]),
        ],
    );

    let pkg = load_package_from_path(&path).unwrap();
    std::fs::remove_file(&path).unwrap();
    assert_eq!(pkg.manifest.name, "Greeter");

    let mut m = machine();
    let installed = provision(m.kernel_mut().fs_mut(), &pkg).unwrap();
    assert_eq!(installed.len(), 2);
    assert!(m
        .kernel_mut()
        .fs_mut()
        .info("greet.exe")
        .unwrap()
        .attributes
        .is_read_only());

    let autorun = pkg.manifest.autorun.clone().unwrap();
    let mut argv = vec![autorun.program.clone()];
    argv.extend(autorun.args);
    let pid = m.launch(&autorun.program, &argv).unwrap();

    assert_eq!(m.run().unwrap(), RunExit::AllFinished);
    assert_eq!(m.console().output_string(), "hi");
    assert_eq!(m.exit_code(pid), Some(2));

    let fs = m.kernel_mut().fs_mut();
    let fd = fs.open("motd.txt", FileMode::Read).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"welcome");
    fs.close(fd).unwrap();
}

#[test]
fn test_second_package_overrides_first() {
    let first = write_package("first", &[("data.txt", &b"old contents"[..])]);
    let second = write_package("second", &[("DATA.TXT", &b"new"[..])]);

    let mut m = machine();
    for path in [&first, &second] {
        let pkg = load_package_from_path(path).unwrap();
        std::fs::remove_file(path).unwrap();
        provision(m.kernel_mut().fs_mut(), &pkg).unwrap();
    }

    let fs = m.kernel_mut().fs_mut();
    assert_eq!(fs.entries().unwrap(), 1);
    assert_eq!(fs.info("data.txt").unwrap().size, 3);
}

#[test]
fn test_missing_package_file() {
    let path = std::env::temp_dir().join("bankos-does-not-exist.zip");
    assert!(matches!(load_package_from_path(&path), Err(KernelError::Io(_))));
}

#[test]
fn test_not_a_zip() {
    let path = std::env::temp_dir().join(format!("bankos-{}-garbage.zip", std::process::id()));
    std::fs::write(&path, b"this is not an archive").unwrap();
    let result = load_package_from_path(&path);
    std::fs::remove_file(&path).unwrap();
    assert!(matches!(result, Err(KernelError::Zip(_))));
}
