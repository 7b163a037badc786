//! bankos CLI - Run programs on the bank-switched kernel.
//!
//! Usage:
//!   bankos [packages/images/files...] [-- program args]
//!
//! Examples:
//!   bankos demo.zip                      # Provision demo.zip, run its autorun
//!   bankos demo.zip -- hello.exe world   # Run hello.exe with one argument
//!   bankos disk.img -- shell.exe         # Boot from an existing volume image
//!   bankos hello.exe --dump-image out.img
//!
//! Ctrl-X raises cancel and Ctrl-C raises break in the running program.

use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use clap::Parser;
use crossterm::{
    event::{self, Event, KeyCode, KeyModifiers},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use tokio::sync::mpsc as tokio_mpsc;

use bankos_core::fs::Attributes;
use bankos_core::{
    format_volume, install_file, load_package_from_path, provision, Console, FormatOptions,
    Kernel, KernelConfig, LoadedPackage, Machine, MemoryDisk, RunExit, ShortName,
};

/// Sector size of blank and imported volumes.
const SECTOR_SIZE: usize = 512;

/// Sectors in a blank volume (4 MiB).
const VOLUME_SECTORS: u32 = 8192;

/// Bank-switched kernel CLI
#[derive(Parser, Debug)]
#[command(name = "bankos")]
#[command(about = "Run programs on the bank-switched kernel")]
struct Args {
    /// Package ZIP files, a .img volume image, or loose files to install
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Number of physical memory banks
    #[arg(short, long)]
    banks: Option<usize>,

    /// Kernel configuration (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable kernel tracing
    #[arg(short, long)]
    trace: bool,

    /// Write the volume image here on exit
    #[arg(long)]
    dump_image: Option<PathBuf>,

    /// Program and arguments to run (instead of the package autorun)
    #[arg(last = true)]
    command: Vec<String>,
}

/// Channel-based console fed by the terminal reader task.
struct ChannelConsole {
    key_rx: mpsc::Receiver<u8>,
    key_buffer: Vec<u8>,
    closed: bool,
}

impl ChannelConsole {
    fn new(key_rx: mpsc::Receiver<u8>) -> Self {
        Self {
            key_rx,
            key_buffer: Vec::new(),
            closed: false,
        }
    }

    fn drain(&mut self) {
        loop {
            match self.key_rx.try_recv() {
                Ok(ch) => self.key_buffer.push(ch),
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    self.closed = true;
                    break;
                }
            }
        }
    }
}

impl Console for ChannelConsole {
    fn write(&mut self, ch: u8) {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();

        match ch {
            0x0A => {
                // Raw mode: LF alone does not return the carriage
                let _ = handle.write_all(b"\r\n");
            }
            0x08 => {
                let _ = handle.write_all(b"\x08 \x08");
            }
            _ => {
                let _ = handle.write_all(&[ch]);
            }
        }
        let _ = handle.flush();
    }

    fn get_key(&mut self) -> Option<u8> {
        self.drain();
        if self.key_buffer.is_empty() {
            return None;
        }
        Some(self.key_buffer.remove(0))
    }

    fn wait_for_key(&mut self, timeout: Duration) -> Option<u8> {
        if let Some(ch) = self.get_key() {
            return Some(ch);
        }
        match self.key_rx.recv_timeout(timeout) {
            Ok(ch) => Some(ch),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                self.closed = true;
                None
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.closed && self.key_buffer.is_empty()
    }
}

/// Translate crossterm key events to console key codes.
fn translate_key(code: KeyCode, modifiers: KeyModifiers) -> Option<u8> {
    if modifiers.contains(KeyModifiers::CONTROL) {
        if let KeyCode::Char(c) = code {
            let upper = c.to_ascii_uppercase();
            if upper.is_ascii_uppercase() {
                return Some(upper as u8 - 64); // Ctrl+C=3, Ctrl+X=0x18
            }
        }
    }

    match code {
        KeyCode::Char(c) if c.is_ascii() => Some(c as u8),
        KeyCode::Enter => Some(13),
        KeyCode::Backspace => Some(8),
        KeyCode::Tab => Some(9),
        KeyCode::Esc => Some(27),
        _ => None,
    }
}

/// Program and argv: the explicit command, else the first package
/// autorun, else the only loose file.
fn resolve_command(
    command: &[String],
    packages: &[LoadedPackage],
    loose: &[(ShortName, Vec<u8>)],
) -> Option<(String, Vec<String>)> {
    if let Some(program) = command.first() {
        return Some((program.clone(), command.to_vec()));
    }

    for pkg in packages {
        if let Some(autorun) = &pkg.manifest.autorun {
            let mut argv = vec![autorun.program.clone()];
            argv.extend(autorun.args.iter().cloned());
            return Some((autorun.program.clone(), argv));
        }
    }

    if let [(name, _)] = loose {
        return Some((name.to_string(), vec![name.to_string()]));
    }
    None
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => KernelConfig::from_path(path)?,
        None => KernelConfig::default(),
    };
    if let Some(banks) = args.banks {
        config.banks = banks;
    }
    config.trace |= args.trace;
    config.validate()?;

    // Separate packages (.zip) and volume images (.img) from loose files
    let mut packages = Vec::new();
    let mut image: Option<Vec<u8>> = None;
    let mut loose: Vec<(ShortName, Vec<u8>)> = Vec::new();

    for path in &args.files {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_uppercase();

        match ext.as_str() {
            "ZIP" => match load_package_from_path(path) {
                Ok(pkg) => packages.push(pkg),
                Err(e) => {
                    eprintln!("Failed to load {}: {}", path.display(), e);
                    return Err(e.into());
                }
            },
            "IMG" => {
                if image.is_some() {
                    return Err(format!("More than one volume image: {}", path.display()).into());
                }
                image = Some(std::fs::read(path)?);
            }
            _ => {
                let filename = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("UNKNOWN");
                loose.push((ShortName::normalize(filename), std::fs::read(path)?));
            }
        }
    }

    let disk = match image {
        Some(bytes) => MemoryDisk::from_bytes(bytes, SECTOR_SIZE)?,
        None => {
            let mut disk = MemoryDisk::blank(VOLUME_SECTORS, SECTOR_SIZE)?;
            format_volume(&mut disk, &FormatOptions::default())?;
            disk
        }
    };

    let mut kernel = Kernel::new(disk, &config)?;
    for pkg in &packages {
        let installed = provision(kernel.fs_mut(), pkg)?;
        eprintln!(
            "Loaded package: {} ({} files)",
            pkg.manifest.name,
            installed.len()
        );
    }
    for (name, data) in &loose {
        install_file(kernel.fs_mut(), name, data, Attributes::default())?;
    }

    let command = resolve_command(&args.command, &packages, &loose);
    let dump_image = args.dump_image.clone();

    let Some((program, argv)) = command else {
        if let Some(path) = dump_image {
            let disk = kernel.into_disk()?;
            std::fs::write(&path, disk.into_bytes())?;
            eprintln!("Wrote volume image: {}", path.display());
            return Ok(());
        }
        eprintln!("No program given and no package autorun found.");
        return Err("Nothing to run".into());
    };

    // Create channel for keyboard input
    let (key_tx, key_rx) = mpsc::channel::<u8>();

    // Create shutdown signal
    let (shutdown_tx, mut shutdown_rx) = tokio_mpsc::channel::<()>(1);

    let console = ChannelConsole::new(key_rx);
    let mut machine = Machine::new(kernel, console);
    machine.set_slice(config.slice_instructions);
    let pid = machine.launch(&program, &argv)?;

    // Enable raw mode (gracefully handle non-TTY)
    let raw_mode_enabled = enable_raw_mode().is_ok();

    // Spawn machine in blocking task
    let machine_handle = tokio::task::spawn_blocking(move || {
        let result = machine.run();
        (machine, result)
    });

    // Spawn terminal input reader
    let input_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    if event::poll(Duration::from_millis(0)).unwrap_or(false) {
                        if let Ok(Event::Key(key_event)) = event::read() {
                            if let Some(ch) = translate_key(key_event.code, key_event.modifiers) {
                                if key_tx.send(ch).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    });

    let (machine, result) = machine_handle.await?;

    // Signal input handler to stop
    let _ = shutdown_tx.send(()).await;
    let _ = input_handle.await;

    if raw_mode_enabled {
        let _ = disable_raw_mode();
    }

    let code = machine.exit_code(pid);
    match result {
        Ok(RunExit::AllFinished) => {}
        Ok(RunExit::Idle) => eprintln!("\nStopped: every process is waiting"),
        Err(e) => eprintln!("\nError: {}", e),
    }

    if let Some(path) = dump_image {
        let (kernel, _console) = machine.into_parts();
        let disk = kernel.into_disk()?;
        std::fs::write(&path, disk.into_bytes())?;
        eprintln!("Wrote volume image: {}", path.display());
    }

    if let Some(code) = code.filter(|&c| c != 0) {
        eprintln!("{} exited with {}", program, code);
        std::process::exit(code as i32 & 0xFF);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_control_keys() {
        assert_eq!(translate_key(KeyCode::Char('c'), KeyModifiers::CONTROL), Some(0x03));
        assert_eq!(translate_key(KeyCode::Char('x'), KeyModifiers::CONTROL), Some(0x18));
        assert_eq!(translate_key(KeyCode::Char('a'), KeyModifiers::NONE), Some(b'a'));
        assert_eq!(translate_key(KeyCode::Enter, KeyModifiers::NONE), Some(13));
        assert_eq!(translate_key(KeyCode::F(1), KeyModifiers::NONE), None);
    }

    #[test]
    fn test_resolve_explicit_command() {
        let command = vec!["hello.exe".to_string(), "world".to_string()];
        let (program, argv) = resolve_command(&command, &[], &[]).unwrap();
        assert_eq!(program, "hello.exe");
        assert_eq!(argv, command);
    }

    #[test]
    fn test_resolve_single_loose_file() {
        let loose = vec![(ShortName::normalize("hello.exe"), vec![0x0A, 0x80])];
        let (program, argv) = resolve_command(&[], &[], &loose).unwrap();
        assert_eq!(program, "HELLO.EXE");
        assert_eq!(argv, vec!["HELLO.EXE"]);
        assert!(resolve_command(&[], &[], &[]).is_none());
    }
}
