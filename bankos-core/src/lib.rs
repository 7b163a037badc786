//! Bank-switched 8-bit kernel core
//!
//! This crate provides the kernel of a small multitasking system for a
//! Z80-class machine whose upper 32 KiB is a window onto one of many
//! physical memory banks:
//! - Bank allocation and the banked RAM model
//! - Process table, executable loader and argument passing
//! - Cooperative round-robin scheduler with event waits
//! - Cancel/break signals with user handlers
//! - FAT16 filesystem over a sector device
//!
//! # Architecture
//!
//! - `BlockDevice` trait: raw sector storage (`MemoryDisk` in memory)
//! - `Filesystem`: FAT16 volume with a fixed descriptor table
//! - `Kernel`: owns every table and implements the cross-cutting operations
//! - `Machine`: runs kernel processes on a Z80 and dispatches syscalls
//! - `Console` trait: character I/O abstraction

pub mod config;
pub mod console;
pub mod error;
pub mod fs;
pub mod kernel;
pub mod machine;
pub mod memory;
pub mod package;
pub mod process;
pub mod ram;
pub mod scheduler;
pub mod signal;

pub use config::KernelConfig;
pub use console::{Console, HeadlessConsole};
pub use error::{KernelError, KernelResult};
pub use fs::{format_volume, BlockDevice, FileMode, Filesystem, FormatOptions, MemoryDisk, ShortName};
pub use kernel::Kernel;
pub use machine::{Machine, RunExit, Syscall};
pub use memory::{BankAllocator, BankState};
pub use package::{
    install_file, load_package, load_package_from_path, provision, LoadedPackage, PackageManifest,
};
pub use process::{Pid, ProcessDescriptor, ProcessTable};
pub use ram::BankedRam;
pub use scheduler::{Event, Scheduler, TaskState, Tick};
pub use signal::{Disposition, Outcome, Signal};
