//! Process table.
//!
//! A fixed table of process descriptors indexed by process id. The loader
//! and exit path live on [`crate::Kernel`], which owns the table together
//! with the banks it hands out.

pub mod args;
pub mod header;

pub use args::{ArgBlock, MAX_ARGS, STACK_TOP};
pub use header::{ExecHeader, EXEC_MARKER, MAX_IMAGE_SIZE, USER_BASE_PAGE};

use crate::error::{KernelError, KernelResult};
use crate::signal::SignalState;

/// Process identifier (index into the process table).
pub type Pid = usize;

/// Capacity of the process table.
pub const MAX_PROCESSES: usize = 16;

/// Terminal status bits of a process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TermStatus(u8);

impl TermStatus {
    /// Binary mode: break characters are passed through as data.
    pub const BINARY: u8 = 1 << 0;

    pub fn is_binary(&self) -> bool {
        self.0 & Self::BINARY != 0
    }

    pub fn set_binary(&mut self, binary: bool) {
        if binary {
            self.0 |= Self::BINARY;
        } else {
            self.0 &= !Self::BINARY;
        }
    }

    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// Register state a process starts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecContext {
    /// Entry point (`base_page << 8`).
    pub entry: u16,
    /// Initial stack pointer; a zero return address sits on top.
    pub stack: u16,
    /// Pointer to the argv table (passed in HL).
    pub argv: u16,
    /// Argument count (passed in DE).
    pub argc: u16,
}

/// Kernel-owned record of a loaded process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDescriptor {
    pub base_address: u16,
    pub bank: usize,
    pub term_status: TermStatus,
    pub signals: SignalState,
    pub context: ExecContext,
}

/// Fixed-capacity process table.
pub struct ProcessTable {
    slots: [Option<ProcessDescriptor>; MAX_PROCESSES],
    /// Enable process tracing.
    pub trace: bool,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    pub fn new() -> Self {
        Self {
            slots: Default::default(),
            trace: false,
        }
    }

    /// Store a descriptor in the first free slot not rejected by `reserved`.
    pub fn insert<F>(&mut self, descriptor: ProcessDescriptor, reserved: F) -> KernelResult<Pid>
    where
        F: Fn(Pid) -> bool,
    {
        let pid = self
            .slots
            .iter()
            .enumerate()
            .position(|(pid, slot)| slot.is_none() && !reserved(pid))
            .ok_or(KernelError::TooManyTasks)?;

        if self.trace {
            eprintln!(
                "[PROC] pid {} -> bank {} at {:#06X}",
                pid, descriptor.bank, descriptor.base_address
            );
        }
        self.slots[pid] = Some(descriptor);
        Ok(pid)
    }

    /// Whether `reserved` leaves any slot for a new process.
    pub fn has_free_slot<F>(&self, reserved: F) -> bool
    where
        F: Fn(Pid) -> bool,
    {
        self.slots
            .iter()
            .enumerate()
            .any(|(pid, slot)| slot.is_none() && !reserved(pid))
    }

    /// Read-only descriptor lookup.
    pub fn info(&self, pid: Pid) -> Option<&ProcessDescriptor> {
        self.slots.get(pid).and_then(|s| s.as_ref())
    }

    pub fn info_mut(&mut self, pid: Pid) -> Option<&mut ProcessDescriptor> {
        self.slots.get_mut(pid).and_then(|s| s.as_mut())
    }

    /// Free a slot, returning the descriptor it held.
    pub fn remove(&mut self, pid: Pid) -> Option<ProcessDescriptor> {
        let descriptor = self.slots.get_mut(pid).and_then(|s| s.take());
        if self.trace && descriptor.is_some() {
            eprintln!("[PROC] pid {} released", pid);
        }
        descriptor
    }

    /// Live processes in pid order.
    pub fn iter(&self) -> impl Iterator<Item = (Pid, &ProcessDescriptor)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(pid, slot)| slot.as_ref().map(|d| (pid, d)))
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
