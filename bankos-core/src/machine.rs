//! Z80 machine - runs kernel processes on `z80emu`.
//!
//! The lower 32 KiB (`0x0000..0x8000`) is common memory shared by every
//! process; the upper half is the bank the scheduler picked for the tick.
//! Each live process keeps its own CPU state.
//!
//! Programs enter the kernel with `CALL 0x0005`. The vector there jumps to
//! [`SYSCALL_ENTRY`], which is intercepted before it executes. The function
//! number is in `C`, arguments in `DE`, `HL` and `B`; the result comes back
//! in `HL` with the low byte mirrored in `A`. Jumping to `0x0000` (or
//! returning from the entry point) exits with the code in `HL`.

use std::collections::VecDeque;
use std::num::NonZeroU16;
use std::time::Duration;

use z80emu::host::TsCounter;
use z80emu::{Clock, Cpu, Io, Memory, Reg8, StkReg16, Z80NMOS};

use crate::config::KernelConfig;
use crate::console::Console;
use crate::error::{KernelError, KernelResult};
use crate::fs::{BlockDevice, FileMode};
use crate::kernel::Kernel;
use crate::process::{Pid, MAX_ARGS, MAX_PROCESSES};
use crate::ram::window_offset;
use crate::scheduler::{Event, TaskState, Tick};
use crate::signal::{Disposition, Outcome, Signal};

/// Type alias for the clock.
type TsClock = TsCounter<i32>;

/// Exit vector.
pub const EXIT_VECTOR: u16 = 0x0000;

/// Address programs call to enter the kernel.
pub const SYSCALL_VECTOR: u16 = 0x0005;

/// Intercepted syscall entry.
pub const SYSCALL_ENTRY: u16 = 0x0010;

const COMMON_SIZE: usize = 0x8000;

/// Longest string a syscall reads from process memory.
const MAX_STRING: usize = 224;

/// Largest file transfer per call; the count always fits a positive `i16`.
const MAX_TRANSFER: usize = 0x7FFF;

/// How long an idle machine waits for a key before checking again.
const IDLE_POLL: Duration = Duration::from_millis(20);

/// Syscall function numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Syscall {
    /// 0: Exit with code `DE`
    Exit = 0,
    /// 1: Write `E` to the console
    PutChar = 1,
    /// 2: Read a key; blocks until one arrives
    GetChar = 2,
    /// 3: End the slice
    Yield = 3,
    /// 4: Open file named at `DE` with mode `B`
    FileOpen = 4,
    /// 5: Read `HL` bytes from fd `B` into `DE`
    FileRead = 5,
    /// 6: Write `HL` bytes at `DE` to fd `B`
    FileWrite = 6,
    /// 7: Close fd `B`
    FileClose = 7,
    /// 8: Delete file named at `DE`
    FileDelete = 8,
    /// 9: Attributes, size and date of file `DE` into `HL`
    FileInfo = 9,
    /// 10: Number of directory entries
    FileEntries = 10,
    /// 11: Name of entry `DE` into `HL`
    FileEntry = 11,
    /// 12: Load executable named at `DE`
    ProcessLoad = 12,
    /// 13: Spawn pid `B` with `HL` arguments from pointer table `DE`
    ProcessSpawn = 13,
    /// 14: Like spawn, then wait; returns the child's exit code
    ProcessExec = 14,
    /// 15: Handler `DE` for signal `B` (0 clears)
    SignalHandler = 15,
    /// 16: Read sector `DE` into `HL`
    DiskRead = 16,
    /// 17: Write sector `DE` from `HL`
    DiskWrite = 17,
    /// 18: Terminal mode, `E` nonzero for binary
    SetMode = 18,
}

impl TryFrom<u8> for Syscall {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Exit),
            1 => Ok(Self::PutChar),
            2 => Ok(Self::GetChar),
            3 => Ok(Self::Yield),
            4 => Ok(Self::FileOpen),
            5 => Ok(Self::FileRead),
            6 => Ok(Self::FileWrite),
            7 => Ok(Self::FileClose),
            8 => Ok(Self::FileDelete),
            9 => Ok(Self::FileInfo),
            10 => Ok(Self::FileEntries),
            11 => Ok(Self::FileEntry),
            12 => Ok(Self::ProcessLoad),
            13 => Ok(Self::ProcessSpawn),
            14 => Ok(Self::ProcessExec),
            15 => Ok(Self::SignalHandler),
            16 => Ok(Self::DiskRead),
            17 => Ok(Self::DiskWrite),
            18 => Ok(Self::SetMode),
            _ => Err(value),
        }
    }
}

/// Why [`Machine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// Every process has finished.
    AllFinished,
    /// Processes remain but all of them wait on something that cannot
    /// happen (closed console, a child that was never spawned).
    Idle,
}

/// What a syscall does to the caller.
enum Flow {
    /// Return to the caller with a result.
    Return(KernelResult<i16>),
    /// Leave the caller parked on the entry so the call is retried.
    Retry,
    /// The caller is gone.
    Exited,
}

/// Memory as seen by the CPU during a slice.
struct Bus<'a> {
    common: &'a mut [u8],
    bank: &'a mut [u8],
}

impl Memory for Bus<'_> {
    type Timestamp = i32;

    fn read_debug(&self, addr: u16) -> u8 {
        match window_offset(addr) {
            Some(off) => self.bank[off],
            None => self.common[addr as usize],
        }
    }

    fn read_mem(&self, addr: u16, _ts: Self::Timestamp) -> u8 {
        self.read_debug(addr)
    }

    fn write_mem(&mut self, addr: u16, value: u8, _ts: Self::Timestamp) {
        match window_offset(addr) {
            Some(off) => self.bank[off] = value,
            None => self.common[addr as usize] = value,
        }
    }
}

impl Io for Bus<'_> {
    type Timestamp = i32;
    type WrIoBreak = ();
    type RetiBreak = ();

    fn read_io(&mut self, _port: u16, _ts: Self::Timestamp) -> (u8, Option<NonZeroU16>) {
        (0xFF, None)
    }

    fn write_io(
        &mut self,
        _port: u16,
        _value: u8,
        _ts: Self::Timestamp,
    ) -> (Option<Self::WrIoBreak>, Option<NonZeroU16>) {
        (None, None)
    }
}

/// A kernel, a console and the CPUs that run its processes.
pub struct Machine<C: Console, D: BlockDevice> {
    kernel: Kernel<D>,
    console: C,
    common: Vec<u8>,
    cpus: Vec<Option<Z80NMOS>>,
    /// Child a parent collects the exit code of when it next runs.
    pending_reap: Vec<Option<Pid>>,
    clock: TsClock,
    input: VecDeque<u8>,
    slice: u32,
    pub trace: bool,
}

impl<C: Console, D: BlockDevice> Machine<C, D> {
    /// Wrap an existing kernel with the default slice length.
    pub fn new(kernel: Kernel<D>, console: C) -> Self {
        let trace = kernel.trace();
        let mut machine = Self {
            kernel,
            console,
            common: vec![0; COMMON_SIZE],
            cpus: (0..MAX_PROCESSES).map(|_| None).collect(),
            pending_reap: vec![None; MAX_PROCESSES],
            clock: TsClock::default(),
            input: VecDeque::new(),
            slice: KernelConfig::default().slice_instructions,
            trace,
        };
        machine.init_memory();
        machine
    }

    /// Mount `disk` and build the kernel from `config`.
    pub fn with_config(disk: D, console: C, config: &KernelConfig) -> KernelResult<Self> {
        let kernel = Kernel::new(disk, config)?;
        let mut machine = Self::new(kernel, console);
        machine.slice = config.slice_instructions;
        Ok(machine)
    }

    /// Initialize common memory with the system vectors.
    fn init_memory(&mut self) {
        // JP 0 at the exit vector
        self.common[EXIT_VECTOR as usize] = 0xC3;
        self.common[0x0001] = 0x00;
        self.common[0x0002] = 0x00;

        // JP SYSCALL_ENTRY
        let vector = SYSCALL_VECTOR as usize;
        self.common[vector] = 0xC3;
        self.common[vector + 1..vector + 3].copy_from_slice(&SYSCALL_ENTRY.to_le_bytes());

        // RET (intercepted before this)
        self.common[SYSCALL_ENTRY as usize] = 0xC9;
    }

    pub fn kernel(&self) -> &Kernel<D> {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel<D> {
        &mut self.kernel
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    pub fn into_parts(self) -> (Kernel<D>, C) {
        (self.kernel, self.console)
    }

    /// Instructions per slice.
    pub fn set_slice(&mut self, instructions: u32) {
        self.slice = instructions.max(1);
    }

    /// T-states executed so far.
    pub fn t_states(&self) -> u64 {
        self.clock.as_timestamp() as u64
    }

    /// Load and schedule a program. Finished processes nobody is waiting
    /// on are reaped first, so their exit codes are only readable until
    /// the next launch.
    pub fn launch<S: AsRef<[u8]>>(&mut self, filename: &str, args: &[S]) -> KernelResult<Pid> {
        self.reap_orphans()?;
        self.kernel.launch(filename, args)
    }

    /// Drop finished entries no exec parent will collect, freeing their
    /// pids for the next load.
    fn reap_orphans(&mut self) -> KernelResult<()> {
        let orphans: Vec<Pid> = self
            .kernel
            .scheduler()
            .tasks()
            .filter(|&(pid, state)| {
                matches!(state, TaskState::Finished(_)) && !self.pending_reap.contains(&Some(pid))
            })
            .map(|(pid, _)| pid)
            .collect();

        for pid in orphans {
            if let Some(code) = self.kernel.reap(pid)? {
                if self.trace {
                    eprintln!("[SYS] Reaped pid {} (exit {})", pid, code);
                }
            }
        }
        Ok(())
    }

    /// Exit code of a finished, unreaped process.
    pub fn exit_code(&self, pid: Pid) -> Option<i16> {
        self.kernel.scheduler().exit_code(pid)
    }

    /// Run until every process has finished or nothing can make progress.
    pub fn run(&mut self) -> KernelResult<RunExit> {
        loop {
            match self.kernel.tick()? {
                Tick::Run { pid, bank } => {
                    self.pump_input();
                    self.run_slice(pid, bank)?;
                    self.deliver_signals()?;
                }
                Tick::Idle => {
                    self.pump_input();
                    if !self.kernel.scheduler().has_live_tasks() {
                        return Ok(RunExit::AllFinished);
                    }
                    if self.kernel.scheduler().tasks().any(|(_, s)| s == TaskState::Ready) {
                        continue;
                    }
                    if self.waiting_for_input() && !self.console.is_closed() {
                        if let Some(key) = self.console.wait_for_key(IDLE_POLL) {
                            self.accept_key(key);
                        }
                        continue;
                    }
                    if self.waiting_for_input() && self.console.is_closed() {
                        // Wake readers so they see end of input
                        self.kernel.broadcast(Event::Input);
                        continue;
                    }
                    return Ok(RunExit::Idle);
                }
            }
        }
    }

    fn waiting_for_input(&self) -> bool {
        self.kernel
            .scheduler()
            .tasks()
            .any(|(_, s)| s == TaskState::Waiting(Event::Input))
    }

    /// Move keys from the console into the input queue, raising signals
    /// for break keys.
    fn pump_input(&mut self) {
        while let Some(key) = self.console.get_key() {
            self.accept_key(key);
        }
    }

    fn accept_key(&mut self, key: u8) {
        if let Some(signal) = self.kernel.raise_from_key(key) {
            if self.trace {
                eprintln!("[SYS] Key {:#04X} raised {:?}", key, signal);
            }
            return;
        }
        self.input.push_back(key);
        self.kernel.broadcast(Event::Input);
    }

    /// Fresh CPU state from a process's execution context.
    fn spawn_cpu(&self, pid: Pid) -> KernelResult<Z80NMOS> {
        let context = self
            .kernel
            .info(pid)
            .ok_or(KernelError::NoSuchProcess(pid))?
            .context;

        let mut cpu = Z80NMOS::default();
        cpu.reset();
        cpu.set_pc(context.entry);
        cpu.set_sp(context.stack);
        cpu.set_reg16(StkReg16::HL, context.argv);
        cpu.set_reg16(StkReg16::DE, context.argc);
        Ok(cpu)
    }

    fn run_slice(&mut self, pid: Pid, bank: usize) -> KernelResult<()> {
        let mut cpu = match self.cpus[pid].take() {
            Some(cpu) => cpu,
            None => self.spawn_cpu(pid)?,
        };

        // Resuming after exec: collect the child
        if let Some(child) = self.pending_reap[pid].take() {
            match self.kernel.reap(child) {
                Ok(Some(code)) => set_result(&mut cpu, code),
                Ok(None) => {
                    // Woken early by a signal; keep waiting
                    self.pending_reap[pid] = Some(child);
                    self.kernel.block(pid, Event::ProcessFinished(child))?;
                    self.cpus[pid] = Some(cpu);
                    return Ok(());
                }
                Err(e) => set_result(&mut cpu, e.code()),
            }
        }

        let mut executed = 0;
        let mut alive = true;
        while executed < self.slice {
            let pc = cpu.get_pc();

            if pc == SYSCALL_ENTRY {
                match self.syscall(pid, bank, &mut cpu)? {
                    Flow::Return(result) => {
                        let value = result.unwrap_or_else(|e| e.code());
                        set_result(&mut cpu, value);
                        let ret = self.pop16(bank, &mut cpu);
                        cpu.set_pc(ret);
                    }
                    Flow::Retry => {}
                    Flow::Exited => alive = false,
                }
                break;
            }

            if pc == EXIT_VECTOR {
                let code = cpu.get_reg16(StkReg16::HL) as i16;
                self.exit_process(pid, code)?;
                alive = false;
                break;
            }

            let mut bus = Bus {
                common: &mut self.common,
                bank: self.kernel.ram_mut().bank_mut(bank),
            };
            let _ = cpu.execute_next(&mut bus, &mut self.clock, None::<fn(z80emu::CpuDebug)>);
            executed += 1;

            if cpu.is_halt() {
                self.exit_process(pid, 0)?;
                alive = false;
                break;
            }
        }

        if alive {
            self.cpus[pid] = Some(cpu);
        }
        Ok(())
    }

    fn exit_process(&mut self, pid: Pid, code: i16) -> KernelResult<()> {
        self.cpus[pid] = None;
        self.pending_reap[pid] = None;
        self.kernel.exit(pid, code)
    }

    /// Signal checkpoint for the process that just ran.
    fn deliver_signals(&mut self) -> KernelResult<()> {
        let Some(pid) = self.kernel.current() else {
            return Ok(());
        };
        let Some(bank) = self.kernel.info(pid).map(|d| d.bank) else {
            return Ok(());
        };

        let outcome = self.kernel.checkpoint()?;
        match outcome.disposition() {
            None => {}
            Some(Disposition::Handler(handler)) => {
                if let Some(mut cpu) = self.cpus[pid].take() {
                    let pc = cpu.get_pc();
                    self.push16(bank, &mut cpu, pc);
                    cpu.set_reg16(StkReg16::HL, pc);
                    cpu.set_pc(handler);
                    self.cpus[pid] = Some(cpu);
                }
                self.kernel.wake(pid)?;
                if self.trace {
                    eprintln!("[SIG] pid {} entering handler {:#06X}", pid, handler);
                }
            }
            Some(Disposition::Default) => {
                self.cpus[pid] = None;
                self.pending_reap[pid] = None;
            }
        }
        if outcome != Outcome::Continue && self.trace {
            eprintln!("[SIG] Checkpoint: {:?}", outcome);
        }
        Ok(())
    }

    // Process memory

    fn peek(&self, bank: usize, addr: u16) -> u8 {
        match window_offset(addr) {
            Some(off) => self.kernel.ram().bank(bank)[off],
            None => self.common[addr as usize],
        }
    }

    fn poke(&mut self, bank: usize, addr: u16, value: u8) {
        match window_offset(addr) {
            Some(off) => self.kernel.ram_mut().bank_mut(bank)[off] = value,
            None => self.common[addr as usize] = value,
        }
    }

    fn peek16(&self, bank: usize, addr: u16) -> u16 {
        u16::from_le_bytes([self.peek(bank, addr), self.peek(bank, addr.wrapping_add(1))])
    }

    fn read_block(&self, bank: usize, addr: u16, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.peek(bank, addr.wrapping_add(i as u16)))
            .collect()
    }

    fn write_block(&mut self, bank: usize, addr: u16, data: &[u8]) {
        for (i, &byte) in data.iter().enumerate() {
            self.poke(bank, addr.wrapping_add(i as u16), byte);
        }
    }

    /// NUL-terminated string, at most `MAX_STRING` bytes.
    fn read_cstr(&self, bank: usize, addr: u16) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut at = addr;
        while bytes.len() < MAX_STRING {
            let ch = self.peek(bank, at);
            if ch == 0 {
                break;
            }
            bytes.push(ch);
            at = at.wrapping_add(1);
        }
        bytes
    }

    fn read_name(&self, bank: usize, addr: u16) -> String {
        String::from_utf8_lossy(&self.read_cstr(bank, addr)).into_owned()
    }

    fn pop16(&mut self, bank: usize, cpu: &mut Z80NMOS) -> u16 {
        let sp = cpu.get_sp();
        let value = self.peek16(bank, sp);
        cpu.set_sp(sp.wrapping_add(2));
        value
    }

    fn push16(&mut self, bank: usize, cpu: &mut Z80NMOS, value: u16) {
        let sp = cpu.get_sp().wrapping_sub(2);
        self.write_block(bank, sp, &value.to_le_bytes());
        cpu.set_sp(sp);
    }

    /// Argument strings from a pointer table in the caller's memory.
    fn read_args(&self, bank: usize, table: u16, argc: u16) -> KernelResult<Vec<Vec<u8>>> {
        if argc as usize > MAX_ARGS {
            return Err(KernelError::ArgumentOverflow);
        }
        Ok((0..argc)
            .map(|i| {
                let ptr = self.peek16(bank, table.wrapping_add(i * 2));
                self.read_cstr(bank, ptr)
            })
            .collect())
    }

    // Syscalls

    fn syscall(&mut self, pid: Pid, bank: usize, cpu: &mut Z80NMOS) -> KernelResult<Flow> {
        let c = cpu.get_reg(Reg8::C, None);
        let b = cpu.get_reg(Reg8::B, None);
        let e = cpu.get_reg(Reg8::E, None);
        let de = cpu.get_reg16(StkReg16::DE);
        let hl = cpu.get_reg16(StkReg16::HL);

        if self.trace {
            eprintln!(
                "[SYS] pid {} function {} (B={:#04X}, DE={:#06X}, HL={:#06X})",
                pid, c, b, de, hl
            );
        }

        let func = match Syscall::try_from(c) {
            Ok(func) => func,
            Err(_) => {
                if self.trace {
                    eprintln!("[SYS] Unknown function: {}", c);
                }
                return Ok(Flow::Return(Ok(-1)));
            }
        };

        use Syscall::*;

        let result = match func {
            Exit => {
                self.exit_process(pid, de as i16)?;
                return Ok(Flow::Exited);
            }

            PutChar => {
                self.console.write(e);
                Ok(0)
            }

            GetChar => match self.input.pop_front() {
                Some(key) => Ok(key as i16),
                None if self.console.is_closed() => Err(KernelError::Eof),
                None => {
                    self.kernel.block(pid, Event::Input)?;
                    return Ok(Flow::Retry);
                }
            },

            Yield => Ok(0),

            FileOpen => {
                let name = self.read_name(bank, de);
                FileMode::try_from(b)
                    .and_then(|mode| self.kernel.fs_mut().open(&name, mode))
                    .map(|fd| fd as i16)
            }

            FileRead => {
                let mut buf = vec![0u8; transfer_len(hl)];
                match self.kernel.fs_mut().read(b as usize, &mut buf) {
                    Ok(n) => {
                        self.write_block(bank, de, &buf[..n]);
                        Ok(transfer_count(n))
                    }
                    Err(e) => Err(e),
                }
            }

            FileWrite => {
                let data = self.read_block(bank, de, transfer_len(hl));
                self.kernel
                    .fs_mut()
                    .write(b as usize, &data)
                    .map(transfer_count)
            }

            FileClose => self.kernel.fs_mut().close(b as usize).map(|_| 0),

            FileDelete => {
                let name = self.read_name(bank, de);
                self.kernel.fs_mut().delete(&name).map(|_| 0)
            }

            FileInfo => {
                let name = self.read_name(bank, de);
                match self.kernel.fs_mut().info(&name) {
                    Ok(info) => {
                        let mut out = [0u8; 7];
                        out[0] = info.attributes.bits();
                        out[1..5].copy_from_slice(&info.size.to_le_bytes());
                        out[5..7].copy_from_slice(&info.created.raw().to_le_bytes());
                        self.write_block(bank, hl, &out);
                        Ok(0)
                    }
                    Err(e) => Err(e),
                }
            }

            FileEntries => self.kernel.fs_mut().entries().map(|n| n as i16),

            FileEntry => match self.kernel.fs_mut().entry(de as usize) {
                Ok(entry) => {
                    let mut name = entry.filename().into_bytes();
                    name.push(0);
                    self.write_block(bank, hl, &name);
                    Ok(0)
                }
                Err(e) => Err(e),
            },

            ProcessLoad => {
                let name = self.read_name(bank, de);
                self.reap_orphans()?;
                self.kernel.load(&name).map(|child| child as i16)
            }

            ProcessSpawn => self
                .read_args(bank, de, hl)
                .and_then(|args| self.kernel.spawn(b as usize, &args))
                .map(|_| 0),

            ProcessExec => {
                let child = b as usize;
                match self
                    .read_args(bank, de, hl)
                    .and_then(|args| self.kernel.exec(pid, child, &args))
                {
                    Ok(()) => {
                        self.pending_reap[pid] = Some(child);
                        Ok(0)
                    }
                    Err(e) => Err(e),
                }
            }

            SignalHandler => {
                let handler = (de != 0).then_some(de);
                Signal::try_from(b)
                    .map_err(|_| KernelError::InvalidMode(b))
                    .and_then(|signal| self.kernel.set_handler(pid, signal, handler))
                    .map(|_| 0)
            }

            DiskRead => {
                let size = self.kernel.fs().geometry().bytes_per_sector as usize;
                let mut buf = vec![0u8; size];
                match self.kernel.fs_mut().disk_read(de as u32, &mut buf) {
                    Ok(()) => {
                        self.write_block(bank, hl, &buf);
                        Ok(0)
                    }
                    Err(e) => Err(e),
                }
            }

            DiskWrite => {
                let size = self.kernel.fs().geometry().bytes_per_sector as usize;
                let data = self.read_block(bank, hl, size);
                self.kernel
                    .fs_mut()
                    .disk_write(de as u32, &data)
                    .map(|_| 0)
            }

            SetMode => self.kernel.set_terminal_mode(pid, e != 0).map(|_| 0),
        };

        if self.trace {
            if let Err(e) = &result {
                eprintln!("[SYS] pid {} {:?} failed: {}", pid, func, e);
            }
        }
        Ok(Flow::Return(result))
    }
}

fn transfer_len(requested: u16) -> usize {
    (requested as usize).min(MAX_TRANSFER)
}

fn transfer_count(n: usize) -> i16 {
    n.min(MAX_TRANSFER) as u16 as i16
}

/// Result convention: `HL` holds the value, `A` its low byte.
fn set_result(cpu: &mut Z80NMOS, value: i16) {
    let value = value as u16;
    cpu.set_reg16(StkReg16::HL, value);
    cpu.set_reg(Reg8::A, None, value as u8);
}
