//! Kernel context.
//!
//! [`Kernel`] owns every kernel table: banks, banked RAM, processes, the
//! schedule and the mounted filesystem. Operations that span components
//! (loading, exit, signal checkpoints) live here so each table stays
//! independently testable.

use crate::config::KernelConfig;
use crate::error::{KernelError, KernelResult};
use crate::fs::{BlockDevice, FileMode, Filesystem};
use crate::memory::BankAllocator;
use crate::process::args::ARGV_ADDR;
use crate::process::header::HEADER_SIZE;
use crate::process::{
    ArgBlock, ExecContext, ExecHeader, Pid, ProcessDescriptor, ProcessTable, TermStatus,
    MAX_IMAGE_SIZE, STACK_TOP,
};
use crate::ram::BankedRam;
use crate::scheduler::{Event, Scheduler, TaskState, Tick};
use crate::signal::{signal_for_key, Disposition, Handler, Outcome, Signal, SIGNAL_EXIT_CODE};

/// The kernel and everything it owns.
pub struct Kernel<D: BlockDevice> {
    banks: BankAllocator,
    ram: BankedRam,
    processes: ProcessTable,
    scheduler: Scheduler,
    fs: Filesystem<D>,
    trace: bool,
}

impl<D: BlockDevice> Kernel<D> {
    /// Mount `disk` and build empty tables sized by `config`.
    pub fn new(disk: D, config: &KernelConfig) -> KernelResult<Self> {
        config.validate()?;

        let mut kernel = Self {
            banks: BankAllocator::new(config.banks)?,
            ram: BankedRam::new(config.banks),
            processes: ProcessTable::new(),
            scheduler: Scheduler::new(),
            fs: Filesystem::mount(disk, config.file_limit)?,
            trace: false,
        };
        kernel.set_trace(config.trace);
        Ok(kernel)
    }

    /// Enable tracing on every component.
    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
        self.banks.trace = trace;
        self.processes.trace = trace;
        self.scheduler.trace = trace;
        self.fs.trace = trace;
    }

    pub fn trace(&self) -> bool {
        self.trace
    }

    pub fn banks(&self) -> &BankAllocator {
        &self.banks
    }

    pub fn ram(&self) -> &BankedRam {
        &self.ram
    }

    pub fn ram_mut(&mut self) -> &mut BankedRam {
        &mut self.ram
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn fs(&self) -> &Filesystem<D> {
        &self.fs
    }

    pub fn fs_mut(&mut self) -> &mut Filesystem<D> {
        &mut self.fs
    }

    /// Unmount the volume, handing back the device.
    pub fn into_disk(mut self) -> KernelResult<D> {
        self.fs.close_all()?;
        Ok(self.fs.into_disk())
    }

    // Loader

    /// Load an executable into a fresh bank. The process is not scheduled
    /// until [`Kernel::spawn`].
    pub fn load(&mut self, filename: &str) -> KernelResult<Pid> {
        let fd = self.fs.open(filename, FileMode::Read)?;
        let result = self.load_image(fd);
        self.fs.close(fd)?;

        let pid = result?;
        if self.trace {
            eprintln!("[PROC] Loaded {} as pid {}", filename, pid);
        }
        Ok(pid)
    }

    fn load_image(&mut self, fd: usize) -> KernelResult<Pid> {
        let mut raw = [0u8; HEADER_SIZE];
        let n = self.fs.read(fd, &mut raw)?;
        let header = ExecHeader::parse(&raw[..n])?;

        let scheduler = &self.scheduler;
        if !self.processes.has_free_slot(|pid| scheduler.contains(pid)) {
            return Err(KernelError::TooManyTasks);
        }

        let bank = self.banks.allocate()?;
        self.ram.clear(bank);

        let address = header.load_address();
        let limit = MAX_IMAGE_SIZE.min(0x10000 - address as usize);
        let mut image = vec![0u8; limit];
        let len = match self.fs.read(fd, &mut image) {
            Ok(len) => len,
            Err(e) => {
                self.banks.free(bank)?;
                return Err(e);
            }
        };
        self.ram.write(bank, address, &image[..len]);

        // Returning from the entry point lands on the exit vector
        let stack = STACK_TOP - 2;
        self.ram.write(bank, stack, &[0, 0]);

        let descriptor = ProcessDescriptor {
            base_address: address,
            bank,
            term_status: TermStatus::default(),
            signals: Default::default(),
            context: ExecContext {
                entry: address,
                stack,
                argv: ARGV_ADDR,
                argc: 0,
            },
        };

        let scheduler = &self.scheduler;
        match self
            .processes
            .insert(descriptor, |pid| scheduler.contains(pid))
        {
            Ok(pid) => Ok(pid),
            Err(e) => {
                self.banks.free(bank)?;
                Err(e)
            }
        }
    }

    /// Write the argument block into a loaded process and schedule it.
    ///
    /// Fails with `NoSuchProcess` if `pid` is not loaded or already
    /// scheduled.
    pub fn spawn<S: AsRef<[u8]>>(&mut self, pid: Pid, args: &[S]) -> KernelResult<()> {
        if self.scheduler.contains(pid) {
            return Err(KernelError::NoSuchProcess(pid));
        }
        let block = ArgBlock::pack(args)?;

        let descriptor = self
            .processes
            .info_mut(pid)
            .ok_or(KernelError::NoSuchProcess(pid))?;
        block.write_to(&mut self.ram, descriptor.bank);
        descriptor.context.argc = block.argc();

        self.scheduler.add(pid)?;
        if self.trace {
            eprintln!("[PROC] Spawned pid {} with {} argument(s)", pid, block.argc());
        }
        Ok(())
    }

    /// Spawn `child` and block `parent` until it finishes.
    pub fn exec<S: AsRef<[u8]>>(&mut self, parent: Pid, child: Pid, args: &[S]) -> KernelResult<()> {
        self.spawn(child, args)?;
        self.scheduler
            .block(parent, Event::ProcessFinished(child))
    }

    /// Load and spawn in one step. Nothing is left behind on failure.
    pub fn launch<S: AsRef<[u8]>>(&mut self, filename: &str, args: &[S]) -> KernelResult<Pid> {
        let pid = self.load(filename)?;
        if let Err(e) = self.spawn(pid, args) {
            self.release(pid)?;
            return Err(e);
        }
        Ok(pid)
    }

    /// Read-only descriptor lookup.
    pub fn info(&self, pid: Pid) -> Option<&ProcessDescriptor> {
        self.processes.info(pid)
    }

    fn release(&mut self, pid: Pid) -> KernelResult<ProcessDescriptor> {
        let descriptor = self
            .processes
            .remove(pid)
            .ok_or(KernelError::NoSuchProcess(pid))?;
        self.banks.free(descriptor.bank)?;
        Ok(descriptor)
    }

    /// Terminate a process: free its bank and slot, record the exit code
    /// and wake everything waiting on it.
    pub fn exit(&mut self, pid: Pid, code: i16) -> KernelResult<()> {
        self.release(pid)?;

        if self.scheduler.contains(pid) {
            self.scheduler.exit(pid, code)?;
        } else {
            self.scheduler
                .broadcast(Event::ProcessFinished(pid), Some(pid));
        }

        if self.trace {
            eprintln!("[PROC] pid {} exited with {}", pid, code);
        }
        Ok(())
    }

    /// Collect a finished process's exit code and drop its schedule entry.
    /// `None` while it is still live.
    pub fn reap(&mut self, pid: Pid) -> KernelResult<Option<i16>> {
        match self.scheduler.state(pid) {
            Some(TaskState::Finished(code)) => {
                self.scheduler.remove(pid)?;
                Ok(Some(code))
            }
            Some(_) => Ok(None),
            None => Err(KernelError::NoSuchProcess(pid)),
        }
    }

    // Scheduling

    /// Pick the next process and the bank to map for it.
    pub fn tick(&mut self) -> KernelResult<Tick> {
        self.scheduler.tick(&self.processes)
    }

    pub fn current(&self) -> Option<Pid> {
        self.scheduler.current()
    }

    pub fn block(&mut self, pid: Pid, event: Event) -> KernelResult<()> {
        self.scheduler.block(pid, event)
    }

    pub fn wake(&mut self, pid: Pid) -> KernelResult<bool> {
        self.scheduler.wake(pid)
    }

    /// Wake every task waiting on `event`.
    pub fn broadcast(&mut self, event: Event) -> usize {
        self.scheduler.broadcast(event, None)
    }

    // Signals

    /// Mark `signal` pending on `pid`. A waiting process is woken so the
    /// signal reaches a checkpoint.
    pub fn raise_for(&mut self, pid: Pid, signal: Signal) -> KernelResult<()> {
        let descriptor = self
            .processes
            .info_mut(pid)
            .ok_or(KernelError::NoSuchProcess(pid))?;
        descriptor.signals.raise(signal);

        if self.scheduler.contains(pid) {
            self.scheduler.wake(pid)?;
        }
        if self.trace {
            eprintln!("[SIG] {:?} raised on pid {}", signal, pid);
        }
        Ok(())
    }

    /// Raise `signal` on the currently scheduled process, returning it.
    pub fn raise(&mut self, signal: Signal) -> Option<Pid> {
        let pid = self.scheduler.current()?;
        self.raise_for(pid, signal).ok().map(|_| pid)
    }

    /// Translate a console key into a signal on the current process.
    /// Keys are data, not signals, when the process is in binary mode.
    pub fn raise_from_key(&mut self, key: u8) -> Option<Signal> {
        let signal = signal_for_key(key)?;
        let pid = self.scheduler.current()?;
        if self.processes.info(pid)?.term_status.is_binary() {
            return None;
        }
        self.raise_for(pid, signal).ok()?;
        Some(signal)
    }

    /// Register (or clear) a handler.
    pub fn set_handler(&mut self, pid: Pid, signal: Signal, handler: Option<Handler>) -> KernelResult<()> {
        let descriptor = self
            .processes
            .info_mut(pid)
            .ok_or(KernelError::NoSuchProcess(pid))?;
        descriptor.signals.set_handler(signal, handler);
        Ok(())
    }

    /// Switch a process's terminal between cooked and binary mode.
    pub fn set_terminal_mode(&mut self, pid: Pid, binary: bool) -> KernelResult<()> {
        let descriptor = self
            .processes
            .info_mut(pid)
            .ok_or(KernelError::NoSuchProcess(pid))?;
        descriptor.term_status.set_binary(binary);
        Ok(())
    }

    /// Deliver at most one pending signal to the current process.
    ///
    /// With no handler registered the process has already exited with
    /// [`SIGNAL_EXIT_CODE`] when this returns.
    pub fn checkpoint(&mut self) -> KernelResult<Outcome> {
        let Some(pid) = self.scheduler.current() else {
            return Ok(Outcome::Continue);
        };
        let Some(descriptor) = self.processes.info_mut(pid) else {
            return Ok(Outcome::Continue);
        };

        let outcome = descriptor.signals.dispatch();
        if outcome == Outcome::Continue {
            return Ok(outcome);
        }

        if self.trace {
            eprintln!("[SIG] pid {}: {:?}", pid, outcome);
        }
        if outcome.disposition() == Some(Disposition::Default) {
            self.exit(pid, SIGNAL_EXIT_CODE)?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{format_volume, FormatOptions, MemoryDisk};
    use crate::memory::BankState;
    use crate::process::args::{ARGC_ADDR, ARG_STRINGS_ADDR};

    fn kernel(banks: usize) -> Kernel<MemoryDisk> {
        let mut disk = MemoryDisk::blank(1024, 512).unwrap();
        format_volume(&mut disk, &FormatOptions::default()).unwrap();
        let config = KernelConfig {
            banks,
            ..Default::default()
        };
        Kernel::new(disk, &config).unwrap()
    }

    fn install(kernel: &mut Kernel<MemoryDisk>, name: &str, bytes: &[u8]) {
        let fs = kernel.fs_mut();
        let fd = fs.open(name, FileMode::Write).unwrap();
        fs.write(fd, bytes).unwrap();
        fs.close(fd).unwrap();
    }

    #[test]
    fn test_load_minimal_header() {
        let mut k = kernel(4);
        install(&mut k, "min.exe", &[0x0A, 0x80]);

        let pid = k.load("min.exe").unwrap();
        let info = k.info(pid).unwrap();
        assert_eq!(info.base_address, 0x8000);
        assert_eq!(info.context.entry, 0x8000);
        assert_eq!(info.bank, 0);
        assert!(info.signals.pending.is_empty());
        assert_eq!(info.signals.cancel, None);
        assert_eq!(k.banks().state(0), BankState::Used);
        // Loaded, not scheduled
        assert_eq!(k.scheduler().state(pid), None);
    }

    #[test]
    fn test_load_copies_body() {
        let mut k = kernel(4);
        install(&mut k, "prog.exe", &[0x0A, 0xC0, 0x3E, 0x2A, 0xC9]);

        let pid = k.load("prog.exe").unwrap();
        let bank = k.info(pid).unwrap().bank;
        assert_eq!(k.ram().read_byte(bank, 0xC000), 0x3E);
        assert_eq!(k.ram().read_byte(bank, 0xC002), 0xC9);
        assert_eq!(k.ram().read_u16(bank, STACK_TOP - 2), 0);
    }

    #[test]
    fn test_load_errors() {
        let mut k = kernel(1);
        install(&mut k, "bad.exe", &[0x0B, 0x80]);
        install(&mut k, "low.exe", &[0x0A, 0x40]);
        install(&mut k, "tiny.exe", &[0x0A]);
        install(&mut k, "ok.exe", &[0x0A, 0x80]);

        assert!(matches!(k.load("bad.exe"), Err(KernelError::InvalidHeader)));
        assert!(matches!(k.load("low.exe"), Err(KernelError::InvalidPage(0x40))));
        assert!(matches!(k.load("tiny.exe"), Err(KernelError::InvalidHeader)));
        assert!(matches!(k.load("none.exe"), Err(KernelError::FileNotFound)));

        k.load("ok.exe").unwrap();
        assert!(matches!(k.load("ok.exe"), Err(KernelError::NoPages)));

        // Descriptors were released on every path
        assert!(k.fs().descriptor(0).is_err());
    }

    #[test]
    fn test_spawn_writes_arguments() {
        let mut k = kernel(4);
        install(&mut k, "echo.exe", &[0x0A, 0x80]);

        let pid = k.load("echo.exe").unwrap();
        k.spawn(pid, &["echo", "hi"]).unwrap();

        let bank = k.info(pid).unwrap().bank;
        assert_eq!(k.info(pid).unwrap().context.argc, 2);
        assert_eq!(k.ram().read_u16(bank, ARGC_ADDR), 2);
        assert_eq!(k.ram().read_u16(bank, ARGV_ADDR), ARG_STRINGS_ADDR);
        assert_eq!(k.scheduler().state(pid), Some(TaskState::Ready));

        // Twice is refused
        assert!(k.spawn(pid, &["x"]).is_err());
    }

    #[test]
    fn test_spawn_overflow_rejected() {
        let mut k = kernel(4);
        install(&mut k, "p.exe", &[0x0A, 0x80]);
        let pid = k.load("p.exe").unwrap();

        let args = vec!["arg"; 9];
        assert!(matches!(k.spawn(pid, &args), Err(KernelError::ArgumentOverflow)));
        assert_eq!(k.scheduler().state(pid), None);
    }

    #[test]
    fn test_exit_releases_bank_and_slot() {
        let mut k = kernel(2);
        install(&mut k, "p.exe", &[0x0A, 0x80]);

        let a = k.launch("p.exe", &["p"]).unwrap();
        let b = k.launch("p.exe", &["p"]).unwrap();
        assert!(matches!(k.load("p.exe"), Err(KernelError::NoPages)));

        k.exit(a, 7).unwrap();
        assert_eq!(k.banks().free_count(), 1);
        assert!(k.info(a).is_none());
        assert_eq!(k.scheduler().exit_code(a), Some(7));

        // Slot `a` is held until reaped
        let c = k.load("p.exe").unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);

        assert_eq!(k.reap(a).unwrap(), Some(7));
        assert!(matches!(k.reap(a), Err(KernelError::NoSuchProcess(_))));
        assert_eq!(k.reap(b).unwrap(), None);
    }

    #[test]
    fn test_exec_blocks_parent_until_child_exits() {
        let mut k = kernel(4);
        install(&mut k, "p.exe", &[0x0A, 0x80]);

        let parent = k.launch("p.exe", &["sh"]).unwrap();
        assert_eq!(k.tick().unwrap(), Tick::Run { pid: parent, bank: 0 });

        let child = k.load("p.exe").unwrap();
        k.exec(parent, child, &["child"]).unwrap();
        assert_eq!(
            k.scheduler().state(parent),
            Some(TaskState::Waiting(Event::ProcessFinished(child)))
        );

        assert_eq!(k.tick().unwrap(), Tick::Run { pid: child, bank: 1 });
        assert_eq!(k.tick().unwrap(), Tick::Run { pid: child, bank: 1 });

        k.exit(child, 3).unwrap();
        assert_eq!(k.scheduler().state(parent), Some(TaskState::Ready));
        assert_eq!(k.tick().unwrap(), Tick::Run { pid: parent, bank: 0 });
        assert_eq!(k.reap(child).unwrap(), Some(3));
    }

    #[test]
    fn test_tick_idle() {
        let mut k = kernel(2);
        assert_eq!(k.tick().unwrap(), Tick::Idle);
    }

    #[test]
    fn test_checkpoint_default_kills() {
        let mut k = kernel(2);
        install(&mut k, "p.exe", &[0x0A, 0x80]);
        let pid = k.launch("p.exe", &["p"]).unwrap();
        k.tick().unwrap();

        assert_eq!(k.checkpoint().unwrap(), Outcome::Continue);
        assert_eq!(k.raise(Signal::Cancel), Some(pid));
        assert_eq!(
            k.checkpoint().unwrap(),
            Outcome::Cancelled(Disposition::Default)
        );
        assert_eq!(k.scheduler().exit_code(pid), Some(SIGNAL_EXIT_CODE));
        assert_eq!(k.banks().free_count(), 2);
    }

    #[test]
    fn test_checkpoint_with_handler() {
        let mut k = kernel(2);
        install(&mut k, "p.exe", &[0x0A, 0x80]);
        let pid = k.launch("p.exe", &["p"]).unwrap();
        k.tick().unwrap();

        k.set_handler(pid, Signal::Break, Some(0x8100)).unwrap();
        k.raise(Signal::Break);
        k.raise(Signal::Cancel);

        // Cancel first, one per checkpoint
        assert_eq!(
            k.checkpoint().unwrap(),
            Outcome::Cancelled(Disposition::Default)
        );
        assert!(k.info(pid).is_none());
        assert_eq!(k.checkpoint().unwrap(), Outcome::Continue);
    }

    #[test]
    fn test_break_handler_keeps_process() {
        let mut k = kernel(2);
        install(&mut k, "p.exe", &[0x0A, 0x80]);
        let pid = k.launch("p.exe", &["p"]).unwrap();
        k.tick().unwrap();

        k.set_handler(pid, Signal::Break, Some(0x8100)).unwrap();
        assert_eq!(k.raise_from_key(0x03), Some(Signal::Break));
        assert_eq!(
            k.checkpoint().unwrap(),
            Outcome::Broken(Disposition::Handler(0x8100))
        );
        assert!(k.info(pid).is_some());
        assert_eq!(k.scheduler().state(pid), Some(TaskState::Running));
    }

    #[test]
    fn test_binary_mode_ignores_break_keys() {
        let mut k = kernel(2);
        install(&mut k, "p.exe", &[0x0A, 0x80]);
        let pid = k.launch("p.exe", &["p"]).unwrap();
        k.tick().unwrap();

        k.set_terminal_mode(pid, true).unwrap();
        assert_eq!(k.raise_from_key(0x18), None);
        assert_eq!(k.raise_from_key(b'a'), None);
        assert_eq!(k.checkpoint().unwrap(), Outcome::Continue);

        k.set_terminal_mode(pid, false).unwrap();
        assert_eq!(k.raise_from_key(0x18), Some(Signal::Cancel));
    }

    #[test]
    fn test_signal_wakes_waiting_process() {
        let mut k = kernel(2);
        install(&mut k, "p.exe", &[0x0A, 0x80]);
        let pid = k.launch("p.exe", &["p"]).unwrap();
        k.tick().unwrap();
        k.block(pid, Event::Input).unwrap();

        assert_eq!(k.tick().unwrap(), Tick::Idle);
        k.raise(Signal::Cancel);
        assert_eq!(k.tick().unwrap(), Tick::Run { pid, bank: 0 });
        assert!(matches!(k.checkpoint().unwrap(), Outcome::Cancelled(_)));
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let mut disk = MemoryDisk::blank(1024, 512).unwrap();
        format_volume(&mut disk, &FormatOptions::default()).unwrap();
        let config = KernelConfig {
            banks: 1000,
            ..Default::default()
        };
        assert!(matches!(Kernel::new(disk, &config), Err(KernelError::Init)));
    }
}
