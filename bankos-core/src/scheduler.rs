//! Cooperative round-robin scheduler.
//!
//! The schedule table is never compacted: finished and waiting entries stay
//! in place and the circular scan simply skips them. Scheduling decisions
//! only happen when [`Scheduler::next`] (or [`Scheduler::tick`]) is called.

use crate::error::{KernelError, KernelResult};
use crate::process::{Pid, ProcessTable};

/// Capacity of the schedule table.
pub const MAX_SCHEDULED: usize = 16;

/// Something a task can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The given process finished.
    ProcessFinished(Pid),
    /// Any process finished.
    AnyProcessFinished,
    /// A console key became available.
    Input,
}

impl Event {
    /// Whether a task waiting on `self` is satisfied by `occurred`.
    pub fn satisfied_by(&self, occurred: &Event) -> bool {
        match (self, occurred) {
            (Event::AnyProcessFinished, Event::ProcessFinished(_)) => true,
            (a, b) => a == b,
        }
    }
}

/// Run state of a schedule entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Free,
    Ready,
    Running,
    Waiting(Event),
    Finished(i16),
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: TaskState,
    pid: Pid,
}

/// Hand-off from a scheduling decision to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Map `bank` and resume `pid`.
    Run { pid: Pid, bank: usize },
    /// Nothing is ready to run.
    Idle,
}

/// Round-robin scheduler over a fixed table.
pub struct Scheduler {
    table: [Entry; MAX_SCHEDULED],
    /// Index of the last selected entry.
    current: Option<usize>,
    /// One past the highest slot ever used; bounds the circular scan.
    high_water: usize,
    /// Enable scheduler tracing.
    pub trace: bool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            table: [Entry {
                state: TaskState::Free,
                pid: 0,
            }; MAX_SCHEDULED],
            current: None,
            high_water: 0,
            trace: false,
        }
    }

    fn entry(&self, pid: Pid) -> Option<usize> {
        self.table
            .iter()
            .position(|e| e.state != TaskState::Free && e.pid == pid)
    }

    fn entry_or_err(&self, pid: Pid) -> KernelResult<usize> {
        self.entry(pid).ok_or(KernelError::NoSuchProcess(pid))
    }

    /// Add a task in the `Ready` state.
    pub fn add(&mut self, pid: Pid) -> KernelResult<()> {
        let slot = self
            .table
            .iter()
            .position(|e| e.state == TaskState::Free)
            .ok_or(KernelError::TooManyTasks)?;

        self.table[slot] = Entry {
            state: TaskState::Ready,
            pid,
        };
        self.high_water = self.high_water.max(slot + 1);

        if self.trace {
            eprintln!("[SCHED] Added pid {} in slot {}", pid, slot);
        }
        Ok(())
    }

    /// Select the next ready task, or `None` when nothing can run.
    pub fn next(&mut self) -> Option<Pid> {
        if let Some(cur) = self.current {
            if self.table[cur].state == TaskState::Running {
                self.table[cur].state = TaskState::Ready;
            }
        }

        if self.high_water == 0 {
            return None;
        }

        let start = self.current.map(|c| c + 1).unwrap_or(0);
        for step in 0..self.high_water {
            let slot = (start + step) % self.high_water;
            if self.table[slot].state == TaskState::Ready {
                self.table[slot].state = TaskState::Running;
                self.current = Some(slot);
                return Some(self.table[slot].pid);
            }
        }

        if self.trace {
            eprintln!("[SCHED] Idle: no ready task");
        }
        None
    }

    /// Select the next task and resolve the bank the dispatcher must map.
    pub fn tick(&mut self, processes: &ProcessTable) -> KernelResult<Tick> {
        let Some(pid) = self.next() else {
            return Ok(Tick::Idle);
        };

        let bank = processes
            .info(pid)
            .map(|p| p.bank)
            .ok_or(KernelError::NoSuchProcess(pid))?;

        if self.trace {
            eprintln!("[SCHED] Tick: pid {} on bank {}", pid, bank);
        }
        Ok(Tick::Run { pid, bank })
    }

    /// Mark a task finished and wake everything waiting on it.
    pub fn exit(&mut self, pid: Pid, code: i16) -> KernelResult<()> {
        let slot = self.entry_or_err(pid)?;
        self.table[slot].state = TaskState::Finished(code);

        if self.trace {
            eprintln!("[SCHED] pid {} finished with {}", pid, code);
        }
        self.broadcast(Event::ProcessFinished(pid), Some(pid));
        Ok(())
    }

    /// Exit code of a finished task.
    pub fn exit_code(&self, pid: Pid) -> Option<i16> {
        match self.state(pid) {
            Some(TaskState::Finished(code)) => Some(code),
            _ => None,
        }
    }

    /// State of the task with `pid`, if scheduled.
    pub fn state(&self, pid: Pid) -> Option<TaskState> {
        self.entry(pid).map(|slot| self.table[slot].state)
    }

    /// Whether `pid` still has a schedule entry (live or finished).
    pub fn contains(&self, pid: Pid) -> bool {
        self.entry(pid).is_some()
    }

    /// The last selected task, unless it has finished or been removed.
    pub fn current(&self) -> Option<Pid> {
        let entry = self.table[self.current?];
        match entry.state {
            TaskState::Free | TaskState::Finished(_) => None,
            _ => Some(entry.pid),
        }
    }

    /// Block a ready or running task on `event`.
    pub fn block(&mut self, pid: Pid, event: Event) -> KernelResult<()> {
        let slot = self.entry_or_err(pid)?;
        match self.table[slot].state {
            TaskState::Ready | TaskState::Running | TaskState::Waiting(_) => {
                self.table[slot].state = TaskState::Waiting(event);
                if self.trace {
                    eprintln!("[SCHED] pid {} waiting on {:?}", pid, event);
                }
                Ok(())
            }
            _ => Err(KernelError::NoSuchProcess(pid)),
        }
    }

    /// Block the current task on `event`.
    pub fn block_current(&mut self, event: Event) -> KernelResult<()> {
        let pid = self.current().ok_or(KernelError::NoSuchProcess(0))?;
        self.block(pid, event)
    }

    /// Event a waiting task is blocked on.
    pub fn event(&self, pid: Pid) -> Option<Event> {
        match self.state(pid) {
            Some(TaskState::Waiting(event)) => Some(event),
            _ => None,
        }
    }

    /// Move a waiting task back to `Ready`. Returns whether it was waiting.
    pub fn wake(&mut self, pid: Pid) -> KernelResult<bool> {
        let slot = self.entry_or_err(pid)?;
        if let TaskState::Waiting(_) = self.table[slot].state {
            self.table[slot].state = TaskState::Ready;
            if self.trace {
                eprintln!("[SCHED] pid {} woken", pid);
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Wake every task (except `exclude`) waiting on `event`.
    pub fn broadcast(&mut self, event: Event, exclude: Option<Pid>) -> usize {
        let mut woken = 0;
        for entry in self.table.iter_mut() {
            if Some(entry.pid) == exclude {
                continue;
            }
            if let TaskState::Waiting(waiting) = entry.state {
                if waiting.satisfied_by(&event) {
                    entry.state = TaskState::Ready;
                    woken += 1;
                }
            }
        }
        if self.trace && woken > 0 {
            eprintln!("[SCHED] {:?} woke {} task(s)", event, woken);
        }
        woken
    }

    /// Drop a task's entry so its slot can be reused.
    pub fn remove(&mut self, pid: Pid) -> KernelResult<TaskState> {
        let slot = self.entry_or_err(pid)?;
        let state = self.table[slot].state;
        self.table[slot].state = TaskState::Free;
        Ok(state)
    }

    /// Tasks with an entry, in slot order.
    pub fn tasks(&self) -> impl Iterator<Item = (Pid, TaskState)> + '_ {
        self.table
            .iter()
            .filter(|e| e.state != TaskState::Free)
            .map(|e| (e.pid, e.state))
    }

    /// Whether any task has not finished yet.
    pub fn has_live_tasks(&self) -> bool {
        self.tasks()
            .any(|(_, s)| !matches!(s, TaskState::Finished(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_task() {
        let mut sched = Scheduler::new();
        sched.add(0).unwrap();
        for _ in 0..10 {
            assert_eq!(sched.next(), Some(0));
            assert_eq!(sched.state(0), Some(TaskState::Running));
        }
    }

    #[test]
    fn test_round_robin_order() {
        let mut sched = Scheduler::new();
        sched.add(6).unwrap();
        sched.add(9).unwrap();
        sched.add(2).unwrap();

        let expected = [6, 9, 2];
        for i in 0..100 {
            let pid = sched.next().unwrap();
            assert_eq!(pid, expected[i % 3]);
            assert_eq!(sched.state(pid), Some(TaskState::Running));
        }
    }

    #[test]
    fn test_add_while_running() {
        let mut sched = Scheduler::new();
        sched.add(0).unwrap();
        assert_eq!(sched.next(), Some(0));
        assert_eq!(sched.next(), Some(0));

        sched.add(1).unwrap();
        assert_eq!(sched.next(), Some(1));
        assert_eq!(sched.next(), Some(0));
        assert_eq!(sched.next(), Some(1));
    }

    #[test]
    fn test_exit_removes_from_rotation() {
        let mut sched = Scheduler::new();
        for pid in [6, 9, 2] {
            sched.add(pid).unwrap();
        }
        for _ in 0..9 {
            sched.next();
        }

        sched.exit(6, 0).unwrap();
        let expected = [9, 2];
        for i in 0..20 {
            assert_eq!(sched.next(), Some(expected[i % 2]));
        }
    }

    #[test]
    fn test_too_many_tasks() {
        let mut sched = Scheduler::new();
        for pid in 0..MAX_SCHEDULED {
            sched.add(pid).unwrap();
        }
        assert!(matches!(sched.add(99), Err(KernelError::TooManyTasks)));
    }

    #[test]
    fn test_exit_code() {
        let mut sched = Scheduler::new();
        sched.add(6).unwrap();
        sched.add(9).unwrap();

        assert_eq!(sched.exit_code(9), None);
        sched.exit(9, 42).unwrap();
        assert_eq!(sched.exit_code(9), Some(42));
        assert_eq!(sched.state(9), Some(TaskState::Finished(42)));
    }

    #[test]
    fn test_block_and_event() {
        let mut sched = Scheduler::new();
        sched.add(6).unwrap();
        sched.add(9).unwrap();

        assert_eq!(sched.state(9), Some(TaskState::Ready));
        assert_eq!(sched.event(9), None);

        sched.block(9, Event::ProcessFinished(6)).unwrap();
        assert_eq!(
            sched.state(9),
            Some(TaskState::Waiting(Event::ProcessFinished(6)))
        );
        assert_eq!(sched.event(9), Some(Event::ProcessFinished(6)));
    }

    #[test]
    fn test_waiting_woken_by_exit() {
        let mut sched = Scheduler::new();
        sched.add(5).unwrap();
        sched.add(6).unwrap();

        assert_eq!(sched.next(), Some(5));
        sched.block(5, Event::ProcessFinished(6)).unwrap();

        assert_eq!(sched.next(), Some(6));
        assert_eq!(sched.state(6), Some(TaskState::Running));

        sched.exit(6, 42).unwrap();
        assert_eq!(sched.state(5), Some(TaskState::Ready));
        assert_eq!(sched.state(6), Some(TaskState::Finished(42)));
    }

    #[test]
    fn test_waiting_task_not_scheduled() {
        let mut sched = Scheduler::new();
        sched.add(14).unwrap();
        sched.add(52).unwrap();

        assert_eq!(sched.next(), Some(14));
        sched.block(14, Event::AnyProcessFinished).unwrap();

        for _ in 0..10 {
            assert_eq!(sched.next(), Some(52));
            assert_eq!(sched.state(14), Some(TaskState::Waiting(Event::AnyProcessFinished)));
        }

        sched.exit(52, 42).unwrap();
        assert_eq!(sched.state(14), Some(TaskState::Ready));
        assert_eq!(sched.next(), Some(14));
        assert_eq!(sched.state(14), Some(TaskState::Running));
    }

    #[test]
    fn test_idle_when_nothing_ready() {
        let mut sched = Scheduler::new();
        assert_eq!(sched.next(), None);

        sched.add(1).unwrap();
        assert_eq!(sched.next(), Some(1));
        sched.block_current(Event::Input).unwrap();
        assert_eq!(sched.next(), None);

        assert!(sched.wake(1).unwrap());
        assert!(!sched.wake(1).unwrap()); // Already ready
        assert_eq!(sched.next(), Some(1));
    }

    #[test]
    fn test_broadcast_only_matching() {
        let mut sched = Scheduler::new();
        for pid in 0..3 {
            sched.add(pid).unwrap();
        }
        sched.block(0, Event::Input).unwrap();
        sched.block(1, Event::ProcessFinished(2)).unwrap();

        assert_eq!(sched.broadcast(Event::ProcessFinished(7), None), 0);
        assert_eq!(sched.broadcast(Event::Input, None), 1);
        assert_eq!(sched.state(0), Some(TaskState::Ready));
        assert_eq!(sched.event(1), Some(Event::ProcessFinished(2)));
    }

    #[test]
    fn test_remove_frees_slot() {
        let mut sched = Scheduler::new();
        for pid in 0..MAX_SCHEDULED {
            sched.add(pid).unwrap();
        }
        sched.exit(3, 1).unwrap();

        // Finished entries still hold their slot
        assert!(sched.add(100).is_err());

        assert_eq!(sched.remove(3).unwrap(), TaskState::Finished(1));
        assert!(!sched.contains(3));
        sched.add(100).unwrap();
        assert_eq!(sched.state(100), Some(TaskState::Ready));
    }

    #[test]
    fn test_unknown_pid() {
        let mut sched = Scheduler::new();
        assert_eq!(sched.state(3), None);
        assert!(matches!(sched.exit(3, 0), Err(KernelError::NoSuchProcess(3))));
        assert!(sched.wake(3).is_err());
    }

    #[test]
    fn test_tick_resolves_bank() {
        use crate::process::{ExecContext, ProcessDescriptor, TermStatus};
        use crate::signal::SignalState;

        let mut processes = ProcessTable::new();
        let pid = processes
            .insert(
                ProcessDescriptor {
                    base_address: 0x8000,
                    bank: 3,
                    term_status: TermStatus::default(),
                    signals: SignalState::default(),
                    context: ExecContext {
                        entry: 0x8000,
                        stack: 0xFDFE,
                        argv: 0xFE02,
                        argc: 0,
                    },
                },
                |_| false,
            )
            .unwrap();

        let mut sched = Scheduler::new();
        assert_eq!(sched.tick(&processes).unwrap(), Tick::Idle);

        sched.add(pid).unwrap();
        assert_eq!(sched.tick(&processes).unwrap(), Tick::Run { pid, bank: 3 });

        // Scheduled pid with no descriptor
        sched.add(9).unwrap();
        assert!(matches!(
            sched.tick(&processes),
            Err(KernelError::NoSuchProcess(9))
        ));
    }
}
