//! Physical memory bank allocator.
//!
//! Memory is handed out one whole bank at a time. Banks below the
//! configured count start `Free`; everything above stays `Disabled` for the
//! lifetime of the allocator.

use crate::error::{KernelError, KernelResult};

/// Capacity of the bank table.
pub const MAX_BANKS: usize = 256;

/// State of a single physical bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BankState {
    /// Not present (beyond the configured count).
    Disabled,
    /// Available for allocation.
    Free,
    /// Owned by a process.
    Used,
}

/// First-fit allocator over a fixed bank table.
pub struct BankAllocator {
    table: [BankState; MAX_BANKS],
    count: usize,
    /// Enable allocation tracing.
    pub trace: bool,
}

impl BankAllocator {
    /// Create an allocator with banks `[0, count)` free.
    pub fn new(count: usize) -> KernelResult<Self> {
        let mut alloc = Self {
            table: [BankState::Disabled; MAX_BANKS],
            count: 0,
            trace: false,
        };
        alloc.init(count)?;
        Ok(alloc)
    }

    /// Reset the table: `[0, count)` free, the rest disabled.
    pub fn init(&mut self, count: usize) -> KernelResult<()> {
        if count > MAX_BANKS {
            return Err(KernelError::Init);
        }

        for (i, state) in self.table.iter_mut().enumerate() {
            *state = if i < count {
                BankState::Free
            } else {
                BankState::Disabled
            };
        }
        self.count = count;
        Ok(())
    }

    /// Claim the lowest-numbered free bank.
    pub fn allocate(&mut self) -> KernelResult<usize> {
        let bank = self.table[..self.count]
            .iter()
            .position(|s| *s == BankState::Free)
            .ok_or(KernelError::NoPages)?;

        self.table[bank] = BankState::Used;
        if self.trace {
            eprintln!("[BANK] Allocated bank {}", bank);
        }
        Ok(bank)
    }

    /// Return a bank to the free pool. Only `Used` banks can be freed.
    pub fn free(&mut self, bank: usize) -> KernelResult<()> {
        match self.table.get(bank) {
            Some(BankState::Used) => {
                self.table[bank] = BankState::Free;
                if self.trace {
                    eprintln!("[BANK] Freed bank {}", bank);
                }
                Ok(())
            }
            _ => Err(KernelError::InvalidBank(bank)),
        }
    }

    /// State of a bank; out-of-range banks read as disabled.
    pub fn state(&self, bank: usize) -> BankState {
        self.table.get(bank).copied().unwrap_or(BankState::Disabled)
    }

    /// Number of configured banks.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of banks currently free.
    pub fn free_count(&self) -> usize {
        self.table[..self.count]
            .iter()
            .filter(|s| **s == BankState::Free)
            .count()
    }
}
