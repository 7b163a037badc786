//! Argument block passed to a spawned process.
//!
//! Layout inside the child's bank (window addresses):
//! - `0xFE00`: argc (u16, little-endian)
//! - `0xFE02`: argv table, one u16 pointer per argument
//! - `0xFE20..0xFF00`: NUL-terminated argument strings
//!
//! The initial stack grows down from `0xFE00`.

use crate::error::{KernelError, KernelResult};
use crate::ram::BankedRam;

/// Address of the argument count.
pub const ARGC_ADDR: u16 = 0xFE00;

/// Address of the argv pointer table.
pub const ARGV_ADDR: u16 = 0xFE02;

/// Start of the string area.
pub const ARG_STRINGS_ADDR: u16 = 0xFE20;

/// End (exclusive) of the string area.
pub const ARG_STRINGS_END: u16 = 0xFF00;

/// Maximum number of arguments.
pub const MAX_ARGS: usize = 8;

/// Initial stack top.
pub const STACK_TOP: u16 = ARGC_ADDR;

/// Serialized arguments, ready to copy into a bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgBlock {
    pointers: Vec<u16>,
    strings: Vec<u8>,
}

impl ArgBlock {
    /// Pack arguments, rejecting too many, too long, or any containing a
    /// NUL.
    pub fn pack<S: AsRef<[u8]>>(args: &[S]) -> KernelResult<Self> {
        if args.len() > MAX_ARGS {
            return Err(KernelError::ArgumentOverflow);
        }

        let capacity = (ARG_STRINGS_END - ARG_STRINGS_ADDR) as usize;
        let mut strings = Vec::new();
        let mut pointers = Vec::with_capacity(args.len());

        for arg in args {
            let arg = arg.as_ref();
            if arg.contains(&0) {
                return Err(KernelError::ArgumentOverflow);
            }

            if strings.len() + arg.len() + 1 > capacity {
                return Err(KernelError::ArgumentOverflow);
            }

            pointers.push(ARG_STRINGS_ADDR + strings.len() as u16);
            strings.extend_from_slice(arg);
            strings.push(0);
        }

        Ok(Self { pointers, strings })
    }

    pub fn argc(&self) -> u16 {
        self.pointers.len() as u16
    }

    /// Write argc, the argv table and the strings into `bank`.
    pub fn write_to(&self, ram: &mut BankedRam, bank: usize) {
        ram.write(bank, ARGC_ADDR, &self.argc().to_le_bytes());

        let table: Vec<u8> = self
            .pointers
            .iter()
            .flat_map(|p| p.to_le_bytes())
            .collect();
        ram.write(bank, ARGV_ADDR, &table);
        ram.write(bank, ARG_STRINGS_ADDR, &self.strings);
    }
}
