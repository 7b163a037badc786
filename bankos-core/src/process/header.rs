//! Executable header.
//!
//! Layout (2 bytes):
//! - Byte 0: marker, always `0x0A`
//! - Byte 1: base page; the image loads at `page << 8`
//!
//! The image body follows immediately.

use crate::error::{KernelError, KernelResult};

/// Marker byte identifying a loadable program.
pub const EXEC_MARKER: u8 = 0x0A;

/// Lowest page a user program may load at (`0x8000`).
pub const USER_BASE_PAGE: u8 = 0x80;

/// Size of the header in bytes.
pub const HEADER_SIZE: usize = 2;

/// Largest image copied into a bank.
pub const MAX_IMAGE_SIZE: usize = 28 * 1024;

/// Parsed executable header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecHeader {
    pub base_page: u8,
}

impl ExecHeader {
    /// Parse and validate the first bytes of an executable.
    pub fn parse(bytes: &[u8]) -> KernelResult<Self> {
        if bytes.len() < HEADER_SIZE || bytes[0] != EXEC_MARKER {
            return Err(KernelError::InvalidHeader);
        }

        let base_page = bytes[1];
        if base_page < USER_BASE_PAGE {
            return Err(KernelError::InvalidPage(base_page));
        }

        Ok(Self { base_page })
    }

    /// Address the image is loaded at and execution starts from.
    pub fn load_address(&self) -> u16 {
        (self.base_page as u16) << 8
    }

    /// Encode the header (for building executables).
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        [EXEC_MARKER, self.base_page]
    }
}
