//! Banked RAM model.
//!
//! Each physical bank is 32 KiB and appears in the upper half of the
//! address space (`0x8000..=0xFFFF`) when mapped. Addresses passed to this
//! module are window addresses, not bank offsets.

/// Size of one bank in bytes.
pub const BANK_SIZE: usize = 0x8000;

/// First address of the banked window.
pub const WINDOW_BASE: u16 = 0x8000;

/// Storage for every physical bank.
pub struct BankedRam {
    banks: Vec<Vec<u8>>,
}

impl BankedRam {
    pub fn new(count: usize) -> Self {
        Self {
            banks: vec![vec![0; BANK_SIZE]; count],
        }
    }

    /// Number of banks backed by storage.
    pub fn len(&self) -> usize {
        self.banks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.banks.is_empty()
    }

    /// Whole contents of a bank.
    pub fn bank(&self, bank: usize) -> &[u8] {
        &self.banks[bank]
    }

    /// Mutable contents of a bank.
    pub fn bank_mut(&mut self, bank: usize) -> &mut [u8] {
        &mut self.banks[bank]
    }

    /// Copy `data` into `bank` at window address `address`.
    /// Bytes that would fall past the end of the window are dropped.
    pub fn write(&mut self, bank: usize, address: u16, data: &[u8]) -> usize {
        let Some(start) = window_offset(address) else {
            return 0;
        };
        let end = (start + data.len()).min(BANK_SIZE);
        self.banks[bank][start..end].copy_from_slice(&data[..end - start]);
        end - start
    }

    /// Read a byte at window address `address`.
    pub fn read_byte(&self, bank: usize, address: u16) -> u8 {
        window_offset(address)
            .map(|off| self.banks[bank][off])
            .unwrap_or(0xFF)
    }

    /// Read a little-endian word at window address `address`.
    pub fn read_u16(&self, bank: usize, address: u16) -> u16 {
        u16::from_le_bytes([
            self.read_byte(bank, address),
            self.read_byte(bank, address.wrapping_add(1)),
        ])
    }

    /// Clear a bank (called when it is handed to a new process).
    pub fn clear(&mut self, bank: usize) {
        self.banks[bank].fill(0);
    }
}

/// Offset into a bank for a window address.
pub fn window_offset(address: u16) -> Option<usize> {
    address
        .checked_sub(WINDOW_BASE)
        .map(|off| off as usize)
}
