//! Root directory entries and 8.3 names.
//!
//! Entry layout (32 bytes):
//! - `0..8`: name, space padded
//! - `8..11`: extension, space padded
//! - `11`: attributes
//! - `16..18`: creation date
//! - `26..28`: start cluster
//! - `28..32`: size in bytes

use std::fmt;

use crate::error::{KernelError, KernelResult};

/// Size of one directory entry.
pub const ENTRY_SIZE: usize = 32;

/// First name byte of the entry that ends the directory.
pub const END_MARKER: u8 = 0x00;

/// First name byte of a deleted entry.
pub const FREE_MARKER: u8 = 0xE5;

/// Longest accepted filename, `NAME.EXT`.
pub const MAX_FILENAME_LEN: usize = 12;

/// Characters allowed in a name besides ASCII letters and digits.
const NAME_SYMBOLS: &str = "$#@!%'`(){}~^-_";

fn valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || NAME_SYMBOLS.contains(c)
}

/// Attribute byte of a directory entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Attributes(u8);

impl Attributes {
    pub const READ_ONLY: u8 = 0x01;
    pub const HIDDEN: u8 = 0x02;
    pub const SYSTEM: u8 = 0x04;
    pub const VOLUME_LABEL: u8 = 0x08;
    pub const DIRECTORY: u8 = 0x10;

    /// Bits a program may change.
    pub const USER_MASK: u8 = Self::READ_ONLY | Self::HIDDEN | Self::SYSTEM;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn is_read_only(&self) -> bool {
        self.0 & Self::READ_ONLY != 0
    }

    pub fn is_hidden(&self) -> bool {
        self.0 & Self::HIDDEN != 0
    }

    pub fn is_system(&self) -> bool {
        self.0 & Self::SYSTEM != 0
    }

    /// Directories and volume labels are never listed as files.
    pub fn is_file(&self) -> bool {
        self.0 & (Self::DIRECTORY | Self::VOLUME_LABEL) == 0
    }

    /// Replace the user bits, keeping the rest.
    pub fn with_user_bits(&self, bits: u8) -> Self {
        Self((self.0 & !Self::USER_MASK) | (bits & Self::USER_MASK))
    }
}

/// Packed creation date: bits 9-15 year since 1980, 5-8 month, 0-4 day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Date(u16);

impl Date {
    /// 1980-01-01, stamped on every new file.
    pub const EPOCH: Date = Date(0x0021);

    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub fn from_ymd(year: u16, month: u8, day: u8) -> Self {
        let year = year.saturating_sub(1980).min(0x7F);
        Self((year << 9) | ((month as u16 & 0x0F) << 5) | (day as u16 & 0x1F))
    }

    pub fn raw(&self) -> u16 {
        self.0
    }

    pub fn year(&self) -> u16 {
        1980 + (self.0 >> 9)
    }

    pub fn month(&self) -> u8 {
        ((self.0 >> 5) & 0x0F) as u8
    }

    pub fn day(&self) -> u8 {
        (self.0 & 0x1F) as u8
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year(), self.month(), self.day())
    }
}

/// Space-padded 8.3 name as stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShortName {
    name: [u8; 8],
    ext: [u8; 3],
}

impl ShortName {
    /// Parse a user-supplied `NAME[.EXT]`, case folded to upper.
    ///
    /// Rejects names longer than 12 characters, empty or over-long parts,
    /// more than one dot and characters outside the 8.3 set.
    pub fn parse(filename: &str) -> KernelResult<Self> {
        let invalid = || KernelError::InvalidFilename(filename.to_string());

        if filename.len() > MAX_FILENAME_LEN {
            return Err(invalid());
        }

        let upper = filename.to_ascii_uppercase();
        let (name, ext) = match upper.split_once('.') {
            Some((name, ext)) => (name, ext),
            None => (upper.as_str(), ""),
        };

        if name.is_empty() || name.len() > 8 || ext.len() > 3 {
            return Err(invalid());
        }
        if !name.chars().chain(ext.chars()).all(valid_name_char) {
            return Err(invalid());
        }

        Ok(Self::from_parts(name.as_bytes(), ext.as_bytes()))
    }

    /// Squeeze an arbitrary host filename into 8.3.
    ///
    /// Uppercases, drops invalid characters and truncates the name to 8
    /// and the extension to 3 characters. An empty name becomes `_`.
    pub fn normalize(filename: &str) -> Self {
        let upper = filename.to_uppercase();
        let (name, ext) = match upper.rfind('.') {
            Some(pos) => (&upper[..pos], &upper[pos + 1..]),
            None => (upper.as_str(), ""),
        };

        fn clean(s: &str, limit: usize) -> String {
            s.chars().filter(|c| valid_name_char(*c)).take(limit).collect()
        }

        let mut name = clean(name, 8);
        let ext = clean(ext, 3);
        if name.is_empty() {
            name.push('_');
        }

        Self::from_parts(name.as_bytes(), ext.as_bytes())
    }

    fn from_parts(name: &[u8], ext: &[u8]) -> Self {
        let mut short = Self {
            name: [b' '; 8],
            ext: [b' '; 3],
        };
        short.name[..name.len()].copy_from_slice(name);
        short.ext[..ext.len()].copy_from_slice(ext);
        short
    }

    /// Name from the first 11 bytes of a directory entry.
    pub fn from_raw(raw: &[u8]) -> Self {
        let mut short = Self {
            name: [b' '; 8],
            ext: [b' '; 3],
        };
        short.name.copy_from_slice(&raw[0..8]);
        short.ext.copy_from_slice(&raw[8..11]);
        short
    }

    pub fn raw(&self) -> [u8; 11] {
        let mut raw = [0u8; 11];
        raw[..8].copy_from_slice(&self.name);
        raw[8..].copy_from_slice(&self.ext);
        raw
    }
}

impl fmt::Display for ShortName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let trim = |part: &[u8]| {
            let end = part.iter().position(|&b| b == b' ').unwrap_or(part.len());
            String::from_utf8_lossy(&part[..end]).into_owned()
        };

        let name = trim(&self.name);
        let ext = trim(&self.ext);
        if ext.is_empty() {
            write!(f, "{}", name)
        } else {
            write!(f, "{}.{}", name, ext)
        }
    }
}

/// Decoded directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirEntry {
    pub name: ShortName,
    pub attributes: Attributes,
    pub created: Date,
    pub start_cluster: u16,
    pub size: u32,
}

impl DirEntry {
    /// Entry for a freshly created, empty file.
    pub fn new(name: ShortName, start_cluster: u16) -> Self {
        Self {
            name,
            attributes: Attributes::default(),
            created: Date::EPOCH,
            start_cluster,
            size: 0,
        }
    }

    pub fn parse(raw: &[u8]) -> Self {
        Self {
            name: ShortName::from_raw(raw),
            attributes: Attributes::from_bits(raw[11]),
            created: Date::from_raw(u16::from_le_bytes([raw[16], raw[17]])),
            start_cluster: u16::from_le_bytes([raw[26], raw[27]]),
            size: u32::from_le_bytes([raw[28], raw[29], raw[30], raw[31]]),
        }
    }

    /// Store the decoded fields into `raw`, leaving the rest untouched.
    pub fn encode_into(&self, raw: &mut [u8]) {
        raw[0..11].copy_from_slice(&self.name.raw());
        raw[11] = self.attributes.bits();
        raw[16..18].copy_from_slice(&self.created.raw().to_le_bytes());
        raw[26..28].copy_from_slice(&self.start_cluster.to_le_bytes());
        raw[28..32].copy_from_slice(&self.size.to_le_bytes());
    }

    /// Listing name, `NAME.EXT` or `NAME`.
    pub fn filename(&self) -> String {
        self.name.to_string()
    }
}
