//! Error types for the kernel.

use thiserror::Error;

/// Errors that can occur in kernel operations.
///
/// Every variant that crosses the syscall boundary has a small negative
/// integer code, see [`KernelError::code`].
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("No free memory banks")]
    NoPages,

    #[error("Invalid initialization parameters")]
    Init,

    #[error("Bank {0} is not in use")]
    InvalidBank(usize),

    #[error("Too many tasks")]
    TooManyTasks,

    #[error("No such process: {0}")]
    NoSuchProcess(usize),

    #[error("File not found")]
    FileNotFound,

    #[error("Too many open files")]
    FileLimit,

    #[error("Invalid file descriptor: {0}")]
    InvalidDescriptor(usize),

    #[error("Invalid filename: {0}")]
    InvalidFilename(String),

    #[error("Access mode violation")]
    AccessMode,

    #[error("Disk full")]
    DiskFull,

    #[error("File exists")]
    FileExist,

    #[error("Directory full")]
    DirFull,

    #[error("Invalid file mode: {0}")]
    InvalidMode(u8),

    #[error("Invalid load page: {0:#04X}")]
    InvalidPage(u8),

    #[error("Invalid executable header")]
    InvalidHeader,

    #[error("Argument block overflow")]
    ArgumentOverflow,

    #[error("End of file")]
    Eof,

    #[error("Package error: {0}")]
    Package(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KernelError {
    /// Code returned to user programs through the syscall ABI.
    ///
    /// The filesystem/process family shares one numbering; memory and
    /// scheduler errors keep their own small codes.
    pub fn code(&self) -> i16 {
        match self {
            KernelError::NoPages => -1,
            KernelError::Init => -2,
            KernelError::TooManyTasks => -1,
            KernelError::FileNotFound => -1,
            KernelError::FileLimit => -2,
            KernelError::InvalidDescriptor(_) => -3,
            KernelError::InvalidFilename(_) => -4,
            KernelError::AccessMode => -5,
            KernelError::DiskFull => -6,
            KernelError::FileExist => -7,
            KernelError::DirFull => -8,
            KernelError::InvalidMode(_) => -9,
            KernelError::InvalidPage(_) => -10,
            KernelError::InvalidHeader => -11,
            KernelError::InvalidBank(_) => -12,
            KernelError::NoSuchProcess(_) => -13,
            KernelError::ArgumentOverflow => -14,
            KernelError::Eof => -15,
            KernelError::Package(_)
            | KernelError::Io(_)
            | KernelError::Zip(_)
            | KernelError::Json(_) => -16,
        }
    }
}

/// Result type for kernel operations.
pub type KernelResult<T> = Result<T, KernelError>;
