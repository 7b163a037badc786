//! Kernel configuration.
//!
//! Loaded from JSON; every field is optional:
//! ```json
//! { "banks": 8, "fileLimit": 4, "sliceInstructions": 10000, "trace": false }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::fs::MAX_FILE_LIMIT;
use crate::memory::MAX_BANKS;

fn default_banks() -> usize {
    8
}

fn default_file_limit() -> usize {
    4
}

fn default_slice_instructions() -> u32 {
    10_000
}

/// Tunables for [`crate::Kernel`] and [`crate::Machine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelConfig {
    /// Physical memory banks.
    #[serde(default = "default_banks")]
    pub banks: usize,
    /// Size of the file descriptor table.
    #[serde(default = "default_file_limit")]
    pub file_limit: usize,
    /// Instructions a process may run per tick before it is switched out.
    #[serde(default = "default_slice_instructions")]
    pub slice_instructions: u32,
    #[serde(default)]
    pub trace: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            banks: default_banks(),
            file_limit: default_file_limit(),
            slice_instructions: default_slice_instructions(),
            trace: false,
        }
    }
}

impl KernelConfig {
    pub fn from_json(text: &str) -> KernelResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> KernelResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Reject values the kernel cannot be built with.
    pub fn validate(&self) -> KernelResult<()> {
        if self.banks > MAX_BANKS
            || self.file_limit == 0
            || self.file_limit > MAX_FILE_LIMIT
            || self.slice_instructions == 0
        {
            return Err(KernelError::Init);
        }
        Ok(())
    }
}
