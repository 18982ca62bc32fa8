//! Kernel Configuration
//!
//! Table sizes, limits and timing for one kernel instance.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sys::scheduler::{DEFAULT_TIME_SLICE, MAX_USER_PRIORITY, MIN_USER_PRIORITY};
use crate::{KernelError, KernelResult};
use crate::{MAX_MAILBOXES, MAX_MESSAGE, MAX_NAME, MAX_PROCESSES, MAX_SLOTS, MIN_STACK};

/// Kernel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Process table capacity (live processes plus unjoined zombies)
    pub max_processes: usize,

    /// Longest accepted process name
    pub max_name_len: usize,

    /// Smallest stack a process may request
    pub min_stack_size: usize,

    /// Stack used for the processes the kernel creates itself
    pub default_stack_size: usize,

    /// Mailbox table capacity
    pub max_mailboxes: usize,

    /// Size of the slot pool shared by every mailbox
    pub max_slots: usize,

    /// Largest message a single slot can hold
    pub max_message: usize,

    /// Quantum before round-robin rotation is considered
    #[serde(with = "humantime_serde")]
    pub time_slice: Duration,

    /// Priority of the `main` process forked by init
    pub main_priority: u8,

    /// Logging level used by the command-line front end
    pub log_level: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            max_processes: MAX_PROCESSES,
            max_name_len: MAX_NAME,
            min_stack_size: MIN_STACK,
            default_stack_size: 4 * MIN_STACK,
            max_mailboxes: MAX_MAILBOXES,
            max_slots: MAX_SLOTS,
            max_message: MAX_MESSAGE,
            time_slice: DEFAULT_TIME_SLICE,
            main_priority: 3,
            log_level: "info".into(),
        }
    }
}

impl KernelConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> KernelResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))?;

        serde_json::from_str(&content)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> KernelResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| KernelError::InvalidConfiguration(e.to_string()))
    }

    /// Time slice in clock units (microseconds)
    pub fn time_slice_us(&self) -> u64 {
        self.time_slice.as_micros().min(u64::MAX as u128) as u64
    }

    /// Validate configuration
    pub fn validate(&self) -> KernelResult<()> {
        // init, idle and main must always fit
        if self.max_processes < 3 {
            return Err(KernelError::InvalidConfiguration(format!(
                "max_processes must be at least 3, got {}",
                self.max_processes
            )));
        }

        if self.max_name_len == 0 {
            return Err(KernelError::InvalidConfiguration(
                "max_name_len must be positive".into(),
            ));
        }

        if self.default_stack_size < self.min_stack_size {
            return Err(KernelError::InvalidConfiguration(format!(
                "default_stack_size {} is below min_stack_size {}",
                self.default_stack_size, self.min_stack_size
            )));
        }

        if self.max_mailboxes == 0 {
            return Err(KernelError::InvalidConfiguration(
                "max_mailboxes must be positive".into(),
            ));
        }

        if self.time_slice.is_zero() {
            return Err(KernelError::InvalidConfiguration(
                "time_slice must be positive".into(),
            ));
        }

        if !(MAX_USER_PRIORITY..=MIN_USER_PRIORITY).contains(&self.main_priority) {
            return Err(KernelError::InvalidConfiguration(format!(
                "main_priority {} outside {}..={}",
                self.main_priority, MAX_USER_PRIORITY, MIN_USER_PRIORITY
            )));
        }

        Ok(())
    }
}
