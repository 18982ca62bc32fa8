//! Error types for the μKernel
//!
//! Two classes of failure exist. Recoverable errors are returned to the
//! caller of a kernel call and carry the small negative status codes of the
//! flat kernel interface (see the `code()` methods). Fatal errors are never
//! returned from a kernel call: they halt every process and surface once,
//! from [`crate::Kernel::run`], as a [`KernelError`].

use thiserror::Error;

use crate::ipc::MailboxId;
use crate::sys::ProcessId;

/// Result type for whole-kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

/// Result type for process-control calls
pub type ProcessResult<T> = Result<T, ProcessError>;

/// Result type for mailbox calls
pub type MailboxResult<T> = Result<T, MailboxError>;

/// Reasons a kernel stopped, plus configuration problems detected before boot
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KernelError {
    /// A system invariant was violated; the diagnostic names the violation
    #[error("Kernel halted: {0}")]
    Fatal(String),

    /// Every process blocked and nothing can ever wake one of them
    #[error("Deadlock detected: all processes are blocked")]
    Deadlock,

    /// Code running inside a process panicked
    #[error("Process {pid} panicked: {message}")]
    ProcessPanicked {
        /// Process that panicked
        pid: ProcessId,
        /// Panic payload, if it was a string
        message: String,
    },

    /// The configuration cannot be used
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The host refused to provide a thread or file
    #[error("Host error: {0}")]
    Host(String),

    /// `run` was called a second time on the same kernel
    #[error("Kernel already started")]
    AlreadyStarted,
}

/// Errors reported by the process-control calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    /// Name is empty or longer than the configured maximum
    #[error("Invalid process name: {0:?}")]
    InvalidName(String),

    /// Requested stack is below the minimum
    #[error("Stack size {0} below minimum {1}")]
    StackTooSmall(usize, usize),

    /// Priority outside the range available to ordinary processes
    #[error("Priority {0} out of range")]
    InvalidPriority(u8),

    /// No free slot in the process table
    #[error("Process table full")]
    TableFull,

    /// `join` was called by a process without children
    #[error("No children to join")]
    NoChildren,

    /// `unblock_proc` target is unknown, dead, the caller itself, or
    /// blocked inside the scheduler
    #[error("Process {0} cannot be unblocked")]
    NotBlocked(ProcessId),
}

impl ProcessError {
    /// Status code of the flat kernel interface
    pub fn code(&self) -> i32 {
        match self {
            ProcessError::StackTooSmall(..)
            | ProcessError::NoChildren
            | ProcessError::NotBlocked(_) => -2,
            ProcessError::InvalidName(_)
            | ProcessError::InvalidPriority(_)
            | ProcessError::TableFull => -1,
        }
    }
}

/// Errors reported by the mailbox calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MailboxError {
    /// Capacity or message size outside the system limits
    #[error("Invalid mailbox geometry: {slots} slots of {size} bytes")]
    InvalidGeometry {
        /// Requested number of slots
        slots: usize,
        /// Requested maximum message size
        size: usize,
    },

    /// Every mailbox is in use
    #[error("Mailbox table full")]
    TableFull,

    /// Unknown id, never created, or already released
    #[error("Invalid mailbox: {0}")]
    InvalidMailbox(MailboxId),

    /// Message larger than the mailbox's maximum
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Size of the rejected message
        size: usize,
        /// Mailbox maximum
        max: usize,
    },

    /// Queued message did not fit the receive buffer; it was discarded
    #[error("Receive buffer too small: message is {size} bytes, buffer {capacity}")]
    BufferTooSmall {
        /// Size of the discarded message
        size: usize,
        /// Length of the caller's buffer
        capacity: usize,
    },

    /// A conditional call would have had to block
    #[error("Operation would block")]
    WouldBlock,

    /// The shared slot pool is exhausted
    #[error("System is out of mailbox slots")]
    OutOfSlots,

    /// The mailbox was released while the caller was waiting on it
    #[error("Mailbox released while waiting")]
    Released,
}

impl MailboxError {
    /// Status code of the flat kernel interface
    pub fn code(&self) -> i32 {
        match self {
            MailboxError::WouldBlock | MailboxError::OutOfSlots => -2,
            MailboxError::Released => -3,
            _ => -1,
        }
    }

    /// Whether the caller may retry the same call later
    pub fn is_transient(&self) -> bool {
        matches!(self, MailboxError::WouldBlock | MailboxError::OutOfSlots)
    }
}
