//! Core Kernel Services
//!
//! Provides fundamental kernel services:
//! - Critical section guarding all kernel state
//! - Process table and lifecycle calls
//! - Scheduler and dispatcher
//! - Host-thread execution contexts

pub mod critical;
pub mod process;
pub mod scheduler;
pub mod thread;

pub use critical::CriticalSection;
pub use process::{
    BlockReason, Pcb, ProcessDump, ProcessId, ProcessInfo, ProcessState, ProcessTable,
    BOOTSTRAP_PID, MAX_RESERVED_BLOCK,
};
pub use scheduler::{Dispatch, RunQueues, SchedulerFault};
pub use thread::ProcessEntry;

use crate::boot::HaltReason;
use crate::ipc::MailboxTable;
use crate::KernelConfig;

/// Everything protected by the critical section
#[derive(Debug)]
pub struct KernelState {
    pub(crate) procs: ProcessTable,
    pub(crate) ready: RunQueues,
    pub(crate) current: Option<ProcessId>,
    pub(crate) mailboxes: MailboxTable,
    pub(crate) halted: Option<HaltReason>,
    pub(crate) started: bool,
    pub(crate) ticks: u64,
}

impl KernelState {
    /// Empty state sized by `config`
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            procs: ProcessTable::new(config.max_processes),
            ready: RunQueues::new(),
            current: None,
            mailboxes: MailboxTable::new(config),
            halted: None,
            started: false,
            ticks: 0,
        }
    }

    /// Process holding the CPU
    pub fn current(&self) -> Option<ProcessId> {
        self.current
    }

    /// The process table
    pub fn processes(&self) -> &ProcessTable {
        &self.procs
    }

    /// The mailbox table
    pub fn mailboxes(&self) -> &MailboxTable {
        &self.mailboxes
    }

    /// Why the kernel stopped, once it has
    pub fn halted(&self) -> Option<&HaltReason> {
        self.halted.as_ref()
    }
}
