//! μKernel: Single-CPU Teaching Kernel for μOS
//!
//! A small kernel core implementing:
//! - Process lifecycle (fork, join, quit, zap, block/unblock)
//! - Priority scheduling with round-robin timeslicing
//! - Bounded mailboxes as the universal synchronization primitive
//! - One critical section guarding all kernel state
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Processes                              │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────────────┐│
//! │  │   init   │ │   main   │ │ services │ │       idle       ││
//! │  └────┬─────┘ └────┬─────┘ └────┬─────┘ └────────┬─────────┘│
//! │       │            │            │                 │          │
//! │  ═════╪════════════╪════════════╪═════════════════╪═════════ │
//! │       │   kernel calls (critical section)         │          │
//! │       ▼            ▼            ▼                 ▼          │
//! ├─────────────────────────────────────────────────────────────┤
//! │                      μKernel                                │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────┐   │
//! │  │ Process      │  │  Mailboxes   │  │   Dispatcher     │   │
//! │  │ Table        │  │  + Slot Pool │  │ (8 run queues)   │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────┘   │
//! │  ┌──────────────────────────────────────────────────────┐   │
//! │  │ Host threads (one per process) + CPU condvar + clock │   │
//! │  └──────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use mukernel::{Kernel, KernelConfig};
//!
//! let kernel = Kernel::new(KernelConfig::default()).unwrap();
//! let status = kernel
//!     .run(|k| {
//!         let child = k.fork("child", 128 * 1024, 2, |_| 7).unwrap();
//!         let (pid, status) = k.join().unwrap();
//!         assert_eq!((pid, status), (child, 7));
//!         0
//!     })
//!     .unwrap();
//! assert_eq!(status, 0);
//! ```

#![warn(missing_docs)]

pub mod boot;
pub mod config;
pub mod drivers;
pub mod error;
pub mod ipc;
pub mod sys;

use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

pub use boot::{HaltReason, ServiceHook};
pub use config::KernelConfig;
pub use drivers::{Clock, ManualClock, SystemClock};
pub use error::{
    KernelError, KernelResult, MailboxError, MailboxResult, ProcessError, ProcessResult,
};
pub use ipc::{MailboxId, MailboxInfo};
pub use sys::{
    BlockReason, ProcessDump, ProcessId, ProcessInfo, ProcessState, BOOTSTRAP_PID,
    MAX_RESERVED_BLOCK,
};

use sys::{CriticalSection, KernelState};

/// Kernel version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Kernel name
pub const NAME: &str = "μKernel";

/// Default process table capacity
pub const MAX_PROCESSES: usize = 50;

/// Default longest process name
pub const MAX_NAME: usize = 50;

/// Default smallest process stack
pub const MIN_STACK: usize = 80 * 1024;

/// Default mailbox table capacity
pub const MAX_MAILBOXES: usize = 2000;

/// Default size of the shared slot pool
pub const MAX_SLOTS: usize = 2500;

/// Default largest message
pub const MAX_MESSAGE: usize = 150;

/// Handle to one kernel instance
///
/// Cloning the handle is cheap; every clone refers to the same kernel.
#[derive(Clone)]
pub struct Kernel {
    inner: Arc<KernelInner>,
}

struct KernelInner {
    state: Mutex<KernelState>,
    cpu: Condvar,
    clock: Arc<dyn Clock>,
    config: KernelConfig,
}

impl Kernel {
    /// Create a kernel driven by the host's monotonic clock
    pub fn new(config: KernelConfig) -> KernelResult<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Create a kernel driven by `clock`
    pub fn with_clock(config: KernelConfig, clock: Arc<dyn Clock>) -> KernelResult<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(KernelInner {
                state: Mutex::new(KernelState::new(&config)),
                cpu: Condvar::new(),
                clock,
                config,
            }),
        })
    }

    /// Configuration the kernel was built with
    pub fn config(&self) -> &KernelConfig {
        &self.inner.config
    }

    /// Clock the kernel reads
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.inner.clock
    }

    pub(crate) fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub(crate) fn cpu(&self) -> &Condvar {
        &self.inner.cpu
    }

    /// Enter the critical section
    pub(crate) fn lock(&self) -> CriticalSection<'_> {
        let caller = match sys::thread::binding() {
            Some((kernel, pid)) if kernel == self.id() => Some(pid),
            _ => None,
        };
        CriticalSection::new(self, self.inner.state.lock(), caller)
    }

    /// Enter the critical section on behalf of the running process
    ///
    /// Panics when called from a thread that is not the current process.
    pub(crate) fn enter(&self, op: &str) -> (CriticalSection<'_>, ProcessId) {
        let cs = self.lock();

        if cs.halted.is_some() && cs.caller().is_some() {
            drop(cs);
            sys::thread::exit_thread(sys::thread::ProcessExit::Halted);
        }

        match cs.caller() {
            Some(pid) if cs.current == Some(pid) => (cs, pid),
            _ => panic!("{} called outside of process context", op),
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &NAME)
            .field("config", &self.inner.config)
            .field("clock", &self.inner.clock)
            .finish()
    }
}
