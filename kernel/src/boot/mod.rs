//! Boot Module
//!
//! Brings a kernel up and down.
//!
//! # Boot Sequence
//!
//! 1. [`Kernel::run`] creates `init` (PID 1, priority 0) and dispatches it
//! 2. `init` runs the service start-up hooks in order
//! 3. `init` forks `idle` (priority 7) and `main` (configured priority)
//! 4. `init` joins children forever
//! 5. `main` returning halts the kernel with its status
//!
//! `idle` only ever gets the CPU when every other process is blocked. No
//! event source outside the processes exists, so that is a deadlock.

use tracing::{error, info};

use crate::sys::scheduler::{BOOTSTRAP_PRIORITY, IDLE_PRIORITY};
use crate::sys::thread::ProcessEntry;
use crate::sys::ProcessDump;
use crate::{Kernel, KernelError, KernelResult, ProcessError, NAME, VERSION};

/// Start-up entry point of a service, run inside `init` before `main`
pub type ServiceHook = Box<dyn FnOnce(&Kernel) + Send + 'static>;

/// Why a kernel stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// Orderly shutdown with a status
    Exit(i32),
    /// Fatal error
    Error(KernelError),
}

impl Kernel {
    /// Boot the kernel, run `main` as the first ordinary process and wait
    /// for the kernel to halt
    pub fn run<F>(&self, main: F) -> KernelResult<i32>
    where
        F: FnOnce(&Kernel) -> i32 + Send + 'static,
    {
        self.run_with_services(Vec::new(), main)
    }

    /// [`Kernel::run`] with service start-up hooks executed by `init`
    pub fn run_with_services<F>(&self, services: Vec<ServiceHook>, main: F) -> KernelResult<i32>
    where
        F: FnOnce(&Kernel) -> i32 + Send + 'static,
    {
        let mut cs = self.lock();
        if cs.started {
            return Err(KernelError::AlreadyStarted);
        }
        cs.started = true;

        info!("{} v{} starting...", NAME, VERSION);

        let pid = cs
            .procs
            .allocate()
            .ok_or_else(|| KernelError::Fatal("no slot for init".into()))?;
        let entry: ProcessEntry = Box::new(move |kernel: &Kernel| init_main(kernel, services, main));
        cs.install_process(pid, "init", self.config().default_stack_size, BOOTSTRAP_PRIORITY, entry)
            .map_err(|e| KernelError::Host(format!("cannot start init: {}", e)))?;

        cs.start();
        let reason = cs.wait_for_halt();
        let contexts = cs.procs.drain_contexts();
        drop(cs);

        for context in contexts {
            context.reap();
        }

        match reason {
            HaltReason::Exit(status) => Ok(status),
            HaltReason::Error(e) => Err(e),
        }
    }

    /// Halt the kernel with `status`. Never returns.
    pub fn shutdown(&self, status: i32) -> ! {
        let (mut cs, pid) = self.enter("shutdown");
        info!("Process {} requested shutdown", pid);
        cs.halt(HaltReason::Exit(status))
    }
}

fn init_main<F>(kernel: &Kernel, services: Vec<ServiceHook>, main: F) -> i32
where
    F: FnOnce(&Kernel) -> i32 + Send + 'static,
{
    for service in services {
        service(kernel);
    }

    let stack_size = kernel.config().default_stack_size;

    if let Err(e) = kernel.spawn("idle", stack_size, IDLE_PRIORITY, Box::new(idle_main)) {
        kernel.lock().fatal(format!("could not create the idle process: {}", e));
    }

    let main_priority = kernel.config().main_priority;
    let started = kernel.fork("main", stack_size, main_priority, move |kernel| {
        let status = main(kernel);
        kernel.shutdown(status)
    });
    if let Err(e) = started {
        kernel.lock().fatal(format!("could not create the main process: {}", e));
    }

    loop {
        if let Err(ProcessError::NoChildren) = kernel.join() {
            kernel
                .lock()
                .fatal("all of the children of init have died, but main never halted the kernel");
        }
    }
}

fn idle_main(kernel: &Kernel) -> i32 {
    let dump: ProcessDump = kernel.dump_processes();
    error!("DEADLOCK DETECTED! All of the processes have blocked.\n{}", dump);
    kernel.lock().halt(HaltReason::Error(KernelError::Deadlock))
}
