//! Critical Section
//!
//! All scheduler and mailbox state sits behind one mutex per kernel. Holding
//! a [`CriticalSection`] is the only way to touch it. A process gives the
//! guard up only by parking on the CPU condition variable inside
//! [`CriticalSection::dispatch`], and gets it back when it is dispatched
//! again.

use std::ops::{Deref, DerefMut};

use parking_lot::MutexGuard;
use tracing::{debug, error, info, trace};

use super::process::{BlockReason, ProcessDump, ProcessId};
use super::scheduler::Dispatch;
use super::thread::{self, ProcessExit};
use super::KernelState;
use crate::boot::HaltReason;
use crate::{Kernel, KernelError};

/// Exclusive access to a kernel's state
pub struct CriticalSection<'a> {
    kernel: &'a Kernel,
    guard: MutexGuard<'a, KernelState>,
    caller: Option<ProcessId>,
}

impl<'a> CriticalSection<'a> {
    pub(crate) fn new(
        kernel: &'a Kernel,
        guard: MutexGuard<'a, KernelState>,
        caller: Option<ProcessId>,
    ) -> Self {
        Self {
            kernel,
            guard,
            caller,
        }
    }

    /// Kernel this section belongs to
    pub fn kernel(&self) -> &'a Kernel {
        self.kernel
    }

    /// Process running on the calling host thread, if any
    pub fn caller(&self) -> Option<ProcessId> {
        self.caller
    }

    /// Clock reading in microseconds
    pub fn now(&self) -> u64 {
        self.kernel.clock().now_us()
    }

    /// Park until `pid` is current. Leaves the thread if the kernel halts.
    pub(crate) fn wait_for_cpu(&mut self, pid: ProcessId) {
        let kernel = self.kernel;
        loop {
            if self.guard.halted.is_some() {
                thread::exit_thread(ProcessExit::Halted);
            }
            if self.guard.current == Some(pid) {
                return;
            }
            kernel.cpu().wait(&mut self.guard);
        }
    }

    /// Post-switch bookkeeping for a process that just got the CPU
    fn resume(&mut self, pid: ProcessId) {
        let now = self.now();
        let pcb = &mut self.guard.procs[pid];
        let consistent = !pcb.queued && pcb.time_slice_start.is_none();
        pcb.time_slice_start = Some(now);

        if !consistent {
            self.fatal(format!(
                "process {} resumed while queued or with a running timeslice",
                pid
            ));
        }
    }

    /// First dispatch of a freshly created process
    pub(crate) fn start_process(&mut self, pid: ProcessId) {
        self.wait_for_cpu(pid);
        self.resume(pid);
        trace!("Process {} started", pid);
    }

    /// Run the scheduler and, if it picks another process, hand the CPU over.
    ///
    /// Returns once the caller is current again. A caller that has quit
    /// returns immediately after the hand-off.
    pub(crate) fn dispatch(&mut self) {
        let now = self.now();
        let time_slice = self.kernel.config().time_slice_us();

        match self.guard.schedule(now, time_slice) {
            Ok(Dispatch::Keep) => {}
            Ok(Dispatch::Switch { from, to }) => {
                trace!("Switching from {:?} to {}", from, to);
                self.kernel.cpu().notify_all();

                let Some(pid) = self.caller else {
                    return;
                };
                let alive = self.guard.procs.get(pid).map_or(false, |p| !p.is_zombie());
                if !alive {
                    return;
                }
                if to != pid {
                    self.wait_for_cpu(pid);
                }
                self.resume(pid);
            }
            Err(fault) => self.fatal(fault.to_string()),
        }
    }

    /// Initial dispatch from the host thread that boots the kernel
    pub(crate) fn start(&mut self) {
        let now = self.now();
        let time_slice = self.kernel.config().time_slice_us();

        match self.guard.schedule(now, time_slice) {
            Ok(_) => {
                self.kernel.cpu().notify_all();
            }
            Err(fault) => self.record_halt(HaltReason::Error(KernelError::Fatal(fault.to_string()))),
        }
    }

    /// Block until the kernel halts
    pub(crate) fn wait_for_halt(&mut self) -> HaltReason {
        let kernel = self.kernel;
        loop {
            if let Some(reason) = &self.guard.halted {
                return reason.clone();
            }
            kernel.cpu().wait(&mut self.guard);
        }
    }

    /// Make a process runnable; a mismatch with `expected` halts the kernel
    pub(crate) fn wake(&mut self, pid: ProcessId, expected: BlockReason) {
        if let Err(fault) = self.guard.wake_up(pid, expected) {
            self.fatal(fault.to_string());
        }
    }

    /// Stop the kernel, waking every parked process so it can leave
    pub(crate) fn record_halt(&mut self, reason: HaltReason) {
        if self.guard.halted.is_none() {
            match &reason {
                HaltReason::Exit(status) => info!("Kernel halted with status {}", status),
                HaltReason::Error(e) => error!("{}", e),
            }
            self.guard.halted = Some(reason);
        }
        self.guard.current = None;
        self.kernel.cpu().notify_all();
    }

    /// Stop the kernel and leave the calling process
    pub(crate) fn halt(&mut self, reason: HaltReason) -> ! {
        self.record_halt(reason);
        thread::exit_thread(ProcessExit::Halted)
    }

    /// Halt on a violated invariant
    pub(crate) fn fatal(&mut self, message: impl Into<String>) -> ! {
        let message = message.into();
        error!("ERROR: {}", message);
        debug!("Process table at halt:\n{}", ProcessDump::capture(&self.guard.procs, self.guard.current));
        self.halt(HaltReason::Error(KernelError::Fatal(message)))
    }

    /// A process's code panicked; its host thread is already unwound
    pub(crate) fn process_panicked(&mut self, pid: ProcessId, message: String) {
        self.record_halt(HaltReason::Error(KernelError::ProcessPanicked { pid, message }));
    }
}

impl Deref for CriticalSection<'_> {
    type Target = KernelState;

    fn deref(&self) -> &KernelState {
        &self.guard
    }
}

impl DerefMut for CriticalSection<'_> {
    fn deref_mut(&mut self) -> &mut KernelState {
        &mut self.guard
    }
}
