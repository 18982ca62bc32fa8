//! Execution Contexts
//!
//! Every process runs on its own host thread. The thread is the process's
//! saved context: it only executes while the kernel names it as `current`,
//! and otherwise sits parked on the CPU condition variable. Leaving a
//! process (termination or kernel halt) unwinds the thread with a private
//! [`ProcessExit`] payload that [`launch`] catches.

use std::any::Any;
use std::cell::Cell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use super::process::ProcessId;
use crate::Kernel;

/// Host threads never get less stack than this, whatever the request
pub const HOST_STACK_FLOOR: usize = 512 * 1024;

/// Body of a process; its return value is the termination status
pub type ProcessEntry = Box<dyn FnOnce(&Kernel) -> i32 + Send + 'static>;

thread_local! {
    /// (kernel identity, pid) of the process running on this host thread
    static BINDING: Cell<Option<(usize, ProcessId)>> = const { Cell::new(None) };
}

/// Process bound to the calling host thread, if any
pub(crate) fn binding() -> Option<(usize, ProcessId)> {
    BINDING.with(|b| b.get())
}

fn bind(kernel: usize, pid: ProcessId) {
    BINDING.with(|b| b.set(Some((kernel, pid))));
}

/// Why a process's host thread is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessExit {
    /// The process called `quit`
    Terminated,
    /// The kernel halted
    Halted,
}

/// Leave the current process without returning
pub(crate) fn exit_thread(reason: ProcessExit) -> ! {
    panic::resume_unwind(Box::new(reason))
}

/// Saved execution context of one process
#[derive(Debug)]
pub struct Context {
    handle: Option<JoinHandle<()>>,
    stack_size: usize,
}

impl Context {
    /// Start the host thread for `pid`. It parks until first dispatched.
    pub(crate) fn spawn(
        kernel: &Kernel,
        pid: ProcessId,
        name: &str,
        stack_size: usize,
        entry: ProcessEntry,
    ) -> io::Result<Self> {
        let kernel = kernel.clone();
        let handle = thread::Builder::new()
            .name(format!("{}:{}", name, pid))
            .stack_size(stack_size.max(HOST_STACK_FLOOR))
            .spawn(move || launch(kernel, pid, entry))?;

        Ok(Self {
            handle: Some(handle),
            stack_size,
        })
    }

    /// Stack size requested at creation
    pub fn stack_size(&self) -> usize {
        self.stack_size
    }

    /// Wait for the host thread to finish and release it
    pub(crate) fn reap(mut self) {
        if let Some(handle) = self.handle.take() {
            let name = handle.thread().name().map(str::to_owned);
            if handle.join().is_err() {
                warn!("Host thread {:?} ended abnormally", name);
            }
        }
    }
}

/// Trampoline run on every process's host thread
fn launch(kernel: Kernel, pid: ProcessId, entry: ProcessEntry) {
    bind(kernel.id(), pid);

    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        kernel.lock().start_process(pid);
        let status = entry(&kernel);
        kernel.quit(status);
    }));

    if let Err(payload) = result {
        match payload.downcast_ref::<ProcessExit>() {
            Some(reason) => debug!("Host thread of process {} left: {:?}", pid, reason),
            None => kernel.lock().process_panicked(pid, panic_message(&*payload)),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
