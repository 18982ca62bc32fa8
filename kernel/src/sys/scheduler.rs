//! Scheduler
//!
//! Priority-based scheduler with:
//! - 8 priority levels (0 = highest, 7 = idle)
//! - Round-robin within same priority
//! - Time slice based rotation
//!
//! # Scheduling Algorithm
//!
//! 1. A blocked current process gives up the CPU
//! 2. A runnable process at a strictly higher priority preempts it
//! 3. Otherwise it keeps the CPU until its time slice expires
//! 4. On expiry it rotates to the tail of its level, unless it is alone there
//!
//! The decision itself ([`KernelState::schedule`]) is pure bookkeeping on
//! the process table and run queues; performing the switch belongs to the
//! critical section.

use std::time::Duration;

use thiserror::Error;

use super::process::{BlockReason, ProcessId, ProcessTable};
use super::KernelState;

/// Number of priority levels
pub const NUM_PRIORITIES: usize = 8;

/// Priority reserved for init
pub const BOOTSTRAP_PRIORITY: u8 = 0;

/// Highest priority an ordinary process may use
pub const MAX_USER_PRIORITY: u8 = 1;

/// Lowest priority an ordinary process may use
pub const MIN_USER_PRIORITY: u8 = 6;

/// Priority reserved for the idle process
pub const IDLE_PRIORITY: u8 = 7;

/// Default time slice
pub const DEFAULT_TIME_SLICE: Duration = Duration::from_millis(80);

/// Scheduler invariant violations. Any of these halts the kernel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerFault {
    /// The current process is linked into a run queue
    #[error("current process {0} is on a run queue")]
    CurrentQueued(ProcessId),

    /// Every run queue is empty
    #[error("no runnable process found")]
    NothingRunnable,

    /// A process taken from a run queue is not runnable
    #[error("process {0} was dispatched but is not runnable")]
    NotRunnable(ProcessId),

    /// Wake-up target does not exist
    #[error("cannot wake process {0}: no such process")]
    NoSuchProcess(ProcessId),

    /// Wake-up target has already quit
    #[error("cannot wake process {pid}: already terminated with status {status}")]
    Terminated {
        /// Target
        pid: ProcessId,
        /// Its termination status
        status: i32,
    },

    /// Wake-up target is not blocked the way the caller expected
    #[error("cannot wake process {pid}: state is {actual}, expected {expected}")]
    UnexpectedState {
        /// Target
        pid: ProcessId,
        /// Expected block reason
        expected: BlockReason,
        /// Actual block reason
        actual: BlockReason,
    },

    /// Process is already linked into a run queue
    #[error("process {0} is already on a run queue")]
    AlreadyQueued(ProcessId),
}

/// Outcome of one scheduling decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The current process keeps the CPU
    Keep,
    /// `to` is the new current process
    Switch {
        /// Process that held the CPU when the decision started
        from: Option<ProcessId>,
        /// Process that now holds it
        to: ProcessId,
    },
}

#[derive(Debug, Clone, Copy, Default)]
struct RunQueue {
    head: Option<ProcessId>,
    tail: Option<ProcessId>,
    len: usize,
}

/// One FIFO per priority level, linked through the PCBs
#[derive(Debug, Default)]
pub struct RunQueues {
    queues: [RunQueue; NUM_PRIORITIES],
}

impl RunQueues {
    /// Create empty run queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `pid` at the tail of its priority level
    pub fn push_back(
        &mut self,
        procs: &mut ProcessTable,
        pid: ProcessId,
    ) -> Result<(), SchedulerFault> {
        let pcb = procs.get_mut(pid).ok_or(SchedulerFault::NoSuchProcess(pid))?;
        if pcb.queued {
            return Err(SchedulerFault::AlreadyQueued(pid));
        }
        pcb.queued = true;
        pcb.queue_next = None;

        let queue = &mut self.queues[pcb.priority as usize];
        match queue.tail {
            Some(tail) => procs[tail].queue_next = Some(pid),
            None => queue.head = Some(pid),
        }
        queue.tail = Some(pid);
        queue.len += 1;
        Ok(())
    }

    /// Remove the head of one priority level
    pub fn pop_front(&mut self, procs: &mut ProcessTable, priority: u8) -> Option<ProcessId> {
        let queue = &mut self.queues[priority as usize];
        let head = queue.head?;

        let pcb = &mut procs[head];
        queue.head = pcb.queue_next.take();
        pcb.queued = false;
        if queue.head.is_none() {
            queue.tail = None;
        }
        queue.len -= 1;
        Some(head)
    }

    /// Remove the head of the highest non-empty level
    pub fn pop_highest(&mut self, procs: &mut ProcessTable) -> Option<ProcessId> {
        let priority = (0..NUM_PRIORITIES).find(|&p| self.queues[p].head.is_some())?;
        self.pop_front(procs, priority as u8)
    }

    /// Whether a priority level is empty
    pub fn is_empty(&self, priority: u8) -> bool {
        self.queues[priority as usize].head.is_none()
    }

    /// Number of processes waiting at a priority level
    pub fn len(&self, priority: u8) -> usize {
        self.queues[priority as usize].len
    }

    /// Whether any level strictly above `priority` has a waiting process
    pub fn any_above(&self, priority: u8) -> bool {
        self.queues[..priority as usize]
            .iter()
            .any(|q| q.head.is_some())
    }

    /// PIDs waiting at a priority level, head first
    pub fn pids(&self, procs: &ProcessTable, priority: u8) -> Vec<ProcessId> {
        let mut out = Vec::new();
        let mut cur = self.queues[priority as usize].head;
        while let Some(pid) = cur {
            out.push(pid);
            cur = procs[pid].queue_next;
        }
        out
    }
}

impl KernelState {
    /// Make a blocked (or brand-new) process runnable
    ///
    /// `expected` is the block reason the caller believes the target has;
    /// any mismatch is a fault.
    pub fn wake_up(&mut self, pid: ProcessId, expected: BlockReason) -> Result<(), SchedulerFault> {
        let pcb = self
            .procs
            .get_mut(pid)
            .ok_or(SchedulerFault::NoSuchProcess(pid))?;

        if let Some(status) = pcb.status {
            return Err(SchedulerFault::Terminated { pid, status });
        }
        if pcb.blocked != expected {
            return Err(SchedulerFault::UnexpectedState {
                pid,
                expected,
                actual: pcb.blocked,
            });
        }

        pcb.blocked = BlockReason::Runnable;
        self.ready.push_back(&mut self.procs, pid)
    }

    /// Take the current process off the CPU, charging it for the slice it
    /// used. It is requeued only if it is still runnable.
    pub fn remove_current(&mut self, now: u64) -> Result<(), SchedulerFault> {
        let Some(pid) = self.current.take() else {
            return Ok(());
        };

        let pcb = &mut self.procs[pid];
        if let Some(start) = pcb.time_slice_start.take() {
            pcb.cpu_time += now.saturating_sub(start);
        }

        if pcb.is_runnable() {
            self.ready.push_back(&mut self.procs, pid)?;
        }
        Ok(())
    }

    /// Decide who runs next
    ///
    /// On [`Dispatch::Switch`] the new process is already recorded as
    /// current; the caller performs the actual hand-off.
    pub fn schedule(&mut self, now: u64, time_slice: u64) -> Result<Dispatch, SchedulerFault> {
        let from = self.current;

        if let Some(pid) = self.current {
            if self.procs[pid].queued {
                return Err(SchedulerFault::CurrentQueued(pid));
            }
            if !self.procs[pid].is_runnable() {
                self.remove_current(now)?;
            }
        }

        if let Some(pid) = self.current {
            if self.ready.any_above(self.procs[pid].priority) {
                self.remove_current(now)?;
            }
        }

        if let Some(pid) = self.current {
            let priority = self.procs[pid].priority;
            let start = self.procs[pid].time_slice_start.unwrap_or(now);

            if now.saturating_sub(start) < time_slice {
                return Ok(Dispatch::Keep);
            }

            if self.ready.is_empty(priority) {
                let pcb = &mut self.procs[pid];
                pcb.cpu_time += now.saturating_sub(start);
                pcb.time_slice_start = Some(now);
                return Ok(Dispatch::Keep);
            }

            self.remove_current(now)?;
        }

        let next = self
            .ready
            .pop_highest(&mut self.procs)
            .ok_or(SchedulerFault::NothingRunnable)?;

        if !self.procs[next].is_runnable() {
            return Err(SchedulerFault::NotRunnable(next));
        }

        self.current = Some(next);
        Ok(Dispatch::Switch { from, to: next })
    }
}
