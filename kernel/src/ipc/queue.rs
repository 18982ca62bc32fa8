//! Mailbox Wait Queues
//!
//! A wait queue is a FIFO of parked processes. Links live in a per-kernel
//! array indexed by `pid % max_processes`, since a process can wait on at
//! most one queue at a time.
//!
//! A woken process stays at the head of its queue until it runs and removes
//! itself, which keeps each queue draining in order. `wakeup_pending`
//! records that the head has already been told to wake.

use crate::sys::ProcessId;

#[derive(Debug, Clone, Copy, Default)]
struct WaitLink {
    pid: Option<ProcessId>,
    next: Option<ProcessId>,
}

/// Per-process link storage shared by every wait queue
#[derive(Debug)]
pub struct WaitLinks {
    links: Vec<WaitLink>,
}

impl WaitLinks {
    /// Links for a process table of `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            links: vec![WaitLink::default(); capacity],
        }
    }

    fn slot(&self, pid: ProcessId) -> usize {
        pid as usize % self.links.len()
    }

    /// Whether `pid` is parked in some wait queue
    pub fn is_waiting(&self, pid: ProcessId) -> bool {
        self.links[self.slot(pid)].pid == Some(pid)
    }

    fn next(&self, pid: ProcessId) -> Option<ProcessId> {
        self.links[self.slot(pid)].next
    }
}

/// FIFO of processes blocked on one side of a mailbox
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcQueue {
    head: Option<ProcessId>,
    tail: Option<ProcessId>,
    wakeup_pending: bool,
}

impl ProcQueue {
    /// Whether nobody is waiting
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append `pid` at the tail
    pub fn append(&mut self, links: &mut WaitLinks, pid: ProcessId) {
        let slot = links.slot(pid);
        debug_assert!(links.links[slot].pid.is_none());
        links.links[slot] = WaitLink {
            pid: Some(pid),
            next: None,
        };

        match self.tail {
            Some(tail) => {
                let tail_slot = links.slot(tail);
                links.links[tail_slot].next = Some(pid);
            }
            None => self.head = Some(pid),
        }
        self.tail = Some(pid);
    }

    /// Claim the right to wake the head. Returns the PID to wake, or `None`
    /// if the queue is empty or a wake-up is already in flight.
    pub fn begin_wakeup(&mut self) -> Option<ProcessId> {
        let head = self.head?;
        if self.wakeup_pending {
            return None;
        }
        self.wakeup_pending = true;
        Some(head)
    }

    /// Called by the woken head to leave the queue.
    /// Returns `false` if `pid` was not the woken head.
    pub fn remove_self_from_head(&mut self, links: &mut WaitLinks, pid: ProcessId) -> bool {
        if self.head != Some(pid) || !self.wakeup_pending {
            return false;
        }
        self.wakeup_pending = false;

        self.head = links.next(pid);
        if self.head.is_none() {
            self.tail = None;
        }

        let slot = links.slot(pid);
        links.links[slot] = WaitLink::default();
        true
    }

    /// PIDs in queue order
    pub fn pids(&self, links: &WaitLinks) -> Vec<ProcessId> {
        let mut out = Vec::new();
        let mut cur = self.head;
        while let Some(pid) = cur {
            out.push(pid);
            cur = links.next(pid);
        }
        out
    }
}
