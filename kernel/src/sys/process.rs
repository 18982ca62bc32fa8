//! Process Management
//!
//! A process is a host thread plus a process control block (PCB) in the
//! fixed-capacity process table. PCBs live in an arena indexed by
//! `pid % capacity`; family, zapper and run-queue lists are threaded through
//! them as `Option<ProcessId>` links.
//!
//! # Lifecycle
//!
//! ```text
//! fork ──► Runnable ◄──► Running ──► Blocked ──► Runnable ...
//!                          │
//!                        quit
//!                          ▼
//!                        Zombie ──(parent joins)──► slot freed
//! ```

use std::fmt;
use std::ops::{Index, IndexMut};

use tracing::debug;

use super::critical::CriticalSection;
use super::scheduler::{IDLE_PRIORITY, MAX_USER_PRIORITY, MIN_USER_PRIORITY};
use super::thread::{self, Context, ProcessEntry, ProcessExit};
use crate::boot::HaltReason;
use crate::{Kernel, KernelError, ProcessError, ProcessResult};

/// Process ID type
pub type ProcessId = u32;

/// PID of the bootstrap process
pub const BOOTSTRAP_PID: ProcessId = 1;

/// Block codes up to this value belong to the kernel
pub const MAX_RESERVED_BLOCK: u32 = 10;

/// Why a process is not runnable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Not blocked
    Runnable,
    /// Inside `join`, no zombie child yet
    WaitingForChild,
    /// Inside `zap`, target still alive
    WaitingForZapTarget,
    /// Caller-supplied reason (always above [`MAX_RESERVED_BLOCK`])
    Other(u32),
}

impl BlockReason {
    /// Numeric block code (0 = runnable)
    pub fn code(&self) -> u32 {
        match self {
            BlockReason::Runnable => 0,
            BlockReason::WaitingForChild => 1,
            BlockReason::WaitingForZapTarget => 2,
            BlockReason::Other(code) => *code,
        }
    }

    /// Whether the process is blocked at all
    pub fn is_blocked(&self) -> bool {
        !matches!(self, BlockReason::Runnable)
    }

    /// Whether the reason belongs to the kernel rather than a caller
    pub fn is_reserved(&self) -> bool {
        (1..=MAX_RESERVED_BLOCK).contains(&self.code())
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::Runnable => write!(f, "runnable"),
            BlockReason::WaitingForChild => write!(f, "waiting for child to quit"),
            BlockReason::WaitingForZapTarget => write!(f, "waiting for zap target to quit"),
            BlockReason::Other(code) => write!(f, "{}", code),
        }
    }
}

/// Process control block
#[derive(Debug)]
pub struct Pcb {
    pub(crate) pid: ProcessId,
    pub(crate) name: String,
    pub(crate) priority: u8,

    pub(crate) parent: Option<ProcessId>,
    /// Newest child first
    pub(crate) first_child: Option<ProcessId>,
    pub(crate) next_sibling: Option<ProcessId>,
    /// `None` while running; set by `quit`
    pub(crate) status: Option<i32>,

    pub(crate) blocked: BlockReason,
    pub(crate) first_zapper: Option<ProcessId>,
    pub(crate) next_zapper: Option<ProcessId>,

    pub(crate) queue_next: Option<ProcessId>,
    pub(crate) queued: bool,

    pub(crate) context: Option<Context>,
    /// `None` unless this is the current process
    pub(crate) time_slice_start: Option<u64>,
    pub(crate) cpu_time: u64,
}

impl Pcb {
    /// Create a runnable, unlinked PCB
    pub fn new(pid: ProcessId, name: &str, priority: u8, parent: Option<ProcessId>) -> Self {
        Self {
            pid,
            name: name.to_string(),
            priority,
            parent,
            first_child: None,
            next_sibling: None,
            status: None,
            blocked: BlockReason::Runnable,
            first_zapper: None,
            next_zapper: None,
            queue_next: None,
            queued: false,
            context: None,
            time_slice_start: None,
            cpu_time: 0,
        }
    }

    /// Process ID
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Process name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Scheduling priority
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Termination status, once the process has quit
    pub fn status(&self) -> Option<i32> {
        self.status
    }

    /// Current block reason
    pub fn blocked(&self) -> BlockReason {
        self.blocked
    }

    /// Terminated but not yet joined
    pub fn is_zombie(&self) -> bool {
        self.status.is_some()
    }

    /// Alive and not blocked
    pub fn is_runnable(&self) -> bool {
        self.status.is_none() && !self.blocked.is_blocked()
    }
}

/// Fixed-capacity process table
#[derive(Debug)]
pub struct ProcessTable {
    slots: Vec<Option<Pcb>>,
    next_pid: ProcessId,
}

impl ProcessTable {
    /// Create an empty table
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            next_pid: BOOTSTRAP_PID,
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots (live processes and zombies)
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, pid: ProcessId) -> usize {
        pid as usize % self.slots.len()
    }

    /// Look up a PCB
    pub fn get(&self, pid: ProcessId) -> Option<&Pcb> {
        self.slots[self.slot(pid)].as_ref().filter(|p| p.pid == pid)
    }

    /// Look up a PCB mutably
    pub fn get_mut(&mut self, pid: ProcessId) -> Option<&mut Pcb> {
        let slot = self.slot(pid);
        self.slots[slot].as_mut().filter(|p| p.pid == pid)
    }

    /// Whether `pid` names a PCB in the table
    pub fn contains(&self, pid: ProcessId) -> bool {
        self.get(pid).is_some()
    }

    /// Reserve the next PID whose slot is free, scanning forward from the
    /// rolling cursor. Returns `None` after one full lap.
    pub fn allocate(&mut self) -> Option<ProcessId> {
        let stop_at = self.next_pid.wrapping_add(self.slots.len() as ProcessId);
        while self.slots[self.slot(self.next_pid)].is_some() || self.next_pid == 0 {
            self.next_pid = self.next_pid.wrapping_add(1);
            if self.next_pid == stop_at {
                return None;
            }
        }

        let pid = self.next_pid;
        self.next_pid = self.next_pid.wrapping_add(1);
        Some(pid)
    }

    /// Store a PCB in its slot
    pub fn insert(&mut self, pcb: Pcb) {
        let slot = self.slot(pcb.pid);
        debug_assert!(self.slots[slot].is_none());
        self.slots[slot] = Some(pcb);
    }

    /// Clear a PCB's slot
    pub fn remove(&mut self, pid: ProcessId) -> Option<Pcb> {
        let slot = self.slot(pid);
        match &self.slots[slot] {
            Some(p) if p.pid == pid => self.slots[slot].take(),
            _ => None,
        }
    }

    /// Iterate over occupied slots in slot order
    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.slots.iter().flatten()
    }

    /// Link `child` as the newest child of `parent`
    pub fn link_child(&mut self, parent: ProcessId, child: ProcessId) {
        let first = self[parent].first_child;
        self[child].next_sibling = first;
        self[parent].first_child = Some(child);
    }

    /// Unlink `child` from `parent`'s child list
    pub fn unlink_child(&mut self, parent: ProcessId, child: ProcessId) {
        let next = self[child].next_sibling.take();
        self[child].parent = None;

        if self[parent].first_child == Some(child) {
            self[parent].first_child = next;
            return;
        }

        let mut cur = self[parent].first_child;
        while let Some(pid) = cur {
            if self[pid].next_sibling == Some(child) {
                self[pid].next_sibling = next;
                return;
            }
            cur = self[pid].next_sibling;
        }
    }

    /// Children of `parent`, newest first
    pub fn children(&self, parent: ProcessId) -> Vec<ProcessId> {
        let mut out = Vec::new();
        let mut cur = self.get(parent).and_then(|p| p.first_child);
        while let Some(pid) = cur {
            out.push(pid);
            cur = self[pid].next_sibling;
        }
        out
    }

    /// First zombie in `parent`'s child list
    pub fn find_zombie_child(&self, parent: ProcessId) -> Option<ProcessId> {
        self.children(parent)
            .into_iter()
            .find(|&pid| self[pid].is_zombie())
    }

    /// Register `zapper` on `target`'s wait-for-death list
    pub fn add_zapper(&mut self, target: ProcessId, zapper: ProcessId) {
        let first = self[target].first_zapper;
        self[zapper].next_zapper = first;
        self[target].first_zapper = Some(zapper);
    }

    /// Empty `target`'s wait-for-death list
    pub fn take_zappers(&mut self, target: ProcessId) -> Vec<ProcessId> {
        let mut out = Vec::new();
        let mut cur = self[target].first_zapper.take();
        while let Some(pid) = cur {
            cur = self[pid].next_zapper.take();
            out.push(pid);
        }
        out
    }

    /// Take every host context out of the table
    pub(crate) fn drain_contexts(&mut self) -> Vec<Context> {
        self.slots
            .iter_mut()
            .flatten()
            .filter_map(|p| p.context.take())
            .collect()
    }
}

impl Index<ProcessId> for ProcessTable {
    type Output = Pcb;

    fn index(&self, pid: ProcessId) -> &Pcb {
        match self.get(pid) {
            Some(pcb) => pcb,
            None => panic!("no process with pid {}", pid),
        }
    }
}

impl IndexMut<ProcessId> for ProcessTable {
    fn index_mut(&mut self, pid: ProcessId) -> &mut Pcb {
        match self.get_mut(pid) {
            Some(pcb) => pcb,
            None => panic!("no process with pid {}", pid),
        }
    }
}

/// State column of a process dump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Holding the CPU
    Running,
    /// Waiting on a run queue
    Runnable,
    /// Blocked for the given reason
    Blocked(BlockReason),
    /// Zombie with its status
    Terminated(i32),
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Running => write!(f, "Running"),
            ProcessState::Runnable => write!(f, "Runnable"),
            ProcessState::Blocked(reason) => write!(f, "Blocked({})", reason),
            ProcessState::Terminated(status) => write!(f, "Terminated({})", status),
        }
    }
}

/// One row of a process dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    /// Process ID
    pub pid: ProcessId,
    /// Parent PID (`None` for the bootstrap process)
    pub ppid: Option<ProcessId>,
    /// Process name
    pub name: String,
    /// Scheduling priority
    pub priority: u8,
    /// Scheduling state
    pub state: ProcessState,
    /// Accumulated CPU time in microseconds
    pub cpu_time: u64,
    /// Stack size requested at creation
    pub stack_size: usize,
}

/// Snapshot of the process table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessDump {
    /// Rows in table-slot order
    pub processes: Vec<ProcessInfo>,
}

impl ProcessDump {
    pub(crate) fn capture(table: &ProcessTable, current: Option<ProcessId>) -> Self {
        let processes = table
            .iter()
            .map(|pcb| {
                let state = match pcb.status {
                    Some(status) => ProcessState::Terminated(status),
                    None if pcb.blocked.is_blocked() => ProcessState::Blocked(pcb.blocked),
                    None if current == Some(pcb.pid) => ProcessState::Running,
                    None => ProcessState::Runnable,
                };
                ProcessInfo {
                    pid: pcb.pid,
                    ppid: pcb.parent,
                    name: pcb.name.clone(),
                    priority: pcb.priority,
                    state,
                    cpu_time: pcb.cpu_time,
                    stack_size: pcb.context.as_ref().map_or(0, Context::stack_size),
                }
            })
            .collect();

        Self { processes }
    }

    /// Row for `pid`
    pub fn get(&self, pid: ProcessId) -> Option<&ProcessInfo> {
        self.processes.iter().find(|p| p.pid == pid)
    }
}

impl fmt::Display for ProcessDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, " PID  PPID  NAME              PRIORITY  STATE")?;
        for p in &self.processes {
            writeln!(
                f,
                "{:4}  {:4}  {:<17} {:<10}{}",
                p.pid,
                p.ppid.unwrap_or(0),
                p.name,
                p.priority,
                p.state
            )?;
        }
        Ok(())
    }
}

impl CriticalSection<'_> {
    /// Start the host thread for a reserved PID, install its PCB as the
    /// caller's newest child and make it runnable. Does not dispatch.
    pub(crate) fn install_process(
        &mut self,
        pid: ProcessId,
        name: &str,
        stack_size: usize,
        priority: u8,
        entry: ProcessEntry,
    ) -> std::io::Result<()> {
        let context = Context::spawn(self.kernel(), pid, name, stack_size, entry)?;
        let parent = self.caller();

        let mut pcb = Pcb::new(pid, name, priority, parent);
        pcb.context = Some(context);
        self.procs.insert(pcb);
        if let Some(parent) = parent {
            self.procs.link_child(parent, pid);
        }

        self.wake(pid, BlockReason::Runnable);
        debug!("Created process {} ({}) at priority {}", pid, name, priority);
        Ok(())
    }

    /// Block the caller for a caller-supplied reason and re-dispatch
    pub(crate) fn block_me(&mut self, reason: u32) {
        let Some(pid) = self.caller() else {
            self.fatal("block_me called outside of process context");
        };

        if reason <= MAX_RESERVED_BLOCK {
            self.fatal(format!(
                "process {} tried to block with reserved reason {}",
                pid, reason
            ));
        }

        if pid == BOOTSTRAP_PID {
            self.fatal("attempted to block init; fork a child process that blocks instead");
        }

        self.procs[pid].blocked = BlockReason::Other(reason);
        self.dispatch();
    }

    /// Make a process blocked for a caller-supplied reason runnable again
    pub(crate) fn unblock(&mut self, pid: ProcessId) -> ProcessResult<()> {
        let caller = self.caller();
        let reason = match self.procs.get(pid) {
            Some(p) if Some(pid) != caller && !p.is_zombie() && !p.blocked.is_reserved() => {
                p.blocked
            }
            _ => return Err(ProcessError::NotBlocked(pid)),
        };

        if !reason.is_blocked() {
            self.fatal(format!(
                "attempting to wake up process {}, which is already runnable, from process {:?}",
                pid, caller
            ));
        }

        self.wake(pid, reason);
        self.dispatch();
        Ok(())
    }
}

impl Kernel {
    /// Create a child of the calling process
    ///
    /// The child starts in `entry`; if `entry` returns, the child quits with
    /// the returned status. The new process is made runnable and the
    /// dispatcher decides whether it runs before this call returns.
    pub fn fork<F>(
        &self,
        name: &str,
        stack_size: usize,
        priority: u8,
        entry: F,
    ) -> ProcessResult<ProcessId>
    where
        F: FnOnce(&Kernel) -> i32 + Send + 'static,
    {
        if !(MAX_USER_PRIORITY..=MIN_USER_PRIORITY).contains(&priority) {
            return Err(ProcessError::InvalidPriority(priority));
        }
        self.spawn(name, stack_size, priority, Box::new(entry))
    }

    /// `fork` without the priority restriction, for kernel-owned processes
    pub(crate) fn spawn(
        &self,
        name: &str,
        stack_size: usize,
        priority: u8,
        entry: ProcessEntry,
    ) -> ProcessResult<ProcessId> {
        let (mut cs, _) = self.enter("fork");
        let config = self.config();

        if name.is_empty() || name.len() > config.max_name_len {
            return Err(ProcessError::InvalidName(name.to_string()));
        }
        if stack_size < config.min_stack_size {
            return Err(ProcessError::StackTooSmall(stack_size, config.min_stack_size));
        }
        if priority > IDLE_PRIORITY {
            return Err(ProcessError::InvalidPriority(priority));
        }

        let pid = cs.procs.allocate().ok_or(ProcessError::TableFull)?;
        if let Err(e) = cs.install_process(pid, name, stack_size, priority, entry) {
            cs.halt(HaltReason::Error(KernelError::Host(format!(
                "cannot start process {}: {}",
                name, e
            ))));
        }

        cs.dispatch();
        Ok(pid)
    }

    /// Wait for a child to terminate and collect it
    ///
    /// Returns the child's PID and status. When several children have
    /// already terminated, the one nearest the head of the child list
    /// (newest first) is collected.
    pub fn join(&self) -> ProcessResult<(ProcessId, i32)> {
        let (mut cs, me) = self.enter("join");

        if cs.procs[me].first_child.is_none() {
            return Err(ProcessError::NoChildren);
        }

        let child = loop {
            if let Some(child) = cs.procs.find_zombie_child(me) {
                break child;
            }
            cs.procs[me].blocked = BlockReason::WaitingForChild;
            cs.dispatch();
        };

        cs.procs.unlink_child(me, child);
        let Some(pcb) = cs.procs.remove(child) else {
            cs.fatal(format!("zombie child {} vanished from the process table", child));
        };
        let status = pcb.status.unwrap_or_default();
        drop(cs);

        debug!("Process {} joined child {} (status {})", me, child, status);
        if let Some(context) = pcb.context {
            context.reap();
        }

        Ok((child, status))
    }

    /// Terminate the calling process
    ///
    /// The caller must have no children left. Wakes a parent blocked in
    /// `join` and every process that zapped the caller. Never returns.
    pub fn quit(&self, status: i32) -> ! {
        let (mut cs, me) = self.enter("quit");

        if cs.procs[me].first_child.is_some() {
            cs.fatal(format!(
                "process {} called quit() while it still had children",
                me
            ));
        }

        cs.procs[me].status = Some(status);

        if let Some(parent) = cs.procs[me].parent {
            if cs.procs[parent].blocked == BlockReason::WaitingForChild {
                cs.wake(parent, BlockReason::WaitingForChild);
            }
        }

        for zapper in cs.procs.take_zappers(me) {
            cs.wake(zapper, BlockReason::WaitingForZapTarget);
        }

        debug!("Process {} quit with status {}", me, status);

        let now = cs.now();
        if let Err(fault) = cs.remove_current(now) {
            cs.fatal(fault.to_string());
        }
        cs.dispatch();
        drop(cs);

        thread::exit_thread(ProcessExit::Terminated)
    }

    /// Block until process `pid` terminates
    ///
    /// Zapping init, oneself, an unknown PID or a process that has already
    /// quit halts the kernel.
    pub fn zap(&self, pid: ProcessId) {
        let (mut cs, me) = self.enter("zap");

        if pid == BOOTSTRAP_PID {
            cs.fatal("attempt to zap() init");
        }
        if pid == me {
            cs.fatal("attempt to zap() itself");
        }
        match cs.procs.get(pid) {
            None => cs.fatal(format!("attempt to zap() non-existent process {}", pid)),
            Some(p) if p.is_zombie() => cs.fatal(format!(
                "attempt to zap() process {} which is already dying",
                pid
            )),
            Some(_) => {}
        }

        cs.procs.add_zapper(pid, me);
        cs.procs[me].blocked = BlockReason::WaitingForZapTarget;
        debug!("Process {} zapped process {}", me, pid);
        cs.dispatch();
    }

    /// Whether any process is waiting for the caller to terminate
    pub fn is_zapped(&self) -> bool {
        let (cs, me) = self.enter("is_zapped");
        cs.procs[me].first_zapper.is_some()
    }

    /// PID of the calling process
    pub fn getpid(&self) -> ProcessId {
        match thread::binding() {
            Some((kernel, pid)) if kernel == self.id() => pid,
            _ => panic!("getpid called outside of process context"),
        }
    }

    /// Block the caller with a caller-supplied reason (must exceed
    /// [`MAX_RESERVED_BLOCK`]) until another process unblocks it
    pub fn block_me(&self, reason: u32) {
        let (mut cs, _) = self.enter("block_me");
        cs.block_me(reason);
    }

    /// Make a process blocked by [`Kernel::block_me`] runnable again
    pub fn unblock_proc(&self, pid: ProcessId) -> ProcessResult<()> {
        let (mut cs, _) = self.enter("unblock_proc");
        cs.unblock(pid)
    }

    /// Snapshot of the process table
    pub fn dump_processes(&self) -> ProcessDump {
        let cs = self.lock();
        ProcessDump::capture(&cs.procs, cs.current)
    }
}
