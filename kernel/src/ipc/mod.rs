//! Inter-Process Communication (IPC)
//!
//! Bounded mailboxes are the kernel's only synchronization primitive:
//! - Blocking and conditional send/receive
//! - Zero-capacity mailboxes as pure rendezvous points
//! - Strict FIFO order on both the producer and the consumer side
//!
//! # Mailbox Layout
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │ Mailbox                                                  │
//! ├──────────────┬───────────────┬──────────────┬────────────┤
//! │ refcount     │ releasing     │ capacity     │ pending    │
//! ├──────────────┴───────────────┴──────────────┴────────────┤
//! │ producers: P ─► P ─► P        consumers: C ─► C          │
//! ├──────────────────────────────────────────────────────────┤
//! │ messages:  slot ─► slot ─► slot   (shared slot pool)     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Every blocked waiter pins its mailbox with a reference; a released
//! mailbox is only cleared once the last reference is dropped.

pub mod queue;
pub mod rendezvous;
pub mod slot;

pub use queue::{ProcQueue, WaitLinks};
pub use slot::{SlotId, SlotPool, SlotQueue};

use tracing::{debug, warn};

use crate::sys::{BlockReason, CriticalSection, ProcessId};
use crate::{Kernel, KernelConfig, MailboxError, MailboxResult};

/// Mailbox ID type
pub type MailboxId = usize;

/// Block code of a consumer waiting for a message
pub const BLOCKED_RECV: u32 = 11;

/// Block code of a producer waiting for room
pub const BLOCKED_SEND: u32 = 12;

/// Block code of either side of a zero-capacity mailbox
pub const BLOCKED_ZERO_SLOT: u32 = 13;

/// Which wait queue of a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Blocked senders
    Producers,
    /// Blocked receivers
    Consumers,
}

impl Side {
    /// The other queue
    pub fn opposite(self) -> Self {
        match self {
            Side::Producers => Side::Consumers,
            Side::Consumers => Side::Producers,
        }
    }
}

/// One mailbox table entry
#[derive(Debug, Clone, Default)]
pub struct Mailbox {
    /// Free for reuse when zero
    refcount: u32,
    /// Set by release; tells waiters to go away
    releasing: bool,
    /// Bumped on every create so stale ids can be told apart
    generation: u64,
    capacity: usize,
    max_message: usize,
    /// Queued messages, or in-flight wake-ups for zero-capacity boxes
    pending: usize,
    producers: ProcQueue,
    consumers: ProcQueue,
    messages: SlotQueue,
}

impl Mailbox {
    fn is_free(&self) -> bool {
        self.refcount == 0
    }

    fn is_live(&self) -> bool {
        self.refcount > 0 && !self.releasing
    }

    fn queue(&self, side: Side) -> &ProcQueue {
        match side {
            Side::Producers => &self.producers,
            Side::Consumers => &self.consumers,
        }
    }

    fn queue_mut(&mut self, side: Side) -> &mut ProcQueue {
        match side {
            Side::Producers => &mut self.producers,
            Side::Consumers => &mut self.consumers,
        }
    }
}

/// Observable state of one mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxInfo {
    /// Number of slots (0 = rendezvous)
    pub capacity: usize,
    /// Largest accepted message
    pub max_message: usize,
    /// Queued messages (in-flight wake-ups for rendezvous boxes)
    pub pending: usize,
    /// Owner plus one per parked waiter
    pub refcount: u32,
    /// Released but still pinned by waiters
    pub releasing: bool,
    /// Parked producers, head first
    pub producers: Vec<ProcessId>,
    /// Parked consumers, head first
    pub consumers: Vec<ProcessId>,
}

/// Mailbox table plus the shared slot pool
#[derive(Debug)]
pub struct MailboxTable {
    boxes: Vec<Mailbox>,
    slots: SlotPool,
    waiters: WaitLinks,
    max_message: usize,
}

impl MailboxTable {
    /// Tables sized by `config`
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            boxes: vec![Mailbox::default(); config.max_mailboxes],
            slots: SlotPool::new(config.max_slots, config.max_message),
            waiters: WaitLinks::new(config.max_processes),
            max_message: config.max_message,
        }
    }

    /// Allocate the lowest free mailbox
    pub fn create(&mut self, capacity: usize, max_message: usize) -> MailboxResult<MailboxId> {
        if max_message > self.max_message || capacity > self.slots.capacity() {
            return Err(MailboxError::InvalidGeometry {
                slots: capacity,
                size: max_message,
            });
        }

        let id = self
            .boxes
            .iter()
            .position(Mailbox::is_free)
            .ok_or(MailboxError::TableFull)?;

        let mb = &mut self.boxes[id];
        *mb = Mailbox {
            refcount: 1,
            generation: mb.generation.wrapping_add(1),
            capacity,
            max_message,
            ..Mailbox::default()
        };
        Ok(id)
    }

    fn live(&self, id: MailboxId) -> MailboxResult<&Mailbox> {
        self.boxes
            .get(id)
            .filter(|mb| mb.is_live())
            .ok_or(MailboxError::InvalidMailbox(id))
    }

    /// Whether `id` still names the mailbox created as `generation`
    fn same_box(&self, id: MailboxId, generation: u64) -> bool {
        self.boxes[id].refcount > 0 && self.boxes[id].generation == generation
    }

    /// Drop one reference; the last one clears the entry
    fn decrement_refcount(&mut self, id: MailboxId) {
        let mb = &mut self.boxes[id];
        mb.refcount = mb.refcount.saturating_sub(1);
        if mb.refcount == 0 {
            *mb = Mailbox {
                generation: mb.generation,
                ..Mailbox::default()
            };
        }
    }

    /// Number of mailboxes in use (including released ones still pinned)
    pub fn in_use(&self) -> usize {
        self.boxes.iter().filter(|mb| !mb.is_free()).count()
    }

    /// Unused slots in the shared pool
    pub fn free_slots(&self) -> usize {
        self.slots.available()
    }

    /// Snapshot of one mailbox
    pub fn info(&self, id: MailboxId) -> Option<MailboxInfo> {
        let mb = self.boxes.get(id).filter(|mb| !mb.is_free())?;
        Some(MailboxInfo {
            capacity: mb.capacity,
            max_message: mb.max_message,
            pending: mb.pending,
            refcount: mb.refcount,
            releasing: mb.releasing,
            producers: mb.producers.pids(&self.waiters),
            consumers: mb.consumers.pids(&self.waiters),
        })
    }
}

impl CriticalSection<'_> {
    /// Wake the head of one of a mailbox's queues, unless it is empty or
    /// already waking
    pub(crate) fn wakeup_head(&mut self, id: MailboxId, side: Side) {
        let Some(pid) = self.mailboxes.boxes[id].queue_mut(side).begin_wakeup() else {
            return;
        };
        if let Err(e) = self.unblock(pid) {
            self.fatal(format!("mailbox {}: cannot wake waiter {}: {}", id, pid, e));
        }
    }

    /// Park the caller on one side of a mailbox until it is woken.
    ///
    /// The mailbox is pinned while the caller waits. Returns
    /// [`MailboxError::Released`] if it was released in the meantime.
    pub(crate) fn park(&mut self, id: MailboxId, side: Side) -> MailboxResult<()> {
        let Some(me) = self.caller() else {
            self.fatal("mailbox wait outside of process context");
        };
        if self.mailboxes.waiters.is_waiting(me) {
            self.fatal(format!(
                "process {} parked on mailbox {} while already waiting elsewhere",
                me, id
            ));
        }

        let reason = {
            let table = &mut self.mailboxes;
            let mb = &mut table.boxes[id];
            mb.refcount += 1;
            mb.queue_mut(side).append(&mut table.waiters, me);
            block_reason(side, mb.capacity)
        };

        self.block_me(reason.code());

        let (removed, released) = {
            let table = &mut self.mailboxes;
            let mb = &mut table.boxes[id];
            let removed = mb.queue_mut(side).remove_self_from_head(&mut table.waiters, me);
            (removed, mb.releasing)
        };
        if !removed {
            self.fatal(format!(
                "process {} woke up but is not the woken head of mailbox {}",
                me, id
            ));
        }

        if released {
            self.wakeup_head(id, side);
        }
        self.mailboxes.decrement_refcount(id);

        if released {
            Err(MailboxError::Released)
        } else {
            Ok(())
        }
    }

    fn send(&mut self, id: MailboxId, message: &[u8], conditional: bool) -> MailboxResult<()> {
        let mb = self.mailboxes.live(id)?;
        if message.len() > mb.max_message {
            return Err(MailboxError::MessageTooLarge {
                size: message.len(),
                max: mb.max_message,
            });
        }

        if mb.capacity == 0 {
            if !message.is_empty() {
                return Err(MailboxError::MessageTooLarge {
                    size: message.len(),
                    max: 0,
                });
            }
            return self.rendezvous(id, Side::Producers, conditional);
        }

        if !mb.producers.is_empty() || mb.pending == mb.capacity {
            if conditional {
                return Err(MailboxError::WouldBlock);
            }
            self.park(id, Side::Producers)?;
        }

        let Some(slot) = self.mailboxes.slots.claim(message) else {
            warn!("Could not send to mailbox {}, the system is out of mailbox slots", id);
            return Err(MailboxError::OutOfSlots);
        };

        let generation = {
            let table = &mut self.mailboxes;
            let mb = &mut table.boxes[id];
            mb.messages.push_back(&mut table.slots, slot);
            mb.pending += 1;
            mb.generation
        };

        self.wakeup_head(id, Side::Consumers);

        // the wake-up may have switched away; re-read the mailbox
        if self.mailboxes.same_box(id, generation) {
            let mb = &self.mailboxes.boxes[id];
            if mb.pending < mb.capacity {
                self.wakeup_head(id, Side::Producers);
            }
        }

        Ok(())
    }

    fn receive(&mut self, id: MailboxId, buf: &mut [u8], conditional: bool) -> MailboxResult<usize> {
        let mb = self.mailboxes.live(id)?;

        if mb.capacity == 0 {
            self.rendezvous(id, Side::Consumers, conditional)?;
            return Ok(0);
        }

        if mb.pending == 0 || !mb.consumers.is_empty() {
            if conditional {
                return Err(MailboxError::WouldBlock);
            }
            self.park(id, Side::Consumers)?;
        }

        let (slot, generation) = {
            let table = &mut self.mailboxes;
            let mb = &mut table.boxes[id];
            let slot = mb.messages.pop_front(&mut table.slots);
            if slot.is_some() {
                mb.pending -= 1;
            }
            (slot, mb.generation)
        };
        let Some(slot) = slot else {
            self.fatal(format!("consumer woke on mailbox {} with no message queued", id));
        };

        let message = self.mailboxes.slots.message(slot);
        let result = if message.len() > buf.len() {
            Err(MailboxError::BufferTooSmall {
                size: message.len(),
                capacity: buf.len(),
            })
        } else {
            buf[..message.len()].copy_from_slice(message);
            Ok(message.len())
        };
        self.mailboxes.slots.release(slot);

        self.wakeup_head(id, Side::Producers);

        if self.mailboxes.same_box(id, generation) && self.mailboxes.boxes[id].pending > 0 {
            self.wakeup_head(id, Side::Consumers);
        }

        result
    }
}

impl Kernel {
    /// Create a mailbox of `slots` messages of at most `max_message` bytes.
    /// Zero slots makes a rendezvous mailbox.
    pub fn mbox_create(&self, slots: usize, max_message: usize) -> MailboxResult<MailboxId> {
        let (mut cs, me) = self.enter("mbox_create");
        let id = cs.mailboxes.create(slots, max_message)?;
        debug!(
            "Process {} created mailbox {} ({} slots of {} bytes)",
            me, id, slots, max_message
        );
        Ok(id)
    }

    /// Release a mailbox
    ///
    /// Queued messages are discarded and every process blocked on the
    /// mailbox returns [`MailboxError::Released`]. The id becomes reusable
    /// once the last of them has left.
    pub fn mbox_release(&self, id: MailboxId) -> MailboxResult<()> {
        let (mut cs, me) = self.enter("mbox_release");
        cs.mailboxes.live(id)?;

        {
            let table = &mut cs.mailboxes;
            let mb = &mut table.boxes[id];
            while let Some(slot) = mb.messages.pop_front(&mut table.slots) {
                table.slots.release(slot);
            }
            mb.pending = 0;
            mb.releasing = true;
        }

        cs.wakeup_head(id, Side::Producers);
        cs.wakeup_head(id, Side::Consumers);
        cs.mailboxes.decrement_refcount(id);

        debug!("Process {} released mailbox {}", me, id);
        Ok(())
    }

    /// Send a message, blocking while the mailbox is full
    pub fn mbox_send(&self, id: MailboxId, message: &[u8]) -> MailboxResult<()> {
        let (mut cs, _) = self.enter("mbox_send");
        cs.send(id, message, false)
    }

    /// Send a message, failing with [`MailboxError::WouldBlock`] instead of
    /// blocking
    pub fn mbox_cond_send(&self, id: MailboxId, message: &[u8]) -> MailboxResult<()> {
        let (mut cs, _) = self.enter("mbox_cond_send");
        cs.send(id, message, true)
    }

    /// Receive the oldest message into `buf`, blocking while the mailbox is
    /// empty. Returns the message length.
    ///
    /// A message longer than `buf` is discarded and reported as
    /// [`MailboxError::BufferTooSmall`].
    pub fn mbox_recv(&self, id: MailboxId, buf: &mut [u8]) -> MailboxResult<usize> {
        let (mut cs, _) = self.enter("mbox_recv");
        cs.receive(id, buf, false)
    }

    /// Receive without blocking
    pub fn mbox_cond_recv(&self, id: MailboxId, buf: &mut [u8]) -> MailboxResult<usize> {
        let (mut cs, _) = self.enter("mbox_cond_recv");
        cs.receive(id, buf, true)
    }

    /// Snapshot of a mailbox, if it is in use
    pub fn mbox_info(&self, id: MailboxId) -> Option<MailboxInfo> {
        self.lock().mailboxes.info(id)
    }
}

/// Block reason used by mailbox waits
pub fn block_reason(side: Side, capacity: usize) -> BlockReason {
    match (capacity, side) {
        (0, _) => BlockReason::Other(BLOCKED_ZERO_SLOT),
        (_, Side::Producers) => BlockReason::Other(BLOCKED_SEND),
        (_, Side::Consumers) => BlockReason::Other(BLOCKED_RECV),
    }
}
