//! Mail Slots
//!
//! Every mailbox stores its queued messages in slots taken from one pool of
//! fixed-size buffers shared by the whole kernel.

/// Index of a slot in the pool
pub type SlotId = usize;

#[derive(Debug)]
struct MailSlot {
    /// `None` while free; zero-length messages are valid
    len: Option<usize>,
    buf: Box<[u8]>,
    next: Option<SlotId>,
}

/// Shared pool of mail slots
#[derive(Debug)]
pub struct SlotPool {
    slots: Vec<MailSlot>,
    free: Vec<SlotId>,
}

impl SlotPool {
    /// `count` slots of `size` bytes each
    pub fn new(count: usize, size: usize) -> Self {
        let slots = (0..count)
            .map(|_| MailSlot {
                len: None,
                buf: vec![0u8; size].into_boxed_slice(),
                next: None,
            })
            .collect();

        Self {
            slots,
            // lowest ids are handed out first
            free: (0..count).rev().collect(),
        }
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of unused slots
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Copy `message` into a free slot
    pub fn claim(&mut self, message: &[u8]) -> Option<SlotId> {
        let id = self.free.pop()?;
        let slot = &mut self.slots[id];
        slot.buf[..message.len()].copy_from_slice(message);
        slot.len = Some(message.len());
        slot.next = None;
        Some(id)
    }

    /// Message held by a slot
    pub fn message(&self, id: SlotId) -> &[u8] {
        let slot = &self.slots[id];
        &slot.buf[..slot.len.unwrap_or(0)]
    }

    /// Return a slot to the pool
    pub fn release(&mut self, id: SlotId) {
        let slot = &mut self.slots[id];
        if slot.len.take().is_some() {
            slot.next = None;
            self.free.push(id);
        }
    }
}

/// FIFO of occupied slots belonging to one mailbox
#[derive(Debug, Clone, Copy, Default)]
pub struct SlotQueue {
    head: Option<SlotId>,
    tail: Option<SlotId>,
    len: usize,
}

impl SlotQueue {
    /// Number of queued messages
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no message is queued
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Append a claimed slot
    pub fn push_back(&mut self, pool: &mut SlotPool, id: SlotId) {
        pool.slots[id].next = None;
        match self.tail {
            Some(tail) => pool.slots[tail].next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.len += 1;
    }

    /// Detach the oldest slot (still claimed; the caller releases it)
    pub fn pop_front(&mut self, pool: &mut SlotPool) -> Option<SlotId> {
        let head = self.head?;
        self.head = pool.slots[head].next.take();
        if self.head.is_none() {
            self.tail = None;
        }
        self.len -= 1;
        Some(head)
    }
}
