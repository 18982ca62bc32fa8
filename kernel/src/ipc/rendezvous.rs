//! Zero-Capacity Mailboxes
//!
//! A mailbox without slots carries no data; it only pairs a sender with a
//! receiver. Whichever side arrives second wakes the head of the opposite
//! queue and returns at once. The wake-up acts as a message travelling the
//! other way and is counted in `pending`. While anything is in flight, every
//! newcomer queues up, because the leftover waiter could be on either side.
//!
//! When a woken waiter consumes the last in-flight wake-up and finds both
//! queues occupied, it pairs their heads itself, so `pending` can reach two.

use super::{MailboxId, Side};
use crate::sys::CriticalSection;
use crate::{MailboxError, MailboxResult};

impl CriticalSection<'_> {
    /// Rendezvous on a zero-capacity mailbox from `side`
    pub(crate) fn rendezvous(
        &mut self,
        id: MailboxId,
        side: Side,
        conditional: bool,
    ) -> MailboxResult<()> {
        let theirs = side.opposite();
        let mb = &self.mailboxes.boxes[id];
        let must_wait = mb.pending > 0 || !mb.queue(side).is_empty() || mb.queue(theirs).is_empty();

        if !must_wait {
            self.mailboxes.boxes[id].pending += 1;
            self.wakeup_head(id, theirs);
            return Ok(());
        }

        if conditional {
            return Err(MailboxError::WouldBlock);
        }

        self.park(id, side)?;

        if self.mailboxes.boxes[id].pending == 0 {
            self.fatal(format!(
                "rendezvous on mailbox {} woke with nothing in flight",
                id
            ));
        }
        let mb = &mut self.mailboxes.boxes[id];
        mb.pending -= 1;

        let pair_next = mb.pending == 0 && !mb.queue(side).is_empty() && !mb.queue(theirs).is_empty();
        if pair_next {
            mb.pending += 2;
            let generation = mb.generation;
            self.wakeup_head(id, side);

            // the first wake-up may have switched away; the box can be gone
            if self.mailboxes.same_box(id, generation) {
                self.wakeup_head(id, theirs);
            }
        }

        Ok(())
    }
}
