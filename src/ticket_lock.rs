//! # Ticket-queue lock
//!
//! The unbounded variant. Every reader and writer draws a ticket and waits until the dequeue
//! counter reaches it, so they get through one at a time in arrival order.
//!
//! The asymmetry is the whole trick:
//! - a reader advances the dequeue counter as soon as it's in => the next ticket starts its own
//!   admission while the reader still reads, so consecutive readers pipeline
//! - a writer keeps the queue head until `unlock` => nobody behind it gets admitted meanwhile
//!
//! There's no bound on how far ahead tickets may be drawn, see [crate::ring_lock] for that.

use std::time::Duration;

use log::trace;

use crate::{
    config::LockConfig,
    locker::RwpqLocker,
    state::{
        Access, LockSnapshot, LockState, SharedState, Ticket, PRIORITY_TARGET, READ_TARGET,
        WRITE_TARGET,
    },
};

pub struct TicketLock {
    shared: SharedState,
}

impl TicketLock {
    /// The ring size of the config is ignored, there's no ring here.
    pub fn new(config: &LockConfig) -> Self {
        Self {
            shared: SharedState::new(config.poller()),
        }
    }

    pub fn with_interval(poll_interval: Duration) -> Self {
        Self::new(&LockConfig::default().with_poll_interval(poll_interval))
    }

    fn admit(&self, ticket: Ticket) {
        self.shared.wait_until(|| self.shared.is_head(ticket));
    }
}

impl Default for TicketLock {
    fn default() -> Self {
        Self::new(&LockConfig::default())
    }
}

impl RwpqLocker for TicketLock {
    fn r_lock(&self) {
        let ticket = self.shared.draw_ticket();
        trace!(target: READ_TARGET, "RLock [{ticket}] waiting...");
        self.admit(ticket);
        // after a yield the ticket is still the head, only the state has to be won again
        self.shared.claim(ticket, Access::Read, |_| {});
        // count ourselves in before letting the next ticket through,
        // a writer right behind us waits for the count to drop to zero
        self.shared.enter_reader();
        self.shared.advance_queue();
        trace!(target: READ_TARGET, "RLock acquired [{ticket}]");
    }

    fn lock(&self) -> Ticket {
        let ticket = self.shared.draw_ticket();
        trace!(target: WRITE_TARGET, "Lock [{ticket}] waiting...");
        self.admit(ticket);
        // pipelined readers ahead of us may still be reading
        self.shared.wait_until(|| self.shared.no_active_readers());
        self.shared.claim(ticket, Access::Write, |_| {});
        trace!(target: WRITE_TARGET, "Lock acquired [{ticket}]");
        ticket
    }

    fn p_lock(&self) {
        self.shared.acquire_priority(LockState::WriteLocked);
    }

    fn r_unlock(&self) {
        self.shared.release_reader();
    }

    fn unlock(&self, ticket: Ticket) {
        trace!(target: WRITE_TARGET, "-------------------- Unlock [{ticket}]");
        self.shared.open();
        self.shared.advance_queue();
    }

    fn p_unlock(&self) {
        trace!(target: PRIORITY_TARGET, "-------------------- PUnlock");
        self.shared.open();
    }

    fn snapshot(&self) -> LockSnapshot {
        self.shared.snapshot()
    }
}
