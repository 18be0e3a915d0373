//! # Circular-queue lock
//!
//! The bounded variant. It's the [crate::ticket_lock] state machine plus a ring of turn flags,
//! one slot per `ticket % ring_size`. Admission is two-part:
//! 1. the window: `ticket - dequeued < ring_size`, at most `ring_size` tickets in flight
//! 2. the turn: the ticket's own slot is raised
//!
//! The window is what makes slot reuse safe: ticket `n + ring_size` shares a slot with ticket `n`
//! and must not mistake `n`'s raised flag for its own turn. It's also the backpressure:
//! drawing a ticket doesn't mean being served any time soon when the ring is full.
//!
//! Passing the turn on = lower our slot, raise the next one, bump the dequeue counter.
//! Readers do it on acquire (after counting themselves in), writers on release.

use std::{
    sync::atomic::{AtomicBool, Ordering::SeqCst},
    time::Duration,
};

use log::trace;

use crate::{
    config::{ConfigError, LockConfig},
    locker::RwpqLocker,
    state::{
        Access, LockSnapshot, LockState, SharedState, Ticket, PRIORITY_TARGET, READ_TARGET,
        WRITE_TARGET,
    },
};

pub struct RingLock {
    shared: SharedState,
    slots: Box<[AtomicBool]>,
}

impl RingLock {
    pub fn new(config: &LockConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let slots: Box<[AtomicBool]> = (0..config.ring_size)
            // the very first ticket's turn
            .map(|i| AtomicBool::new(i == 0))
            .collect();
        Ok(Self {
            shared: SharedState::new(config.poller()),
            slots,
        })
    }

    pub fn with_ring_size(ring_size: usize, poll_interval: Duration) -> Result<Self, ConfigError> {
        Self::new(
            &LockConfig::default()
                .with_ring_size(ring_size)
                .with_poll_interval(poll_interval),
        )
    }

    pub fn ring_size(&self) -> usize {
        self.slots.len()
    }

    fn slot(&self, ticket: Ticket) -> &AtomicBool {
        &self.slots[(ticket.value() % self.slots.len() as u64) as usize]
    }

    fn admit(&self, ticket: Ticket) {
        let ring_size = self.slots.len() as u64;
        self.shared
            .wait_until(|| ticket.value().wrapping_sub(self.shared.dequeued()) < ring_size);
        self.shared.wait_until(|| self.slot(ticket).load(SeqCst));
    }

    fn pass_turn(&self, ticket: Ticket) {
        // with a ring of 1 both are the same slot, the order leaves it raised
        self.slot(ticket).store(false, SeqCst);
        self.slot(ticket.next()).store(true, SeqCst);
    }

    // a parked state word only comes back once the priority caller let go
    fn wait_open(shared: &SharedState) {
        shared.wait_until(|| shared.is(LockState::Open));
    }
}

impl RwpqLocker for RingLock {
    fn r_lock(&self) {
        let ticket = self.shared.draw_ticket();
        trace!(target: READ_TARGET, "RLock [{ticket}] waiting...");
        self.admit(ticket);
        self.shared.claim(ticket, Access::Read, Self::wait_open);
        // count in first: if the next ticket is a writer, it has to see us
        self.shared.enter_reader();
        self.pass_turn(ticket);
        self.shared.advance_queue();
        trace!(target: READ_TARGET, "RLock acquired [{ticket}]");
    }

    fn lock(&self) -> Ticket {
        let ticket = self.shared.draw_ticket();
        trace!(target: WRITE_TARGET, "Lock [{ticket}] waiting...");
        self.admit(ticket);
        self.shared.wait_until(|| self.shared.no_active_readers());
        self.shared.claim(ticket, Access::Write, Self::wait_open);
        trace!(target: WRITE_TARGET, "Lock acquired [{ticket}]");
        ticket
    }

    fn p_lock(&self) {
        self.shared.acquire_priority(LockState::PriorityLocked);
    }

    fn r_unlock(&self) {
        self.shared.release_reader();
    }

    fn unlock(&self, ticket: Ticket) {
        trace!(target: WRITE_TARGET, "-------------------- Unlock [{ticket}]");
        self.pass_turn(ticket);
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

#[cfg(test)]
mod test {
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst},
            Barrier, Mutex,
        },
        thread::{scope, sleep},
        time::Duration,
    };

    use super::*;

    fn lock(ring_size: usize) -> RingLock {
        RingLock::with_ring_size(ring_size, Duration::from_millis(1)).unwrap()
    }

    fn raised(l: &RingLock) -> Vec<usize> {
        (0..l.ring_size())
            .filter(|&i| l.slots[i].load(SeqCst))
            .collect()
    }

    #[test]
    fn test_zero_ring_rejected() {
        assert_eq!(
            RingLock::with_ring_size(0, Duration::from_millis(1)).err(),
            Some(ConfigError::ZeroRingSize)
        );
    }

    #[test]
    fn test_sequential_writers_walk_the_ring() {
        let l = lock(4);
        assert_eq!(raised(&l), vec![0]);
        for expected in 0..4u64 {
            let ticket = l.lock();
            assert_eq!(ticket.value(), expected);
            // a writer doesn't touch the ring until it leaves
            assert_eq!(raised(&l), vec![expected as usize]);
            l.unlock(ticket);
        }
        // back at slot 0 for ticket 4
        assert_eq!(raised(&l), vec![0]);
        let ticket = l.lock();
        assert_eq!(ticket.value(), 4);
        l.unlock(ticket);
    }

    #[test]
    fn test_full_ring_applies_backpressure() {
        let l = lock(4);
        let order = Mutex::new(Vec::new());
        let head = l.lock();

        scope(|s| {
            for expected in 1..=4u64 {
                s.spawn(|| {
                    let guard = l.write();
                    let snapshot = guard.snapshot();
                    // admitted tickets are always inside the window
                    assert!(guard.ticket().value() - snapshot.dequeued < 4);
                    order.lock().unwrap().push(guard.ticket().value());
                });
                l.shared.wait_until(|| l.snapshot().issued == expected + 1);
            }

            // ticket 4 shares slot 0 with the head, only the window keeps it out
            sleep(Duration::from_millis(30));
            assert!(order.lock().unwrap().is_empty());
            assert_eq!(l.snapshot().in_flight(), 5);
            assert_eq!(l.snapshot().state, LockState::WriteLocked);

            l.unlock(head);
        });

        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4]);
        assert_eq!(l.snapshot().in_flight(), 0);
        assert_eq!(raised(&l), vec![1]);
    }

    #[test]
    fn test_readers_pipeline() {
        let l = lock(4);
        let barrier = Barrier::new(2);
        scope(|s| {
            for _ in 0..2 {
                s.spawn(|| {
                    let guard = l.read();
                    barrier.wait();
                    assert_eq!(guard.snapshot().active_readers, 2);
                    barrier.wait();
                });
            }
        });
        assert_eq!(l.snapshot().state, LockState::Open);
        assert_eq!(raised(&l), vec![2]);
    }

    #[test]
    fn test_writer_waits_for_pipelined_reader() {
        let l = lock(2);
        l.r_lock();
        let writing = AtomicUsize::new(0);

        scope(|s| {
            s.spawn(|| {
                let _guard = l.write();
                writing.store(1, SeqCst);
            });
            sleep(Duration::from_millis(30));
            // the writer is the queue head, but the reader is still in
            assert_eq!(l.snapshot().dequeued, 1);
            assert_eq!(writing.load(SeqCst), 0);
            l.r_unlock();
        });

        assert_eq!(writing.load(SeqCst), 1);
        assert_eq!(l.snapshot().state, LockState::Open);
    }

    #[test]
    fn test_ring_of_one() {
        let l = lock(1);
        scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..10 {
                        drop(l.read());
                        drop(l.write());
                    }
                });
            }
        });
        let snapshot = l.snapshot();
        assert_eq!(snapshot.issued, 80);
        assert_eq!(snapshot.in_flight(), 0);
        assert_eq!(raised(&l), vec![0]);
    }

    #[test]
    fn test_priority_bypasses_ring() {
        let l = lock(4);
        let order = Mutex::new(Vec::new());
        let head = l.lock();

        scope(|s| {
            s.spawn(|| {
                let _guard = l.write();
                order.lock().unwrap().push("writer");
            });
            l.shared.wait_until(|| l.snapshot().issued == 2);

            s.spawn(|| {
                let guard = l.priority();
                assert_eq!(guard.snapshot().state, LockState::PriorityLocked);
                order.lock().unwrap().push("priority");
            });
            l.shared.wait_until(|| l.snapshot().priority_waiting == 1);
            l.unlock(head);
        });

        assert_eq!(*order.lock().unwrap(), vec!["priority", "writer"]);
        assert_eq!(l.snapshot().state, LockState::Open);
        assert_eq!(l.snapshot().issued, 2);
    }

    #[test]
    fn test_priority_cuts_ahead_of_queued_reader() {
        let l = lock(4);
        let order = Mutex::new(Vec::new());
        let head = l.lock();

        scope(|s| {
            s.spawn(|| {
                let _guard = l.read();
                order.lock().unwrap().push("reader");
            });
            l.shared.wait_until(|| l.snapshot().issued == 2);

            s.spawn(|| {
                let _guard = l.priority();
                order.lock().unwrap().push("priority");
            });
            l.shared.wait_until(|| l.snapshot().priority_waiting == 1);
            l.unlock(head);
        });

        assert_eq!(*order.lock().unwrap(), vec!["priority", "reader"]);
        let snapshot = l.snapshot();
        assert_eq!(snapshot.state, LockState::Open);
        assert_eq!(snapshot.active_readers, 0);
        assert_eq!(snapshot.dequeued, 2);
        assert_eq!(raised(&l), vec![2]);
    }

    #[test]
    fn test_yielding_reader_waits_for_open() {
        let l = lock(4);
        let shared = &l.shared;
        let ticket = shared.draw_ticket();
        let yields = AtomicUsize::new(0);
        let claimed = AtomicBool::new(false);
        shared.announce_priority();

        scope(|s| {
            s.spawn(|| {
                shared.claim(ticket, Access::Read, |shared| {
                    yields.fetch_add(1, SeqCst);
                    RingLock::wait_open(shared);
                });
                claimed.store(true, SeqCst);
            });

            shared.wait_until(|| shared.is(LockState::PriorityReserved));
            assert!(shared.transition(LockState::PriorityReserved, LockState::PriorityLocked));
            shared.withdraw_priority();

            // even a read-locked state isn't enough once the reader has yielded
            assert!(shared.transition(LockState::PriorityLocked, LockState::ReadLocked));
            sleep(Duration::from_millis(30));
            assert!(!claimed.load(SeqCst));
            assert!(shared.transition(LockState::ReadLocked, LockState::Open));
        });

        assert!(claimed.load(SeqCst));
        assert_eq!(yields.load(SeqCst), 1);
        assert_eq!(l.snapshot().state, LockState::ReadLocked);
        assert_eq!(l.snapshot().priority_waiting, 0);
    }
}
