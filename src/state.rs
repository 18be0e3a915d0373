//! # Shared lock state
//!
//! The substrate both lock variants are made of: one atomic state word, the ticket dispenser,
//! the dequeue counter, the active-readers counter and the priority-waiting counter.
//! There's no queuing logic here, only the transitions of the state machine:
//!
//! ```text
//! Open -> ReadLocked | WriteLocked | PriorityLocked -> Open
//!           \-> PriorityReserved -> (priority caller) -> Open
//! ```
//!
//! `PriorityReserved` is a detour a ticket holder takes when it notices a priority caller
//! right after winning the state word. It parks the state there with a plain store, not a CAS.
//! That store may race with the CAS of a reader fanning into `ReadLocked`, so a priority caller
//! can end up holding the lock next to readers that were already active.
//! Nothing here guards against it.
//!
//! ## Memory ordering
//!
//! Everything is SeqCst. The priority handshake is a Dekker-style store-then-load pair:
//! - the priority caller bumps `priority_waiting` then CASes the state word
//! - the ticket holder CASes the state word then loads `priority_waiting`
//!
//! Acquire/Release doesn't forbid both sides from missing each other's store here,
//! a single total order does.
//!
//! ## Waiting
//!
//! Nothing blocks, every wait is a [Poller] probing a condition with a sleep in between.

use std::{
    fmt,
    sync::atomic::{
        AtomicU32, AtomicU64, AtomicUsize,
        Ordering::{Relaxed, SeqCst},
    },
    thread::sleep,
    time::Duration,
};

use crossbeam_utils::Backoff;
use log::{debug, trace};
use strum_macros::{Display, FromRepr};

/// The value of the state word. Exactly one holds at any instant.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[strum(serialize_all = "snake_case")]
pub enum LockState {
    Open = 0,
    ReadLocked = 1,
    WriteLocked = 2,
    PriorityLocked = 3,
    PriorityReserved = 4,
}

/// Arrival order of a reader or a writer. Drawn once, never reused.
///
/// Writers get theirs back from `lock` and hand it to `unlock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ticket(u64);

impl Ticket {
    pub fn value(self) -> u64 {
        self.0
    }

    pub(crate) fn next(self) -> Ticket {
        Ticket(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Ticket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A point-in-time view of the counters, for diagnostics.
///
/// The fields are loaded one by one, so they aren't consistent with each other under contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSnapshot {
    pub state: LockState,
    /// tickets drawn so far == the next ticket to be drawn
    pub issued: u64,
    /// the ticket allowed through admission next
    pub dequeued: u64,
    pub active_readers: usize,
    pub priority_waiting: usize,
}

impl LockSnapshot {
    /// tickets drawn but not yet dequeued
    pub fn in_flight(&self) -> u64 {
        self.issued.wrapping_sub(self.dequeued)
    }
}

/// Bounded-delay waiting: probe, sleep, probe again.
///
/// - a zero interval never sleeps, it spins then yields via [Backoff::snooze]
/// - with `max_backoff`, the sleep doubles after every failed probe up to the cap
#[derive(Debug, Clone, Copy)]
pub struct Poller {
    interval: Duration,
    max_backoff: Option<Duration>,
}

impl Poller {
    pub fn new(interval: Duration, max_backoff: Option<Duration>) -> Self {
        Self {
            interval,
            max_backoff,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns once `ready` returned true. Waits forever otherwise.
    pub fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        if ready() {
            return;
        }

        if self.interval.is_zero() {
            let backoff = Backoff::new();
            while !ready() {
                backoff.snooze();
            }
            return;
        }

        let mut delay = self.interval;
        loop {
            sleep(delay);
            if ready() {
                return;
            }
            if let Some(cap) = self.max_backoff {
                delay = delay.saturating_mul(2).min(cap);
            }
        }
    }
}

/// Which kind of access a ticket holder is claiming the state word for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Access {
    Read,
    Write,
}

impl Access {
    pub(crate) fn target(self) -> &'static str {
        match self {
            Access::Read => READ_TARGET,
            Access::Write => WRITE_TARGET,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Access::Read => "RLock",
            Access::Write => "Lock",
        }
    }
}

// log targets, the ordered logger colors lines by them
pub const READ_TARGET: &str = "rwpq::read";
pub const WRITE_TARGET: &str = "rwpq::write";
pub const PRIORITY_TARGET: &str = "rwpq::priority";
pub const STATE_TARGET: &str = "rwpq::state";

/// All the atomics a lock is made of. Created once, shared by reference with every caller.
pub(crate) struct SharedState {
    state: AtomicU32,
    ticket: AtomicU64,
    dequeued: AtomicU64,
    active_readers: AtomicUsize,
    priority_waiting: AtomicUsize,
    poller: Poller,
}

impl SharedState {
    pub(crate) fn new(poller: Poller) -> Self {
        Self {
            state: AtomicU32::new(LockState::Open as u32),
            ticket: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            active_readers: AtomicUsize::new(0),
            priority_waiting: AtomicUsize::new(0),
            poller,
        }
    }

    pub(crate) fn wait_until(&self, ready: impl FnMut() -> bool) {
        self.poller.wait_until(ready)
    }

    pub(crate) fn state(&self) -> LockState {
        let raw = self.state.load(SeqCst);
        // only LockState discriminants are ever stored
        LockState::from_repr(raw).unwrap_or_else(|| unreachable!("corrupted lock state {raw}"))
    }

    pub(crate) fn is(&self, state: LockState) -> bool {
        self.state.load(SeqCst) == state as u32
    }

    /// CAS `from -> to`, true if it took place
    pub(crate) fn transition(&self, from: LockState, to: LockState) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, SeqCst, SeqCst)
            .is_ok()
    }

    /// Unconditional release. Whoever holds the lock exclusively owns the state word.
    pub(crate) fn open(&self) {
        trace!(target: STATE_TARGET, "LOCK: OPEN...");
        self.state.store(LockState::Open as u32, SeqCst);
    }

    pub(crate) fn draw_ticket(&self) -> Ticket {
        // wraps on overflow, all ticket comparisons are wrapping too
        Ticket(self.ticket.fetch_add(1, SeqCst))
    }

    pub(crate) fn dequeued(&self) -> u64 {
        self.dequeued.load(SeqCst)
    }

    pub(crate) fn advance_queue(&self) {
        self.dequeued.fetch_add(1, SeqCst);
    }

    pub(crate) fn is_head(&self, ticket: Ticket) -> bool {
        self.dequeued() == ticket.value()
    }

    pub(crate) fn enter_reader(&self) {
        self.active_readers.fetch_add(1, SeqCst);
    }

    pub(crate) fn no_active_readers(&self) -> bool {
        self.active_readers.load(SeqCst) == 0
    }

    /// Drops one reader. The one that brings the count to zero reopens the lock.
    ///
    /// Reopening is a CAS from `ReadLocked`: if a priority caller already took the state word
    /// away from the readers, it stays with the priority caller.
    pub(crate) fn release_reader(&self) -> usize {
        let remaining = self.active_readers.fetch_sub(1, SeqCst).wrapping_sub(1);
        trace!(target: READ_TARGET, "-------------------- RUnlock ({remaining} remaining)");
        if remaining == 0 && self.transition(LockState::ReadLocked, LockState::Open) {
            trace!(target: STATE_TARGET, "LOCK: OPEN...");
        }
        remaining
    }

    fn try_enter(&self, access: Access) -> bool {
        match access {
            // readers fan into an already read-locked state
            Access::Read => {
                self.is(LockState::ReadLocked)
                    || self.transition(LockState::Open, LockState::ReadLocked)
            }
            Access::Write => self.transition(LockState::Open, LockState::WriteLocked),
        }
    }

    /// The state half of an acquisition, for a ticket that already passed admission.
    ///
    /// Spins until the state word is won, then gives it up to any announced priority caller
    /// by parking it in `PriorityReserved`. `after_yield` runs right after parking, before the
    /// next attempt.
    pub(crate) fn claim(&self, ticket: Ticket, access: Access, after_yield: impl Fn(&Self)) {
        loop {
            self.wait_until(|| self.try_enter(access));
            if self.priority_waiting.load(SeqCst) == 0 {
                return;
            }
            debug!(
                target: access.target(),
                "{} [{ticket}] yielding to priority locker...",
                access.name()
            );
            self.state.store(LockState::PriorityReserved as u32, SeqCst);
            after_yield(self);
        }
    }

    /// The whole priority acquisition: announce, then take the state word from either an open
    /// lock or a ticket holder that parked it. Priority callers race each other unordered.
    pub(crate) fn acquire_priority(&self, held: LockState) {
        self.announce_priority();
        trace!(target: PRIORITY_TARGET, "PLock waiting...");
        self.wait_until(|| {
            self.transition(LockState::Open, held)
                || self.transition(LockState::PriorityReserved, held)
        });
        trace!(target: PRIORITY_TARGET, "PLock acquired.");
        self.withdraw_priority();
    }

    /// From here on every ticket holder that wins the state word parks it for us.
    pub(crate) fn announce_priority(&self) {
        self.priority_waiting.fetch_add(1, SeqCst);
    }

    pub(crate) fn withdraw_priority(&self) {
        self.priority_waiting.fetch_sub(1, SeqCst);
    }

    pub(crate) fn snapshot(&self) -> LockSnapshot {
        LockSnapshot {
            state: self.state(),
            issued: self.ticket.load(Relaxed),
            dequeued: self.dequeued.load(Relaxed),
            active_readers: self.active_readers.load(Relaxed),
            priority_waiting: self.priority_waiting.load(Relaxed),
        }
    }
}
