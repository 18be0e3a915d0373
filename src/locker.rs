//! # Reader / writer / priority locker
//!
//! The six operations both lock variants expose. They're raw: nothing stops a caller from
//! unlocking what it never locked, and a ticket that's drawn must be served or the lock wedges.
//! - a writer that never calls `unlock` starves everybody behind its ticket
//! - a reader that never calls `r_unlock` keeps writers waiting forever
//! - a bounded lock also wedges if a ticket holder never passes its ring slot on
//!
//! These are contract violations, the lock doesn't detect them.
//!
//! The guards below are the ergonomic way around it: drop releases exactly what was acquired.

use std::ops::Deref;

use crate::state::{LockSnapshot, Ticket};

pub trait RwpqLocker: Send + Sync {
    /// Shared access, in ticket order. Blocks.
    fn r_lock(&self);

    /// Exclusive access, in ticket order. Blocks. The ticket goes back to [RwpqLocker::unlock].
    fn lock(&self) -> Ticket;

    /// Exclusive access bypassing the ticket queue. Blocks.
    fn p_lock(&self);

    /// Releases one reader's shared access. Never blocks.
    fn r_unlock(&self);

    /// Releases exclusive access taken with [RwpqLocker::lock]. Never blocks.
    fn unlock(&self, ticket: Ticket);

    /// Releases exclusive access taken with [RwpqLocker::p_lock]. Never blocks.
    fn p_unlock(&self);

    fn snapshot(&self) -> LockSnapshot;

    fn read(&self) -> ReadGuard<'_, Self>
    where
        Self: Sized,
    {
        self.r_lock();
        ReadGuard { lock: self }
    }

    fn write(&self) -> WriteGuard<'_, Self>
    where
        Self: Sized,
    {
        let ticket = self.lock();
        WriteGuard { lock: self, ticket }
    }

    fn priority(&self) -> PriorityGuard<'_, Self>
    where
        Self: Sized,
    {
        self.p_lock();
        PriorityGuard { lock: self }
    }
}

/// Shared access held until drop
pub struct ReadGuard<'a, L: RwpqLocker + ?Sized> {
    lock: &'a L,
}

impl<L: RwpqLocker + ?Sized> Drop for ReadGuard<'_, L> {
    fn drop(&mut self) {
        self.lock.r_unlock();
    }
}

/// Exclusive access held until drop. Keeps the ticket `unlock` needs.
pub struct WriteGuard<'a, L: RwpqLocker + ?Sized> {
    lock: &'a L,
    ticket: Ticket,
}

impl<L: RwpqLocker + ?Sized> WriteGuard<'_, L> {
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }
}

impl<L: RwpqLocker + ?Sized> Drop for WriteGuard<'_, L> {
    fn drop(&mut self) {
        self.lock.unlock(self.ticket);
    }
}

/// Priority access held until drop
pub struct PriorityGuard<'a, L: RwpqLocker + ?Sized> {
    lock: &'a L,
}

impl<L: RwpqLocker + ?Sized> Drop for PriorityGuard<'_, L> {
    fn drop(&mut self) {
        self.lock.p_unlock();
    }
}

// let the guards peek at the lock they hold, e.g. for snapshots
impl<L: RwpqLocker + ?Sized> Deref for ReadGuard<'_, L> {
    type Target = L;
    fn deref(&self) -> &Self::Target {
        self.lock
    }
}

impl<L: RwpqLocker + ?Sized> Deref for WriteGuard<'_, L> {
    type Target = L;
    fn deref(&self) -> &Self::Target {
        self.lock
    }
}

impl<L: RwpqLocker + ?Sized> Deref for PriorityGuard<'_, L> {
    type Target = L;
    fn deref(&self) -> &Self::Target {
        self.lock
    }
}
