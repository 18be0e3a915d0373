//! Fair reader/writer locks with a priority entrance.
//!
//! Readers and writers queue up by ticket and get served in arrival order, consecutive readers
//! side by side. A priority caller skips the queue and cuts in ahead of whoever hasn't finished
//! acquiring yet. Nothing blocks: every wait is a poll with a sleep in between.
//!
//! Two variants behind [RwpqLocker]:
//! - [TicketLock] - unbounded ticket queue
//! - [RingLock] - the same plus a ring of turn flags capping the tickets in flight

pub mod config;
pub mod driver;
pub mod locker;
pub mod logging;
pub mod ring_lock;
pub mod state;
pub mod ticket_lock;

pub use config::{ConfigError, LockConfig, Variant};
pub use locker::{PriorityGuard, ReadGuard, RwpqLocker, WriteGuard};
pub use ring_lock::RingLock;
pub use state::{LockSnapshot, LockState, Poller, Ticket};
pub use ticket_lock::TicketLock;
