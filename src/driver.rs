//! # Load driver
//!
//! Throws readers, writers and priority lockers at a lock for a while and counts how many
//! acquisitions of each kind went through. Every worker loops:
//! acquire -> count -> hold -> release -> pause, until stopped.
//!
//! While holding, each worker also checks it's alone (or among readers only).
//! A violation is counted, not panicked on. Readers next to priority lockers can produce some,
//! see the notes on `PriorityReserved` in [crate::state].

use std::{
    fmt,
    sync::{
        atomic::{
            AtomicBool, AtomicU64, AtomicUsize,
            Ordering::{Relaxed, SeqCst},
        },
        Arc, Mutex, PoisonError,
    },
    thread::{self, sleep, JoinHandle},
    time::Duration,
};

use log::{info, warn};

use crate::locker::RwpqLocker;

/// How many workers of each kind and how they pace themselves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub readers: usize,
    pub writers: usize,
    pub priority: usize,
    pub read_hold: Duration,
    pub read_pause: Duration,
    pub write_hold: Duration,
    pub write_pause: Duration,
    pub priority_hold: Duration,
    pub priority_pause: Duration,
    /// delay between starting two readers or two writers
    pub spawn_stagger: Duration,
    /// delay between starting two priority lockers
    pub priority_stagger: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        let tick = Duration::from_micros(1);
        Self {
            readers: 64,
            writers: 32,
            priority: 2,
            read_hold: tick,
            read_pause: tick * 30,
            write_hold: tick,
            write_pause: tick * 100,
            priority_hold: tick * 3,
            priority_pause: tick * 10_000,
            spawn_stagger: tick / 4,
            priority_stagger: tick * 16,
        }
    }
}

/// What a run managed to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadReport {
    pub reads: u64,
    pub writes: u64,
    pub priorities: u64,
    pub exclusion_violations: u64,
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rlocks, {} locks, {} plocks",
            self.reads, self.writes, self.priorities
        )?;
        if self.exclusion_violations > 0 {
            write!(f, ", {} exclusion violations", self.exclusion_violations)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    writes: AtomicU64,
    priorities: AtomicU64,
    violations: AtomicU64,
    // occupancy, to catch overlapping access
    readers_inside: AtomicUsize,
    writers_inside: AtomicUsize,
    stop: AtomicBool,
}

impl Counters {
    fn stopped(&self) -> bool {
        self.stop.load(Relaxed)
    }

    fn enter_shared(&self) {
        self.readers_inside.fetch_add(1, SeqCst);
        if self.writers_inside.load(SeqCst) != 0 {
            self.violation();
        }
    }

    fn leave_shared(&self) {
        self.readers_inside.fetch_sub(1, SeqCst);
    }

    fn enter_exclusive(&self) {
        if self.writers_inside.fetch_add(1, SeqCst) != 0 || self.readers_inside.load(SeqCst) != 0 {
            self.violation();
        }
    }

    fn leave_exclusive(&self) {
        self.writers_inside.fetch_sub(1, SeqCst);
    }

    fn violation(&self) {
        warn!("exclusion violated");
        self.violations.fetch_add(1, Relaxed);
    }

    fn report(&self) -> LoadReport {
        LoadReport {
            reads: self.reads.load(Relaxed),
            writes: self.writes.load(Relaxed),
            priorities: self.priorities.load(Relaxed),
            exclusion_violations: self.violations.load(Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Role {
    Reader,
    Writer,
    Priority,
}

pub struct LoadDriver {
    counters: Arc<Counters>,
    spawners: Vec<JoinHandle<()>>,
    workers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl LoadDriver {
    /// Starts the workers in the background. Readers, writers and priority lockers
    /// are started by three spawners at once, each staggering its own kind.
    pub fn start<L>(lock: Arc<L>, config: DriverConfig) -> Self
    where
        L: RwpqLocker + ?Sized + 'static,
    {
        let counters = Arc::new(Counters::default());
        let workers = Arc::new(Mutex::new(Vec::new()));
        let config = Arc::new(config);

        let spawners = [
            (Role::Reader, config.readers, config.spawn_stagger),
            (Role::Writer, config.writers, config.spawn_stagger),
            (Role::Priority, config.priority, config.priority_stagger),
        ]
        .into_iter()
        .map(|(role, count, stagger)| {
            let lock = lock.clone();
            let counters = counters.clone();
            let workers = workers.clone();
            let config = config.clone();
            thread::spawn(move || {
                for _ in 0..count {
                    if counters.stopped() {
                        return;
                    }
                    let worker = {
                        let lock = lock.clone();
                        let counters = counters.clone();
                        let config = config.clone();
                        thread::spawn(move || work(role, &*lock, &counters, &config))
                    };
                    workers
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(worker);
                    sleep(stagger);
                }
            })
        })
        .collect();

        Self {
            counters,
            spawners,
            workers,
        }
    }

    pub fn report(&self) -> LoadReport {
        self.counters.report()
    }

    /// Stops every worker after its current round and waits for all of them.
    pub fn stop(self) -> LoadReport {
        self.counters.stop.store(true, Relaxed);
        for spawner in self.spawners {
            // a spawner only panics when a thread fails to spawn, keep joining the rest
            let _ = spawner.join();
        }
        let workers =
            std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        for worker in workers {
            if worker.join().is_err() {
                warn!("a load worker panicked");
            }
        }
        let report = self.counters.report();
        info!("load stopped: {report}");
        report
    }

    pub fn run_for<L>(lock: Arc<L>, config: DriverConfig, duration: Duration) -> LoadReport
    where
        L: RwpqLocker + ?Sized + 'static,
    {
        let driver = Self::start(lock, config);
        sleep(duration);
        driver.stop()
    }
}

fn work<L: RwpqLocker + ?Sized>(role: Role, lock: &L, counters: &Counters, config: &DriverConfig) {
    while !counters.stopped() {
        match role {
            Role::Reader => {
                lock.r_lock();
                counters.enter_shared();
                counters.reads.fetch_add(1, Relaxed);
                sleep(config.read_hold);
                counters.leave_shared();
                lock.r_unlock();
                sleep(config.read_pause);
            }
            Role::Writer => {
                let ticket = lock.lock();
                counters.enter_exclusive();
                counters.writes.fetch_add(1, Relaxed);
                sleep(config.write_hold);
                counters.leave_exclusive();
                lock.unlock(ticket);
                sleep(config.write_pause);
            }
            Role::Priority => {
                lock.p_lock();
                counters.enter_exclusive();
                counters.priorities.fetch_add(1, Relaxed);
                sleep(config.priority_hold);
                counters.leave_exclusive();
                lock.p_unlock();
                sleep(config.priority_pause);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        config::{LockConfig, Variant},
        state::LockState,
    };
    use strum::IntoEnumIterator;

    fn small() -> DriverConfig {
        DriverConfig {
            readers: 6,
            writers: 3,
            priority: 0,
            ..DriverConfig::default()
        }
    }

    #[test]
    fn test_report_display() {
        let mut report = LoadReport {
            reads: 3,
            writes: 2,
            priorities: 1,
            exclusion_violations: 0,
        };
        assert_eq!(report.to_string(), "3 rlocks, 2 locks, 1 plocks");
        report.exclusion_violations = 4;
        assert_eq!(
            report.to_string(),
            "3 rlocks, 2 locks, 1 plocks, 4 exclusion violations"
        );
    }

    #[test]
    fn test_readers_and_writers_stay_exclusive() {
        let config = LockConfig::default().with_poll_interval(Duration::from_micros(20));
        for variant in Variant::iter() {
            let lock = variant.build(&config).unwrap();
            let report = LoadDriver::run_for(lock.clone(), small(), Duration::from_millis(300));

            assert!(report.reads > 0, "{variant}: {report}");
            assert!(report.writes > 0, "{variant}: {report}");
            assert_eq!(report.priorities, 0);
            assert_eq!(report.exclusion_violations, 0, "{variant}: {report}");

            // every drawn ticket got served
            let snapshot = lock.snapshot();
            assert_eq!(snapshot.in_flight(), 0);
            assert_eq!(snapshot.active_readers, 0);
            assert_eq!(snapshot.state, LockState::Open);
        }
    }

    #[test]
    fn test_priority_lockers_get_through() {
        let config = LockConfig::default().with_poll_interval(Duration::from_micros(20));
        let driver_config = DriverConfig {
            readers: 0,
            writers: 4,
            priority: 2,
            priority_pause: Duration::from_millis(1),
            ..DriverConfig::default()
        };
        for variant in Variant::iter() {
            let lock = variant.build(&config).unwrap();
            let report = LoadDriver::run_for(
                lock.clone(),
                driver_config.clone(),
                Duration::from_millis(300),
            );

            assert!(report.priorities > 0, "{variant}: {report}");
            assert!(report.writes > 0, "{variant}: {report}");
            assert_eq!(report.exclusion_violations, 0, "{variant}: {report}");
            assert_eq!(lock.snapshot().priority_waiting, 0);
        }
    }
}
