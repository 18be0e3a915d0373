//! Lock configuration: how long to sleep between probes and how big the admission ring is.
//!
//! Either built in code with the `with_*` setters or read from the environment:
//! - `RWPQ_POLL_NS` - polling interval in nanoseconds
//! - `RWPQ_MAX_BACKOFF_NS` - cap of the exponential backoff in nanoseconds, unset means no backoff
//! - `RWPQ_RING_SIZE` - max tickets in flight for the ring lock

use std::{env, str::FromStr, sync::Arc, time::Duration};

use strum_macros::{Display, EnumIter, EnumString};
use thiserror::Error;

use crate::{locker::RwpqLocker, ring_lock::RingLock, state::Poller, ticket_lock::TicketLock};

pub const POLL_ENV: &str = "RWPQ_POLL_NS";
pub const MAX_BACKOFF_ENV: &str = "RWPQ_MAX_BACKOFF_NS";
pub const RING_SIZE_ENV: &str = "RWPQ_RING_SIZE";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("ring size must be at least 1")]
    ZeroRingSize,
    #[error("max backoff {max_backoff:?} is shorter than the polling interval {interval:?}")]
    BackoffBelowInterval {
        interval: Duration,
        max_backoff: Duration,
    },
    #[error("can't parse {name}={value}")]
    InvalidEnv { name: &'static str, value: String },
    #[error(transparent)]
    UnknownVariant(#[from] strum::ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    pub poll_interval: Duration,
    pub max_backoff: Option<Duration>,
    pub ring_size: usize,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_micros(1),
            max_backoff: None,
            ring_size: 4,
        }
    }
}

impl LockConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_backoff(mut self, max_backoff: Duration) -> Self {
        self.max_backoff = Some(max_backoff);
        self
    }

    pub fn with_ring_size(mut self, ring_size: usize) -> Self {
        self.ring_size = ring_size;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_size == 0 {
            return Err(ConfigError::ZeroRingSize);
        }
        match self.max_backoff {
            Some(max_backoff) if max_backoff < self.poll_interval => {
                Err(ConfigError::BackoffBelowInterval {
                    interval: self.poll_interval,
                    max_backoff,
                })
            }
            _ => Ok(()),
        }
    }

    /// Defaults overridden by whatever is set in the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    // split from from_env so tests don't have to touch the process environment
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ns) = parse_var::<u64>(&lookup, POLL_ENV)? {
            config.poll_interval = Duration::from_nanos(ns);
        }
        if let Some(ns) = parse_var::<u64>(&lookup, MAX_BACKOFF_ENV)? {
            config.max_backoff = Some(Duration::from_nanos(ns));
        }
        if let Some(size) = parse_var::<usize>(&lookup, RING_SIZE_ENV)? {
            config.ring_size = size;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn poller(&self) -> Poller {
        Poller::new(self.poll_interval, self.max_backoff)
    }
}

fn parse_var<Y: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Y>, ConfigError> {
    lookup(name)
        .map(|value| {
            value
                .trim()
                .parse::<Y>()
                .map_err(|_| ConfigError::InvalidEnv { name, value })
        })
        .transpose()
}

/// The two lock algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIter, EnumString, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Variant {
    /// unbounded, [TicketLock]
    Ticket,
    /// bounded by the admission ring, [RingLock]
    Ring,
}

impl Variant {
    pub fn build(self, config: &LockConfig) -> Result<Arc<dyn RwpqLocker>, ConfigError> {
        Ok(match self {
            Variant::Ticket => {
                config.validate()?;
                Arc::new(TicketLock::new(config))
            }
            Variant::Ring => Arc::new(RingLock::new(config)?),
        })
    }
}
