//! # Ordered logger
//!
//! Threads hammering a lock log concurrently, and lines printed in arrival order read like
//! nonsense: an "acquired" before the "waiting" it answers, etc. This sink stamps every line
//! with its creation time, buffers a few, and prints them sorted by the stamp.
//! - more than `high_water` lines buffered => sort, print the oldest `batch`
//! - [OrderedLogger::flush_all] prints whatever is left, sorted
//!
//! It's a `log` backend: the locks emit plain `trace!`/`debug!` records with `rwpq::*` targets,
//! the logger colors them by lock kind.
//!
//! The level comes from the `LOG` environment variable, see [level_from_env].

use std::{
    env, fmt,
    io::{self, Write},
    sync::{
        atomic::{AtomicBool, Ordering::Relaxed},
        Mutex, MutexGuard, OnceLock, PoisonError,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

use crate::state::{PRIORITY_TARGET, READ_TARGET, WRITE_TARGET};

pub const DEFAULT_HIGH_WATER: usize = 10;
pub const DEFAULT_BATCH: usize = 5;

/// A message and the time it was created at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp_nanos: i64,
    pub message: String,
}

struct Buffer {
    lines: Vec<LogLine>,
    out: Box<dyn Write + Send>,
}

impl Buffer {
    fn sort(&mut self) {
        // stable => equal stamps keep their arrival order
        self.lines.sort_by_key(|line| line.timestamp_nanos);
    }

    fn print(&mut self, count: usize) {
        let count = count.min(self.lines.len());
        for line in self.lines.drain(..count) {
            // nowhere to report a failing log sink to
            let _ = writeln!(self.out, "{}", line.message);
        }
        let _ = self.out.flush();
    }
}

pub struct OrderedLogger {
    buffer: Mutex<Buffer>,
    silent: AtomicBool,
    level: LevelFilter,
    high_water: usize,
    batch: usize,
}

impl OrderedLogger {
    pub fn new(level: LevelFilter, out: Box<dyn Write + Send>) -> Self {
        Self {
            buffer: Mutex::new(Buffer {
                lines: Vec::new(),
                out,
            }),
            silent: AtomicBool::new(false),
            level,
            high_water: DEFAULT_HIGH_WATER,
            batch: DEFAULT_BATCH,
        }
    }

    pub fn stdout(level: LevelFilter) -> Self {
        Self::new(level, Box::new(io::stdout()))
    }

    /// `batch` is clamped to `1..=high_water + 1` so every dump makes progress
    pub fn with_batching(mut self, high_water: usize, batch: usize) -> Self {
        self.high_water = high_water;
        self.batch = batch.clamp(1, high_water.saturating_add(1));
        self
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Relaxed);
    }

    pub fn is_silent(&self) -> bool {
        self.silent.load(Relaxed)
    }

    /// Accepts one line. Prints nothing until the buffer grows past the high-water mark.
    pub fn push(&self, timestamp_nanos: i64, message: String) {
        if self.is_silent() {
            return;
        }
        let mut buffer = self.lock_buffer();
        buffer.lines.push(LogLine {
            timestamp_nanos,
            message,
        });
        if buffer.lines.len() > self.high_water {
            buffer.sort();
            buffer.print(self.batch);
        }
    }

    pub fn flush_all(&self) {
        let mut buffer = self.lock_buffer();
        buffer.sort();
        let count = buffer.lines.len();
        buffer.print(count);
    }

    pub fn buffered(&self) -> usize {
        self.lock_buffer().lines.len()
    }

    // a panic while printing doesn't make the lines any less printable
    fn lock_buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Log for OrderedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level && !self.is_silent()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let message = match color_code(record.target()) {
            Some(code) => with_color(record.args(), code),
            None => record.args().to_string(),
        };
        self.push(now_nanos(), message);
    }

    fn flush(&self) {
        self.flush_all();
    }
}

/// Nanoseconds since the epoch, saturating on the far ends
pub fn now_nanos() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since) => i64::try_from(since.as_nanos()).unwrap_or(i64::MAX),
        Err(before) => i64::try_from(before.duration().as_nanos())
            .map(|n| -n)
            .unwrap_or(i64::MIN),
    }
}

// ANSI: cyan readers, red writers, blue priority, the rest as is
fn color_code(target: &str) -> Option<u8> {
    match target {
        READ_TARGET => Some(36),
        WRITE_TARGET => Some(31),
        PRIORITY_TARGET => Some(34),
        _ => None,
    }
}

fn with_color(args: &fmt::Arguments, code: u8) -> String {
    format!("\u{1B}[{code}m{args}\u{1B}[0m")
}

/// `LOG=error|warn|info|debug|trace`, anything else turns logging off
pub fn level_from_env() -> LevelFilter {
    parse_level(env::var("LOG").ok().as_deref())
}

fn parse_level(value: Option<&str>) -> LevelFilter {
    match value.map(str::to_ascii_lowercase).as_deref() {
        Some("error") => LevelFilter::Error,
        Some("warn") => LevelFilter::Warn,
        Some("info") => LevelFilter::Info,
        Some("debug") => LevelFilter::Debug,
        Some("trace") => LevelFilter::Trace,
        _ => LevelFilter::Off,
    }
}

/// Installs a stdout [OrderedLogger] as the process-wide `log` backend.
///
/// Returns it so the caller can silence or flush it later. Fails if any logger
/// (this one included) was installed before.
pub fn init(level: LevelFilter) -> Result<&'static OrderedLogger, SetLoggerError> {
    static LOGGER: OnceLock<OrderedLogger> = OnceLock::new();
    let logger = LOGGER.get_or_init(|| OrderedLogger::stdout(level));
    log::set_logger(logger)?;
    log::set_max_level(level);
    Ok(logger)
}
