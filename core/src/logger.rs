//! Global logging for the loader
//!
//! One `log::Log` implementation backs the whole loader. Every record is
//! kept in a small ring of recent lines and, while a console is attached,
//! echoed to it. Both paths avoid blocking on a lock held further up the
//! stack so that a log call made from inside a console write (or from a
//! layer already holding references into the memory manager) never
//! deadlocks.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::{self, Write};

use log::{LevelFilter, Log, Metadata, Record};
use spin::{Mutex, RwLock};

use crate::platform::Console;

const LINE_CAPACITY: usize = 160;
const MAX_LOG_ENTRIES: usize = 64;

#[derive(Clone, Copy)]
struct Line {
    len: usize,
    buf: [u8; LINE_CAPACITY],
}

impl Line {
    const EMPTY: Line = Line {
        len: 0,
        buf: [0; LINE_CAPACITY],
    };

    fn as_str(&self) -> &str {
        // Truncation in write_str only ever cuts on a char boundary.
        core::str::from_utf8(&self.buf[..self.len]).unwrap_or("")
    }
}

impl Write for Line {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - self.len;
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

struct Ring {
    lines: [Line; MAX_LOG_ENTRIES],
    next: usize,
    count: usize,
}

impl Ring {
    const fn new() -> Self {
        Self {
            lines: [Line::EMPTY; MAX_LOG_ENTRIES],
            next: 0,
            count: 0,
        }
    }

    fn push(&mut self, line: &Line) {
        self.lines[self.next] = *line;
        self.next = (self.next + 1) % MAX_LOG_ENTRIES;
        self.count = (self.count + 1).min(MAX_LOG_ENTRIES);
    }
}

static RING: Mutex<Ring> = Mutex::new(Ring::new());
static SINK: RwLock<Option<&'static dyn Console>> = RwLock::new(None);
static LOGGER: LoaderLogger = LoaderLogger;

struct LoaderLogger;

impl Log for LoaderLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let mut line = Line::EMPTY;
        let _ = write!(line, "[{}] {}", record.level(), record.args());

        if let Some(mut ring) = RING.try_lock() {
            ring.push(&line);
        }

        // Readers never exclude each other, so a nested call lands here too.
        if let Some(console) = *SINK.read() {
            console.write_str(line.as_str());
            console.write_str("\n");
        }
    }

    fn flush(&self) {}
}

/// Install the loader logger. Safe to call more than once.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Info);
    }
}

/// Route log output to `console` from now on.
pub fn attach(console: &'static dyn Console) {
    init();
    *SINK.write() = Some(console);
}

/// Stop writing to the console. Lines are still kept in the ring.
pub fn detach() {
    *SINK.write() = None;
}

/// Raise the level to `Debug` (or drop it back to `Info`).
pub fn set_verbose(verbose: bool) {
    log::set_max_level(if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    });
}

/// Most recent log lines, oldest first.
pub fn recent_lines() -> Vec<String> {
    let ring = RING.lock();
    let start = (ring.next + MAX_LOG_ENTRIES - ring.count) % MAX_LOG_ENTRIES;
    (0..ring.count)
        .map(|i| String::from(ring.lines[(start + i) % MAX_LOG_ENTRIES].as_str()))
        .collect()
}

/// Number of lines currently held.
pub fn log_count() -> usize {
    RING.lock().count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_truncates_on_char_boundary() {
        let mut line = Line::EMPTY;
        for _ in 0..LINE_CAPACITY {
            let _ = line.write_str("é");
        }
        assert!(line.len <= LINE_CAPACITY);
        assert!(line.as_str().chars().all(|c| c == 'é'));
    }

    #[test]
    fn ring_keeps_newest_entries() {
        let mut ring = Ring::new();
        for i in 0..(MAX_LOG_ENTRIES + 3) {
            let mut line = Line::EMPTY;
            let _ = write!(line, "{}", i);
            ring.push(&line);
        }
        assert_eq!(ring.count, MAX_LOG_ENTRIES);
        let oldest = (ring.next + MAX_LOG_ENTRIES - ring.count) % MAX_LOG_ENTRIES;
        assert_eq!(ring.lines[oldest].as_str(), "3");
    }
}
