//! Logger for recording scope and blocking-wait events
//!
//! This module records when detection scopes are entered and exited, when
//! threads enter and leave blocking waits, and when a deadlock or a long
//! wait is detected. Entries are written as JSON lines by a background
//! writer thread, so logging never blocks the thread being observed.
//!
//! Logging is off until [`init_logger`] is called with a path.

use crate::core::types::{ContextId, Events, ThreadId};
use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// One line of the event log
#[derive(Debug, Serialize, Clone)]
pub struct LogEntry {
    pub thread_id: ThreadId,
    /// Context involved (0 when there is none)
    pub context_id: ContextId,
    pub event: Events,
    /// RFC 3339 with microseconds
    pub timestamp: String,
}

enum Command {
    Write(LogEntry),
    Flush(Sender<()>),
}

/// Event logger writing JSON lines through a background thread
///
/// Dropping the logger closes the channel and waits for the writer to drain
/// it, so every queued entry is on disk afterwards.
pub struct EventLogger {
    sender: Option<Sender<Command>>,
    writer: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl EventLogger {
    /// Open `path` for writing, replacing any existing file
    ///
    /// A `{timestamp}` in the path is replaced with the current UTC time and
    /// missing parent directories are created.
    ///
    /// # Errors
    /// Returns an error if the directory or file cannot be created, or the
    /// writer thread cannot be spawned
    pub fn with_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = resolve_placeholder(path.as_ref());

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;

        let (tx, rx) = unbounded::<Command>();
        let writer = thread::Builder::new()
            .name("blockwatch-logger".to_string())
            .spawn(move || write_loop(file, rx))
            .context("Failed to spawn logger thread")?;

        Ok(EventLogger {
            sender: Some(tx),
            writer: Some(writer),
            path,
        })
    }

    /// Path of the file this logger writes to
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an event for writing. Never blocks.
    pub fn log_event(&self, thread_id: ThreadId, context_id: ContextId, event: Events) {
        let entry = LogEntry {
            thread_id,
            context_id,
            event,
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        };
        if let Some(sender) = &self.sender
            && sender.send(Command::Write(entry)).is_err()
        {
            eprintln!("blockwatch: logger thread is gone, dropping event");
        }
    }

    /// Write everything queued so far to disk
    ///
    /// # Errors
    /// Returns an error if the writer thread is gone or does not answer in time
    pub fn flush(&self) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| anyhow!("Logger is shut down"))?;
        let (done_tx, done_rx) = bounded(1);
        sender
            .send(Command::Flush(done_tx))
            .map_err(|_| anyhow!("Logger thread is not running"))?;
        done_rx
            .recv_timeout(FLUSH_TIMEOUT)
            .with_context(|| format!("Flushing {} timed out", self.path.display()))
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        drop(self.sender.take());
        if let Some(writer) = self.writer.take()
            && writer.join().is_err()
        {
            eprintln!("blockwatch: logger thread panicked");
        }
    }
}

fn resolve_placeholder(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if !text.contains("{timestamp}") {
        return path.to_path_buf();
    }
    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    PathBuf::from(text.replace("{timestamp}", &stamp))
}

fn write_loop(file: File, rx: Receiver<Command>) {
    let mut out = BufWriter::new(file);

    for command in rx {
        match command {
            Command::Write(entry) => {
                let written = serde_json::to_writer(&mut out, &entry)
                    .map_err(std::io::Error::from)
                    .and_then(|()| out.write_all(b"\n"));
                if let Err(e) = written {
                    eprintln!("blockwatch: failed to write log entry: {e}");
                }
            }
            Command::Flush(done) => {
                if let Err(e) = out.flush() {
                    eprintln!("blockwatch: failed to flush log: {e}");
                }
                let _ = done.send(());
            }
        }
    }

    // Channel closed
    if let Err(e) = out.flush() {
        eprintln!("blockwatch: failed to flush log: {e}");
    }
}

lazy_static::lazy_static! {
    static ref GLOBAL_LOGGER: Mutex<Option<EventLogger>> = Mutex::new(None);
}

/// Start logging to `path`, or stop logging with `None`
///
/// A previously active logger is drained and closed first.
///
/// # Errors
/// Returns an error if the log file cannot be created
pub fn init_logger<P: AsRef<Path>>(path: Option<P>) -> Result<()> {
    let logger = path
        .map(EventLogger::with_file)
        .transpose()
        .context("Failed to create logger with file")?;
    let previous = std::mem::replace(&mut *GLOBAL_LOGGER.lock(), logger);
    // Joined outside the lock so logging threads are not held up
    drop(previous);
    Ok(())
}

/// Log an event to the global logger (if enabled)
pub fn log_event(thread_id: ThreadId, context_id: ContextId, event: Events) {
    if let Some(logger) = GLOBAL_LOGGER.lock().as_ref() {
        logger.log_event(thread_id, context_id, event);
    }
}

pub fn is_logging_enabled() -> bool {
    GLOBAL_LOGGER.lock().is_some()
}

/// Path of the file the global logger writes to
pub fn get_current_log_file() -> Option<PathBuf> {
    GLOBAL_LOGGER.lock().as_ref().map(|l| l.path().to_path_buf())
}

/// Flush the global logger, if enabled
///
/// # Errors
/// Returns an error if the flush does not complete
pub fn flush_logs() -> Result<()> {
    match GLOBAL_LOGGER.lock().as_ref() {
        Some(logger) => logger.flush(),
        None => Ok(()),
    }
}
