//! Timed warning for blocking waits that take too long
//!
//! When there is no real single-threaded confinement, a blocked thread cannot
//! be proven deadlocked. The watchdog reports a [`DiagnosticKind::BlockingWarning`]
//! if the wait is still going after the configured duration, and then lets
//! the wait carry on.

use crate::core::dispatcher;
use crate::core::error::Trace;
use crate::core::types::{ContextId, DiagnosticKind, get_current_thread_id};
use crossbeam_channel::{RecvTimeoutError, Sender, bounded};
use std::thread;
use std::time::{Duration, Instant};

/// Armed timer; dropping it cancels the warning
pub struct Watchdog {
    // Never sent on. Dropping it disconnects the timer thread.
    _disarm: Sender<()>,
}

impl Watchdog {
    /// Start a timer that warns once if not dropped within `after`
    ///
    /// The warning names the current thread and carries `trace` if given.
    pub fn arm(after: Duration, context_id: Option<ContextId>, trace: Option<Trace>) -> Self {
        let (tx, rx) = bounded::<()>(0);
        let thread_id = get_current_thread_id();
        let started = Instant::now();

        thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = rx.recv_timeout(after) {
                dispatcher::report(dispatcher::diagnostic(
                    DiagnosticKind::BlockingWarning,
                    thread_id,
                    context_id,
                    Some(started.elapsed().as_millis() as u64),
                    trace.map(|t| t.to_string()),
                ));
            }
        });

        Watchdog { _disarm: tx }
    }
}
