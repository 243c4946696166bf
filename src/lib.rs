//! # Blockwatch
//!
//! Detects sync-over-async deadlocks on single-threaded contexts.
//!
//! When a thread that owns a single-threaded confinement (a UI loop, a
//! per-request dispatcher) blocks waiting for an asynchronous result, and
//! that result can only be delivered by a continuation scheduled back onto
//! the same confinement, the program hangs forever. Blockwatch wraps the
//! confinement while a detection scope is active, notices the continuation
//! arriving at a blocked thread, and turns the hang into a
//! [`DeadlockError`].
//!
//! ## Features
//!
//! - Definite detection when a real single-threaded confinement is wrapped
//! - Potential-deadlock detection and long-wait warnings without one
//! - Optional call-site traces of the blocking wait
//! - JSON-lines event logging
//!
//! ## Example
//!
//! ```rust
//! use blockwatch::{DetectionMode, DetectionScope, LocalQueue, Task, ambient, wait};
//! use std::time::Duration;
//!
//! // The host thread owns a single-threaded queue
//! let queue = LocalQueue::new();
//! let previous = ambient::replace(Some(queue));
//!
//! let scope = DetectionScope::enter(DetectionMode::OnlyActualDeadlocks);
//! // The task's completion must run on this thread, which is about to block
//! let task = Task::delay(Duration::from_millis(50), "hello");
//! let err = wait::result(task).unwrap_err();
//! assert!(!err.as_deadlock().unwrap().is_potential());
//! scope.close();
//!
//! ambient::replace(previous);
//! ```

mod core;
pub use crate::core::{
    Blockwatch, CancellationToken, Config, ConfinementContext, Confinement, Continuation,
    DeadlockError, DetectionMode, DetectionScope, Diagnostic, DiagnosticKind, Events, LocalQueue,
    Task, Trace, WaitError, WaitOptions, flush_logs, init_logger, unreleased_scopes,
    with_detection,
    types::{ContextId, ThreadId, get_current_thread_id},
};
pub use crate::core::{ambient, config, wait};
pub use crate::core::confinement::spawn_detached;
pub use crate::core::dispatcher::{clear_callback, set_callback};
pub use crate::core::logger::{get_current_log_file, is_logging_enabled};
pub use crate::core::watchdog::Watchdog;
