use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Thread identifier type
///
/// Uniquely identifies a thread in the application. Unlike `std::thread::ThreadId`
/// it is a plain integer so it can be serialized into diagnostics and logs.
pub type ThreadId = usize;

// Global counter for assigning unique thread IDs
static THREAD_ID_COUNTER: AtomicUsize = AtomicUsize::new(1);

// Thread-local storage for each thread's assigned ID
thread_local! {
    static THREAD_ID: ThreadId = {
        // Each thread gets a unique ID once, when this is first accessed
        THREAD_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
    };
}

/// Get a unique identifier of the current thread
/// This will always return the same ID for the lifetime of the thread
pub fn get_current_thread_id() -> ThreadId {
    THREAD_ID.with(|&id| id)
}

/// Confinement context identifier type
///
/// Every `ConfinementContext` (including copies) gets its own ID.
pub type ContextId = usize;

static NEXT_CONTEXT_ID: AtomicUsize = AtomicUsize::new(1);

pub(crate) fn next_context_id() -> ContextId {
    NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst)
}

/// Represents the type of scope/blocking event that occurred
///
/// These events are written to the event log when logging is enabled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Events {
    /// A detection scope installed a confinement context
    ScopeEnter,
    /// A detection scope restored the previous ambient confinement
    ScopeExit,
    /// A thread started a blocking wait on a context
    BlockingEnter,
    /// A thread finished a blocking wait on a context
    BlockingExit,
    /// A continuation was refused because its context was blocked
    Deadlock,
    /// A blocking wait outlived the warning duration
    BlockingWarning,
    /// A detection scope was dropped without being closed
    UnreleasedScope,
}

/// Kind of a reported diagnostic
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// A continuation was scheduled onto a blocked context that wraps a real
    /// single-threaded confinement. The program would hang.
    Deadlock,
    /// Same as `Deadlock`, but no real confinement was wrapped
    PotentialDeadlock,
    /// A blocking wait outlived the configured warning duration
    BlockingWarning,
    /// A detection scope was dropped without being closed
    UnreleasedScope,
}

/// A diagnostic report delivered to the configured callback
///
/// This structure describes one detection event: what happened, on which
/// thread and context, and the trace captured when the blocking wait began
/// (if trace generation is enabled).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Diagnostic {
    /// What was detected
    pub kind: DiagnosticKind,

    /// Thread that entered the blocking wait (or owned the scope)
    pub thread_id: ThreadId,

    /// Context involved, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<ContextId>,

    /// How long the wait had been blocked, for `BlockingWarning`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_for_ms: Option<u64>,

    /// Rendered trace of the blocking call site
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace: Option<String>,

    /// ISO-8601 formatted timestamp indicating when the event was reported
    pub timestamp: String,
}

impl Diagnostic {
    /// Human-readable one-paragraph rendering of this diagnostic
    pub fn message(&self) -> String {
        let head = match self.kind {
            DiagnosticKind::Deadlock => format!(
                "deadlock: a continuation was scheduled onto a context blocked by thread {}",
                self.thread_id
            ),
            DiagnosticKind::PotentialDeadlock => format!(
                "potential deadlock: a continuation was scheduled onto a context blocked by thread {}",
                self.thread_id
            ),
            DiagnosticKind::BlockingWarning => format!(
                "thread {} has been blocked for {}ms and might be deadlocked",
                self.thread_id,
                self.blocked_for_ms.unwrap_or_default()
            ),
            DiagnosticKind::UnreleasedScope => format!(
                "a detection scope on thread {} was dropped without being closed",
                self.thread_id
            ),
        };
        match &self.trace {
            Some(trace) => format!("{head}\nBlocking call site:\n{trace}"),
            None => head,
        }
    }
}
