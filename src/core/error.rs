use crate::core::types::{ContextId, ThreadId};
use std::backtrace::Backtrace;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Call-site trace captured when a blocking wait begins
///
/// Cheap to clone; every clone refers to the same captured backtrace.
#[derive(Clone)]
pub struct Trace(Arc<Backtrace>);

impl Trace {
    /// Capture the current call stack regardless of `RUST_BACKTRACE`
    pub fn capture() -> Self {
        Trace(Arc::new(Backtrace::force_capture()))
    }

    pub fn backtrace(&self) -> &Backtrace {
        &self.0
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Trace(..)")
    }
}

/// Raised when a continuation is scheduled onto a context that is currently
/// blocked waiting for it
///
/// A definite signal means a real single-threaded confinement was wrapped, so
/// the continuation could never have run. A potential signal means no such
/// confinement existed and the wait would only hang under one.
#[derive(Debug, Clone)]
pub struct DeadlockError {
    trace: Option<Trace>,
    potential: bool,
    blocked_thread: Option<ThreadId>,
    context: ContextId,
}

impl DeadlockError {
    pub(crate) fn new(
        trace: Option<Trace>,
        potential: bool,
        blocked_thread: Option<ThreadId>,
        context: ContextId,
    ) -> Self {
        DeadlockError {
            trace,
            potential,
            blocked_thread,
            context,
        }
    }

    /// Trace of the blocking call, when trace generation was enabled
    pub fn trace(&self) -> Option<&Trace> {
        self.trace.as_ref()
    }

    /// True when no real confinement was wrapped
    pub fn is_potential(&self) -> bool {
        self.potential
    }

    /// Thread that was inside the blocking wait
    pub fn blocked_thread(&self) -> Option<ThreadId> {
        self.blocked_thread
    }

    /// Context the continuation was refused by
    pub fn context_id(&self) -> ContextId {
        self.context
    }
}

impl fmt::Display for DeadlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.potential {
            f.write_str(
                "blocking wait might deadlock: a continuation was scheduled onto the blocked \
                 context; this would hang under a single-threaded confinement",
            )?;
        } else {
            f.write_str(
                "blocking wait will deadlock: a continuation was scheduled onto a \
                 single-threaded confinement that is blocked waiting for it",
            )?;
        }
        if let Some(trace) = &self.trace {
            write!(f, "\nBlocking call site:\n{trace}")?;
        }
        Ok(())
    }
}

impl std::error::Error for DeadlockError {}

/// Why a blocking wait returned without a value
#[derive(Debug, Clone, thiserror::Error)]
pub enum WaitError {
    /// The awaited continuation was refused by a blocked context
    #[error(transparent)]
    Deadlock(#[from] DeadlockError),

    #[error("wait timed out after {0:?}")]
    TimedOut(Duration),

    #[error("wait was cancelled")]
    Cancelled,

    /// The asynchronous work panicked
    #[error("task faulted: {0}")]
    Faulted(String),

    /// The result was already taken by an earlier call
    #[error("task result was already taken")]
    AlreadyTaken,
}

impl WaitError {
    /// The deadlock signal carried by this error, if any
    pub fn as_deadlock(&self) -> Option<&DeadlockError> {
        match self {
            WaitError::Deadlock(err) => Some(err),
            _ => None,
        }
    }
}
