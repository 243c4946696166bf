//! Blocking waits that cooperate with detection
//!
//! Call these instead of blocking on a [`Task`] directly. When a detecting
//! [`ConfinementContext`] is ambient, the wait runs inside
//! [`ConfinementContext::run_while_blocking`], so a continuation scheduled
//! onto the blocked thread is refused and the wait returns
//! [`WaitError::Deadlock`] instead of hanging.
//!
//! ```rust
//! use blockwatch::{Task, WaitOptions, wait};
//! use std::time::Duration;
//!
//! let task = Task::spawn(|| 40 + 2);
//! assert_eq!(wait::result(task).unwrap(), 42);
//!
//! let slow = Task::delay(Duration::from_secs(5), ());
//! assert!(wait::wait_with(&slow, WaitOptions::new().timeout_ms(10)).is_err());
//! ```

use crate::core::ambient;
use crate::core::config::{self, DetectionMode};
use crate::core::context::ConfinementContext;
use crate::core::error::{Trace, WaitError};
use crate::core::task::{CancellationToken, Task};
use crate::core::watchdog::Watchdog;
use std::time::Duration;

/// Timeout and cancellation for a blocking wait
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
}

impl WaitOptions {
    /// Wait with no timeout and no cancellation
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_ms(self, millis: u64) -> Self {
        self.timeout(Duration::from_millis(millis))
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Block until `task` completes
pub fn wait<T: Send + 'static>(task: &Task<T>) -> Result<(), WaitError> {
    wait_with(task, WaitOptions::new())
}

/// Block until `task` completes, times out or is cancelled
pub fn wait_with<T: Send + 'static>(task: &Task<T>, options: WaitOptions) -> Result<(), WaitError> {
    block(|| task.block_until_complete(options.timeout, options.cancel.as_ref()))
}

/// Block until `task` completes and return its value
pub fn result<T: Send + 'static>(task: Task<T>) -> Result<T, WaitError> {
    result_with(task, WaitOptions::new())
}

/// Block until `task` completes, times out or is cancelled, and return its value
pub fn result_with<T: Send + 'static>(task: Task<T>, options: WaitOptions) -> Result<T, WaitError> {
    wait_with(&task, options)?;
    task.take()
}

/// Run the raw wait, through the ambient context if there is one
fn block<R>(wait: impl FnOnce() -> R) -> R {
    let current = ambient::current();
    if let Some(context) = current.as_deref().and_then(|c| c.detector()) {
        let _watchdog = watchdog_for_context(context);
        return context.run_while_blocking(wait);
    }

    let config = config::snapshot();
    let _watchdog = (config.default_mode == DetectionMode::AlsoPotentialDeadlocks).then(|| {
        Watchdog::arm(
            config.blocking_warning_duration,
            None,
            config.generate_traces.then(Trace::capture),
        )
    });
    wait()
}

/// A context without a real confinement can only be checked heuristically
fn watchdog_for_context(context: &ConfinementContext) -> Option<Watchdog> {
    if context.mode() != DetectionMode::AlsoPotentialDeadlocks || !context.is_potential() {
        return None;
    }
    let config = config::snapshot();
    Some(Watchdog::arm(
        config.blocking_warning_duration,
        Some(context.id()),
        config.generate_traces.then(Trace::capture),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::confinement::{Confinement, LocalQueue};
    use crate::core::scope::DetectionScope;
    use std::sync::Arc;

    #[test]
    fn test_plain_wait_returns_value() {
        let task = Task::delay(Duration::from_millis(10), "late");
        assert_eq!(result(task).unwrap(), "late");
    }

    #[test]
    fn test_wait_then_result_keeps_value() {
        let task = Task::spawn(|| vec![1, 2, 3]);
        wait(&task).unwrap();
        wait(&task).unwrap();
        assert_eq!(result(task).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_combined_timeout_and_cancel() {
        let task = Task::delay(Duration::from_secs(5), ());
        let token = CancellationToken::new();
        let err = wait_with(&task, WaitOptions::new().timeout_ms(20).cancel(token)).unwrap_err();
        assert!(matches!(err, WaitError::TimedOut(_)));
    }

    #[test]
    fn test_blocked_continuation_surfaces_as_deadlock() {
        let queue: Arc<dyn Confinement> = LocalQueue::new();
        let previous = ambient::replace(Some(queue));

        let scope = DetectionScope::enter(DetectionMode::OnlyActualDeadlocks);
        let task = Task::delay(Duration::from_millis(50), 1);
        let err = result(task).unwrap_err();
        let deadlock = err.as_deadlock().expect("deadlock signal");
        assert!(!deadlock.is_potential());
        assert_eq!(Some(deadlock.context_id()), scope.context().map(|c| c.id()));
        scope.close();

        ambient::replace(previous);
    }

    #[test]
    fn test_context_is_idle_after_wait() {
        let scope = DetectionScope::enter(DetectionMode::AlsoPotentialDeadlocks);
        let context = Arc::clone(scope.context().unwrap());

        // Already complete, so no continuation goes through the context
        let task = Task::ready(3);
        assert_eq!(result(task).unwrap(), 3);
        assert!(!context.is_blocking());

        scope.close();
    }
}
