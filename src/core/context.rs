//! The detecting confinement context
//!
//! A [`ConfinementContext`] decorates the confinement of one thread (or
//! stands in for a missing one) and tracks whether that thread is inside a
//! blocking wait. Every continuation scheduled onto it while the thread is
//! blocked is refused with a [`DeadlockError`] instead of being queued
//! behind a wait that can never finish.
//!
//! # States
//!
//! ```text
//!            run_while_blocking (enter)
//!   Idle  ------------------------------>  Blocking
//!         <------------------------------
//!            run_while_blocking (exit, always)
//! ```
//!
//! `schedule` never changes state: it forwards in `Idle` and raises in
//! `Blocking`. Both the transition and the check go through one mutex per
//! instance, so a continuation scheduled from another thread always sees
//! the most recent transition. The lock is released before forwarding, so
//! a wrapped confinement that runs continuations inline can re-enter.

use crate::core::config::{self, DetectionMode};
use crate::core::confinement::{Confinement, Continuation, spawn_detached};
use crate::core::dispatcher;
use crate::core::error::{DeadlockError, Trace};
use crate::core::logger;
use crate::core::types::{
    ContextId, DiagnosticKind, Events, ThreadId, get_current_thread_id, next_context_id,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Blocking status of one context
#[derive(Debug, Clone, Default)]
struct BlockingState {
    blocking: bool,
    trace: Option<Trace>,
    thread: Option<ThreadId>,
}

/// A confinement that refuses continuations while its thread is blocked
pub struct ConfinementContext {
    id: ContextId,
    /// Real confinement being decorated; `None` means detection is heuristic only
    inner: Option<Arc<dyn Confinement>>,
    mode: DetectionMode,
    capture_traces: bool,
    state: Mutex<BlockingState>,
}

impl ConfinementContext {
    /// Wrap `inner` using the current global settings
    pub fn new(inner: Option<Arc<dyn Confinement>>) -> Self {
        let config = config::snapshot();
        Self::with_settings(inner, config.default_mode, config.generate_traces)
    }

    /// Wrap `inner` with explicit settings
    pub fn with_settings(
        inner: Option<Arc<dyn Confinement>>,
        mode: DetectionMode,
        capture_traces: bool,
    ) -> Self {
        ConfinementContext {
            id: next_context_id(),
            inner,
            mode,
            capture_traces,
            state: Mutex::new(BlockingState::default()),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn mode(&self) -> DetectionMode {
        self.mode
    }

    /// The decorated confinement, if any
    pub fn inner(&self) -> Option<&Arc<dyn Confinement>> {
        self.inner.as_ref()
    }

    /// True when no real confinement is wrapped, so any detection is
    /// only a potential deadlock
    ///
    /// Another context is not a real confinement; what counts is whatever
    /// that one wraps.
    pub fn is_potential(&self) -> bool {
        match &self.inner {
            None => true,
            Some(inner) => inner.detector().is_some_and(|c| c.is_potential()),
        }
    }

    pub fn is_blocking(&self) -> bool {
        self.state.lock().blocking
    }

    /// Thread currently inside `run_while_blocking`, if any
    pub fn blocking_thread(&self) -> Option<ThreadId> {
        self.state.lock().thread
    }

    /// Schedule `continuation` onto this context
    ///
    /// Forwards to the wrapped confinement (or a detached thread when none
    /// is wrapped) unless the context is blocked.
    ///
    /// # Errors
    /// Returns a [`DeadlockError`] when a blocking wait is in progress on
    /// this context. The error is potential when no real confinement is
    /// wrapped.
    pub fn schedule(&self, continuation: Continuation) -> Result<(), DeadlockError> {
        let state = self.state.lock();
        if state.blocking {
            let err = DeadlockError::new(
                state.trace.clone(),
                self.is_potential(),
                state.thread,
                self.id,
            );
            drop(state);
            self.report(&err);
            return Err(err);
        }

        // Decided; the wrapped confinement may run the continuation inline,
        // and that continuation may come back to this context
        drop(state);

        match &self.inner {
            Some(inner) => inner.schedule(continuation),
            None => {
                spawn_detached(continuation);
                Ok(())
            }
        }
    }

    /// Run `work` on the calling thread with this context marked as blocking
    ///
    /// Any continuation scheduled onto this context while `work` runs,
    /// including from `work` itself, is refused with a [`DeadlockError`].
    /// The blocking state is cleared when `work` returns or panics.
    ///
    /// # Panics
    /// Panics if a blocking wait is already in progress on this context,
    /// whether nested on the same thread or concurrent from another one.
    /// Only one thread may block a context at a time.
    pub fn run_while_blocking<R>(&self, work: impl FnOnce() -> R) -> R {
        let caller = get_current_thread_id();
        // Checked before taking the lock; capturing is the expensive part
        let trace = self.capture_traces.then(Trace::capture);

        {
            let mut state = self.state.lock();
            if state.blocking {
                let holder = state.thread;
                drop(state);
                if holder == Some(caller) {
                    panic!(
                        "nested blocking wait on context {} by thread {caller}: \
                         a context can only be blocked once at a time",
                        self.id
                    );
                }
                panic!(
                    "concurrent blocking wait on context {}: thread {caller} tried to block \
                     while thread {} is already blocking",
                    self.id,
                    holder.map_or_else(|| "?".to_string(), |t| t.to_string())
                );
            }
            state.blocking = true;
            state.trace = trace;
            state.thread = Some(caller);
        }
        logger::log_event(caller, self.id, Events::BlockingEnter);

        let _unblock = Unblock {
            context: self,
            thread: caller,
        };
        work()
    }

    /// Independent copy of this context
    ///
    /// The copy starts with the current blocking snapshot and evolves
    /// separately afterwards. The wrapped confinement is duplicated when it
    /// supports that; otherwise the copy wraps none.
    pub fn create_copy(&self) -> ConfinementContext {
        let snapshot = self.state.lock().clone();
        ConfinementContext {
            id: next_context_id(),
            inner: self.inner.as_ref().and_then(|inner| inner.duplicate()),
            mode: self.mode,
            capture_traces: self.capture_traces,
            state: Mutex::new(snapshot),
        }
    }

    fn report(&self, err: &DeadlockError) {
        let kind = if err.is_potential() {
            DiagnosticKind::PotentialDeadlock
        } else {
            DiagnosticKind::Deadlock
        };
        dispatcher::report(dispatcher::diagnostic(
            kind,
            err.blocked_thread().unwrap_or_else(get_current_thread_id),
            Some(self.id),
            None,
            err.trace().map(|t| t.to_string()),
        ));
    }
}

/// Clears the blocking state when `run_while_blocking` exits by any path
struct Unblock<'a> {
    context: &'a ConfinementContext,
    thread: ThreadId,
}

impl Drop for Unblock<'_> {
    fn drop(&mut self) {
        *self.context.state.lock() = BlockingState::default();
        logger::log_event(self.thread, self.context.id, Events::BlockingExit);
    }
}

impl Confinement for ConfinementContext {
    fn schedule(&self, continuation: Continuation) -> Result<(), DeadlockError> {
        ConfinementContext::schedule(self, continuation)
    }

    fn duplicate(&self) -> Option<Arc<dyn Confinement>> {
        Some(Arc::new(self.create_copy()))
    }

    fn detector(&self) -> Option<&ConfinementContext> {
        Some(self)
    }
}

impl fmt::Debug for ConfinementContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConfinementContext")
            .field("id", &self.id)
            .field("wraps_confinement", &self.inner.is_some())
            .field("mode", &self.mode)
            .field("blocking", &state.blocking)
            .field("blocking_thread", &state.thread)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::confinement::LocalQueue;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::mpsc;
    use std::sync::{Barrier, atomic::AtomicBool, atomic::Ordering};
    use std::thread;
    use std::time::Duration;

    fn wrapping_queue() -> (Arc<LocalQueue>, ConfinementContext) {
        let queue = LocalQueue::new();
        let context = ConfinementContext::with_settings(
            Some(Arc::clone(&queue) as Arc<dyn Confinement>),
            DetectionMode::OnlyActualDeadlocks,
            false,
        );
        (queue, context)
    }

    #[test]
    fn test_idle_schedule_forwards_to_inner() {
        let (queue, context) = wrapping_queue();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        context
            .schedule(Box::new(move || flag.store(true, Ordering::SeqCst)))
            .unwrap();

        // Forwarded, not run inline
        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(queue.run_pending(), 1);
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_idle_schedule_without_inner_runs_detached() {
        let context =
            ConfinementContext::with_settings(None, DetectionMode::AlsoPotentialDeadlocks, false);
        let (tx, rx) = mpsc::channel();
        context.schedule(Box::new(move || tx.send(()).unwrap())).unwrap();
        rx.recv_timeout(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_schedule_while_blocking_is_definite_with_inner() {
        let (queue, context) = wrapping_queue();

        let result = context.run_while_blocking(|| context.schedule(Box::new(|| {})));

        let err = result.unwrap_err();
        assert!(!err.is_potential());
        assert_eq!(err.blocked_thread(), Some(get_current_thread_id()));
        assert_eq!(err.context_id(), context.id());
        // Refused continuations never reach the wrapped queue
        assert!(queue.is_empty());
    }

    #[test]
    fn test_schedule_while_blocking_is_potential_without_inner() {
        let context =
            ConfinementContext::with_settings(None, DetectionMode::AlsoPotentialDeadlocks, false);

        let err = context
            .run_while_blocking(|| context.schedule(Box::new(|| {})))
            .unwrap_err();
        assert!(err.is_potential());
    }

    #[test]
    fn test_schedule_from_other_thread_sees_blocking() {
        let (_queue, context) = wrapping_queue();
        let context = Arc::new(context);

        let result = context.run_while_blocking(|| {
            let remote = Arc::clone(&context);
            thread::spawn(move || remote.schedule(Box::new(|| {})))
                .join()
                .unwrap()
        });

        assert!(result.is_err());
    }

    #[test]
    fn test_state_cleared_after_return() {
        let (_queue, context) = wrapping_queue();

        let value = context.run_while_blocking(|| {
            assert!(context.is_blocking());
            assert_eq!(context.blocking_thread(), Some(get_current_thread_id()));
            17
        });

        assert_eq!(value, 17);
        assert!(!context.is_blocking());
        assert_eq!(context.blocking_thread(), None);
        assert!(context.schedule(Box::new(|| {})).is_ok());
    }

    #[test]
    fn test_state_cleared_after_panic() {
        let (_queue, context) = wrapping_queue();

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            context.run_while_blocking(|| panic!("work failed"));
        }));

        assert!(outcome.is_err());
        assert!(!context.is_blocking());
        assert!(context.schedule(Box::new(|| {})).is_ok());
    }

    #[test]
    fn test_failure_propagates_unchanged() {
        let (_queue, context) = wrapping_queue();
        let result: Result<(), &str> = context.run_while_blocking(|| Err("boom"));
        assert_eq!(result, Err("boom"));
        assert!(!context.is_blocking());
    }

    #[test]
    #[should_panic(expected = "nested blocking wait")]
    fn test_nested_blocking_is_a_usage_fault() {
        let (_queue, context) = wrapping_queue();
        context.run_while_blocking(|| context.run_while_blocking(|| ()));
    }

    #[test]
    fn test_concurrent_blocking_is_a_usage_fault() {
        let (_queue, context) = wrapping_queue();
        let context = Arc::new(context);
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));

        let blocker = {
            let context = Arc::clone(&context);
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            thread::spawn(move || {
                context.run_while_blocking(|| {
                    entered.wait();
                    release.wait();
                })
            })
        };

        entered.wait();
        let second = catch_unwind(AssertUnwindSafe(|| context.run_while_blocking(|| ())));
        let message = second
            .unwrap_err()
            .downcast::<String>()
            .map(|m| *m)
            .unwrap_or_default();
        assert!(message.contains("concurrent blocking wait"));

        // The first blocker is unaffected by the failed attempt
        assert!(context.is_blocking());
        release.wait();
        blocker.join().unwrap();
        assert!(!context.is_blocking());
    }

    #[test]
    fn test_traces_only_when_enabled() {
        let without =
            ConfinementContext::with_settings(None, DetectionMode::AlsoPotentialDeadlocks, false);
        let err = without
            .run_while_blocking(|| without.schedule(Box::new(|| {})))
            .unwrap_err();
        assert!(err.trace().is_none());

        let with =
            ConfinementContext::with_settings(None, DetectionMode::AlsoPotentialDeadlocks, true);
        let err = with
            .run_while_blocking(|| with.schedule(Box::new(|| {})))
            .unwrap_err();
        assert!(err.trace().is_some());
        assert!(err.to_string().contains("Blocking call site:"));
    }

    #[test]
    fn test_copy_is_independent() {
        let (queue, original) = wrapping_queue();

        // Copy taken while blocking inherits the blocking snapshot
        let copy = original.run_while_blocking(|| original.create_copy());
        assert!(copy.is_blocking());
        assert!(!original.is_blocking());
        assert_ne!(copy.id(), original.id());

        // Blocking the original does not touch the copy, and vice versa
        let idle_copy = original.create_copy();
        original.run_while_blocking(|| assert!(!idle_copy.is_blocking()));
        idle_copy.run_while_blocking(|| assert!(!original.is_blocking()));

        // The LocalQueue was duplicated, so the copy still wraps a real confinement
        assert!(!idle_copy.is_potential());
        idle_copy.schedule(Box::new(|| {})).unwrap();
        assert_eq!(queue.run_pending(), 1);
    }

    #[test]
    fn test_copy_without_duplicable_inner_wraps_none() {
        struct Fixed;
        impl Confinement for Fixed {
            fn schedule(&self, continuation: Continuation) -> Result<(), DeadlockError> {
                continuation();
                Ok(())
            }
        }

        let context = ConfinementContext::with_settings(
            Some(Arc::new(Fixed)),
            DetectionMode::OnlyActualDeadlocks,
            false,
        );
        assert!(!context.is_potential());
        assert!(context.create_copy().is_potential());
    }

    #[test]
    fn test_inline_confinement_can_reenter() {
        struct Inline;
        impl Confinement for Inline {
            fn schedule(&self, continuation: Continuation) -> Result<(), DeadlockError> {
                continuation();
                Ok(())
            }
        }

        let context = Arc::new(ConfinementContext::with_settings(
            Some(Arc::new(Inline)),
            DetectionMode::OnlyActualDeadlocks,
            false,
        ));
        let (tx, rx) = mpsc::channel();

        let handle = {
            let context = Arc::clone(&context);
            thread::spawn(move || {
                let again = Arc::clone(&context);
                context.schedule(Box::new(move || {
                    assert!(!again.is_blocking());
                    let inner_tx = tx.clone();
                    again
                        .schedule(Box::new(move || inner_tx.send("inner").unwrap()))
                        .unwrap();
                    tx.send("outer").unwrap();
                }))
            })
        };

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok("inner"));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok("outer"));
        assert!(handle.join().unwrap().is_ok());
    }

    #[test]
    fn test_wrapping_another_context_inherits_potential() {
        let outer = Arc::new(ConfinementContext::with_settings(
            None,
            DetectionMode::AlsoPotentialDeadlocks,
            false,
        ));
        let wrapper = ConfinementContext::with_settings(
            Some(Arc::clone(&outer) as Arc<dyn Confinement>),
            DetectionMode::AlsoPotentialDeadlocks,
            false,
        );
        assert!(wrapper.is_potential());
        let err = wrapper
            .run_while_blocking(|| wrapper.schedule(Box::new(|| {})))
            .unwrap_err();
        assert!(err.is_potential());

        let (_queue, real) = wrapping_queue();
        let wrapper = ConfinementContext::with_settings(
            Some(Arc::new(real) as Arc<dyn Confinement>),
            DetectionMode::OnlyActualDeadlocks,
            false,
        );
        assert!(!wrapper.is_potential());
    }

    #[test]
    fn test_detector_downcast() {
        let (_queue, context) = wrapping_queue();
        let as_confinement: Arc<dyn Confinement> = Arc::new(context);
        assert!(as_confinement.detector().is_some());
    }
}
