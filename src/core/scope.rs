//! Detection scopes
//!
//! A [`DetectionScope`] installs a [`ConfinementContext`] as the ambient
//! confinement of the current thread and puts the previous one back when it
//! is closed.
//!
//! ```rust
//! use blockwatch::{DetectionMode, DetectionScope};
//!
//! let scope = DetectionScope::enter(DetectionMode::AlsoPotentialDeadlocks);
//! assert!(scope.is_active());
//! // ... blocking waits here are checked ...
//! scope.close();
//! ```

use crate::core::ambient;
use crate::core::config::{self, DetectionMode};
use crate::core::confinement::Confinement;
use crate::core::context::ConfinementContext;
use crate::core::dispatcher;
use crate::core::logger;
use crate::core::types::{DiagnosticKind, Events, ThreadId, get_current_thread_id};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

static UNRELEASED_SCOPES: AtomicUsize = AtomicUsize::new(0);

/// Number of enabled scopes dropped without `close()` in this process
pub fn unreleased_scopes() -> usize {
    UNRELEASED_SCOPES.load(Ordering::SeqCst)
}

struct Installed {
    context: Arc<ConfinementContext>,
    /// Same allocation as `context`, as stored in the ambient slot
    slot_value: Arc<dyn Confinement>,
    previous: Option<Arc<dyn Confinement>>,
    thread: ThreadId,
}

/// Handle for an entered detection scope
///
/// Must be closed with [`DetectionScope::close`]. Dropping an enabled scope
/// still restores the previous confinement, but unless the thread is
/// unwinding from a panic it is reported as an unreleased scope.
///
/// The handle is bound to the thread that entered it.
#[must_use = "a detection scope must be closed with `close()`"]
pub struct DetectionScope {
    installed: Option<Installed>,
    _not_send: PhantomData<*const ()>,
}

impl DetectionScope {
    /// Enter a scope with the given mode
    ///
    /// `Disabled` does nothing. `OnlyActualDeadlocks` does nothing when the
    /// thread has no ambient confinement, since there is nothing that could
    /// be violated. Nor does any mode when a [`ConfinementContext`] is
    /// already ambient: waits inside are checked by that context. Otherwise
    /// the ambient confinement (possibly none) is wrapped in a new
    /// [`ConfinementContext`] which becomes ambient.
    pub fn enter(mode: DetectionMode) -> Self {
        if mode == DetectionMode::Disabled {
            return Self::inert();
        }

        let ambient = ambient::current();
        if ambient.is_none() && mode == DetectionMode::OnlyActualDeadlocks {
            return Self::inert();
        }
        if ambient.as_deref().and_then(|c| c.detector()).is_some() {
            return Self::inert();
        }

        let context = Arc::new(ConfinementContext::with_settings(
            ambient,
            mode,
            config::generate_traces(),
        ));
        let slot_value: Arc<dyn Confinement> = context.clone();
        let previous = ambient::replace(Some(Arc::clone(&slot_value)));
        let thread = get_current_thread_id();
        logger::log_event(thread, context.id(), Events::ScopeEnter);

        DetectionScope {
            installed: Some(Installed {
                context,
                slot_value,
                previous,
                thread,
            }),
            _not_send: PhantomData,
        }
    }

    /// Enter a scope with the globally configured default mode
    pub fn enter_default() -> Self {
        Self::enter(config::default_mode())
    }

    fn inert() -> Self {
        DetectionScope {
            installed: None,
            _not_send: PhantomData,
        }
    }

    /// Whether this scope installed a context
    pub fn is_active(&self) -> bool {
        self.installed.is_some()
    }

    /// The context installed by this scope
    pub fn context(&self) -> Option<&Arc<ConfinementContext>> {
        self.installed.as_ref().map(|i| &i.context)
    }

    /// Leave the scope, restoring the previously ambient confinement
    pub fn close(mut self) {
        self.restore();
    }

    fn restore(&mut self) {
        let Some(installed) = self.installed.take() else {
            return;
        };

        let current = ambient::replace(installed.previous);
        if !thread::panicking() {
            debug_assert!(
                ambient::same(&current, &Some(installed.slot_value)),
                "detection scopes must be closed in reverse order of entry"
            );
        }
        logger::log_event(installed.thread, installed.context.id(), Events::ScopeExit);
    }
}

impl Drop for DetectionScope {
    fn drop(&mut self) {
        if let Some(installed) = &self.installed
            && !thread::panicking()
        {
            UNRELEASED_SCOPES.fetch_add(1, Ordering::SeqCst);
            dispatcher::report(dispatcher::diagnostic(
                DiagnosticKind::UnreleasedScope,
                installed.thread,
                Some(installed.context.id()),
                None,
                None,
            ));
        }
        self.restore();
    }
}

/// Run `f` inside a detection scope that is always closed afterwards
pub fn with_detection<R>(mode: DetectionMode, f: impl FnOnce(&DetectionScope) -> R) -> R {
    let scope = DetectionScope::enter(mode);
    let result = f(&scope);
    scope.close();
    result
}
