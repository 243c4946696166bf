//! Pending asynchronous operations
//!
//! A [`Task`] is the result of work running elsewhere. Like an awaited
//! continuation, its completion is scheduled back onto the confinement that
//! was ambient when the task was spawned. If that confinement's thread is
//! blocked waiting for the task, the completion can never run: with
//! detection on, the refusal surfaces as [`WaitError::Deadlock`] instead.
//!
//! Only a completion that arrives while the wait is in progress is caught.
//! One queued on the confinement before the wait began is not seen.

use crate::core::ambient;
use crate::core::confinement::Confinement;
use crate::core::error::WaitError;
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

enum State<T> {
    Pending,
    Ready(Result<T, WaitError>),
    Taken,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    ready: Condvar,
}

impl<T> Shared<T> {
    fn complete(&self, outcome: Result<T, WaitError>) {
        let mut state = self.state.lock();
        if matches!(*state, State::Pending) {
            *state = State::Ready(outcome);
            self.ready.notify_all();
        }
    }

    fn wake(&self) {
        let _state = self.state.lock();
        self.ready.notify_all();
    }
}

/// A pending result produced by work running on another thread
pub struct Task<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Task<T> {
    /// Run `work` on a worker thread
    ///
    /// The ambient confinement of the calling thread is captured now; when
    /// `work` finishes, the task is completed by a continuation scheduled
    /// onto it. A panic in `work` completes the task with
    /// [`WaitError::Faulted`].
    pub fn spawn<F>(work: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let confinement = ambient::current();
        let task = Task::pending();
        let shared = Arc::clone(&task.shared);

        thread::spawn(move || {
            let outcome = catch_unwind(AssertUnwindSafe(work))
                .map_err(|payload| WaitError::Faulted(panic_message(payload)));
            resume(confinement, shared, outcome);
        });

        task
    }

    /// A task that produces `value` after `delay`
    pub fn delay(delay: Duration, value: T) -> Self {
        Task::spawn(move || {
            thread::sleep(delay);
            value
        })
    }

    /// An already completed task
    pub fn ready(value: T) -> Self {
        let task = Task::pending();
        task.shared.complete(Ok(value));
        task
    }

    fn pending() -> Self {
        Task {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending),
                ready: Condvar::new(),
            }),
        }
    }

    /// Whether the task has an outcome (or had one that was taken)
    pub fn is_completed(&self) -> bool {
        !matches!(*self.shared.state.lock(), State::Pending)
    }

    /// Block the calling thread until the task completes
    ///
    /// This is the raw wait with no detection; use the functions in
    /// [`crate::wait`] instead.
    pub(crate) fn block_until_complete(
        &self,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), WaitError> {
        let deadline = timeout.map(|t| Instant::now() + t);

        let _registration = cancel.map(|token| {
            let shared = Arc::clone(&self.shared);
            token.register(move || shared.wake())
        });

        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                State::Ready(Ok(_)) => return Ok(()),
                State::Ready(Err(err)) => return Err(err.clone()),
                State::Taken => return Err(WaitError::AlreadyTaken),
                State::Pending => {}
            }
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Err(WaitError::Cancelled);
            }
            match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    let timed_out = self.shared.ready.wait_until(&mut state, deadline).timed_out();
                    if timed_out && matches!(*state, State::Pending) {
                        return Err(WaitError::TimedOut(timeout));
                    }
                }
                _ => self.shared.ready.wait(&mut state),
            }
        }
    }

    /// Take the outcome of a completed task
    pub(crate) fn take(&self) -> Result<T, WaitError> {
        let mut state = self.shared.state.lock();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Ready(outcome) => outcome,
            State::Taken => Err(WaitError::AlreadyTaken),
            // Only reachable when called before the task completed
            State::Pending => {
                *state = State::Pending;
                Err(WaitError::TimedOut(Duration::ZERO))
            }
        }
    }
}

/// Complete `shared` on the captured confinement
fn resume<T: Send + 'static>(
    confinement: Option<Arc<dyn Confinement>>,
    shared: Arc<Shared<T>>,
    outcome: Result<T, WaitError>,
) {
    let Some(confinement) = confinement else {
        shared.complete(outcome);
        return;
    };

    let target = Arc::clone(&shared);
    if let Err(deadlock) = confinement.schedule(Box::new(move || target.complete(outcome))) {
        // The continuation was refused; hand the signal to whoever is waiting
        shared.complete(Err(WaitError::Deadlock(deadlock)));
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

type Listener = Box<dyn Fn() + Send + Sync>;

struct TokenInner {
    cancelled: AtomicBool,
    next_listener: AtomicU64,
    listeners: Mutex<Vec<(u64, Listener)>>,
}

/// Requests cancellation of blocking waits
///
/// Clones share the same cancellation state.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        CancellationToken {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                next_listener: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Cancel every wait observing this token. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        for (_, listener) in self.inner.listeners.lock().iter() {
            listener();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    fn register(&self, listener: impl Fn() + Send + Sync + 'static) -> Registration {
        let id = self.inner.next_listener.fetch_add(1, Ordering::Relaxed);
        self.inner.listeners.lock().push((id, Box::new(listener)));
        Registration {
            token: Arc::clone(&self.inner),
            id,
        }
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Removes a cancellation listener when dropped
struct Registration {
    token: Arc<TokenInner>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.token.listeners.lock().retain(|(id, _)| *id != self.id);
    }
}
