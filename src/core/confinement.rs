//! Confinement mechanisms: places a continuation can be scheduled onto.
//!
//! A confinement guarantees that everything scheduled onto it runs on one
//! specific thread, the way a UI dispatcher does. [`LocalQueue`] is such a
//! mechanism. When no confinement is present, continuations run on a
//! detached background thread instead (see [`spawn_detached`]).

use crate::core::context::ConfinementContext;
use crate::core::error::DeadlockError;
use crate::core::types::{ThreadId, get_current_thread_id};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// A unit of work resuming after an asynchronous operation completes
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Something a continuation can be scheduled onto
pub trait Confinement: Send + Sync {
    /// Hand `continuation` over to this confinement. Must never block.
    fn schedule(&self, continuation: Continuation) -> Result<(), DeadlockError>;

    /// An independent instance targeting the same confinement, if supported
    fn duplicate(&self) -> Option<Arc<dyn Confinement>> {
        None
    }

    /// Returns the detecting context when this confinement is one
    fn detector(&self) -> Option<&ConfinementContext> {
        None
    }
}

/// Run `continuation` on a fresh background thread
///
/// This is what scheduling means when there is no confinement at all.
pub fn spawn_detached(continuation: Continuation) {
    thread::spawn(continuation);
}

/// A single-threaded continuation queue
///
/// Continuations scheduled from any thread are queued and only run when the
/// owning thread calls [`LocalQueue::run_pending`] or
/// [`LocalQueue::run_next_timeout`]. If the owner is blocked, nothing
/// queued here can run.
///
/// # Example
///
/// ```rust
/// use blockwatch::{Confinement, LocalQueue};
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// let queue = LocalQueue::new();
/// let hits = Arc::new(AtomicUsize::new(0));
///
/// let counter = Arc::clone(&hits);
/// queue
///     .schedule(Box::new(move || {
///         counter.fetch_add(1, Ordering::SeqCst);
///     }))
///     .unwrap();
///
/// assert_eq!(queue.run_pending(), 1);
/// assert_eq!(hits.load(Ordering::SeqCst), 1);
/// ```
#[derive(Clone)]
pub struct LocalQueue {
    sender: Sender<Continuation>,
    receiver: Receiver<Continuation>,
    owner: ThreadId,
}

impl LocalQueue {
    /// Create a queue owned by the current thread
    pub fn new() -> Arc<Self> {
        let (sender, receiver) = unbounded();
        Arc::new(LocalQueue {
            sender,
            receiver,
            owner: get_current_thread_id(),
        })
    }

    /// Thread that is allowed to drain this queue
    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    /// Number of continuations waiting to run
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Run every continuation that is currently queued
    ///
    /// # Returns
    /// The number of continuations that ran
    ///
    /// # Panics
    /// Panics when called from any thread other than the owner
    pub fn run_pending(&self) -> usize {
        self.assert_owner();
        let mut ran = 0;
        while let Ok(continuation) = self.receiver.try_recv() {
            continuation();
            ran += 1;
        }
        ran
    }

    /// Wait up to `timeout` for one continuation and run it
    ///
    /// # Returns
    /// `true` if a continuation ran, `false` if the timeout elapsed first
    pub fn run_next_timeout(&self, timeout: Duration) -> bool {
        self.assert_owner();
        match self.receiver.recv_timeout(timeout) {
            Ok(continuation) => {
                continuation();
                true
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }

    fn assert_owner(&self) {
        assert_eq!(
            get_current_thread_id(),
            self.owner,
            "LocalQueue can only be drained by the thread that created it"
        );
    }
}

impl Confinement for LocalQueue {
    fn schedule(&self, continuation: Continuation) -> Result<(), DeadlockError> {
        // We hold a receiver ourselves, so the channel is never disconnected
        let _ = self.sender.send(continuation);
        Ok(())
    }

    fn duplicate(&self) -> Option<Arc<dyn Confinement>> {
        Some(Arc::new(self.clone()))
    }
}
