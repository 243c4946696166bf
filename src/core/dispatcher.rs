//! Delivery of diagnostics to the user callback
//!
//! Callbacks run on a dedicated background thread so that reporting never
//! runs user code on the thread that is blocked (or about to raise).

use crate::core::logger;
use crate::core::types::{ContextId, Diagnostic, DiagnosticKind, Events, ThreadId};
use chrono::Utc;
use crossbeam_channel::{Sender, unbounded};
use parking_lot::RwLock;
use std::sync::Arc;

/// Callback invoked for every reported diagnostic
pub type DiagnosticCallback = Arc<dyn Fn(Diagnostic) + Send + Sync>;

// Global dispatcher for asynchronous callback execution
lazy_static::lazy_static! {
    static ref DISPATCHER: Dispatcher = Dispatcher::new();
    static ref CALLBACK: RwLock<Option<DiagnosticCallback>> = RwLock::new(None);
}

/// Background dispatcher for asynchronous callback execution
///
/// Runs a dedicated thread that receives diagnostics through a channel
/// and executes the registered callback.
struct Dispatcher {
    /// Channel sender for transmitting diagnostics
    sender: Sender<Diagnostic>,
}

impl Dispatcher {
    /// Create a new dispatcher with a background thread and channel
    fn new() -> Self {
        let (tx, rx) = unbounded::<Diagnostic>();

        std::thread::spawn(move || {
            while let Ok(diagnostic) = rx.recv() {
                let callback = CALLBACK.read().clone();
                match callback {
                    Some(cb) => cb(diagnostic),
                    None => eprintln!("[blockwatch] {}", diagnostic.message()),
                }
            }
        });

        Dispatcher { sender: tx }
    }

    fn send(&self, diagnostic: Diagnostic) {
        // The receiver lives for the whole process
        let _ = self.sender.send(diagnostic);
    }
}

/// Replace the callback that receives diagnostics
///
/// With no callback set, diagnostics are printed to stderr.
pub fn set_callback<F>(callback: F)
where
    F: Fn(Diagnostic) + Send + Sync + 'static,
{
    *CALLBACK.write() = Some(Arc::new(callback));
}

/// Go back to printing diagnostics to stderr
pub fn clear_callback() {
    *CALLBACK.write() = None;
}

/// Build a diagnostic stamped with the current time
pub(crate) fn diagnostic(
    kind: DiagnosticKind,
    thread_id: ThreadId,
    context_id: Option<ContextId>,
    blocked_for_ms: Option<u64>,
    trace: Option<String>,
) -> Diagnostic {
    Diagnostic {
        kind,
        thread_id,
        context_id,
        blocked_for_ms,
        trace,
        timestamp: Utc::now().to_rfc3339(),
    }
}

/// Log a diagnostic and hand it to the callback thread
pub(crate) fn report(diagnostic: Diagnostic) {
    let event = match diagnostic.kind {
        DiagnosticKind::Deadlock | DiagnosticKind::PotentialDeadlock => Events::Deadlock,
        DiagnosticKind::BlockingWarning => Events::BlockingWarning,
        DiagnosticKind::UnreleasedScope => Events::UnreleasedScope,
    };
    logger::log_event(
        diagnostic.thread_id,
        diagnostic.context_id.unwrap_or_default(),
        event,
    );
    DISPATCHER.send(diagnostic);
}
