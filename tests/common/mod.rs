use blockwatch::{Blockwatch, ContextId, Diagnostic, DiagnosticKind};
use std::sync::{Arc, Mutex as StdMutex, mpsc};
use std::time::Duration;

#[allow(dead_code)]
pub const DETECTION_TIMEOUT: Duration = Duration::from_secs(3);
#[allow(dead_code)]
pub const QUIET_TIMEOUT: Duration = Duration::from_millis(300);

pub struct DetectorHarness {
    pub rx: mpsc::Receiver<Diagnostic>,
    pub reported: Arc<StdMutex<Vec<Diagnostic>>>,
}

/// Start blockwatch with `configure` applied and collect every diagnostic
pub fn start_detector(configure: impl FnOnce(Blockwatch) -> Blockwatch) -> DetectorHarness {
    let (tx, rx) = mpsc::channel::<Diagnostic>();
    let reported = Arc::new(StdMutex::new(Vec::new()));
    let sink = Arc::clone(&reported);

    let builder = Blockwatch::new().callback(move |diagnostic| {
        sink.lock().unwrap().push(diagnostic.clone());
        let _ = tx.send(diagnostic);
    });

    configure(builder)
        .start()
        .expect("Failed to initialize blockwatch");

    DetectorHarness { rx, reported }
}

#[allow(dead_code)]
pub fn expect_diagnostic(
    h: &DetectorHarness,
    kind: DiagnosticKind,
    timeout: Duration,
) -> Diagnostic {
    loop {
        match h.rx.recv_timeout(timeout) {
            Ok(diagnostic) if diagnostic.kind == kind => return diagnostic,
            Ok(_) => continue,
            Err(_) => panic!("No {kind:?} diagnostic within {timeout:?}"),
        }
    }
}

#[allow(dead_code)]
pub fn expect_context_diagnostic(
    h: &DetectorHarness,
    kind: DiagnosticKind,
    context_id: ContextId,
    timeout: Duration,
) -> Diagnostic {
    loop {
        match h.rx.recv_timeout(timeout) {
            Ok(d) if d.kind == kind && d.context_id == Some(context_id) => return d,
            Ok(_) => continue,
            Err(_) => panic!("No {kind:?} diagnostic for context {context_id} within {timeout:?}"),
        }
    }
}

#[allow(dead_code)]
pub fn assert_no_diagnostic(h: &DetectorHarness, kind: DiagnosticKind, timeout: Duration) {
    std::thread::sleep(timeout);
    let reported = h.reported.lock().unwrap();
    assert!(
        reported.iter().all(|d| d.kind != kind),
        "Unexpected {kind:?} diagnostic: {reported:?}"
    );
}

#[allow(dead_code)]
pub fn count(h: &DetectorHarness, kind: DiagnosticKind) -> usize {
    h.reported
        .lock()
        .unwrap()
        .iter()
        .filter(|d| d.kind == kind)
        .count()
}
