//! The ambient confinement of the current thread.
//!
//! Hosts (a UI loop, a request dispatcher) install their confinement here;
//! detection scopes temporarily replace it with a detecting wrapper.

use crate::core::confinement::Confinement;
use std::cell::RefCell;
use std::sync::Arc;

thread_local! {
    static AMBIENT: RefCell<Option<Arc<dyn Confinement>>> = const { RefCell::new(None) };
}

/// The confinement installed on the current thread, if any
pub fn current() -> Option<Arc<dyn Confinement>> {
    AMBIENT.with(|slot| slot.borrow().clone())
}

/// Install `confinement` on the current thread
///
/// # Returns
/// The confinement that was installed before
pub fn replace(confinement: Option<Arc<dyn Confinement>>) -> Option<Arc<dyn Confinement>> {
    AMBIENT.with(|slot| slot.replace(confinement))
}

/// The ambient confinement, but only when it is a detecting context
pub fn current_context() -> Option<Arc<dyn Confinement>> {
    current().filter(|c| c.detector().is_some())
}

/// Whether `a` and `b` refer to the same installed confinement
pub fn same(a: &Option<Arc<dyn Confinement>>, b: &Option<Arc<dyn Confinement>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
    }
}
