//! One-shot cancellation handle for registrations

use parking_lot::Mutex;

/// Handle owning exactly one registration (an announcement or a change
/// listener). Cancelling removes that registration; the second and
/// every later call is a no-op.
pub struct Cancellable {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Cancellable {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// A handle over nothing, useful as a placeholder.
    pub fn noop() -> Self {
        Self {
            action: Mutex::new(None),
        }
    }

    /// Remove the owned registration. Idempotent.
    pub fn cancel(&self) {
        let action = self.action.lock().take();
        if let Some(action) = action {
            action();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.action.lock().is_none()
    }
}

impl std::fmt::Debug for Cancellable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cancellable")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_cancel_runs_action_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let cancellable = Cancellable::new(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!cancellable.is_cancelled());
        cancellable.cancel();
        cancellable.cancel();
        cancellable.cancel();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cancellable.is_cancelled());
    }

    #[test]
    fn test_noop_is_already_cancelled() {
        let cancellable = Cancellable::noop();
        assert!(cancellable.is_cancelled());
        cancellable.cancel();
    }
}
