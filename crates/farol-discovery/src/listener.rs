//! Discovery change listener trait

use farol_api::DiscoveryEvent;

/// Trait for receiving discovery change events.
///
/// Implement this to be notified when a watched service's endpoint set
/// changes. Listeners are invoked on the view's dispatch task, never in
/// the frame that registered them; long work should be offloaded so
/// other listeners are not delayed.
pub trait ChangeListener: Send + Sync + 'static {
    /// Called with the full current endpoint set after every change
    /// batch, and once immediately after registration.
    fn on_change(&self, event: &DiscoveryEvent);
}

/// A simple listener that invokes a closure.
pub struct FnChangeListener<F>
where
    F: Fn(&DiscoveryEvent) + Send + Sync + 'static,
{
    f: F,
}

impl<F> FnChangeListener<F>
where
    F: Fn(&DiscoveryEvent) + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ChangeListener for FnChangeListener<F>
where
    F: Fn(&DiscoveryEvent) + Send + Sync + 'static,
{
    fn on_change(&self, event: &DiscoveryEvent) {
        (self.f)(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use farol_api::Discoverable;

    use super::*;

    #[test]
    fn test_fn_change_listener() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = seen.clone();

        let listener = FnChangeListener::new(move |event: &DiscoveryEvent| {
            assert_eq!(event.service_name, "web");
            seen_clone.store(event.endpoints.len(), Ordering::SeqCst);
        });

        listener.on_change(&DiscoveryEvent {
            service_name: "web".to_string(),
            endpoints: vec![Discoverable::new("web", "10.0.0.1", 8080)],
        });

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
