//! Live view of one service's endpoint set
//!
//! The view caches the coordination store's current children and pushes
//! change batches to registered listeners through a dedicated dispatch
//! task, so listener execution is decoupled from both the store watch
//! and the frames that call `announce`/`discover`.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use farol_api::{Discoverable, DiscoveryEvent};

use crate::cancellable::Cancellable;
use crate::listener::ChangeListener;
use crate::metrics;

struct ListenerEntry {
    id: u64,
    active: Arc<AtomicBool>,
    listener: Arc<dyn ChangeListener>,
}

struct DispatchJob {
    recipients: Vec<(Arc<AtomicBool>, Arc<dyn ChangeListener>)>,
    event: DiscoveryEvent,
}

struct DiscoveredInner {
    service_name: String,
    /// key = store node path
    snapshot: RwLock<HashMap<String, Discoverable>>,
    listeners: Mutex<Vec<ListenerEntry>>,
    next_listener_id: AtomicU64,
    dispatch_tx: mpsc::UnboundedSender<DispatchJob>,
}

/// The live, mutable set of [`Discoverable`] for one service name.
///
/// Cheap to clone; all clones share the same underlying view.
#[derive(Clone)]
pub struct ServiceDiscovered {
    inner: Arc<DiscoveredInner>,
}

impl ServiceDiscovered {
    /// Create an empty view and start its dispatch task.
    pub(crate) fn new(service_name: &str) -> Self {
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel::<DispatchJob>();

        tokio::spawn(async move {
            while let Some(job) = dispatch_rx.recv().await {
                for (active, listener) in job.recipients {
                    // cancelled listeners get nothing, even if a job was
                    // queued before cancellation
                    if active.load(Ordering::SeqCst) {
                        listener.on_change(&job.event);
                    }
                }
            }
        });

        Self {
            inner: Arc::new(DiscoveredInner {
                service_name: service_name.to_string(),
                snapshot: RwLock::new(HashMap::new()),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(0),
                dispatch_tx,
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// Point-in-time snapshot of the current endpoint set.
    pub fn endpoints(&self) -> Vec<Discoverable> {
        let mut endpoints: Vec<Discoverable> =
            self.inner.snapshot.read().values().cloned().collect();
        endpoints.sort_by(|a, b| a.endpoint().cmp(&b.endpoint()));
        endpoints
    }

    pub fn contains(&self, discoverable: &Discoverable) -> bool {
        self.inner
            .snapshot
            .read()
            .values()
            .any(|d| d == discoverable)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.snapshot.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.snapshot.read().len()
    }

    /// Register a change callback.
    ///
    /// The listener immediately receives the current snapshot (delivered
    /// on the dispatch task, never in this call frame) and then every
    /// add/remove batch. Returns a [`Cancellable`]; after `cancel()`
    /// returns no further notifications are delivered on this handle,
    /// though a notification already executing may still complete.
    pub fn watch_changes(&self, listener: Arc<dyn ChangeListener>) -> Cancellable {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let active = Arc::new(AtomicBool::new(true));

        self.inner.listeners.lock().push(ListenerEntry {
            id,
            active: active.clone(),
            listener: listener.clone(),
        });

        // initial snapshot for just this listener
        let _ = self.inner.dispatch_tx.send(DispatchJob {
            recipients: vec![(active.clone(), listener)],
            event: self.current_event(),
        });

        debug!(
            "Registered change listener {} on service '{}'",
            id, self.inner.service_name
        );

        let inner = self.inner.clone();
        Cancellable::new(move || {
            active.store(false, Ordering::SeqCst);
            inner.listeners.lock().retain(|entry| entry.id != id);
        })
    }

    fn current_event(&self) -> DiscoveryEvent {
        DiscoveryEvent {
            service_name: self.inner.service_name.clone(),
            endpoints: self.endpoints(),
        }
    }

    /// Apply one added node. Returns whether the set changed.
    pub(crate) fn apply_added(&self, path: &str, discoverable: Discoverable) -> bool {
        let mut snapshot = self.inner.snapshot.write();
        match snapshot.get(path) {
            Some(existing) if *existing == discoverable => false,
            _ => {
                snapshot.insert(path.to_string(), discoverable);
                true
            }
        }
    }

    /// Apply one removed node. Returns whether the set changed.
    pub(crate) fn apply_removed(&self, path: &str) -> bool {
        self.inner.snapshot.write().remove(path).is_some()
    }

    /// Push the current snapshot to every active listener.
    pub(crate) fn publish(&self) {
        let event = self.current_event();
        metrics::metrics()
            .notifications
            .with_label_values(&[&self.inner.service_name])
            .inc();
        metrics::metrics()
            .endpoints
            .with_label_values(&[&self.inner.service_name])
            .set(event.endpoints.len() as f64);

        let recipients: Vec<_> = self
            .inner
            .listeners
            .lock()
            .iter()
            .filter(|entry| entry.active.load(Ordering::SeqCst))
            .map(|entry| (entry.active.clone(), entry.listener.clone()))
            .collect();

        if !recipients.is_empty() {
            let _ = self.inner.dispatch_tx.send(DispatchJob { recipients, event });
        }
    }
}
