//! Farol Discovery - service discovery registry
//!
//! Announce/withdraw/watch of named service endpoints over the
//! coordination store's ephemeral-node primitive. An announcement lives
//! exactly as long as the announcing session: losing the session removes
//! the endpoint and notifies every watcher, with no polling involved.

pub mod cancellable;
pub mod discovered;
pub mod listener;
pub mod metrics;

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use farol_api::store::{ChildEvent, CoordinationStore, CreateMode};
use farol_api::{Discoverable, paths};
use farol_common::{FarolError, Result, RetryPolicy, StoreError, is_valid_name};

pub use cancellable::Cancellable;
pub use discovered::ServiceDiscovered;
pub use listener::{ChangeListener, FnChangeListener};

/// Service discovery registry backed by the coordination store.
pub struct DiscoveryRegistry {
    store: Arc<dyn CoordinationStore>,
    retry: RetryPolicy,
    /// One live view per discovered service name.
    views: DashMap<String, ServiceDiscovered>,
    /// Serializes view creation so one service gets one watch task.
    creation_lock: tokio::sync::Mutex<()>,
}

impl DiscoveryRegistry {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self::with_retry_policy(store, RetryPolicy::default())
    }

    pub fn with_retry_policy(store: Arc<dyn CoordinationStore>, retry: RetryPolicy) -> Self {
        Self {
            store,
            retry,
            views: DashMap::new(),
            creation_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> Arc<dyn CoordinationStore> {
        self.store.clone()
    }

    /// Register an ephemeral endpoint for `service_name`.
    ///
    /// Within the propagation bound, all current and future watchers of
    /// the service observe the new entry. Transient store failures are
    /// retried with backoff; exhaustion yields `Registration`, and an
    /// endpoint that is still announced by a live session yields
    /// `DuplicateRegistration`. The returned [`Cancellable`] withdraws
    /// the endpoint exactly once.
    pub async fn announce(&self, service_name: &str, host: &str, port: u16) -> Result<Cancellable> {
        if !is_valid_name(service_name) {
            return Err(FarolError::Registration(format!(
                "invalid service name '{}'",
                service_name
            )));
        }

        let discoverable = Discoverable::new(service_name, host, port);
        let path = paths::discovery_endpoint(service_name, host, port);
        let payload = serde_json::to_vec(&discoverable)
            .map_err(|e| FarolError::Registration(e.to_string()))?;

        let result = self
            .retry
            .run_if(
                "announce",
                || self.store.create(&path, payload.clone(), CreateMode::Ephemeral),
                StoreError::is_transient,
            )
            .await;

        match result {
            Ok(actual_path) => {
                info!("Announced {}", discoverable);
                metrics::metrics()
                    .announcements
                    .with_label_values(&[service_name, "ok"])
                    .inc();

                let store = self.store.clone();
                let service = service_name.to_string();
                Ok(Cancellable::new(move || {
                    metrics::metrics()
                        .withdrawals
                        .with_label_values(&[&service])
                        .inc();
                    tokio::spawn(async move {
                        match store.delete(&actual_path).await {
                            Ok(()) => debug!("Withdrew '{}'", actual_path),
                            Err(e) => warn!("Failed to withdraw '{}': {}", actual_path, e),
                        }
                    });
                }))
            }
            Err(StoreError::NodeExists(_)) => {
                metrics::metrics()
                    .announcements
                    .with_label_values(&[service_name, "duplicate"])
                    .inc();
                Err(FarolError::DuplicateRegistration {
                    service: service_name.to_string(),
                    endpoint: discoverable.endpoint(),
                })
            }
            Err(e) => {
                metrics::metrics()
                    .announcements
                    .with_label_values(&[service_name, "error"])
                    .inc();
                Err(FarolError::Registration(e.to_string()))
            }
        }
    }

    /// Obtain the live view for `service_name`.
    ///
    /// The first call registers the child watch, performs the initial
    /// full fetch, and starts the incremental update task; later calls
    /// return the same shared view.
    pub async fn discover(&self, service_name: &str) -> Result<ServiceDiscovered> {
        if let Some(view) = self.views.get(service_name) {
            return Ok(view.clone());
        }

        let _guard = self.creation_lock.lock().await;
        if let Some(view) = self.views.get(service_name) {
            return Ok(view.clone());
        }

        let view = self.create_view(service_name).await?;
        self.views.insert(service_name.to_string(), view.clone());
        Ok(view)
    }

    async fn create_view(&self, service_name: &str) -> Result<ServiceDiscovered> {
        let view = ServiceDiscovered::new(service_name);
        let service_path = paths::discovery_service(service_name);

        // watch first, list second: every node is seen either by the
        // initial fetch or by the watch, duplicates collapse by path
        let mut watch = self.store.watch_children(&service_path);

        let children = self
            .retry
            .run_if(
                "discover",
                || self.store.children(&service_path),
                StoreError::is_transient,
            )
            .await
            .map_err(FarolError::Store)?;

        for child in children {
            if let Ok(Some(payload)) = self.store.get(&child).await
                && let Some(discoverable) = parse_discoverable(service_name, &child, &payload)
            {
                view.apply_added(&child, discoverable);
            }
        }

        debug!(
            "Discovered service '{}' with {} initial endpoints",
            service_name,
            view.len()
        );

        let updater_view = view.clone();
        let service = service_name.to_string();
        tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                let mut batch = vec![event];
                batch.extend(watch.drain_ready());

                let mut changed = false;
                for event in batch {
                    match event {
                        ChildEvent::Added { path, payload } => {
                            if let Some(discoverable) =
                                parse_discoverable(&service, &path, &payload)
                            {
                                changed |= updater_view.apply_added(&path, discoverable);
                            }
                        }
                        ChildEvent::Removed { path } => {
                            changed |= updater_view.apply_removed(&path);
                        }
                    }
                }

                if changed {
                    updater_view.publish();
                }
            }
            debug!("Watch stream for service '{}' closed", service);
        });

        Ok(view)
    }
}

fn parse_discoverable(service_name: &str, path: &str, payload: &[u8]) -> Option<Discoverable> {
    match serde_json::from_slice::<Discoverable>(payload) {
        Ok(discoverable) if discoverable.service_name == service_name => Some(discoverable),
        Ok(discoverable) => {
            warn!(
                "Node '{}' announces service '{}', expected '{}', skipping",
                path, discoverable.service_name, service_name
            );
            None
        }
        Err(e) => {
            warn!("Malformed discoverable at '{}': {}, skipping", path, e);
            None
        }
    }
}
