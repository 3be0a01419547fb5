//! Contracts for the external collaborators Farol consumes
//!
//! The coordination store, the durable credential store, and the
//! launcher/resource-manager are capabilities provided by the
//! environment; this layer only defines how they are used.

use async_trait::async_trait;
use tokio::sync::mpsc;

use farol_common::{Result, StoreError};

/// Node creation mode for the coordination store.
///
/// Ephemeral nodes are tied to the creating session and are removed
/// automatically when that session expires. Sequential modes append a
/// zero-padded monotonic counter to the requested path.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    PersistentSequential,
    Ephemeral,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Change notification for the children of a watched path.
#[derive(Clone, Debug)]
pub enum ChildEvent {
    Added { path: String, payload: Vec<u8> },
    Removed { path: String },
}

impl ChildEvent {
    pub fn path(&self) -> &str {
        match self {
            ChildEvent::Added { path, .. } => path,
            ChildEvent::Removed { path } => path,
        }
    }
}

/// Stream of [`ChildEvent`]s for one watched path.
///
/// Events are delivered strictly after the watch is registered; nothing
/// is lost between registration and a subsequent `children()` call, so
/// a watcher that registers first and lists second observes every node.
pub struct ChildWatch {
    rx: mpsc::UnboundedReceiver<ChildEvent>,
}

impl ChildWatch {
    pub fn new(rx: mpsc::UnboundedReceiver<ChildEvent>) -> Self {
        Self { rx }
    }

    /// Next change, or `None` once the watch is closed.
    pub async fn recv(&mut self) -> Option<ChildEvent> {
        self.rx.recv().await
    }

    /// Drain whatever is immediately available without waiting.
    pub fn drain_ready(&mut self) -> Vec<ChildEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Client session against the external strongly-consistent,
/// watchable key/value store.
///
/// One value of this trait is one session: every ephemeral node created
/// through it disappears automatically when the session expires, and
/// every live watch observes the removals. Not reimplemented here —
/// `farol-coordination` ships an in-process stand-in for tests and
/// single-host runs.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Session identifier assigned at connect time.
    fn session_id(&self) -> &str;

    /// Create a node. Create-if-absent: an existing live node yields
    /// `StoreError::NodeExists`. Returns the actual path (sequential
    /// modes append the counter).
    async fn create(
        &self,
        path: &str,
        payload: Vec<u8>,
        mode: CreateMode,
    ) -> std::result::Result<String, StoreError>;

    /// Read a node payload, `None` when absent.
    async fn get(&self, path: &str) -> std::result::Result<Option<Vec<u8>>, StoreError>;

    /// Delete a node. Deleting an absent node yields `NotFound`.
    async fn delete(&self, path: &str) -> std::result::Result<(), StoreError>;

    /// List direct children of a path as full paths, in lexicographic
    /// order (sequential nodes therefore list in creation order).
    async fn children(&self, path: &str) -> std::result::Result<Vec<String>, StoreError>;

    /// Watch the direct children of a path.
    fn watch_children(&self, path: &str) -> ChildWatch;

    /// Close the session, expiring its ephemeral nodes.
    async fn close(&self);
}

/// Durable store for versioned credential bundles, reachable by every
/// target of a run. The single source of truth for "current version".
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// Persist a bundle version. Idempotent: writing the same version
    /// with the same payload twice is a no-op; a conflicting payload
    /// for an existing version is rejected with `NodeExists`.
    async fn put(
        &self,
        run_id: &str,
        version: u64,
        payload: &[u8],
    ) -> std::result::Result<(), StoreError>;

    /// Fetch one bundle version, `None` when absent.
    async fn get(
        &self,
        run_id: &str,
        version: u64,
    ) -> std::result::Result<Option<Vec<u8>>, StoreError>;

    /// Highest version written for the run, `None` before the first write.
    async fn latest_version(&self, run_id: &str) -> std::result::Result<Option<u64>, StoreError>;
}

/// Process placement and start/stop primitives.
///
/// Provided by the cluster integration; this layer only consumes
/// "target process X is alive at endpoint Y" through the run registry.
#[async_trait]
pub trait ProcessLauncher: Send + Sync + 'static {
    async fn launch(&self, run_id: &str, target_id: &str) -> Result<()>;

    async fn stop(&self, run_id: &str, target_id: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mode() {
        assert!(CreateMode::Ephemeral.is_ephemeral());
        assert!(CreateMode::EphemeralSequential.is_ephemeral());
        assert!(!CreateMode::Persistent.is_ephemeral());

        assert!(CreateMode::PersistentSequential.is_sequential());
        assert!(!CreateMode::Ephemeral.is_sequential());
    }

    #[test]
    fn test_child_event_path() {
        let added = ChildEvent::Added {
            path: "/a/b".to_string(),
            payload: vec![1],
        };
        assert_eq!(added.path(), "/a/b");

        let removed = ChildEvent::Removed {
            path: "/a/c".to_string(),
        };
        assert_eq!(removed.path(), "/a/c");
    }

    #[tokio::test]
    async fn test_child_watch_drain_ready() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watch = ChildWatch::new(rx);

        tx.send(ChildEvent::Removed {
            path: "/a".to_string(),
        })
        .unwrap();
        tx.send(ChildEvent::Removed {
            path: "/b".to_string(),
        })
        .unwrap();

        let drained = watch.drain_ready();
        assert_eq!(drained.len(), 2);
        assert!(watch.drain_ready().is_empty());
    }
}
