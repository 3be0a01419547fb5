//! One client session against the in-memory hub
//!
//! Implements the `CoordinationStore` contract; dropping or closing the
//! session expires it, which removes its ephemeral nodes and notifies
//! watchers exactly as a lost connection to the real store would.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use farol_api::store::{ChildWatch, CoordinationStore, CreateMode};
use farol_common::StoreError;

use crate::hub::CoordinationHub;

pub struct MemorySession {
    hub: CoordinationHub,
    session_id: String,
    closed: Arc<AtomicBool>,
}

impl MemorySession {
    pub(crate) fn new(hub: CoordinationHub, session_id: String) -> Self {
        Self {
            hub,
            session_id,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::SessionExpired)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CoordinationStore for MemorySession {
    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn create(
        &self,
        path: &str,
        payload: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, StoreError> {
        self.check_open()?;
        self.hub.create_node(&self.session_id, path, payload, mode)
    }

    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_open()?;
        self.hub.get_node(path)
    }

    async fn delete(&self, path: &str) -> Result<(), StoreError> {
        self.check_open()?;
        self.hub.delete_node(path)
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.check_open()?;
        self.hub.child_nodes(path)
    }

    fn watch_children(&self, path: &str) -> ChildWatch {
        self.hub.register_watch(path)
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Closing session {}", self.session_id);
            self.hub.expire_session(&self.session_id);
        }
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.hub.expire_session(&self.session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_session_round_trip() {
        let hub = CoordinationHub::new();
        let session = hub.connect();

        let path = session
            .create("/a/b", b"v".to_vec(), CreateMode::Ephemeral)
            .await
            .unwrap();
        assert_eq!(session.get(&path).await.unwrap().unwrap(), b"v");

        session.delete(&path).await.unwrap();
        assert!(session.get(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_close_expires_ephemerals() {
        let hub = CoordinationHub::new();
        let session = hub.connect();
        let observer = hub.connect();

        session
            .create("/svc/a:1", vec![], CreateMode::Ephemeral)
            .await
            .unwrap();
        session.close().await;

        assert!(observer.get("/svc/a:1").await.unwrap().is_none());
        assert!(matches!(
            session.get("/svc/a:1").await,
            Err(StoreError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn test_drop_expires_ephemerals() {
        let hub = CoordinationHub::new();
        let observer = hub.connect();

        {
            let session = hub.connect();
            session
                .create("/svc/a:1", vec![], CreateMode::Ephemeral)
                .await
                .unwrap();
        }

        assert!(observer.get("/svc/a:1").await.unwrap().is_none());
    }
}
