//! Shared in-memory node tree with sessions, ephemeral nodes, and child watches
//!
//! One hub stands in for the external coordination store; every
//! participating "process" connects its own session. Ephemeral nodes are
//! owned by the creating session and vanish when that session expires,
//! firing Removed events to every live watch — the lease model the
//! discovery registry is built on.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use farol_api::store::{ChildEvent, ChildWatch, CreateMode};
use farol_common::StoreError;

use crate::session::MemorySession;

#[derive(Clone, Debug)]
struct NodeRecord {
    payload: Vec<u8>,
    /// Owning session for ephemeral nodes, `None` for persistent ones.
    owner: Option<String>,
}

pub(crate) struct HubInner {
    /// Path -> record. BTreeMap keeps children listings in lexicographic
    /// order, which is creation order for sequential nodes.
    nodes: Mutex<BTreeMap<String, NodeRecord>>,
    /// Watched parent path -> watcher senders.
    watches: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<ChildEvent>>>>,
    /// Per-prefix counters for sequential creates.
    sequences: Mutex<HashMap<String, u64>>,
    /// Live session ids.
    sessions: Mutex<HashSet<String>>,
    /// Fault injection: when set, every operation fails as unavailable.
    unavailable: AtomicBool,
}

/// Shared in-memory coordination store.
///
/// Cloning shares the same node tree; use [`CoordinationHub::connect`]
/// to obtain per-process sessions.
#[derive(Clone)]
pub struct CoordinationHub {
    inner: Arc<HubInner>,
}

impl Default for CoordinationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl CoordinationHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                nodes: Mutex::new(BTreeMap::new()),
                watches: Mutex::new(HashMap::new()),
                sequences: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashSet::new()),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Open a new session. Each session models one process's connection.
    pub fn connect(&self) -> MemorySession {
        let session_id = uuid::Uuid::new_v4().to_string();
        self.inner.sessions.lock().insert(session_id.clone());
        debug!("Session {} connected", session_id);
        MemorySession::new(self.clone(), session_id)
    }

    /// Toggle store-wide unavailability (fault injection for tests).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
        info!("Coordination hub unavailable={}", unavailable);
    }

    /// Expire a session: remove it and delete every ephemeral node it
    /// owns, notifying watchers. Simulates a crashed or partitioned
    /// process; expiring an unknown session is a no-op.
    pub fn expire_session(&self, session_id: &str) {
        if !self.inner.sessions.lock().remove(session_id) {
            return;
        }

        let owned: Vec<String> = {
            let nodes = self.inner.nodes.lock();
            nodes
                .iter()
                .filter(|(_, record)| record.owner.as_deref() == Some(session_id))
                .map(|(path, _)| path.clone())
                .collect()
        };

        info!(
            "Session {} expired, removing {} ephemeral nodes",
            session_id,
            owned.len()
        );

        for path in owned {
            let removed = self.inner.nodes.lock().remove(&path).is_some();
            if removed {
                self.notify(&path, ChildEvent::Removed { path: path.clone() });
            }
        }
    }

    pub fn is_session_live(&self, session_id: &str) -> bool {
        self.inner.sessions.lock().contains(session_id)
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable(
                "coordination store unreachable".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Send an event about `path` to watchers of its parent, pruning
    /// watchers whose receiver is gone.
    fn notify(&self, path: &str, event: ChildEvent) {
        let parent = parent_path(path);
        let mut watches = self.inner.watches.lock();
        if let Some(senders) = watches.get_mut(&parent) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            if senders.is_empty() {
                watches.remove(&parent);
            }
        }
    }

    pub(crate) fn create_node(
        &self,
        session_id: &str,
        path: &str,
        payload: Vec<u8>,
        mode: CreateMode,
    ) -> Result<String, StoreError> {
        self.check_available()?;

        let actual_path = if mode.is_sequential() {
            let mut sequences = self.inner.sequences.lock();
            let counter = sequences.entry(path.to_string()).or_insert(0);
            *counter += 1;
            format!("{}{:010}", path, *counter)
        } else {
            path.to_string()
        };

        {
            let mut nodes = self.inner.nodes.lock();
            if nodes.contains_key(&actual_path) {
                return Err(StoreError::NodeExists(actual_path));
            }
            let owner = mode.is_ephemeral().then(|| session_id.to_string());
            nodes.insert(
                actual_path.clone(),
                NodeRecord {
                    payload: payload.clone(),
                    owner,
                },
            );
        }

        self.notify(
            &actual_path,
            ChildEvent::Added {
                path: actual_path.clone(),
                payload,
            },
        );

        Ok(actual_path)
    }

    pub(crate) fn get_node(&self, path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check_available()?;
        Ok(self
            .inner
            .nodes
            .lock()
            .get(path)
            .map(|record| record.payload.clone()))
    }

    pub(crate) fn delete_node(&self, path: &str) -> Result<(), StoreError> {
        self.check_available()?;

        let removed = self.inner.nodes.lock().remove(path).is_some();
        if !removed {
            return Err(StoreError::NotFound(path.to_string()));
        }

        self.notify(
            path,
            ChildEvent::Removed {
                path: path.to_string(),
            },
        );
        Ok(())
    }

    pub(crate) fn child_nodes(&self, path: &str) -> Result<Vec<String>, StoreError> {
        self.check_available()?;

        let prefix = format!("{}/", path.trim_end_matches('/'));
        let nodes = self.inner.nodes.lock();
        Ok(nodes
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .filter(|(p, _)| !p[prefix.len()..].contains('/'))
            .map(|(p, _)| p.clone())
            .collect())
    }

    pub(crate) fn register_watch(&self, path: &str) -> ChildWatch {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .watches
            .lock()
            .entry(path.trim_end_matches('/').to_string())
            .or_default()
            .push(tx);
        ChildWatch::new(rx)
    }
}

fn parent_path(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use farol_api::CoordinationStore;

    use super::*;

    #[test]
    fn test_create_get_delete() {
        let hub = CoordinationHub::new();
        let session = hub.connect();

        let path = hub
            .create_node(
                session.session_id(),
                "/discovery/web/a:1",
                b"payload".to_vec(),
                CreateMode::Ephemeral,
            )
            .unwrap();
        assert_eq!(path, "/discovery/web/a:1");
        assert_eq!(hub.get_node(&path).unwrap().unwrap(), b"payload");

        hub.delete_node(&path).unwrap();
        assert!(hub.get_node(&path).unwrap().is_none());
        assert!(matches!(
            hub.delete_node(&path),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_create_if_absent() {
        let hub = CoordinationHub::new();
        let session = hub.connect();

        hub.create_node(
            session.session_id(),
            "/discovery/web/a:1",
            vec![],
            CreateMode::Ephemeral,
        )
        .unwrap();

        let err = hub
            .create_node(
                session.session_id(),
                "/discovery/web/a:1",
                vec![],
                CreateMode::Ephemeral,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::NodeExists(_)));
    }

    #[test]
    fn test_sequential_create_orders_children() {
        let hub = CoordinationHub::new();
        let session = hub.connect();

        for _ in 0..3 {
            hub.create_node(
                session.session_id(),
                "/runs/r/targets/t/commands/cmd-",
                vec![],
                CreateMode::PersistentSequential,
            )
            .unwrap();
        }

        let children = hub.child_nodes("/runs/r/targets/t/commands").unwrap();
        assert_eq!(children.len(), 3);
        assert!(children.windows(2).all(|w| w[0] < w[1]));
        assert!(children[0].ends_with("cmd-0000000001"));
    }

    #[test]
    fn test_children_excludes_grandchildren() {
        let hub = CoordinationHub::new();
        let session = hub.connect();

        hub.create_node(session.session_id(), "/a/b", vec![], CreateMode::Persistent)
            .unwrap();
        hub.create_node(
            session.session_id(),
            "/a/b/c",
            vec![],
            CreateMode::Persistent,
        )
        .unwrap();

        assert_eq!(hub.child_nodes("/a").unwrap(), vec!["/a/b".to_string()]);
        assert_eq!(hub.child_nodes("/a/b").unwrap(), vec!["/a/b/c".to_string()]);
    }

    #[tokio::test]
    async fn test_watch_receives_add_and_remove() {
        let hub = CoordinationHub::new();
        let session = hub.connect();
        let mut watch = hub.register_watch("/discovery/web");

        hub.create_node(
            session.session_id(),
            "/discovery/web/a:1",
            b"x".to_vec(),
            CreateMode::Ephemeral,
        )
        .unwrap();
        hub.delete_node("/discovery/web/a:1").unwrap();

        match watch.recv().await.unwrap() {
            ChildEvent::Added { path, payload } => {
                assert_eq!(path, "/discovery/web/a:1");
                assert_eq!(payload, b"x");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            watch.recv().await.unwrap(),
            ChildEvent::Removed { .. }
        ));
    }

    #[tokio::test]
    async fn test_session_expiry_removes_ephemerals_and_notifies() {
        let hub = CoordinationHub::new();
        let session = hub.connect();
        let session_id = session.session_id().to_string();
        let mut watch = hub.register_watch("/discovery/web");

        hub.create_node(
            &session_id,
            "/discovery/web/a:1",
            vec![],
            CreateMode::Ephemeral,
        )
        .unwrap();
        hub.create_node(&session_id, "/persistent", vec![], CreateMode::Persistent)
            .unwrap();

        let _ = watch.recv().await.unwrap();
        hub.expire_session(&session_id);

        assert!(hub.get_node("/discovery/web/a:1").unwrap().is_none());
        // persistent node survives its creator
        assert!(hub.get_node("/persistent").unwrap().is_some());
        assert!(matches!(
            watch.recv().await.unwrap(),
            ChildEvent::Removed { .. }
        ));
    }

    #[test]
    fn test_unavailable_fails_all_operations() {
        let hub = CoordinationHub::new();
        let session = hub.connect();
        hub.set_unavailable(true);

        assert!(matches!(
            hub.create_node(session.session_id(), "/a", vec![], CreateMode::Persistent),
            Err(StoreError::Unavailable(_))
        ));
        assert!(matches!(hub.get_node("/a"), Err(StoreError::Unavailable(_))));
        assert!(matches!(
            hub.child_nodes("/"),
            Err(StoreError::Unavailable(_))
        ));

        hub.set_unavailable(false);
        assert!(hub.get_node("/a").is_ok());
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/a/b/c"), "/a/b");
        assert_eq!(parent_path("/a"), "/");
    }

    /// Operations against two sessions, checked against a plain set
    /// model: the observable children always equal the endpoints
    /// created-and-not-deleted whose owning session is still live.
    #[derive(Clone, Debug)]
    enum Op {
        Create(u8, u8),
        Delete(u8),
        Expire(u8),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..8, 0u8..2).prop_map(|(n, s)| Op::Create(n, s)),
            (0u8..8).prop_map(Op::Delete),
            (0u8..2).prop_map(Op::Expire),
        ]
    }

    proptest! {
        #[test]
        fn prop_children_match_alive_set(ops in proptest::collection::vec(op_strategy(), 1..40)) {
            let hub = CoordinationHub::new();
            let mut sessions = [hub.connect(), hub.connect()];
            let mut model: std::collections::HashMap<String, usize> = Default::default();

            for op in ops {
                match op {
                    Op::Create(n, s) => {
                        let path = format!("/discovery/svc/host:{}", n);
                        let result = hub.create_node(
                            sessions[s as usize].session_id(),
                            &path,
                            vec![],
                            CreateMode::Ephemeral,
                        );
                        if model.contains_key(&path) {
                            prop_assert!(result.is_err());
                        } else {
                            prop_assert!(result.is_ok());
                            model.insert(path, s as usize);
                        }
                    }
                    Op::Delete(n) => {
                        let path = format!("/discovery/svc/host:{}", n);
                        let result = hub.delete_node(&path);
                        prop_assert_eq!(result.is_ok(), model.remove(&path).is_some());
                    }
                    Op::Expire(s) => {
                        let s = s as usize;
                        hub.expire_session(sessions[s].session_id());
                        model.retain(|_, owner| *owner != s);
                        // reconnect so later creates have a live session
                        sessions[s] = hub.connect();
                    }
                }

                let mut expected: Vec<String> = model.keys().cloned().collect();
                expected.sort();
                prop_assert_eq!(hub.child_nodes("/discovery/svc").unwrap(), expected);
            }
        }
    }
}
