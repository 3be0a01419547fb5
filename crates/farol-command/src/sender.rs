//! Sending side of the command channel
//!
//! Envelopes are appended as persistent sequential nodes under the
//! target's queue; acknowledgements are routed back to waiting callers
//! by one watch task per target.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use farol_api::store::{ChildEvent, CoordinationStore, CreateMode};
use farol_api::{Ack, AckStatus, Command, CommandEnvelope, paths};
use farol_common::{FarolError, Result, RetryPolicy, StoreError};

/// Sends typed commands to the targets of one run.
///
/// FIFO is guaranteed per (sender, target): sequences are allocated by
/// this sender and envelopes are appended in order.
pub struct CommandSender {
    store: Arc<dyn CoordinationStore>,
    run_id: String,
    sender_id: String,
    sequence: AtomicU64,
    retry: RetryPolicy,
    /// envelope id -> waiting caller
    pending: Arc<DashMap<String, oneshot::Sender<Ack>>>,
    /// targets that already have an ack-routing task
    ack_routers: DashMap<String, ()>,
}

impl CommandSender {
    pub fn new(store: Arc<dyn CoordinationStore>, run_id: &str, sender_id: &str) -> Self {
        Self::with_retry_policy(store, run_id, sender_id, RetryPolicy::default())
    }

    pub fn with_retry_policy(
        store: Arc<dyn CoordinationStore>,
        run_id: &str,
        sender_id: &str,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            run_id: run_id.to_string(),
            sender_id: sender_id.to_string(),
            sequence: AtomicU64::new(0),
            retry,
            pending: Arc::new(DashMap::new()),
            ack_routers: DashMap::new(),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Fire-and-forget dispatch: the envelope is durably appended to the
    /// target's queue; delivery happens whenever the target drains it.
    pub async fn send(&self, target_id: &str, command: Command) -> Result<()> {
        let envelope = self.next_envelope(target_id, command);
        self.append(target_id, &envelope).await
    }

    /// Dispatch and wait for the receiving target's acknowledgement.
    ///
    /// A `Failed` ack surfaces as `CommandFailed`; an elapsed `timeout`
    /// surfaces as `Timeout` and leaves the envelope queued, so a target
    /// that becomes live later still drains it (at-least-once).
    pub async fn send_awaited(
        &self,
        target_id: &str,
        command: Command,
        timeout: Duration,
    ) -> Result<Ack> {
        self.ensure_ack_router(target_id);

        let envelope = self.next_envelope(target_id, command);
        let envelope_id = envelope.envelope_id.clone();
        let command_name = envelope.command.name.clone();

        let (tx, rx) = oneshot::channel();
        self.pending.insert(envelope_id.clone(), tx);

        if let Err(e) = self.append(target_id, &envelope).await {
            self.pending.remove(&envelope_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => match ack.status {
                AckStatus::Completed => Ok(ack),
                AckStatus::Failed => Err(FarolError::CommandFailed {
                    command: command_name,
                    target: target_id.to_string(),
                    reason: ack.message.unwrap_or_default(),
                }),
            },
            Ok(Err(_)) => Err(FarolError::IllegalState(
                "ack channel closed before acknowledgement".to_string(),
            )),
            Err(_) => {
                self.pending.remove(&envelope_id);
                Err(FarolError::Timeout(timeout))
            }
        }
    }

    fn next_envelope(&self, target_id: &str, command: Command) -> CommandEnvelope {
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        CommandEnvelope::new(&self.sender_id, target_id, sequence, command)
    }

    async fn append(&self, target_id: &str, envelope: &CommandEnvelope) -> Result<()> {
        let payload = serde_json::to_vec(envelope)
            .map_err(|e| FarolError::IllegalState(format!("unserializable envelope: {}", e)))?;
        let prefix = paths::target_command_prefix(&self.run_id, target_id);

        let path = self
            .retry
            .run_if(
                "sendCommand",
                || self.store.create(&prefix, payload.clone(), CreateMode::PersistentSequential),
                StoreError::is_transient,
            )
            .await
            .map_err(FarolError::Store)?;

        debug!(
            "Dispatched command '{}' to target '{}' as {} (seq {})",
            envelope.command.name, target_id, path, envelope.sequence
        );
        Ok(())
    }

    /// Start the ack-routing task for a target, once.
    fn ensure_ack_router(&self, target_id: &str) {
        if self.ack_routers.insert(target_id.to_string(), ()).is_some() {
            return;
        }

        let acks_path = paths::target_acks(&self.run_id, target_id);
        // register before any envelope goes out: nothing can be acked
        // (and missed) between here and the first dispatch
        let mut watch = self.store.watch_children(&acks_path);
        let store = self.store.clone();
        let pending = self.pending.clone();

        tokio::spawn(async move {
            // sweep acks that predate this sender (e.g. after a restart)
            if let Ok(children) = store.children(&acks_path).await {
                for child in children {
                    if let Ok(Some(payload)) = store.get(&child).await {
                        route_ack(&store, &pending, &child, &payload).await;
                    }
                }
            }

            while let Some(event) = watch.recv().await {
                if let ChildEvent::Added { path, payload } = event {
                    route_ack(&store, &pending, &path, &payload).await;
                }
            }
            debug!("Ack watch for '{}' closed", acks_path);
        });
    }
}

async fn route_ack(
    store: &Arc<dyn CoordinationStore>,
    pending: &DashMap<String, oneshot::Sender<Ack>>,
    path: &str,
    payload: &[u8],
) {
    let ack: Ack = match serde_json::from_slice(payload) {
        Ok(ack) => ack,
        Err(e) => {
            warn!("Malformed ack at '{}': {}", path, e);
            return;
        }
    };

    // acks for other senders' envelopes are left in place
    if let Some((_, tx)) = pending.remove(&ack.envelope_id) {
        let _ = tx.send(ack);
        // observed: the ack node has served its purpose
        if let Err(e) = store.delete(path).await {
            debug!("Could not remove observed ack '{}': {}", path, e);
        }
    }
}
