//! Receiving side of the command channel
//!
//! A target drains its queue continuously while running. An envelope is
//! removed from the store only after its handler returns without
//! failing; handler failures are retried up to a bounded count and then
//! acknowledged as permanent failures, isolated to that one envelope.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use farol_api::store::{ChildEvent, CoordinationStore, CreateMode};
use farol_api::{Ack, CommandEnvelope, paths};
use farol_common::{CMD_TERMINATE, HandlerError, RetryPolicy, StoreError};

use crate::handler::CommandHandlerRegistry;

/// Receiver-side delivery configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Handler attempts per envelope before it is reported as a
    /// permanent delivery failure (default: 3)
    #[serde(default = "default_max_handler_attempts")]
    pub max_handler_attempts: u32,

    /// Backoff between handler attempts
    #[serde(default = "default_handler_retry")]
    pub handler_retry: RetryPolicy,
}

fn default_max_handler_attempts() -> u32 {
    3
}

fn default_handler_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: default_max_handler_attempts(),
        base_delay_ms: 50,
        max_delay_ms: 1000,
        ..Default::default()
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            max_handler_attempts: default_max_handler_attempts(),
            handler_retry: default_handler_retry(),
        }
    }
}

/// Handle over a running [`CommandReceiver`] drain task.
pub struct CommandReceiverHandle {
    running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    terminate_notify: Arc<Notify>,
    terminated: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl CommandReceiverHandle {
    /// Stop draining. Does not touch queued envelopes.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.stop_notify.notify_waiters();
    }

    /// Whether the reserved terminate command has been received.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Wait until the reserved terminate command arrives.
    pub async fn wait_terminate(&self) {
        loop {
            let notified = self.terminate_notify.notified();
            if self.terminated.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Drains one target's command queue.
pub struct CommandReceiver {
    store: Arc<dyn CoordinationStore>,
    run_id: String,
    target_id: String,
    registry: Arc<CommandHandlerRegistry>,
    config: ReceiverConfig,
    terminate_notify: Arc<Notify>,
    terminated: Arc<AtomicBool>,
}

impl CommandReceiver {
    /// Start draining the target's queue and return a control handle.
    pub fn start(
        store: Arc<dyn CoordinationStore>,
        run_id: &str,
        target_id: &str,
        registry: Arc<CommandHandlerRegistry>,
        config: ReceiverConfig,
    ) -> CommandReceiverHandle {
        let running = Arc::new(AtomicBool::new(true));
        let stop_notify = Arc::new(Notify::new());
        let terminate_notify = Arc::new(Notify::new());
        let terminated = Arc::new(AtomicBool::new(false));

        let receiver = CommandReceiver {
            store,
            run_id: run_id.to_string(),
            target_id: target_id.to_string(),
            registry,
            config,
            terminate_notify: terminate_notify.clone(),
            terminated: terminated.clone(),
        };

        let task_running = running.clone();
        let task_stop = stop_notify.clone();
        let task = tokio::spawn(async move {
            receiver.drain_loop(task_running, task_stop).await;
        });

        CommandReceiverHandle {
            running,
            stop_notify,
            terminate_notify,
            terminated,
            task,
        }
    }

    async fn drain_loop(&self, running: Arc<AtomicBool>, stop: Arc<Notify>) {
        let commands_path = paths::target_commands(&self.run_id, &self.target_id);
        // watch first, list second: an envelope appended during startup
        // is seen by one of the two
        let mut watch = self.store.watch_children(&commands_path);

        let mut queue: BTreeSet<String> = match self.store.children(&commands_path).await {
            Ok(children) => children.into_iter().collect(),
            Err(e) => {
                warn!(
                    "Could not list command queue for '{}': {}, starting empty",
                    self.target_id, e
                );
                BTreeSet::new()
            }
        };

        info!(
            "Command receiver for target '{}' started with {} queued envelopes",
            self.target_id,
            queue.len()
        );

        while running.load(Ordering::SeqCst) {
            // lexicographic order over sequential paths preserves
            // per-sender dispatch order
            while let Some(path) = queue.pop_first() {
                if !running.load(Ordering::SeqCst) {
                    return;
                }
                if !self.process(&path).await {
                    // transient store failure: keep the envelope queued
                    queue.insert(path);
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            }

            tokio::select! {
                event = watch.recv() => match event {
                    Some(event) => {
                        for event in std::iter::once(event).chain(watch.drain_ready()) {
                            if let ChildEvent::Added { path, .. } = event {
                                queue.insert(path);
                            }
                        }
                    }
                    None => break,
                },
                _ = stop.notified() => break,
            }
        }

        info!("Command receiver for target '{}' stopped", self.target_id);
    }

    /// Handle one queued envelope. Returns false when a transient store
    /// failure prevented reading it, so the caller re-queues the path.
    async fn process(&self, path: &str) -> bool {
        let payload = match self.store.get(path).await {
            Ok(Some(payload)) => payload,
            // already consumed, nothing to do
            Ok(None) => return true,
            Err(e) => {
                warn!("Could not read envelope '{}': {}", path, e);
                return false;
            }
        };

        let envelope: CommandEnvelope = match serde_json::from_slice(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("Dropping malformed envelope '{}': {}", path, e);
                let _ = self.store.delete(path).await;
                return true;
            }
        };

        debug!(
            "Handling command '{}' from sender '{}' (seq {})",
            envelope.command.name, envelope.sender_id, envelope.sequence
        );

        let result = if envelope.command.name == CMD_TERMINATE {
            self.handle_terminate();
            Ok(())
        } else {
            let retry = RetryPolicy {
                max_attempts: self.config.max_handler_attempts,
                ..self.config.handler_retry.clone()
            };
            retry
                .run_if(
                    "handleCommand",
                    || self.registry.handle(&envelope.command),
                    // unsupported and malformed commands are stable outcomes
                    |e| matches!(e, HandlerError::Failed(_)),
                )
                .await
        };

        // the envelope leaves the store only once its handling concluded
        if let Err(e) = self.store.delete(path).await {
            warn!("Could not delete handled envelope '{}': {}", path, e);
        }

        let ack = match result {
            Ok(()) => Ack::completed(&envelope.envelope_id),
            Err(e) => {
                error!(
                    "Command '{}' permanently failed on target '{}': {}",
                    envelope.command.name, self.target_id, e
                );
                Ack::failed(&envelope.envelope_id, e.to_string())
            }
        };
        self.write_ack(&envelope, &ack).await;
        true
    }

    /// Reserved terminate command: honored even when the target is
    /// already mid-shutdown for another reason.
    fn handle_terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            info!("Target '{}' received terminate", self.target_id);
        }
        self.terminate_notify.notify_waiters();
    }

    async fn write_ack(&self, envelope: &CommandEnvelope, ack: &Ack) {
        let path = paths::target_ack(&self.run_id, &self.target_id, &envelope.envelope_id);
        let payload = match serde_json::to_vec(ack) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Unserializable ack for '{}': {}", envelope.envelope_id, e);
                return;
            }
        };

        match self
            .store
            .create(&path, payload, CreateMode::Persistent)
            .await
        {
            Ok(_) => {}
            // a redelivered envelope was already acked
            Err(StoreError::NodeExists(_)) => {
                debug!("Ack for '{}' already written", envelope.envelope_id);
            }
            Err(e) => warn!("Could not write ack for '{}': {}", envelope.envelope_id, e),
        }
    }
}
