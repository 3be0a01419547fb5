//! Per-target runtime context
//!
//! The context handed to application code running inside one target
//! process: announce/discover delegation, command handler registration,
//! the local credential holder, and the run-scoped liveness
//! announcement that feeds the controller's termination detection.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use farol_api::store::{CoordinationStore, CreateMode, CredentialStore};
use farol_api::{Command, TargetInfo, paths};
use farol_command::{
    CommandHandler, CommandHandlerRegistry, CommandReceiver, CommandReceiverHandle, ReceiverConfig,
};
use farol_common::{
    CMD_CREDENTIALS_UPDATED, FarolError, HandlerError, OPT_VERSION, Result, RetryPolicy,
    StoreError, is_valid_name, local_host,
};
use farol_discovery::{Cancellable, DiscoveryRegistry, ServiceDiscovered};

use crate::credential::CredentialHolder;

/// Internal handler for the reserved `credentialsUpdated` command.
struct CredentialsUpdatedHandler {
    holder: Arc<CredentialHolder>,
}

#[async_trait]
impl CommandHandler for CredentialsUpdatedHandler {
    fn can_handle(&self) -> &str {
        CMD_CREDENTIALS_UPDATED
    }

    async fn handle(&self, command: &Command) -> std::result::Result<(), HandlerError> {
        let version: u64 = command
            .option(OPT_VERSION)
            .ok_or_else(|| HandlerError::Malformed {
                command: command.name.clone(),
                reason: "missing version".to_string(),
            })?
            .parse()
            .map_err(|_| HandlerError::Malformed {
                command: command.name.clone(),
                reason: "version is not a number".to_string(),
            })?;

        self.holder
            .refresh_to(version)
            .await
            .map_err(|e| HandlerError::Failed(e.to_string()))
    }
}

/// Runtime context of one target process.
pub struct TargetRuntime {
    run_id: String,
    target_id: String,
    host: String,
    registry: Arc<DiscoveryRegistry>,
    handlers: Arc<CommandHandlerRegistry>,
    receiver: CommandReceiverHandle,
    credentials: Arc<CredentialHolder>,
    instance_registration: Cancellable,
}

impl std::fmt::Debug for TargetRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRuntime")
            .field("run_id", &self.run_id)
            .field("target_id", &self.target_id)
            .field("host", &self.host)
            .finish_non_exhaustive()
    }
}

impl TargetRuntime {
    /// Join the run: pull the latest credential bundle, announce this
    /// target's liveness node, and start draining its command queue.
    pub async fn start(
        store: Arc<dyn CoordinationStore>,
        credential_store: Arc<dyn CredentialStore>,
        run_id: &str,
        target_id: &str,
        host: &str,
    ) -> Result<Self> {
        if !is_valid_name(run_id) || !is_valid_name(target_id) {
            return Err(FarolError::Registration(format!(
                "invalid run or target id '{}'/'{}'",
                run_id, target_id
            )));
        }

        let registry = Arc::new(DiscoveryRegistry::new(store.clone()));

        // pull on join: a target starting after a renewal cycle picks up
        // the newest bundle without waiting for a notification
        let credentials = Arc::new(CredentialHolder::new(run_id, credential_store));
        match credentials.pull_latest().await? {
            Some(version) => debug!(
                "Target '{}' joined with credential version {}",
                target_id, version
            ),
            None => debug!("Target '{}' joined before any credential bundle", target_id),
        }

        let handlers = Arc::new(CommandHandlerRegistry::new());
        handlers.register_handler(Arc::new(CredentialsUpdatedHandler {
            holder: credentials.clone(),
        }));

        let instance_registration =
            register_instance(store.clone(), run_id, target_id, host).await?;

        let receiver = CommandReceiver::start(
            store.clone(),
            run_id,
            target_id,
            handlers.clone(),
            ReceiverConfig::default(),
        );

        info!("Target '{}' of run '{}' started", target_id, run_id);

        Ok(Self {
            run_id: run_id.to_string(),
            target_id: target_id.to_string(),
            host: host.to_string(),
            registry,
            handlers,
            receiver,
            credentials,
            instance_registration,
        })
    }

    /// Like [`TargetRuntime::start`], announcing the local address.
    pub async fn start_local(
        store: Arc<dyn CoordinationStore>,
        credential_store: Arc<dyn CredentialStore>,
        run_id: &str,
        target_id: &str,
    ) -> Result<Self> {
        let host = local_host();
        Self::start(store, credential_store, run_id, target_id, &host).await
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn target_id(&self) -> &str {
        &self.target_id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Announce a service endpoint on this target's host.
    pub async fn announce(&self, service_name: &str, port: u16) -> Result<Cancellable> {
        self.registry.announce(service_name, &self.host, port).await
    }

    /// Obtain the live discovery view for a named service.
    pub async fn discover(&self, service_name: &str) -> Result<ServiceDiscovered> {
        self.registry.discover(service_name).await
    }

    /// Register an application command handler.
    pub fn register_handler(&self, handler: Arc<dyn CommandHandler>) {
        self.handlers.register_handler(handler);
    }

    /// This target's local credential view.
    pub fn credentials(&self) -> Arc<CredentialHolder> {
        self.credentials.clone()
    }

    /// Whether the reserved terminate command has been received.
    pub fn is_terminated(&self) -> bool {
        self.receiver.is_terminated()
    }

    /// Wait until the reserved terminate command arrives.
    pub async fn wait_terminate(&self) {
        self.receiver.wait_terminate().await;
    }

    /// Leave the run: stop draining commands and withdraw the liveness
    /// node, which the controller observes as this target leaving.
    pub fn shutdown(&self) {
        info!("Target '{}' of run '{}' shutting down", self.target_id, self.run_id);
        self.receiver.stop();
        self.instance_registration.cancel();
    }
}

async fn register_instance(
    store: Arc<dyn CoordinationStore>,
    run_id: &str,
    target_id: &str,
    host: &str,
) -> Result<Cancellable> {
    let info = TargetInfo::new(target_id, host);
    let path = paths::run_instance(run_id, target_id);
    let payload =
        serde_json::to_vec(&info).map_err(|e| FarolError::Registration(e.to_string()))?;

    let result = RetryPolicy::default()
        .run_if(
            "registerInstance",
            || store.create(&path, payload.clone(), CreateMode::Ephemeral),
            StoreError::is_transient,
        )
        .await;

    match result {
        Ok(actual_path) => Ok(Cancellable::new(move || {
            tokio::spawn(async move {
                match store.delete(&actual_path).await {
                    Ok(()) => debug!("Withdrew instance node '{}'", actual_path),
                    Err(e) => warn!("Failed to withdraw instance '{}': {}", actual_path, e),
                }
            });
        })),
        Err(StoreError::NodeExists(_)) => Err(FarolError::DuplicateRegistration {
            service: run_id.to_string(),
            endpoint: target_id.to_string(),
        }),
        Err(e) => Err(FarolError::Registration(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use farol_api::store::CoordinationStore;
    use farol_command::CommandSender;
    use farol_coordination::{CoordinationHub, MemoryCredentialStore};

    use super::*;

    async fn start_target(
        hub: &CoordinationHub,
        credentials: Arc<MemoryCredentialStore>,
        target_id: &str,
    ) -> TargetRuntime {
        TargetRuntime::start(
            Arc::new(hub.connect()),
            credentials,
            "run-1",
            target_id,
            "127.0.0.1",
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_registers_liveness_node() {
        let hub = CoordinationHub::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        let target = start_target(&hub, credentials, "r1").await;

        let observer = hub.connect();
        let instances = observer
            .children(&paths::run_instances("run-1"))
            .await
            .unwrap();
        assert_eq!(instances, vec![paths::run_instance("run-1", "r1")]);

        target.shutdown();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if observer
                    .children(&paths::run_instances("run-1"))
                    .await
                    .unwrap()
                    .is_empty()
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("liveness node never withdrawn");
    }

    #[tokio::test]
    async fn test_duplicate_target_id_rejected() {
        let hub = CoordinationHub::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        let _target = start_target(&hub, credentials.clone(), "r1").await;

        let err = TargetRuntime::start(
            Arc::new(hub.connect()),
            credentials,
            "run-1",
            "r1",
            "127.0.0.1",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, FarolError::DuplicateRegistration { .. }));
    }

    #[tokio::test]
    async fn test_pull_on_join() {
        let hub = CoordinationHub::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        credentials.put("run-1", 4, b"tokens-v4").await.unwrap();

        let target = start_target(&hub, credentials, "r1").await;
        assert_eq!(target.credentials().current_version(), Some(4));
        target.shutdown();
    }

    #[tokio::test]
    async fn test_credentials_updated_command_refreshes_holder() {
        let hub = CoordinationHub::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        let target = start_target(&hub, credentials.clone(), "r1").await;
        assert_eq!(target.credentials().current_version(), None);

        credentials.put("run-1", 1, b"tokens-v1").await.unwrap();
        let sender = CommandSender::new(Arc::new(hub.connect()), "run-1", "controller");
        sender
            .send_awaited("r1", Command::credentials_updated(1), Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(target.credentials().current_version(), Some(1));
        assert_eq!(
            target.credentials().current().unwrap().payload,
            b"tokens-v1"
        );
        target.shutdown();
    }

    #[tokio::test]
    async fn test_terminate_wakes_waiter() {
        let hub = CoordinationHub::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        let target = start_target(&hub, credentials, "r1").await;

        let sender = CommandSender::new(Arc::new(hub.connect()), "run-1", "controller");
        sender.send("r1", Command::terminate()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), target.wait_terminate())
            .await
            .expect("terminate never observed");
        assert!(target.is_terminated());
        target.shutdown();
    }

    #[tokio::test]
    async fn test_announce_and_discover_via_context() {
        let hub = CoordinationHub::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        let t1 = start_target(&hub, credentials.clone(), "r1").await;
        let t2 = start_target(&hub, credentials, "r2").await;

        let _announced = t1.announce("service", 12345).await.unwrap();
        let view = t2.discover("service").await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if view.len() == 1 {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("endpoint never discovered");

        t1.shutdown();
        t2.shutdown();
    }
}
