//! Application controller façade
//!
//! Composes the discovery registry, the command channel, and the
//! renewal pipeline behind the run state machine
//! `Starting -> Running -> Stopping -> Terminated`, with `Failed`
//! reachable from any non-terminal state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use farol_api::store::{CoordinationStore, CredentialStore, ProcessLauncher};
use farol_api::{Ack, ChildEvent, Command, RunRecord, RunState, SecureStore, SecureStoreRenewer, paths};
use farol_command::CommandSender;
use farol_common::{FarolError, Result};
use farol_discovery::{DiscoveryRegistry, ServiceDiscovered};

use crate::config::{ControllerConfig, RenewalConfig};
use crate::renewal::{RenewalHandle, RenewalPipeline};

/// Sender id used for controller-originated commands.
const CONTROLLER_SENDER: &str = "controller";

/// The façade a caller uses to manage one application run.
pub struct ApplicationController {
    config: ControllerConfig,
    store: Arc<dyn CoordinationStore>,
    launcher: Arc<dyn ProcessLauncher>,
    registry: Arc<DiscoveryRegistry>,
    sender: Arc<CommandSender>,
    state_tx: watch::Sender<RunState>,
    last_error: Arc<RwLock<Option<String>>>,
    known_targets: Arc<Mutex<HashSet<String>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
    monitor_stop: Arc<Notify>,
    renewal: Mutex<Option<RenewalHandle>>,
}

impl ApplicationController {
    pub fn new(
        config: ControllerConfig,
        store: Arc<dyn CoordinationStore>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> Self {
        let registry = Arc::new(DiscoveryRegistry::new(store.clone()));
        let sender = Arc::new(CommandSender::new(
            store.clone(),
            &config.run_id,
            CONTROLLER_SENDER,
        ));
        let (state_tx, _) = watch::channel(RunState::Starting);

        Self {
            config,
            store,
            launcher,
            registry,
            sender,
            state_tx,
            last_error: Arc::new(RwLock::new(None)),
            known_targets: Arc::new(Mutex::new(HashSet::new())),
            monitor: Mutex::new(None),
            monitor_stop: Arc::new(Notify::new()),
            renewal: Mutex::new(None),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.config.run_id
    }

    pub fn state(&self) -> RunState {
        *self.state_tx.borrow()
    }

    /// Reason for the last fatal transition, if any.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub fn run_record(&self) -> RunRecord {
        RunRecord {
            run_id: self.config.run_id.clone(),
            state: self.state(),
            known_targets: self.known_targets.lock().clone(),
            last_error: self.last_error(),
        }
    }

    /// Launch the run: start the target monitor, then hand every
    /// declared target to the launcher. The run becomes `Running` when
    /// the first target arrives in the run registry; a launcher
    /// rejection fails the run.
    pub async fn start(&self) -> Result<()> {
        {
            let mut monitor = self.monitor.lock();
            if monitor.is_some() {
                return Err(FarolError::IllegalState(format!(
                    "run '{}' already started",
                    self.config.run_id
                )));
            }
            *monitor = Some(self.spawn_monitor());
        }

        info!(
            "Starting run '{}' with {} declared targets",
            self.config.run_id,
            self.config.targets.len()
        );

        for target_id in &self.config.targets {
            if let Err(e) = self.launcher.launch(&self.config.run_id, target_id).await {
                let reason = format!("launcher rejected target '{}': {}", target_id, e);
                self.fail(&reason);
                return Err(FarolError::IllegalState(reason));
            }
        }

        Ok(())
    }

    /// Obtain the live discovery view for a named service.
    pub async fn discover_service(&self, service_name: &str) -> Result<ServiceDiscovered> {
        self.registry.discover(service_name).await
    }

    /// Broadcast a command to every live target (fire-and-forget).
    pub async fn send_command(&self, command: Command) -> Result<()> {
        let instances = self
            .store
            .children(&paths::run_instances(&self.config.run_id))
            .await
            .map_err(FarolError::Store)?;

        for instance in &instances {
            let target_id = paths::node_name(instance);
            self.sender.send(target_id, command.clone()).await?;
        }

        debug!(
            "Broadcast command '{}' to {} targets of run '{}'",
            command.name,
            instances.len(),
            self.config.run_id
        );
        Ok(())
    }

    /// Send a command to one named target and wait for its
    /// acknowledgement.
    pub async fn send_command_to(&self, target_id: &str, command: Command) -> Result<Ack> {
        self.sender
            .send_awaited(target_id, command, self.config.command_timeout())
            .await
    }

    /// Request orderly shutdown of every live target.
    pub async fn terminate(&self) -> Result<()> {
        self.transition(RunState::Stopping);
        self.send_command(Command::terminate()).await
    }

    /// Block until the run reaches `Terminated` or `Failed`, or the
    /// timeout elapses with `Timeout`, leaving the run state unchanged.
    /// Other controller operations and notification delivery are never
    /// stalled by this wait.
    pub async fn await_terminated(&self, timeout: Duration) -> Result<RunState> {
        let mut state_rx = self.state_tx.subscribe();
        match tokio::time::timeout(timeout, state_rx.wait_for(|s| s.is_terminal())).await {
            Ok(Ok(state)) => Ok(*state),
            Ok(Err(_)) => Err(FarolError::IllegalState(
                "controller state channel closed".to_string(),
            )),
            Err(_) => Err(FarolError::Timeout(timeout)),
        }
    }

    /// Start the credential renewal pipeline for this run.
    ///
    /// A renewal failure past the attempt budget transitions the run to
    /// `Failed` — the controller surfaces the reason via
    /// [`ApplicationController::last_error`].
    pub fn start_renewal(
        &self,
        renewer: Arc<dyn SecureStoreRenewer>,
        credentials: Arc<dyn CredentialStore>,
        config: RenewalConfig,
        initial: Option<SecureStore>,
    ) {
        let mut renewal = self.renewal.lock();
        if renewal.is_some() {
            warn!(
                "Renewal pipeline for run '{}' already running",
                self.config.run_id
            );
            return;
        }

        let pipeline = RenewalPipeline::new(
            &self.config.run_id,
            renewer,
            credentials,
            self.store.clone(),
            self.sender.clone(),
            config,
        );

        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
        *renewal = Some(pipeline.start(initial, failure_tx));

        let state_tx = self.state_tx.clone();
        let last_error = self.last_error.clone();
        let run_id = self.config.run_id.clone();
        tokio::spawn(async move {
            if let Some(err) = failure_rx.recv().await {
                error!("Run '{}' failed: {}", run_id, err);
                *last_error.write() = Some(err.to_string());
                state_tx.send_if_modified(|state| {
                    if state.is_terminal() {
                        false
                    } else {
                        *state = RunState::Failed;
                        true
                    }
                });
            }
        });
    }

    /// Stop background tasks. Called once the run record is destroyed;
    /// queued envelopes of terminated targets were already cleaned up by
    /// the monitor.
    pub fn shutdown(&self) {
        self.monitor_stop.notify_waiters();
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.abort();
        }
        if let Some(renewal) = self.renewal.lock().take() {
            renewal.stop();
        }
    }

    fn fail(&self, reason: &str) {
        error!("Run '{}' failed: {}", self.config.run_id, reason);
        *self.last_error.write() = Some(reason.to_string());
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = RunState::Failed;
                true
            }
        });
        if let Some(renewal) = self.renewal.lock().take() {
            renewal.stop();
        }
    }

    fn transition(&self, to: RunState) {
        let run_id = self.config.run_id.clone();
        self.state_tx.send_if_modified(|state| {
            if *state == to || state.is_terminal() {
                false
            } else {
                info!("Run '{}': {} -> {}", run_id, state, to);
                *state = to;
                true
            }
        });
    }

    /// Watch the run registry: the first arrival makes the run
    /// `Running`; the run is `Terminated` only once every known target
    /// has been observed leaving — never inferred from a single missed
    /// signal.
    fn spawn_monitor(&self) -> JoinHandle<()> {
        let store = self.store.clone();
        let run_id = self.config.run_id.clone();
        let state_tx = self.state_tx.clone();
        let known_targets = self.known_targets.clone();
        let stop = self.monitor_stop.clone();

        tokio::spawn(async move {
            let instances_path = paths::run_instances(&run_id);
            let mut watch = store.watch_children(&instances_path);
            let mut live: HashSet<String> = HashSet::new();

            let initial = store.children(&instances_path).await.unwrap_or_default();
            for path in initial {
                let target = paths::node_name(&path).to_string();
                known_targets.lock().insert(target.clone());
                live.insert(target);
            }
            if !live.is_empty() {
                send_running(&state_tx, &run_id);
            }

            loop {
                let event = tokio::select! {
                    event = watch.recv() => event,
                    _ = stop.notified() => break,
                };
                let Some(event) = event else { break };

                match event {
                    ChildEvent::Added { path, .. } => {
                        let target = paths::node_name(&path).to_string();
                        debug!("Run '{}': target '{}' is live", run_id, target);
                        known_targets.lock().insert(target.clone());
                        live.insert(target);
                        send_running(&state_tx, &run_id);
                    }
                    ChildEvent::Removed { path } => {
                        let target = paths::node_name(&path).to_string();
                        debug!("Run '{}': target '{}' left", run_id, target);
                        live.remove(&target);

                        let all_left = live.is_empty() && !known_targets.lock().is_empty();
                        if all_left {
                            let terminated = state_tx.send_if_modified(|state| {
                                if matches!(state, RunState::Running | RunState::Stopping) {
                                    info!("Run '{}': {} -> TERMINATED", run_id, state);
                                    *state = RunState::Terminated;
                                    true
                                } else {
                                    false
                                }
                            });
                            if terminated {
                                let targets = known_targets.lock().clone();
                                cleanup_run(&store, &run_id, &targets).await;
                                break;
                            }
                        }
                    }
                }
            }
        })
    }
}

fn send_running(state_tx: &watch::Sender<RunState>, run_id: &str) {
    state_tx.send_if_modified(|state| {
        if *state == RunState::Starting {
            info!("Run '{}': STARTING -> RUNNING", run_id);
            *state = RunState::Running;
            true
        } else {
            false
        }
    });
}

/// Best-effort removal of the terminated run's leftover queue nodes.
async fn cleanup_run(store: &Arc<dyn CoordinationStore>, run_id: &str, targets: &HashSet<String>) {
    for target in targets {
        for dir in [
            paths::target_commands(run_id, target),
            paths::target_acks(run_id, target),
        ] {
            if let Ok(children) = store.children(&dir).await {
                for child in children {
                    if let Err(e) = store.delete(&child).await {
                        debug!("Cleanup of '{}' skipped: {}", child, e);
                    }
                }
            }
        }
    }
    info!("Run '{}' record cleaned up", run_id);
}
