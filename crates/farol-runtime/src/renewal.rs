//! Secure-store renewal pipeline
//!
//! One task per run owns the `Idle -> Renewing -> Distributing -> Idle`
//! cycle, which also guarantees a single in-flight cycle without any
//! store-level locking. Renewal failure past the attempt budget is fatal
//! to the run: operating past credential expiry is worse than failing
//! loudly.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use farol_api::store::{CoordinationStore, CredentialStore};
use farol_api::{Command, SecureStore, SecureStoreRenewer, paths};
use farol_command::CommandSender;
use farol_common::{FarolError, Result, RetryPolicy, StoreError};

use crate::config::RenewalConfig;
use crate::credential::SecureStoreWriter;

/// Phase of the renewal state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenewalState {
    Idle,
    Renewing,
    Distributing,
    Stopped,
}

impl std::fmt::Display for RenewalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RenewalState::Idle => write!(f, "IDLE"),
            RenewalState::Renewing => write!(f, "RENEWING"),
            RenewalState::Distributing => write!(f, "DISTRIBUTING"),
            RenewalState::Stopped => write!(f, "STOPPED"),
        }
    }
}

/// Handle over a running renewal task.
pub struct RenewalHandle {
    state_rx: watch::Receiver<RenewalState>,
    stop_notify: Arc<Notify>,
    task: JoinHandle<()>,
}

impl RenewalHandle {
    pub fn state(&self) -> RenewalState {
        *self.state_rx.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<RenewalState> {
        self.state_rx.clone()
    }

    /// Stop the pipeline after the current cycle, entering `Stopped`.
    pub fn stop(&self) {
        // notify_one stores a permit, so a stop issued mid-cycle is
        // picked up at the next idle wait instead of being lost
        self.stop_notify.notify_one();
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// Periodic credential renewal and fan-out for one run.
pub struct RenewalPipeline {
    run_id: String,
    renewer: Arc<dyn SecureStoreRenewer>,
    writer: SecureStoreWriter,
    store: Arc<dyn CoordinationStore>,
    sender: Arc<CommandSender>,
    config: RenewalConfig,
}

impl RenewalPipeline {
    pub fn new(
        run_id: &str,
        renewer: Arc<dyn SecureStoreRenewer>,
        credentials: Arc<dyn CredentialStore>,
        store: Arc<dyn CoordinationStore>,
        sender: Arc<CommandSender>,
        config: RenewalConfig,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            renewer,
            writer: SecureStoreWriter::with_retry_policy(credentials, config.retry.clone()),
            store,
            sender,
            config,
        }
    }

    /// Start the cycle task.
    ///
    /// `initial` seeds the version chain (e.g. the bundle created at
    /// submission time). A fatal renewal failure is sent on
    /// `failure_tx` and stops the pipeline.
    pub fn start(self, initial: Option<SecureStore>, failure_tx: mpsc::UnboundedSender<FarolError>) -> RenewalHandle {
        let (state_tx, state_rx) = watch::channel(RenewalState::Idle);
        let stop_notify = Arc::new(Notify::new());
        let task_stop = stop_notify.clone();

        let task = tokio::spawn(async move {
            let mut last = initial;
            info!(
                "Renewal pipeline for run '{}' started at version {:?}",
                self.run_id,
                last.as_ref().map(|s| s.version)
            );

            loop {
                let delay = self.next_delay(last.as_ref());
                let _ = state_tx.send(RenewalState::Idle);
                debug!("Run '{}': next renewal in {:?}", self.run_id, delay);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = task_stop.notified() => break,
                }

                match self.run_cycle(last.as_ref(), &state_tx).await {
                    Ok(renewed) => last = Some(renewed),
                    Err(e) => {
                        error!("Run '{}': renewal failed fatally: {}", self.run_id, e);
                        let _ = state_tx.send(RenewalState::Stopped);
                        let _ = failure_tx.send(e);
                        return;
                    }
                }
            }

            let _ = state_tx.send(RenewalState::Stopped);
            info!("Renewal pipeline for run '{}' stopped", self.run_id);
        });

        RenewalHandle {
            state_rx,
            stop_notify,
            task,
        }
    }

    /// Time until the next cycle: a fraction of the bundle's remaining
    /// validity, or the fixed interval when no expiry is carried.
    fn next_delay(&self, last: Option<&SecureStore>) -> Duration {
        let now_ms = chrono::Utc::now().timestamp_millis();
        match last.and_then(|s| s.remaining_validity_ms(now_ms)) {
            Some(remaining) if remaining > 0 => {
                Duration::from_millis((remaining as f64 * self.config.renewal_fraction) as u64)
            }
            // already past expiry: renew immediately
            Some(_) => Duration::ZERO,
            None => Duration::from_millis(self.config.default_interval_ms),
        }
    }

    async fn run_cycle(
        &self,
        last: Option<&SecureStore>,
        state_tx: &watch::Sender<RenewalState>,
    ) -> Result<SecureStore> {
        let _ = state_tx.send(RenewalState::Renewing);

        let retry = RetryPolicy {
            max_attempts: self.config.max_renewal_attempts,
            ..self.config.retry.clone()
        };
        let renewed = retry
            .run("secureStoreRenew", || self.renewer.renew(&self.run_id, last))
            .await
            .map_err(|e| FarolError::RenewalFailed {
                run_id: self.run_id.clone(),
                reason: e.to_string(),
            })?;

        if let Some(previous) = last
            && renewed.version != previous.version + 1
        {
            return Err(FarolError::RenewalFailed {
                run_id: self.run_id.clone(),
                reason: format!(
                    "renewer produced version {}, expected {}",
                    renewed.version,
                    previous.version + 1
                ),
            });
        }

        self.writer
            .write(&renewed)
            .await
            .map_err(|e| FarolError::RenewalFailed {
                run_id: self.run_id.clone(),
                reason: e.to_string(),
            })?;

        let _ = state_tx.send(RenewalState::Distributing);
        self.distribute(renewed.version).await?;

        Ok(renewed)
    }

    /// Notify every live target of the new version.
    ///
    /// The target set is re-read until a pass adds nothing: a target
    /// that joins while distribution is underway still gets the
    /// command. Targets joining strictly after the cycle pull the
    /// latest version at their own startup.
    async fn distribute(&self, version: u64) -> Result<()> {
        let instances_path = paths::run_instances(&self.run_id);
        let mut notified: HashSet<String> = HashSet::new();

        loop {
            let targets = self
                .config
                .retry
                .run_if(
                    "renewalTargets",
                    || self.store.children(&instances_path),
                    StoreError::is_transient,
                )
                .await
                .map_err(|e| FarolError::RenewalFailed {
                    run_id: self.run_id.clone(),
                    reason: e.to_string(),
                })?;

            let fresh: Vec<String> = targets
                .iter()
                .map(|path| paths::node_name(path).to_string())
                .filter(|target| !notified.contains(target))
                .collect();

            if fresh.is_empty() {
                break;
            }

            for target in fresh {
                self.sender
                    .send(&target, Command::credentials_updated(version))
                    .await
                    .map_err(|e| FarolError::RenewalFailed {
                        run_id: self.run_id.clone(),
                        reason: format!("could not notify target '{}': {}", target, e),
                    })?;
                notified.insert(target);
            }
        }

        info!(
            "Run '{}': distributed credential version {} to {} targets",
            self.run_id,
            version,
            notified.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use farol_coordination::{CoordinationHub, MemoryCredentialStore};

    use super::*;

    struct CountingRenewer {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl SecureStoreRenewer for CountingRenewer {
        async fn renew(&self, run_id: &str, previous: Option<&SecureStore>) -> Result<SecureStore> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(FarolError::Registration(
                    "credential authority unreachable".to_string(),
                ));
            }
            let version = previous.map(|s| s.version + 1).unwrap_or(1);
            Ok(SecureStore::new(
                run_id,
                version,
                format!("tokens-v{}", version).into_bytes(),
            ))
        }
    }

    struct WrongVersionRenewer;

    #[async_trait]
    impl SecureStoreRenewer for WrongVersionRenewer {
        async fn renew(&self, run_id: &str, _previous: Option<&SecureStore>) -> Result<SecureStore> {
            Ok(SecureStore::new(run_id, 99, vec![]))
        }
    }

    fn fast_config() -> RenewalConfig {
        RenewalConfig {
            default_interval_ms: 20,
            max_renewal_attempts: 3,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 5,
                max_delay_ms: 20,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pipeline(
        hub: &CoordinationHub,
        credentials: Arc<MemoryCredentialStore>,
        renewer: Arc<dyn SecureStoreRenewer>,
    ) -> RenewalPipeline {
        let store: Arc<dyn CoordinationStore> = Arc::new(hub.connect());
        let sender = Arc::new(CommandSender::new(Arc::new(hub.connect()), "run-1", "renewal"));
        RenewalPipeline::new("run-1", renewer, credentials, store, sender, fast_config())
    }

    #[tokio::test]
    async fn test_cycle_bumps_version_and_persists() {
        let hub = CoordinationHub::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        let renewer = Arc::new(CountingRenewer {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });

        let (failure_tx, _failure_rx) = mpsc::unbounded_channel();
        let seed = SecureStore::new("run-1", 3, b"tokens-v3".to_vec());
        credentials.put("run-1", 3, b"tokens-v3").await.unwrap();
        let handle = pipeline(&hub, credentials.clone(), renewer).start(Some(seed), failure_tx);

        tokio::time::timeout(Duration::from_secs(5), async {
            while credentials.latest_version("run-1").await.unwrap() < Some(4) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("version never advanced");

        assert_eq!(
            credentials.get("run-1", 4).await.unwrap().unwrap(),
            b"tokens-v4"
        );
        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_transient_renewal_failure_retried() {
        let hub = CoordinationHub::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        let renewer = Arc::new(CountingRenewer {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });

        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
        let handle = pipeline(&hub, credentials.clone(), renewer).start(None, failure_tx);

        tokio::time::timeout(Duration::from_secs(5), async {
            while credentials.latest_version("run-1").await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("first bundle never written");

        assert!(failure_rx.try_recv().is_err());
        handle.stop();
        handle.join().await;
    }

    #[tokio::test]
    async fn test_exhausted_renewal_is_fatal() {
        let hub = CoordinationHub::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        let renewer = Arc::new(CountingRenewer {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });

        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
        let handle = pipeline(&hub, credentials, renewer).start(None, failure_tx);

        let err = tokio::time::timeout(Duration::from_secs(5), failure_rx.recv())
            .await
            .expect("no fatal failure surfaced")
            .unwrap();
        assert!(matches!(err, FarolError::RenewalFailed { .. }));

        handle.join().await;
    }

    #[tokio::test]
    async fn test_wrong_version_is_fatal() {
        let hub = CoordinationHub::new();
        let credentials = Arc::new(MemoryCredentialStore::new());

        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
        let seed = SecureStore::new("run-1", 3, vec![]);
        let handle = pipeline(&hub, credentials, Arc::new(WrongVersionRenewer))
            .start(Some(seed), failure_tx);

        let err = tokio::time::timeout(Duration::from_secs(5), failure_rx.recv())
            .await
            .expect("no fatal failure surfaced")
            .unwrap();
        match err {
            FarolError::RenewalFailed { reason, .. } => {
                assert!(reason.contains("expected 4"));
            }
            other => panic!("unexpected error: {}", other),
        }
        handle.join().await;
    }

    #[tokio::test]
    async fn test_distribution_reaches_live_targets() {
        let hub = CoordinationHub::new();
        let credentials = Arc::new(MemoryCredentialStore::new());
        let session = hub.connect();

        // two live targets
        for target in ["r1", "r2"] {
            session
                .create(
                    &paths::run_instance("run-1", target),
                    vec![],
                    farol_api::CreateMode::Ephemeral,
                )
                .await
                .unwrap();
        }

        let renewer = Arc::new(CountingRenewer {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let (failure_tx, _failure_rx) = mpsc::unbounded_channel();
        let handle = pipeline(&hub, credentials, renewer).start(None, failure_tx);

        // each target's queue eventually holds the credentialsUpdated envelope
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let mut all = true;
                for target in ["r1", "r2"] {
                    let queued = session
                        .children(&paths::target_commands("run-1", target))
                        .await
                        .unwrap();
                    all &= !queued.is_empty();
                }
                if all {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("distribution never reached the targets");

        handle.stop();
        handle.join().await;
    }
}
