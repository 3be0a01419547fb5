//! Credential bundle persistence and consumption
//!
//! The durable credential store is the single source of truth for the
//! current bundle version; no process caches "current" beyond its own
//! last successful fetch, and a newly observed higher version is always
//! authoritative.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use farol_api::SecureStore;
use farol_api::store::CredentialStore;
use farol_common::{FarolError, Result, RetryPolicy, StoreError};

/// Persists renewed credential bundles to the durable store.
///
/// Writes are idempotent under retry: the store treats a repeated write
/// of the same version as a no-op.
pub struct SecureStoreWriter {
    credentials: Arc<dyn CredentialStore>,
    retry: RetryPolicy,
}

impl SecureStoreWriter {
    pub fn new(credentials: Arc<dyn CredentialStore>) -> Self {
        Self::with_retry_policy(credentials, RetryPolicy::default())
    }

    pub fn with_retry_policy(credentials: Arc<dyn CredentialStore>, retry: RetryPolicy) -> Self {
        Self { credentials, retry }
    }

    /// Write the given bundle.
    pub async fn write(&self, secure_store: &SecureStore) -> Result<()> {
        self.retry
            .run_if(
                "secureStoreWrite",
                || {
                    self.credentials.put(
                        &secure_store.run_id,
                        secure_store.version,
                        &secure_store.payload,
                    )
                },
                StoreError::is_transient,
            )
            .await
            .map_err(FarolError::Store)?;

        info!(
            "Persisted credential bundle version {} for run '{}'",
            secure_store.version, secure_store.run_id
        );
        Ok(())
    }
}

/// A target's local view of the run's credentials.
///
/// Swapping in a new bundle keeps the prior one available for the
/// overlap window defined by the credential authority, so in-flight
/// work using the old credentials is not interrupted.
pub struct CredentialHolder {
    run_id: String,
    credentials: Arc<dyn CredentialStore>,
    current: RwLock<Option<SecureStore>>,
    previous: RwLock<Option<SecureStore>>,
}

impl CredentialHolder {
    pub fn new(run_id: &str, credentials: Arc<dyn CredentialStore>) -> Self {
        Self {
            run_id: run_id.to_string(),
            credentials,
            current: RwLock::new(None),
            previous: RwLock::new(None),
        }
    }

    pub fn current(&self) -> Option<SecureStore> {
        self.current.read().clone()
    }

    pub fn current_version(&self) -> Option<u64> {
        self.current.read().as_ref().map(|s| s.version)
    }

    /// The superseded bundle, still valid during the overlap window.
    pub fn previous(&self) -> Option<SecureStore> {
        self.previous.read().clone()
    }

    /// Fetch and swap in the given version.
    ///
    /// A version at or below the one already held is a stale
    /// notification and is ignored.
    pub async fn refresh_to(&self, version: u64) -> Result<()> {
        if self.current_version().is_some_and(|held| held >= version) {
            debug!(
                "Ignoring stale credential version {} for run '{}'",
                version, self.run_id
            );
            return Ok(());
        }

        let payload = self
            .credentials
            .get(&self.run_id, version)
            .await
            .map_err(FarolError::Store)?
            .ok_or_else(|| {
                FarolError::Store(StoreError::NotFound(format!(
                    "credential bundle {}#{}",
                    self.run_id, version
                )))
            })?;

        let fresh = SecureStore::new(self.run_id.clone(), version, payload);

        {
            let mut current = self.current.write();
            // re-check under the lock: a concurrent refresh may have won
            if current.as_ref().is_some_and(|held| held.version >= version) {
                return Ok(());
            }
            *self.previous.write() = current.take();
            *current = Some(fresh);
        }

        info!(
            "Swapped credentials for run '{}' to version {}",
            self.run_id, version
        );
        Ok(())
    }

    /// Pull the newest bundle version, if any exists yet.
    ///
    /// Called at target startup so a process that joins after a renewal
    /// cycle completed still picks up the latest version.
    pub async fn pull_latest(&self) -> Result<Option<u64>> {
        match self
            .credentials
            .latest_version(&self.run_id)
            .await
            .map_err(FarolError::Store)?
        {
            Some(version) => {
                self.refresh_to(version).await?;
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }
}
