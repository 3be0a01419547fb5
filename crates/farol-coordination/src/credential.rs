//! In-memory durable credential store
//!
//! Version-keyed and write-once: a version is immutable after its first
//! successful put, which is what makes the renewal pipeline's retries
//! idempotent.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::debug;

use farol_api::store::CredentialStore;
use farol_common::StoreError;

#[derive(Default)]
pub struct MemoryCredentialStore {
    /// key = "runId#version"
    bundles: DashMap<String, Vec<u8>>,
    latest: DashMap<String, u64>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn bundle_key(run_id: &str, version: u64) -> String {
    format!("{}#{}", run_id, version)
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn put(&self, run_id: &str, version: u64, payload: &[u8]) -> Result<(), StoreError> {
        let key = bundle_key(run_id, version);

        if let Some(existing) = self.bundles.get(&key) {
            // Re-writing the same version is a retry, not an error, as
            // long as the payload is unchanged.
            if existing.as_slice() == payload {
                debug!("Credential bundle {} already written, no-op", key);
                return Ok(());
            }
            return Err(StoreError::NodeExists(key));
        }

        self.bundles.insert(key.clone(), payload.to_vec());
        self.latest
            .entry(run_id.to_string())
            .and_modify(|current| *current = (*current).max(version))
            .or_insert(version);

        debug!("Stored credential bundle {}", key);
        Ok(())
    }

    async fn get(&self, run_id: &str, version: u64) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .bundles
            .get(&bundle_key(run_id, version))
            .map(|entry| entry.clone()))
    }

    async fn latest_version(&self, run_id: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.latest.get(run_id).map(|entry| *entry))
    }
}
