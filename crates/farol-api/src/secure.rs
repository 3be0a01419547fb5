// Secure store API models
// This file defines the versioned credential bundle and the
// caller-supplied renewal contract

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use farol_common::Result;

/// An opaque, versioned bundle of security credentials.
///
/// Created during renewal, read-only to consumers, superseded (never
/// mutated) by the next renewal cycle. The payload is serialized as
/// base64 on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureStore {
    pub run_id: String,
    pub version: u64,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Expiry of the shortest-lived credential in the bundle, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
}

impl SecureStore {
    pub fn new(run_id: impl Into<String>, version: u64, payload: Vec<u8>) -> Self {
        Self {
            run_id: run_id.into(),
            version,
            payload,
            expires_at_ms: None,
        }
    }

    pub fn with_expiry(mut self, expires_at_ms: i64) -> Self {
        self.expires_at_ms = Some(expires_at_ms);
        self
    }

    /// Remaining validity in milliseconds, when an expiry is carried.
    pub fn remaining_validity_ms(&self, now_ms: i64) -> Option<i64> {
        self.expires_at_ms.map(|expiry| expiry - now_ms)
    }
}

/// Caller-supplied credential-generation logic.
///
/// Invoked by the renewal pipeline at every cycle; the produced bundle
/// must carry `version = previous version + 1`.
#[async_trait]
pub trait SecureStoreRenewer: Send + Sync + 'static {
    async fn renew(&self, run_id: &str, previous: Option<&SecureStore>) -> Result<SecureStore>;
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
