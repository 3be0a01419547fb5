//! Runtime configuration
//!
//! Plain serde-deserializable structs with per-field defaults; no
//! configuration framework is pulled in.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use farol_common::RetryPolicy;

/// Credential renewal configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RenewalConfig {
    /// Fraction of the bundle's remaining validity to wait before
    /// renewing (default: 0.8 — renew well before expiry)
    #[serde(default = "default_renewal_fraction")]
    pub renewal_fraction: f64,

    /// Cycle interval in milliseconds when the bundle carries no expiry
    /// (default: 60000ms)
    #[serde(default = "default_interval_ms")]
    pub default_interval_ms: u64,

    /// Consecutive attempts per renewal before the run fails
    /// (default: 3)
    #[serde(default = "default_max_renewal_attempts")]
    pub max_renewal_attempts: u32,

    /// Backoff between renewal attempts
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_renewal_fraction() -> f64 {
    0.8
}

fn default_interval_ms() -> u64 {
    60_000
}

fn default_max_renewal_attempts() -> u32 {
    3
}

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            renewal_fraction: default_renewal_fraction(),
            default_interval_ms: default_interval_ms(),
            max_renewal_attempts: default_max_renewal_attempts(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Application controller configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Identifier of the application run
    pub run_id: String,

    /// Declared targets handed to the launcher at start
    #[serde(default)]
    pub targets: Vec<String>,

    /// Timeout for awaited commands in milliseconds (default: 30000ms)
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

impl ControllerConfig {
    pub fn new(run_id: impl Into<String>, targets: Vec<String>) -> Self {
        Self {
            run_id: run_id.into(),
            targets,
            command_timeout_ms: default_command_timeout_ms(),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}
