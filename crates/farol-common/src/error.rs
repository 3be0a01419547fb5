//! Error types for Farol
//!
//! This module defines:
//! - `FarolError`: the error surface of the public API
//! - `HandlerError`: receiver-side command handling failures
//! - `StoreError`: coordination/credential store failures (crate-internal,
//!   always wrapped before crossing the public API)

use std::time::Duration;

/// Errors surfaced by the coordination layer
#[derive(thiserror::Error, Debug)]
pub enum FarolError {
    #[error("registration failed: {0}")]
    Registration(String),

    #[error("endpoint '{endpoint}' already announced for service '{service}'")]
    DuplicateRegistration { service: String, endpoint: String },

    #[error("command '{command}' permanently failed on target '{target}': {reason}")]
    CommandFailed {
        command: String,
        target: String,
        reason: String,
    },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("credential renewal failed for run '{run_id}': {reason}")]
    RenewalFailed { run_id: String, reason: String },

    #[error("handler error: {0}")]
    Handler(#[from] HandlerError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Receiver-side failure while handling a single command envelope.
///
/// Isolated to the envelope that produced it; never aborts the channel.
#[derive(thiserror::Error, Debug)]
pub enum HandlerError {
    #[error("unsupported command '{0}'")]
    Unsupported(String),

    #[error("malformed command '{command}': {reason}")]
    Malformed { command: String, reason: String },

    #[error("{0}")]
    Failed(String),
}

/// Errors from the coordination store or the durable credential store
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("node already exists: {0}")]
    NodeExists(String),

    #[error("node not found: {0}")]
    NotFound(String),

    #[error("version conflict at '{path}'")]
    BadVersion { path: String },

    #[error("session expired")]
    SessionExpired,

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether a retry with backoff can reasonably succeed.
    ///
    /// Existence conflicts and version conflicts are stable outcomes and
    /// must be surfaced to the caller instead of retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, FarolError>;
