//! Farol Runtime - controller façade, target context, credential renewal
//!
//! This crate composes the discovery registry and the command channel
//! into the pieces an operator and an application actually touch:
//! - `ApplicationController`: start/stop a run, discover services, send
//!   commands, await termination
//! - `TargetRuntime`: the context handed to application code in each
//!   target process
//! - `RenewalPipeline` / `SecureStoreWriter` / `CredentialHolder`: keep
//!   the run's credential bundle valid for its entire lifetime

pub mod config;
pub mod controller;
pub mod credential;
pub mod renewal;
pub mod target;

pub use config::{ControllerConfig, RenewalConfig};
pub use controller::ApplicationController;
pub use credential::{CredentialHolder, SecureStoreWriter};
pub use renewal::{RenewalHandle, RenewalPipeline, RenewalState};
pub use target::TargetRuntime;
