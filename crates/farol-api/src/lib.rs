//! Farol API - data model and collaborator contracts
//!
//! This crate defines what flows through the coordination layer:
//! - Discovery models (`Discoverable`, `DiscoveryEvent`)
//! - Command models (`Command`, `CommandEnvelope`, `Ack`)
//! - Credential models (`SecureStore`, `SecureStoreRenewer`)
//! - Run lifecycle (`RunState`, `RunRecord`, `TargetInfo`)
//! - The consumed external contracts (`CoordinationStore`,
//!   `CredentialStore`, `ProcessLauncher`)
//! - The coordination store path layout

pub mod command;
pub mod discovery;
pub mod paths;
pub mod run;
pub mod secure;
pub mod store;

pub use command::{Ack, AckStatus, Command, CommandBuilder, CommandEnvelope};
pub use discovery::{Discoverable, DiscoveryEvent};
pub use run::{RunRecord, RunState, TargetInfo};
pub use secure::{SecureStore, SecureStoreRenewer};
pub use store::{
    ChildEvent, ChildWatch, CoordinationStore, CreateMode, CredentialStore, ProcessLauncher,
};
