//! Farol Coordination - in-memory coordination store
//!
//! A session-scoped, watchable, ephemeral-node store implementing the
//! `CoordinationStore` contract from `farol-api`, plus an in-memory
//! `CredentialStore`. Used by tests and single-host runs; production
//! deployments plug a real coordination store client behind the same
//! trait.

pub mod credential;
pub mod hub;
pub mod session;

pub use credential::MemoryCredentialStore;
pub use hub::CoordinationHub;
pub use session::MemorySession;
