//! Dataspace Connector
//!
//! Transfer process orchestration for a dataspace connector, built on a generic leased
//! state machine engine.
//!
//! # Modules
//!
//! - [`statemachine`] - Entity model, processors, retry policy and the runner
//! - [`store`] - Leased entity stores (in-memory, PostgreSQL)
//! - [`spi`] - Collaborator interfaces and message types
//! - [`transfer`] - Transfer process (control plane) state machine and commands
//! - [`dataplane`] - Data flow (data plane) state machine and commands
//! - [`adapters`] - HTTP, embedded and file system collaborators
//! - [`runtime`] - Wiring of both planes from configuration

pub mod adapters;
pub mod clock;
pub mod config;
pub mod dataplane;
pub mod logging;
pub mod runtime;
pub mod spi;
pub mod statemachine;
pub mod store;
pub mod transfer;

#[cfg(test)]
mod testing;

pub use runtime::{ConnectorRuntime, RuntimeBuilder, Stores};
