//! Data Plane
//!
//! Executes the data flows started by control planes. A flow either moves the data
//! itself (push, through a [`TransferService`]) or hands out an endpoint the consumer
//! pulls from. Optional resource provisioning runs before the flow starts; outcomes are
//! reported back through a [`TransferProcessApiClient`].
//!
//! ```text
//! control plane ──start/suspend/terminate──→ DataPlaneManager ──→ LeasedStore<DataFlow>
//!       ↑                                          │ processors
//!       └────provisioned/completed/failed──────────┘ TransferService (detached)
//! ```

pub mod client;
pub mod error;
pub mod flow;
pub mod listener;
pub mod manager;
pub mod recovery;
pub mod state;
pub mod transfer_service;

pub use client::TransferProcessApiClient;
pub use error::DataPlaneError;
pub use flow::DataFlow;
pub use listener::{DataFlowListener, DataFlowObservable};
pub use manager::{DataPlaneCollaborators, DataPlaneManager};
pub use recovery::{OwnershipHeartbeat, OwnershipRecovery};
pub use state::DataFlowState;
pub use transfer_service::{StreamFailure, StreamResult, TransferService, TransferServiceRegistry};
